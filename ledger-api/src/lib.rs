#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The HTTP surface: `/ledger/fast-transfer`, `/ledger/accounts/{id}/balance`,
//! `/offline/ops`, `/offline/sync`, and `/events/balance`. Routing and error
//! handling follow the same `Router<ApiState>` / `State` extractor /
//! `IntoResponse` newtype shape used elsewhere in this codebase for small
//! service surfaces, with one `tracing::info_span!` per request.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::routing::post;
use ledger_core::AccountId;
use ledger_core::Currency;
use ledger_core::JournalEntry;
use ledger_core::LedgerError;
use ledger_offline::OfflineError;
use ledger_offline::OfflineOperation;
use ledger_offline::OfflineQueue;
use ledger_offline::SubmittedOperation;
use ledger_outbox::BalanceEventPayload;
use ledger_outbox::OutboxError;
use ledger_outbox::OutboxStore;
use ledger_store::AuditEvent;
use ledger_store::AuditTrailFilter;
use ledger_store::LedgerStore;
use ledger_store::StoreError;
use ledger_tenancy::Role;
use ledger_tenancy::TenancyError;
use ledger_tenancy::TenantContext;
use ledger_transfer::FastTransferRequest;
use ledger_transfer::FastTransferService;
use ledger_transfer::TransferError;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::Instrument;
use tracing::info_span;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn LedgerStore>,
    pub transfer: Arc<FastTransferService>,
    pub offline: Arc<OfflineQueue>,
    pub outbox: Arc<dyn OutboxStore>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/ledger/fast-transfer", post(fast_transfer_handler))
        .route("/ledger/accounts/{id}/balance", get(balance_handler))
        .route("/ledger/entries/{id}/reverse", post(reverse_entry_handler))
        .route("/offline/ops", post(submit_offline_op_handler))
        .route("/offline/sync", post(sync_offline_handler))
        .route("/events/balance", get(events_balance_handler))
        .route("/audit/trail", get(audit_trail_handler))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Tenancy(#[from] TenancyError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Offline(#[from] OfflineError),
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error("validation error: {0}")]
    Validation(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::Ledger(LedgerError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Ledger(LedgerError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Ledger(LedgerError::InsufficientFunds { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Ledger(LedgerError::CurrencyMismatch { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Ledger(LedgerError::TenantIsolationViolation { .. }) => StatusCode::FORBIDDEN,
            ApiError::Ledger(LedgerError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Tenancy(TenancyError::IsolationViolation { .. }) => StatusCode::FORBIDDEN,
            ApiError::Tenancy(TenancyError::Forbidden { .. }) => StatusCode::FORBIDDEN,
            ApiError::Tenancy(TenancyError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Transfer(TransferError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Transfer(TransferError::Tenancy(_)) => StatusCode::FORBIDDEN,
            ApiError::Transfer(TransferError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Transfer(TransferError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Store(StoreError::AccountExists(_)) => StatusCode::CONFLICT,
            ApiError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            ApiError::Store(StoreError::Ledger(_)) => StatusCode::BAD_REQUEST,
            ApiError::Store(StoreError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Offline(OfflineError::SignatureInvalid(_)) => StatusCode::UNAUTHORIZED,
            ApiError::Offline(OfflineError::ReplayedNonce { .. }) => StatusCode::CONFLICT,
            ApiError::Offline(OfflineError::UnknownDevice(_)) => StatusCode::UNAUTHORIZED,
            ApiError::Offline(OfflineError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Offline(OfflineError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Offline(OfflineError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Outbox(OutboxError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Outbox(OutboxError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Outbox(OutboxError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

fn tenant_from_parts(tenant_id: String, actor_id: String, role: Role) -> Result<TenantContext, ApiError> {
    Ok(TenantContext::new(tenant_id, actor_id, role)?)
}

#[derive(Debug, Deserialize)]
pub struct FastTransferHttpRequest {
    pub tenant_id: String,
    pub actor_id: String,
    pub role: Role,
    pub idempotency_key: String,
    pub from_account: AccountId,
    pub to_account: AccountId,
    pub amount_minor: i64,
    pub currency: Currency,
    pub narration: String,
}

async fn fast_transfer_handler(
    State(state): State<ApiState>,
    Json(payload): Json<FastTransferHttpRequest>,
) -> Result<Json<JournalEntry>, ApiError> {
    let span = info_span!("fast_transfer", tenant = %payload.tenant_id, idempotency_key = %payload.idempotency_key);
    async move {
        let tenant = tenant_from_parts(payload.tenant_id, payload.actor_id, payload.role)?;
        let entry = state
            .transfer
            .execute(
                &tenant,
                FastTransferRequest {
                    idempotency_key: payload.idempotency_key,
                    from_account: payload.from_account,
                    to_account: payload.to_account,
                    amount_minor: payload.amount_minor,
                    currency: payload.currency,
                    narration: payload.narration,
                },
            )
            .await?;
        Ok(Json(entry))
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    pub tenant_id: String,
    pub actor_id: String,
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: AccountId,
    pub balance_minor: i64,
    pub currency: Currency,
}

async fn balance_handler(
    State(state): State<ApiState>,
    Path(account_id): Path<AccountId>,
    Query(query): Query<BalanceQuery>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let span = info_span!("read_balance", account_id = %account_id);
    async move {
        let tenant = tenant_from_parts(query.tenant_id, query.actor_id, query.role)?;
        let account = state.store.get_account(&account_id).await?;
        tenant.assert_owns(&account.id, &account.tenant_id)?;
        Ok(Json(BalanceResponse {
            account_id: account.id,
            balance_minor: account.balance_minor,
            currency: account.currency,
        }))
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
pub struct ReverseEntryRequest {
    pub tenant_id: String,
    pub actor_id: String,
    pub role: Role,
}

async fn reverse_entry_handler(
    State(state): State<ApiState>,
    Path(entry_id): Path<String>,
    Json(payload): Json<ReverseEntryRequest>,
) -> Result<Json<JournalEntry>, ApiError> {
    let span = info_span!("reverse_entry", entry_id = %entry_id);
    async move {
        let tenant = tenant_from_parts(payload.tenant_id, payload.actor_id, payload.role)?;
        tenant.require_role(&[Role::Operator, Role::Admin], "ledger:reverse")?;
        let entry = state.transfer.reverse(&tenant, &entry_id).await?;
        Ok(Json(entry))
    }
    .instrument(span)
    .await
}

async fn submit_offline_op_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmittedOperation>,
) -> Result<Json<OfflineOperation>, ApiError> {
    let span = info_span!("submit_offline_op", device_id = %payload.device_id);
    async move { Ok(Json(state.offline.enqueue(payload).await?)) }
        .instrument(span)
        .await
}

#[derive(Debug, Deserialize)]
pub struct OfflineSyncHttpRequest {
    pub tenant_id: String,
    pub actor_id: String,
    pub role: Role,
    pub device_id: String,
    #[serde(default = "default_sync_max")]
    pub max: usize,
}

fn default_sync_max() -> usize {
    ledger_offline::MAX_SYNC_BATCH
}

async fn sync_offline_handler(
    State(state): State<ApiState>,
    Json(payload): Json<OfflineSyncHttpRequest>,
) -> Result<Json<Vec<OfflineOperation>>, ApiError> {
    let span = info_span!("sync_offline", device_id = %payload.device_id);
    async move {
        let tenant = tenant_from_parts(payload.tenant_id, payload.actor_id, payload.role)?;
        Ok(Json(
            state.offline.sync_device(&tenant, &payload.device_id, payload.max).await?,
        ))
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub account_id: AccountId,
    #[serde(default)]
    pub cursor: u64,
    #[serde(default = "default_events_limit")]
    pub limit: usize,
}

fn default_events_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct EventsBalanceResponse {
    pub events: Vec<BalanceEventPayload>,
    pub next_cursor: u64,
}

async fn events_balance_handler(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsBalanceResponse>, ApiError> {
    let span = info_span!("events_balance", account_id = %query.account_id);
    async move {
        let topic = format!("acct::{}", query.account_id);
        let messages = state.outbox.list_since(&topic, query.cursor, query.limit).await?;
        let next_cursor = messages.last().map(|m| m.sequence).unwrap_or(query.cursor);
        Ok(Json(EventsBalanceResponse {
            events: messages.into_iter().map(|m| m.payload).collect(),
            next_cursor,
        }))
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
pub struct AuditTrailQuery {
    pub tenant_id: String,
    pub actor_id: String,
    pub role: Role,
    pub entity_id: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

async fn audit_trail_handler(
    State(state): State<ApiState>,
    Query(query): Query<AuditTrailQuery>,
) -> Result<Json<Vec<AuditEvent>>, ApiError> {
    let span = info_span!("audit_trail", tenant = %query.tenant_id);
    async move {
        let tenant = tenant_from_parts(query.tenant_id.clone(), query.actor_id, query.role)?;
        tenant.require_role(&[Role::Operator, Role::Admin], "audit:read")?;
        let events = state
            .store
            .list_audit_trail(AuditTrailFilter {
                tenant_id: query.tenant_id,
                entity_id: query.entity_id,
                cursor: query.cursor,
                limit: query.limit,
            })
            .await?;
        Ok(Json(events))
    }
    .instrument(span)
    .await
}
