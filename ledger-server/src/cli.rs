//! Command-line surface: serving the HTTP API is the default, but the same
//! wiring backs two harness subcommands that exercise the offline and
//! outbox paths without needing a running server or a signed HTTP client.

use anyhow::Result;
use anyhow::anyhow;
use chrono::Utc;
use clap::Parser;
use clap::Subcommand;
use ledger_core::Currency;
use ledger_offline::SubmittedOperation;
use ledger_offline::sign_message;
use ledger_outbox::OutboxStore;
use ledger_store::LedgerStore;
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::wiring::Backend;

#[derive(Debug, Parser)]
#[command(name = "ledger-server", about = "Double-entry ledger backend")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bind the HTTP API and serve requests. Default when no subcommand is given.
    Serve,

    /// Sign and apply one offline device operation end to end, bypassing HTTP.
    SimulateDeviceOp {
        #[arg(long, default_value = "dev-sim-1")]
        device_id: String,
        #[arg(long, default_value = "tnt_test1")]
        tenant_id: String,
        #[arg(long)]
        from_account: String,
        #[arg(long)]
        to_account: String,
        #[arg(long)]
        amount_minor: i64,
        #[arg(long, default_value = "USD")]
        currency: String,
    },

    /// Print outbox messages recorded for an account's topic since a cursor.
    ReplayOutbox {
        #[arg(long)]
        account_id: String,
        #[arg(long, default_value_t = 0)]
        cursor: u64,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Print the audit trail recorded for a tenant, oldest first.
    AuditTrail {
        #[arg(long, default_value = "tnt_test1")]
        tenant_id: String,
        #[arg(long)]
        entity_id: Option<String>,
        #[arg(long)]
        cursor: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Reverse an already-posted entry, bypassing HTTP.
    ReverseEntry {
        #[arg(long, default_value = "tnt_test1")]
        tenant_id: String,
        #[arg(long)]
        entry_id: String,
    },
}

impl Cli {
    pub fn wants_serve(&self) -> bool {
        matches!(self.command, None | Some(Command::Serve))
    }
}

/// Runs a non-`Serve` subcommand against `backend`. Returns `Ok(true)` if a
/// harness subcommand ran (the caller should exit afterward), `Ok(false)`
/// if the caller should fall through to serving the HTTP API.
pub async fn run_harness(cli: &Cli, config: &LedgerConfig, backend: &Backend) -> Result<bool> {
    let Some(command) = &cli.command else {
        return Ok(false);
    };

    match command {
        Command::Serve => Ok(false),
        Command::SimulateDeviceOp {
            device_id,
            tenant_id,
            from_account,
            to_account,
            amount_minor,
            currency,
        } => {
            backend
                .provision_device(device_id.clone(), config.device_hmac_key.clone())
                .await;

            let op = SubmittedOperation {
                device_id: device_id.clone(),
                tenant_id: tenant_id.clone(),
                nonce: Uuid::new_v4().to_string(),
                signature_hex: String::new(),
                from_account: from_account.clone(),
                to_account: to_account.clone(),
                amount_minor: *amount_minor,
                currency: Currency::new(currency.to_uppercase(), 2).map_err(|err| anyhow!(err))?,
                client_recorded_at: Utc::now(),
            };
            let signature_hex = sign_message(&config.device_hmac_key, &op.canonical_message());
            let signed = SubmittedOperation { signature_hex, ..op };

            let enqueued = backend
                .offline
                .enqueue(signed)
                .await
                .map_err(|err| anyhow!(err))?;
            println!("enqueued offline op {} for device {}", enqueued.id, enqueued.device_id);

            let tenant = ledger_tenancy::TenantContext::new(
                tenant_id.clone(),
                device_id.clone(),
                ledger_tenancy::Role::DeviceAgent,
            )
            .map_err(|err| anyhow!(err))?;
            let results = backend
                .offline
                .sync_device(&tenant, device_id, ledger_offline::MAX_SYNC_BATCH)
                .await
                .map_err(|err| anyhow!(err))?;
            for op in results {
                println!("- op {} -> {:?} (entry {:?})", op.id, op.status, op.applied_entry_id);
            }
            Ok(true)
        }
        Command::ReplayOutbox {
            account_id,
            cursor,
            limit,
        } => {
            let topic = format!("acct::{account_id}");
            let messages = backend
                .outbox
                .list_since(&topic, *cursor, *limit)
                .await
                .map_err(|err| anyhow!(err))?;
            if messages.is_empty() {
                println!("no outbox messages for {topic} since cursor {cursor}");
            }
            for message in messages {
                println!(
                    "seq={} entry={} balance_minor={} delta_minor={} region={}",
                    message.sequence,
                    message.payload.entry_id,
                    message.payload.balance_minor,
                    message.payload.delta_minor,
                    message.payload.origin_region
                );
            }
            Ok(true)
        }
        Command::AuditTrail {
            tenant_id,
            entity_id,
            cursor,
            limit,
        } => {
            let events = backend
                .store
                .list_audit_trail(ledger_store::AuditTrailFilter {
                    tenant_id: tenant_id.clone(),
                    entity_id: entity_id.clone(),
                    cursor: cursor.clone(),
                    limit: Some(*limit),
                })
                .await
                .map_err(|err| anyhow!(err))?;
            if events.is_empty() {
                println!("no audit events for tenant {tenant_id}");
            }
            for event in events {
                println!("{} [{}] {}: {}", event.id, event.occurred_at, event.entity_id, event.description);
            }
            Ok(true)
        }
        Command::ReverseEntry { tenant_id, entry_id } => {
            let tenant = ledger_tenancy::TenantContext::new(
                tenant_id.clone(),
                "cli-operator".to_string(),
                ledger_tenancy::Role::Operator,
            )
            .map_err(|err| anyhow!(err))?;
            let reversal = backend
                .transfer
                .reverse(&tenant, entry_id)
                .await
                .map_err(|err| anyhow!(err))?;
            println!("reversed entry {entry_id} with new entry {}", reversal.id);
            Ok(true)
        }
    }
}
