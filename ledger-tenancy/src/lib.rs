#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Tenant context and the authorization gate every ledger operation passes
//! through before it touches an account. Tenant isolation is enforced here
//! as a fatal precondition, not a soft filter: a request whose tenant does
//! not own the accounts it names is rejected before any store call is made.

use ledger_core::AccountId;
use ledger_core::TenantId;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub type TenancyResult<T> = Result<T, TenancyError>;

#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("tenant isolation violation: tenant {tenant_id} attempted to act on account {account_id}")]
    IsolationViolation {
        tenant_id: TenantId,
        account_id: AccountId,
    },
    #[error("role {role:?} is not permitted to perform {action}")]
    Forbidden { role: Role, action: String },
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Customer,
    DeviceAgent,
    Operator,
    Admin,
}

/// The tenant/actor this request is authenticated as. Every ledger-touching
/// operation in this crate family takes one of these as its first argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub actor_id: String,
    pub role: Role,
}

impl TenantContext {
    /// The tenant gate: parses and validates the tenant id's format before
    /// an immutable context can be built from it.
    pub fn new(tenant_id: impl Into<TenantId>, actor_id: impl Into<String>, role: Role) -> TenancyResult<Self> {
        let tenant_id = tenant_id.into();
        ledger_core::validate_tenant_id(&tenant_id).map_err(|err| TenancyError::Validation(err.to_string()))?;
        Ok(Self {
            tenant_id,
            actor_id: actor_id.into(),
            role,
        })
    }

    /// Every account id a request names must resolve to this tenant. Callers
    /// supply the owning tenant for each account (looked up from the store)
    /// so this stays a pure check with no I/O.
    pub fn assert_owns(&self, account_id: &AccountId, owning_tenant: &TenantId) -> TenancyResult<()> {
        if owning_tenant != &self.tenant_id {
            return Err(TenancyError::IsolationViolation {
                tenant_id: self.tenant_id.clone(),
                account_id: account_id.clone(),
            });
        }
        Ok(())
    }

    pub fn require_role(&self, allowed: &[Role], action: &str) -> TenancyResult<()> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(TenancyError::Forbidden {
                role: self.role,
                action: action.to_string(),
            })
        }
    }
}
