//! Capability checks for administrative operations
//!
//! Every admin operation in the workspace starts with `access.require(caller, role)?`
//! against the injected [`RoleStore`].

use crate::{
    collaborators::RoleStore,
    types::{Principal, Role},
    Error, Result,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Role-gated access control
#[derive(Debug, Clone)]
pub struct AccessControl {
    roles: Arc<dyn RoleStore>,
}

impl AccessControl {
    /// Wrap a role store
    pub fn new(roles: Arc<dyn RoleStore>) -> Self {
        Self { roles }
    }

    /// Fail unless `principal` holds `role`
    pub fn require(&self, principal: &Principal, role: Role) -> Result<()> {
        if self.roles.has_role(principal, role) {
            Ok(())
        } else {
            warn!(principal = %principal, role = ?role, "Access denied");
            Err(Error::AccessDenied {
                principal: principal.clone(),
                role,
            })
        }
    }

    /// Fail unless `principal` holds any of `roles`
    pub fn require_any(&self, principal: &Principal, roles: &[Role]) -> Result<()> {
        if roles.iter().any(|role| self.roles.has_role(principal, *role)) {
            return Ok(());
        }
        let role = roles.first().copied().unwrap_or(Role::Admin);
        warn!(principal = %principal, roles = ?roles, "Access denied");
        Err(Error::AccessDenied {
            principal: principal.clone(),
            role,
        })
    }

    /// Whether `principal` holds `role`
    pub fn has_role(&self, principal: &Principal, role: Role) -> bool {
        self.roles.has_role(principal, role)
    }

    /// Grant a role (admin only)
    pub fn grant(&self, caller: &Principal, principal: &Principal, role: Role) -> Result<()> {
        self.require(caller, Role::Admin)?;
        self.roles.grant(principal, role);
        info!(caller = %caller, principal = %principal, role = ?role, "Role granted");
        Ok(())
    }

    /// Revoke a role (admin only)
    pub fn revoke(&self, caller: &Principal, principal: &Principal, role: Role) -> Result<bool> {
        self.require(caller, Role::Admin)?;
        let held = self.roles.revoke(principal, role);
        info!(caller = %caller, principal = %principal, role = ?role, held, "Role revoked");
        Ok(held)
    }
}
