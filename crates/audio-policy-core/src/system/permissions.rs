//! Permission and app-op checks at the API boundary

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::types::{AppOp, Caller, Permission};

pub trait PermissionChecker: Send + Sync {
    /// True if the caller's package may perform `op`
    fn check_app_op(&self, op: AppOp, caller: &Caller) -> bool;

    fn has_permission(&self, permission: Permission, caller: &Caller) -> bool;
}

/// Grants everything except explicitly denied ops and permissions
#[derive(Debug, Default)]
pub struct StaticPermissions {
    denied_ops: RwLock<HashSet<AppOp>>,
    denied_permissions: RwLock<HashSet<Permission>>,
    denied_packages: RwLock<HashSet<String>>,
}

impl StaticPermissions {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn deny_app_op(&self, op: AppOp) {
        self.denied_ops.write().insert(op);
    }

    pub fn deny_permission(&self, permission: Permission) {
        self.denied_permissions.write().insert(permission);
    }

    /// Deny every app op to one package
    pub fn deny_package(&self, package: impl Into<String>) {
        self.denied_packages.write().insert(package.into());
    }

    pub fn reset(&self) {
        self.denied_ops.write().clear();
        self.denied_permissions.write().clear();
        self.denied_packages.write().clear();
    }
}

impl PermissionChecker for StaticPermissions {
    fn check_app_op(&self, op: AppOp, caller: &Caller) -> bool {
        !self.denied_ops.read().contains(&op) && !self.denied_packages.read().contains(&caller.package)
    }

    fn has_permission(&self, permission: Permission, _caller: &Caller) -> bool {
        !self.denied_permissions.read().contains(&permission)
    }
}
