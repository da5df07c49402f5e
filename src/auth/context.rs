use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{DomainResult, ServiceError};
use crate::types::{Permission, UserRole};

/// Represents the authentication context for the current operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// The ID of the authenticated user
    pub user_id: Uuid,

    /// The role of the authenticated user
    pub role: UserRole,
}

impl AuthContext {
    /// Create a new authentication context
    pub fn new(user_id: Uuid, role: UserRole) -> Self {
        Self { user_id, role }
    }

    /// Create a new authentication context for internal system operations
    pub fn internal_system_context() -> Self {
        Self {
            user_id: Uuid::nil(),
            role: UserRole::Admin,
        }
    }

    /// Check if user has a specific permission
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.role.has_permission(permission)
    }

    /// Authorize a specific permission, returning an error if not allowed
    pub fn authorize(&self, permission: Permission) -> Result<(), ServiceError> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied(format!(
                "User does not have permission: {:?}",
                permission
            )))
        }
    }
}

/// Polymorphic reference to the subject that owns an export.
///
/// `kind` is a host-defined type tag (e.g. a table or model name) and `id`
/// its key, stringified. The pair only becomes an [`AuthContext`] through a
/// [`SubjectResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: String,
    pub id: String,
}

impl OwnerRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

/// Resolves a polymorphic owner reference to an authenticatable subject.
///
/// Returning `Ok(None)` means the owner exists but is not authenticatable
/// (or no longer exists); callers treat that as "no subject".
#[async_trait]
pub trait SubjectResolver: Send + Sync {
    async fn resolve(&self, owner: &OwnerRef) -> DomainResult<Option<AuthContext>>;
}

/// Resolver that never yields a subject.
pub struct NullSubjectResolver;

#[async_trait]
impl SubjectResolver for NullSubjectResolver {
    async fn resolve(&self, _owner: &OwnerRef) -> DomainResult<Option<AuthContext>> {
        Ok(None)
    }
}

/// Holder for the subject a task is currently acting as.
///
/// The acting subject is passed explicitly into the cell and scoped with an
/// RAII guard; dropping the guard restores whatever was there before, so a
/// task can never leak its identity into the next one.
#[derive(Debug, Default)]
pub struct IdentityCell {
    current: Mutex<Option<AuthContext>>,
}

impl IdentityCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `subject` the acting identity until the returned guard drops.
    pub fn enter(&self, subject: AuthContext) -> IdentityScope<'_> {
        let previous = self
            .current
            .lock()
            .expect("identity cell poisoned")
            .replace(subject);
        IdentityScope {
            cell: self,
            previous,
        }
    }

    /// The subject currently acting, if any.
    pub fn current(&self) -> Option<AuthContext> {
        self.current.lock().expect("identity cell poisoned").clone()
    }
}

/// Guard returned by [`IdentityCell::enter`]; restores the prior subject on drop.
pub struct IdentityScope<'a> {
    cell: &'a IdentityCell,
    previous: Option<AuthContext>,
}

impl Drop for IdentityScope<'_> {
    fn drop(&mut self) {
        *self.cell.current.lock().expect("identity cell poisoned") = self.previous.take();
    }
}
