use serde::{Deserialize, Serialize};

/// UserRole enum for authorization in the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    Admin,
    Member,
}

/// Permission enum representing individual permissions in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    ExportData,
    DownloadExports,
    ConfigureSystem,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Member => "member",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(UserRole::Admin),
            "member" => Some(UserRole::Member),
            _ => None,
        }
    }

    /// Check if the user has a specific permission
    pub fn has_permission(&self, permission: Permission) -> bool {
        match self {
            // Admin has all permissions
            UserRole::Admin => true,
            UserRole::Member => matches!(
                permission,
                Permission::ExportData | Permission::DownloadExports
            ),
        }
    }

    pub fn has_permissions(&self, permissions: &[Permission]) -> bool {
        permissions.iter().all(|p| self.has_permission(*p))
    }
}
