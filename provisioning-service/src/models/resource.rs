//! Protected resource model - visibility scopes and additive grants.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::principal::Role;

/// Resource-level policy selecting the grant lookup path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    RoleBased,
    Custom,
    AdminOnly,
}

impl Visibility {
    pub const ALL: [Visibility; 4] = [
        Visibility::Public,
        Visibility::RoleBased,
        Visibility::Custom,
        Visibility::AdminOnly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::RoleBased => "role_based",
            Visibility::Custom => "custom",
            Visibility::AdminOnly => "admin_only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Visibility::Public),
            "role_based" => Some(Visibility::RoleBased),
            "custom" => Some(Visibility::Custom),
            "admin_only" => Some(Visibility::AdminOnly),
            _ => None,
        }
    }
}

/// Capability requested on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    View,
    Download,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Download => "download",
        }
    }
}

/// Who a grant applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Grantee {
    Role(Role),
    Principal(Uuid),
}

impl Grantee {
    pub fn kind_code(&self) -> &'static str {
        match self {
            Grantee::Role(_) => "role",
            Grantee::Principal(_) => "principal",
        }
    }

    pub fn value_code(&self) -> String {
        match self {
            Grantee::Role(role) => role.as_str().to_string(),
            Grantee::Principal(id) => id.to_string(),
        }
    }

    pub fn from_codes(kind: &str, value: &str) -> Option<Self> {
        match kind {
            "role" => Role::parse(value).map(Grantee::Role),
            "principal" => Uuid::parse_str(value).ok().map(Grantee::Principal),
            _ => None,
        }
    }
}

/// Additive permission record. There is no deny grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub resource_id: Uuid,
    pub grantee: Grantee,
    pub can_view: bool,
    pub can_download: bool,
}

impl Grant {
    pub fn new(resource_id: Uuid, grantee: Grantee, can_view: bool, can_download: bool) -> Self {
        Self {
            resource_id,
            grantee,
            can_view,
            can_download,
        }
    }

    /// Capability flag for `action`.
    pub fn permits(&self, action: Action) -> bool {
        match action {
            Action::View => self.can_view,
            Action::Download => self.can_download,
        }
    }
}

/// Any entity subject to access control, with its grants already loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedResource {
    pub id: Uuid,
    pub visibility: Visibility,
    pub owner_id: Option<Uuid>,
    pub grants: Vec<Grant>,
}

impl ProtectedResource {
    pub fn new(visibility: Visibility, owner_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            visibility,
            owner_id,
            grants: Vec::new(),
        }
    }

    pub fn with_grant(mut self, grantee: Grantee, can_view: bool, can_download: bool) -> Self {
        self.grants
            .push(Grant::new(self.id, grantee, can_view, can_download));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grantee_codes_round_trip() {
        let role = Grantee::Role(Role::Recruiter);
        assert_eq!(
            Grantee::from_codes(role.kind_code(), &role.value_code()),
            Some(role)
        );

        let id = Uuid::new_v4();
        let principal = Grantee::Principal(id);
        assert_eq!(
            Grantee::from_codes(principal.kind_code(), &principal.value_code()),
            Some(principal)
        );
        assert_eq!(Grantee::from_codes("group", "x"), None);
    }

    #[test]
    fn test_grant_permits_per_action() {
        let grant = Grant::new(Uuid::new_v4(), Grantee::Role(Role::Agent), true, false);
        assert!(grant.permits(Action::View));
        assert!(!grant.permits(Action::Download));
    }
}
