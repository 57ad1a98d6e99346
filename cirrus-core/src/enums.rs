//! Enum types for scopes and permissions

use crate::identity::{UserId, ZoneId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// DATABASE SCOPE
// ============================================================================

/// One of the three partitions of the remote store, each with independent
/// access semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DatabaseScope {
    Public,
    Private,
    Shared,
}

impl DatabaseScope {
    /// All scopes in the order the engine initializes them.
    pub const ALL: [DatabaseScope; 3] = [
        DatabaseScope::Public,
        DatabaseScope::Private,
        DatabaseScope::Shared,
    ];

    /// Stable name used in subscription ids and persisted keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseScope::Public => "Public",
            DatabaseScope::Private => "Private",
            DatabaseScope::Shared => "Shared",
        }
    }

    /// Only the private scope can hold custom zones.
    pub fn supports_custom_zones(&self) -> bool {
        matches!(self, DatabaseScope::Private)
    }

    /// Whether this scope starts out knowing its implicit default zone.
    ///
    /// The shared scope only exposes zones owned by other users, so it learns
    /// every zone from the server.
    pub fn has_default_zone(&self) -> bool {
        !matches!(self, DatabaseScope::Shared)
    }

    /// Whether zone-level change notifications (database subscriptions) are
    /// available for this scope.
    pub fn supports_zone_deltas(&self) -> bool {
        !matches!(self, DatabaseScope::Public)
    }

    /// Scope and zone a cache should fall back to when its active zone in
    /// this scope disappears.
    pub fn fallback_zone(&self) -> (DatabaseScope, ZoneId) {
        match self {
            DatabaseScope::Shared => (DatabaseScope::Private, ZoneId::default_zone()),
            other => (*other, ZoneId::default_zone()),
        }
    }
}

impl fmt::Display for DatabaseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "public" => Ok(DatabaseScope::Public),
            "private" => Ok(DatabaseScope::Private),
            "shared" => Ok(DatabaseScope::Shared),
            _ => Err(format!("Invalid DatabaseScope: {}", s)),
        }
    }
}

// ============================================================================
// PERMISSION
// ============================================================================

/// What the current user may do with a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Permission {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl Permission {
    /// Permission derived from the "same creator" rule.
    ///
    /// Public records created by somebody else are read-only. Everything else
    /// defaults to read-write; shared-scope records get their real permission
    /// from share metadata later.
    pub fn for_creator(
        scope: DatabaseScope,
        creator: Option<&UserId>,
        current_user: &UserId,
    ) -> Self {
        match (scope, creator) {
            (DatabaseScope::Public, Some(creator)) if creator != current_user => {
                Permission::ReadOnly
            }
            _ => Permission::ReadWrite,
        }
    }

    pub fn can_write(&self) -> bool {
        matches!(self, Permission::ReadWrite)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Permission::ReadOnly => "ReadOnly",
            Permission::ReadWrite => "ReadWrite",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "readonly" => Ok(Permission::ReadOnly),
            "readwrite" => Ok(Permission::ReadWrite),
            _ => Err(format!("Invalid Permission: {}", s)),
        }
    }
}

// ============================================================================
// STRING CONVERSIONS
// ============================================================================

fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_roundtrip_through_strings() {
        for scope in DatabaseScope::ALL {
            let parsed: DatabaseScope = scope.to_string().parse().expect("scope should parse");
            assert_eq!(parsed, scope);
        }
        assert!("nowhere".parse::<DatabaseScope>().is_err());
    }

    #[test]
    fn test_scope_zone_rules() {
        assert!(!DatabaseScope::Public.supports_custom_zones());
        assert!(DatabaseScope::Private.supports_custom_zones());
        assert!(!DatabaseScope::Shared.supports_custom_zones());
        assert!(!DatabaseScope::Shared.has_default_zone());
        assert!(!DatabaseScope::Public.supports_zone_deltas());
    }

    #[test]
    fn test_shared_scope_falls_back_to_private_default() {
        let (scope, zone) = DatabaseScope::Shared.fallback_zone();
        assert_eq!(scope, DatabaseScope::Private);
        assert!(zone.is_default());

        let (scope, _) = DatabaseScope::Public.fallback_zone();
        assert_eq!(scope, DatabaseScope::Public);
    }

    #[test]
    fn test_permission_same_creator_rule() {
        let me = UserId::new("me");
        let other = UserId::new("other");

        assert_eq!(
            Permission::for_creator(DatabaseScope::Public, Some(&other), &me),
            Permission::ReadOnly
        );
        assert_eq!(
            Permission::for_creator(DatabaseScope::Public, Some(&me), &me),
            Permission::ReadWrite
        );
        assert_eq!(
            Permission::for_creator(DatabaseScope::Private, Some(&other), &me),
            Permission::ReadWrite
        );
        assert_eq!(
            Permission::for_creator(DatabaseScope::Public, None, &me),
            Permission::ReadWrite
        );
    }

    #[test]
    fn test_permission_parse() {
        assert_eq!("read-only".parse::<Permission>(), Ok(Permission::ReadOnly));
        assert_eq!("ReadWrite".parse::<Permission>(), Ok(Permission::ReadWrite));
    }
}
