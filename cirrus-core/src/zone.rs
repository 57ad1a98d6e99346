//! Record zone metadata

use crate::identity::ZoneId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// What a zone supports on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoneCapabilities {
    /// Server-side incremental record diffing.
    pub fetch_changes: bool,
    pub sharing: bool,
}

impl ZoneCapabilities {
    /// Capabilities of custom zones.
    pub const CUSTOM: ZoneCapabilities = ZoneCapabilities {
        fetch_changes: true,
        sharing: true,
    };

    /// The default zone has neither.
    pub const DEFAULT: ZoneCapabilities = ZoneCapabilities {
        fetch_changes: false,
        sharing: false,
    };
}

/// A record zone known to a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordZone {
    pub id: ZoneId,
    pub capabilities: ZoneCapabilities,
}

impl RecordZone {
    pub fn new(id: ZoneId) -> Self {
        let capabilities = if id.is_default() {
            ZoneCapabilities::DEFAULT
        } else {
            ZoneCapabilities::CUSTOM
        };
        Self { id, capabilities }
    }

    pub fn default_zone() -> Self {
        Self::new(ZoneId::default_zone())
    }

    /// Display order: default zone first, then by name, then by owner.
    pub fn display_cmp(&self, other: &Self) -> Ordering {
        zone_order(&self.id, &other.id)
    }
}

/// Total order over zone ids used for every known-zone list.
pub fn zone_order(a: &ZoneId, b: &ZoneId) -> Ordering {
    match (a.is_default(), b.is_default()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.name.cmp(&b.name).then_with(|| a.owner.cmp(&b.owner)),
    }
}

/// Sort a zone list into display order.
pub fn sort_zones(zones: &mut [RecordZone]) {
    zones.sort_by(RecordZone::display_cmp);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_zone_sorts_first() {
        let mut zones = vec![
            RecordZone::new(ZoneId::new("Zeta", "me")),
            RecordZone::new(ZoneId::new("Alpha", "me")),
            RecordZone::default_zone(),
        ];
        sort_zones(&mut zones);
        let names: Vec<_> = zones.iter().map(|z| z.id.name.as_str()).collect();
        assert_eq!(names, vec!["_defaultZone", "Alpha", "Zeta"]);
    }

    #[test]
    fn test_default_zone_capabilities() {
        assert!(!RecordZone::default_zone().capabilities.fetch_changes);
        assert!(RecordZone::new(ZoneId::new("Work", "me")).capabilities.fetch_changes);
    }
}
