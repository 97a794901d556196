use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::policy::DEFAULT_BYPASS_TTL_MINUTES;

/// Per-URL bypass grants.
///
/// Grants are keyed by the exact URL string and expire `ttl_minutes` after
/// they were issued. Expired grants stay in the map but are inert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassCache {
    grants: HashMap<String, DateTime<Utc>>,
    ttl_minutes: u32,
}

impl Default for BypassCache {
    fn default() -> Self {
        Self {
            grants: HashMap::new(),
            ttl_minutes: DEFAULT_BYPASS_TTL_MINUTES,
        }
    }
}

impl BypassCache {
    pub fn grant(&mut self, url: &str, now: DateTime<Utc>) {
        self.grants.insert(url.to_string(), now);
    }

    #[must_use]
    pub fn is_active(&self, url: &str, now: DateTime<Utc>) -> bool {
        self.grants
            .get(url)
            .is_some_and(|granted| now - *granted < self.ttl())
    }

    #[must_use]
    pub fn granted_at(&self, url: &str) -> Option<DateTime<Utc>> {
        self.grants.get(url).copied()
    }

    /// Apply the TTL from the latest policy. Affects existing grants too.
    pub fn set_ttl_minutes(&mut self, minutes: u32) {
        self.ttl_minutes = minutes;
    }

    #[must_use]
    pub const fn ttl_minutes(&self) -> u32 {
        self.ttl_minutes
    }

    /// Number of grants still in effect at `now`.
    #[must_use]
    pub fn active_count(&self, now: DateTime<Utc>) -> usize {
        self.grants
            .values()
            .filter(|granted| now - **granted < self.ttl())
            .count()
    }

    fn ttl(&self) -> Duration {
        Duration::minutes(i64::from(self.ttl_minutes))
    }
}
