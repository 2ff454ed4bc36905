//! Heartbeat freshness channel, used by recovery when pid liveness alone
//! is insufficient (process may have leaked across restarts).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pid: u32,
    pub updated_at: DateTime<Utc>,
}

impl Heartbeat {
    pub fn now(pid: u32) -> Self {
        Self {
            pid,
            updated_at: Utc::now(),
        }
    }

    /// Per `SPEC_FULL.md` §4.7: heartbeat is authoritative for liveness
    /// after 2x the configured heartbeat interval.
    pub fn is_fresh(&self, interval: chrono::Duration) -> bool {
        Utc::now() - self.updated_at <= interval * 2
    }
}
