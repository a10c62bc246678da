// Shared identifiers and time helpers used by every subsystem.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Log sequence number.
///
/// Strictly increasing and gap-free within one run of the log. LSN 0 is
/// reserved and never assigned to a record.
pub type Lsn = u64;

/// Globally unique, time-ordered transaction identifier.
///
/// String form: `txn_<utc-yyyyMMddHHmmss>_<8-digit-sequence>_<32-hex-random>`.
/// The fixed-width sequence makes lexicographic order agree with start order,
/// which the deadlock victim policy relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Builds an ID from its three components.
    pub fn generate(started_at: DateTime<Utc>, sequence: u64, random: u128) -> Self {
        TransactionId(format!(
            "txn_{}_{:08}_{:032x}",
            started_at.format("%Y%m%d%H%M%S"),
            sequence,
            random
        ))
    }

    /// Wraps a previously issued ID, e.g. one read back from the log.
    pub fn from_string(raw: impl Into<String>) -> Self {
        TransactionId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current wall-clock time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch times.
pub fn epoch_millis(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_millis().max(0) as u64
}

/// Inverse of [`epoch_millis`]. Out-of-range values clamp to the epoch.
pub fn from_epoch_millis(millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_id_orders_by_start_time() {
        let t1 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 1).unwrap();

        let a = TransactionId::generate(t1, 1, 0xffff);
        let b = TransactionId::generate(t1, 2, 0x0001);
        let c = TransactionId::generate(t2, 3, 0x0000);

        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_epoch_millis_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 7, 15, 8, 30, 0).unwrap();
        assert_eq!(from_epoch_millis(epoch_millis(ts)), ts);
    }
}
