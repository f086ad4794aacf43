//! Time-ordered 64-bit message identifiers.
//!
//! Layout: 41 bits of milliseconds since the Catga epoch, 10 bits of
//! worker id, 12 bits of per-millisecond sequence. IDs generated by one
//! worker are strictly increasing; IDs across workers sort by time.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Catga epoch: 2024-01-01T00:00:00Z, in unix milliseconds.
const EPOCH_MS: i64 = 1_704_067_200_000;

const WORKER_BITS: u8 = 10;
const SEQUENCE_BITS: u8 = 12;
const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

/// Unique, time-ordered identifier assigned to every message emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    /// Wrap a raw 64-bit value (e.g. read back from a store).
    pub fn from_raw(raw: i64) -> Self {
        MessageId(raw)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Generate the next id from the process-wide generator.
    pub fn next() -> Self {
        process_generator().next_id()
    }

    /// The moment this id was minted, recovered from the timestamp bits.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let ms = (self.0 >> (WORKER_BITS + SEQUENCE_BITS)) + EPOCH_MS;
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snowflake-style generator. One instance per worker; the process-wide
/// instance behind [`MessageId::next`] derives its worker id from
/// `CATGA_WORKER_ID` or falls back to a random one.
pub struct IdGenerator {
    worker_id: u16,
    state: Mutex<GeneratorState>,
}

struct GeneratorState {
    last_ms: i64,
    sequence: u16,
}

impl IdGenerator {
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: worker_id & MAX_WORKER_ID,
            state: Mutex::new(GeneratorState { last_ms: 0, sequence: 0 }),
        }
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id
    }

    pub fn next_id(&self) -> MessageId {
        let mut state = self.state.lock();
        let mut now = Utc::now().timestamp_millis() - EPOCH_MS;

        // Clock went backwards: hold at the last observed millisecond so
        // ids never regress.
        if now < state.last_ms {
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = state.sequence.wrapping_add(1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence exhausted within this millisecond.
                now = state.last_ms + 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let raw = (now << (WORKER_BITS + SEQUENCE_BITS))
            | ((self.worker_id as i64) << SEQUENCE_BITS)
            | state.sequence as i64;
        MessageId(raw)
    }
}

fn process_generator() -> &'static IdGenerator {
    static GENERATOR: OnceLock<IdGenerator> = OnceLock::new();
    GENERATOR.get_or_init(|| {
        let worker_id = std::env::var("CATGA_WORKER_ID")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or_else(|| rand::random::<u16>() & MAX_WORKER_ID);
        IdGenerator::new(worker_id)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_increasing() {
        let gen = IdGenerator::new(7);
        let mut prev = gen.next_id();
        let mut seen = HashSet::new();
        seen.insert(prev);

        for _ in 0..10_000 {
            let id = gen.next_id();
            assert!(id > prev, "ids must be strictly increasing");
            assert!(seen.insert(id), "ids must be unique");
            prev = id;
        }
    }

    #[test]
    fn worker_id_is_masked() {
        let gen = IdGenerator::new(u16::MAX);
        assert_eq!(gen.worker_id(), MAX_WORKER_ID);
    }

    #[test]
    fn timestamp_round_trips() {
        let gen = IdGenerator::new(1);
        let before = Utc::now();
        let id = gen.next_id();
        let ts = id.timestamp();
        assert!(ts >= before - chrono::Duration::milliseconds(2));
        assert!(ts <= Utc::now() + chrono::Duration::milliseconds(2));
    }

    #[test]
    fn raw_round_trips() {
        let id = MessageId::next();
        assert_eq!(MessageId::from_raw(id.as_i64()), id);
    }
}
