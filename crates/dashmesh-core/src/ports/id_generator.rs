//! IdGenerator port.
//!
//! Keys for new tasks and chat messages are ULIDs, so `children()` in key
//! order is also creation order.

use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use crate::domain::ids::NodeId;
use crate::ports::Clock;
use ulid::{Generator, Ulid};

pub trait IdGenerator: Send + Sync {
    /// A fresh sortable store key.
    fn generate_key(&self) -> Ulid;

    /// Node ids are persisted per installation; this is only used on first start.
    fn generate_node_id(&self) -> NodeId {
        NodeId::new(format!("node-{}", self.generate_key().to_string().to_lowercase()))
    }
}

/// ULID generator whose timestamp part comes from a `Clock`.
///
/// Keys generated within the same millisecond are still strictly increasing.
pub struct UlidGenerator<C> {
    clock: C,
    monotonic: Mutex<Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            monotonic: Mutex::new(Generator::new()),
        }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_key(&self) -> Ulid {
        let now = self.clock.now();
        let mut generator = self.monotonic.lock().unwrap_or_else(PoisonError::into_inner);
        generator
            .generate_from_datetime(SystemTime::from(now))
            // random part overflowed within one millisecond
            .unwrap_or_else(|_| Ulid::from_parts(now.timestamp_millis() as u64, rand::random()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);

        let id1 = id_gen.generate_key();
        let id2 = id_gen.generate_key();
        let id3 = id_gen.generate_key();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn fixed_clock_pins_the_timestamp_part() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_key();
        let id2 = id_gen.generate_key();

        assert_ne!(id1, id2);
        assert_eq!(id1.timestamp_ms(), id2.timestamp_ms());
        assert_eq!(id1.timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn keys_sort_by_creation_order() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        let id_gen = UlidGenerator::new(clock.clone());

        let first = id_gen.generate_key().to_string();
        let same_ms = id_gen.generate_key().to_string();
        clock.advance(chrono::Duration::milliseconds(5));
        let later = id_gen.generate_key().to_string();

        assert!(first < same_ms);
        assert!(same_ms < later);
    }

    #[test]
    fn node_ids_are_prefixed() {
        let id_gen = UlidGenerator::new(SystemClock);
        assert!(id_gen.generate_node_id().as_str().starts_with("node-"));
    }
}
