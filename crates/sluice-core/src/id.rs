//! Strongly-typed identifiers and the worker-seeded id generator.
//!
//! All identifiers in Sluice are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Engine minted**: Generated from `(worker-number, time, sequence)` so no
//!   cross-worker coordination is required
//! - **Roughly sortable**: The time component dominates the encoding, so ids
//!   minted later compare greater in the common case
//!
//! # Example
//!
//! ```rust
//! use sluice_core::id::{DagInstanceId, IdGenerator, IdMinter};
//!
//! let ids = IdGenerator::new(7);
//! let dag_ins = DagInstanceId::from(ids.next_string_id());
//!
//! // IDs are different types - this won't compile:
//! // let wrong: sluice_core::id::DagId = dag_ins;
//! ```

use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Engine epoch: 2024-01-01T00:00:00Z in milliseconds since the Unix epoch.
///
/// Ids encode 10 ms ticks since this instant; 39 bits of ticks cover well over
/// a century.
const EPOCH_MS: u64 = 1_704_067_200_000;

/// Number of bits reserved for the tick component.
const TIME_BITS: u32 = 39;
/// Number of bits reserved for the per-tick sequence.
const SEQ_BITS: u32 = 8;
/// Number of bits reserved for the worker number.
const WORKER_BITS: u32 = 16;

/// Maximum sequence value within one tick.
const MAX_SEQ: u64 = (1 << SEQ_BITS) - 1;

/// Mints engine identifiers.
///
/// The engine holds exactly one minter per process; the default implementation
/// is [`IdGenerator`], seeded from the worker number parsed out of the worker
/// key. Installing a custom minter lifts the worker-key format requirement.
pub trait IdMinter: Send + Sync {
    /// Returns the next unique id, rendered as a string.
    fn next_string_id(&self) -> String;
}

/// Generator state guarded by the internal mutex.
#[derive(Debug)]
struct GeneratorState {
    last_tick: u64,
    sequence: u64,
}

/// Monotonic 64-bit id generator.
///
/// Layout (most significant first): 39 bits of 10 ms ticks since the engine
/// epoch, 8 bits of per-tick sequence, 16 bits of worker number. Two workers
/// with distinct numbers can never mint the same id; one worker mints at most
/// 256 ids per 10 ms tick and spins to the next tick beyond that.
#[derive(Debug)]
pub struct IdGenerator {
    worker_number: u16,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    /// Creates a generator seeded with the given worker number.
    #[must_use]
    pub fn new(worker_number: u16) -> Self {
        Self {
            worker_number,
            state: Mutex::new(GeneratorState {
                last_tick: 0,
                sequence: 0,
            }),
        }
    }

    /// Returns the worker number this generator was seeded with.
    #[must_use]
    pub const fn worker_number(&self) -> u16 {
        self.worker_number
    }

    /// Returns the next unique 64-bit id.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned, which can only happen if a
    /// previous call panicked while holding it.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock().expect("id generator mutex poisoned");

        let mut tick = Self::current_tick();
        // Clock skew: never move backwards relative to the last minted tick.
        if tick < state.last_tick {
            tick = state.last_tick;
        }

        if tick == state.last_tick {
            state.sequence += 1;
            if state.sequence > MAX_SEQ {
                // Sequence exhausted within this tick; move to the next one.
                tick += 1;
                state.sequence = 0;
            }
        } else {
            state.sequence = 0;
        }
        state.last_tick = tick;

        let tick = tick & ((1 << TIME_BITS) - 1);
        (tick << (SEQ_BITS + WORKER_BITS))
            | (state.sequence << WORKER_BITS)
            | u64::from(self.worker_number)
    }

    /// Returns 10 ms ticks elapsed since the engine epoch.
    fn current_tick() -> u64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        now_ms.saturating_sub(EPOCH_MS) / 10
    }
}

impl IdMinter for IdGenerator {
    fn next_string_id(&self) -> String {
        self.next_id().to_string()
    }
}

/// Declares a string-backed identifier newtype with the shared conversions.
macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an id from any string-like value.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns true if the id is empty (not yet minted).
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id! {
    /// Identifier of a DAG template.
    ///
    /// DAG ids are user supplied (e.g. the YAML file stem) and must be unique
    /// within one store.
    DagId
}

string_id! {
    /// Identifier of one execution of a DAG, minted by the engine.
    DagInstanceId
}

string_id! {
    /// Identifier of one task execution within a DAG instance, minted by the
    /// engine.
    TaskInstanceId
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_are_unique_within_one_worker() {
        let ids = IdGenerator::new(1);
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(ids.next_id()));
        }
    }

    #[test]
    fn ids_are_unique_across_workers() {
        let a = IdGenerator::new(1);
        let b = IdGenerator::new(2);
        // The worker number occupies the low 16 bits, so even ids minted in
        // the same tick with the same sequence differ.
        assert_ne!(a.next_id() & 0xFFFF, b.next_id() & 0xFFFF);
    }

    #[test]
    fn ids_are_monotonic() {
        let ids = IdGenerator::new(3);
        let mut prev = ids.next_id();
        for _ in 0..1_000 {
            let next = ids.next_id();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn ids_are_unique_under_concurrency() {
        let ids = Arc::new(IdGenerator::new(9));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ids = Arc::clone(&ids);
            handles.push(std::thread::spawn(move || {
                (0..2_000).map(|_| ids.next_id()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("thread panicked") {
                assert!(seen.insert(id));
            }
        }
    }

    #[test]
    fn string_ids_round_trip_serde() {
        let id = DagInstanceId::from("12345");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"12345\"");
        let back: DagInstanceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn empty_id_is_reported() {
        assert!(DagInstanceId::new("").is_empty());
        assert!(!DagInstanceId::new("1").is_empty());
    }
}
