//! Keyed action throttling with tiered lockout.

mod decision;
mod engine;
mod key;
mod memory;
mod policy;
mod store;

pub use decision::{Decision, DecisionReason};
pub use engine::{ThrottleEngine, DEFAULT_STORE_TIMEOUT};
pub use key::{counter_key, lockout_key, ThrottleKey, ADDR_PREFIX, KEY_SEPARATOR};
pub use memory::{MemoryCounterStore, DEFAULT_PURGE_INTERVAL};
pub use policy::{PolicyConfig, PolicyTable, ThrottleRule, MAX_DURATION_SECS};
pub use store::{CounterRecord, CounterStore};
