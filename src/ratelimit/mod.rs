//! Admission algorithms and per-key state management.

mod backend;
mod counter;
mod limiter;
mod registry;
mod slot;
mod store;

pub use backend::{store_backend, AdmissionBackend};
pub use counter::{FixedWindowConfig, FixedWindowCounter, KeyedFixedWindow};
pub use limiter::{RecordPolicy, SlidingWindowConfig, SlidingWindowLimiter};
pub use registry::{KeyLock, KeyLockRegistry};
pub use slot::{TimeSlot, WindowSeries};
pub use store::{
    CounterStore, FailMode, MemoryCounterStore, RedisCounterStore, StoreCounter,
    DEFAULT_KEY_PREFIX,
};
