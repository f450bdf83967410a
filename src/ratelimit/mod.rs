//! Rate limiting algorithms, per-key state stores, and the limiter facade.

mod backend;
mod bucket;
mod clock;
mod keyed;
mod limiter;
mod policy;
mod sweeper;
#[cfg(test)]
mod test_support;
mod window;

pub use backend::{BucketDecision, TokenBucketStore, WindowCounts, WindowStore};
pub use bucket::{BucketEntry, MemoryTokenBucketStore, DEFAULT_BUCKET_TTL};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{
    key_by_header, key_by_ip, key_by_route_and_ip, Decision, ExceededCallback, KeyFn, Limiter,
    LimiterBuilder, Meta, RequestInfo, RequestParts,
};
pub use policy::LimiterSet;
pub use sweeper::{StoreOptions, Sweeper, DEFAULT_SWEEP_INTERVAL};
pub use window::{
    window_start_for, MemoryWindowStore, WindowEntry, WindowEstimate, DEFAULT_WINDOW_TTL,
};
