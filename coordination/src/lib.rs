//! Distributed coordination primitives: the shared cache store and the
//! idempotency layer built on top of it.
//!
//! The cache store is an enum over two backends with identical semantics —
//! a Redis deployment (production) and an in-process map (tests, single-node
//! hosts). Everything above it is backend-agnostic: TTL'd keys, atomic
//! counters, hashes, owner-token locks with Lua-guarded release/refresh,
//! singleflight cache-aside, and pub/sub progress events.
//!
//! The idempotency service turns those primitives into a claim protocol:
//! for a `(job kind, entity id)` pair at most one worker in the fleet holds
//! a running execution, completed executions suppress duplicates for a
//! dedup window, and a crashed worker's claim expires on its own.
//!
//! Nothing durable lives only here: Redis eviction under memory pressure
//! loses progress metadata, never review data.

pub mod error;
pub mod idempotency;
pub mod memory_store;
pub mod redis_store;
pub mod store;

pub use error::{CacheError, CacheResult};
pub use idempotency::{
    ClaimOutcome, ExecStatus, ExecutionHandle, ExecutionState, IdempotencyConfig,
    IdempotencyService, SkipReason,
};
pub use store::CacheStore;
