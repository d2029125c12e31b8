//! Job dispatch
//!
//! Shard planning, the durable queue and the worker that submits shard jobs
//! to executors.

mod planner;
mod queue;
mod retry;
mod server;
mod worker;

pub use planner::{plan, resolve_shard_count, MAX_SHARDS};
pub use queue::{JobQueue, QueueError, QueueTask};
pub use retry::RetryPolicy;
pub use server::{router, DispatchState, LocalEnqueuer};
pub use worker::{DispatchError, Dispatcher, TaskOutcome};
