//! Dispatch and completion tracking for cumulo.
//!
//! Architecture role:
//! - defines the [`ComputeBackend`] contract a FaaS/container/local backend
//!   implements;
//! - dispatches job descriptions through it with token-bucket gating and
//!   bounded jittered retry ([`invoker`]);
//! - tracks each call's lifecycle in a [`CallFuture`] state machine;
//! - monitors completion by storage polling or push feed ([`wait`], [`feed`]).

pub mod compute;
pub mod feed;
pub mod future;
pub mod invoker;
pub mod wait;

#[cfg(test)]
mod future_tests;

pub use compute::ComputeBackend;
pub use feed::{MemoryFeed, StatusFeed, StatusSubscription, job_topic};
pub use future::{CallFuture, CallOutput, CallState};
pub use invoker::Invoker;
pub use wait::{WaitEngine, WaitMode, WaitOptions};
