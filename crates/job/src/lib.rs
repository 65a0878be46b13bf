//! Job construction and data-plane formats for cumulo.
//!
//! Architecture role:
//! - fixes the storage key layout the orchestrator and worker contract share;
//! - defines job/call descriptors and the invocation wire payload;
//! - defines the status/output documents workers write;
//! - partitions logical inputs into byte-range chunks;
//! - builds dispatchable job descriptions (serialize, aggregate, upload).
//!
//! Key modules:
//! - [`layout`]
//! - [`descriptor`]
//! - [`envelope`]
//! - [`partition`]
//! - [`builder`]
//!
//! Feature flags:
//! - `urls` (default): HTTP HEAD probing for URL input sources.

pub mod builder;
pub mod descriptor;
pub mod envelope;
pub mod layout;
pub mod partition;

pub use builder::{CallArgs, ExtraBinding, FunctionBundle, JobBuilder, JobOptions};
pub use descriptor::{InvocationPayload, JobDescription, epoch_secs};
pub use envelope::{CallStatus, RemoteErrorRecord, ResultEnvelope};
pub use partition::{InputSource, Partition, PartitionPlan, PartitionSource, partition};
