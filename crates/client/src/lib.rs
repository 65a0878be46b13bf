//! Client session and public executor API for cumulo.
//!
//! Architecture role:
//! - [`Session`]: the explicit per-run context object carrying the executor
//!   id, configuration, and collaborator handles;
//! - [`FunctionExecutor`]: `map` / `map_reduce` / `call_async` dispatch,
//!   `wait` / `get_result` completion, and background `clean`.

pub mod cleaner;
pub mod executor;
pub mod session;

pub use cleaner::purge_job_prefixes;
pub use executor::{FunctionExecutor, MapReduceOptions};
pub use session::{Session, SharedSession};
