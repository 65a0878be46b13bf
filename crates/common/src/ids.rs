//! Typed identifiers shared across builder/invoker/wait components.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one logical client session.
///
/// Every executor id is unique per run; it namespaces all storage keys the
/// session's jobs write, so two concurrent sessions never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorId(
    /// Raw id value.
    pub String,
);

impl ExecutorId {
    /// Generates a fresh random executor id.
    pub fn generate() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(raw[..12].to_string())
    }

    /// Raw string view.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of job a batch of calls belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// A map batch (`M` jobs).
    Map,
    /// A reduce batch (`R` jobs).
    Reduce,
    /// A single asynchronous call (`A` jobs).
    Async,
}

impl JobKind {
    fn letter(self) -> char {
        match self {
            JobKind::Map => 'M',
            JobKind::Reduce => 'R',
            JobKind::Async => 'A',
        }
    }
}

/// Job identifier, monotonically assigned per executor (`M000`, `R000`, `A000`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(
    /// Raw id value.
    pub String,
);

impl JobId {
    /// Builds the id for the `seq`-th job of the given kind.
    pub fn new(kind: JobKind, seq: u32) -> Self {
        Self(format!("{}{:03}", kind.letter(), seq))
    }

    /// Raw string view.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call identifier, a zero-padded sequence number unique within its job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(
    /// Raw id value.
    pub String,
);

impl CallId {
    /// Builds the id for the `index`-th call of a job.
    pub fn new(index: u32) -> Self {
        Self(format!("{index:05}"))
    }

    /// Raw string view.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque activation identifier returned by the compute backend for one
/// dispatched call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationId(
    /// Raw id value.
    pub String,
);

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The globally unique `(executor_id, job_id, call_id)` triple of one call.
///
/// This triple is the only key used to locate a call's status/output objects
/// in storage; no two concurrent jobs may reuse one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallKey {
    /// Owning executor session.
    pub executor_id: ExecutorId,
    /// Owning job.
    pub job_id: JobId,
    /// Call within the job.
    pub call_id: CallId,
}

impl CallKey {
    /// Builds the key for the `index`-th call of a job.
    pub fn new(executor_id: ExecutorId, job_id: JobId, index: u32) -> Self {
        Self {
            executor_id,
            job_id,
            call_id: CallId::new(index),
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.executor_id, self.job_id, self.call_id)
    }
}
