//! Status and output documents written by workers.
//!
//! The status object is a small JSON document written exactly once at the
//! end of execution; the output envelope is a separate binary object so
//! large results stream through storage instead of the status channel.
//! Both are read-only once written.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use cumulo_common::{CallId, CallKey, CumuloError, ExecutorId, JobId, RemoteError, RemoteErrorKind, Result};

/// Failure tag for a worker-enforced execution timeout.
pub const TAG_TIMEOUT: &str = "OUTATIME";
/// Failure tag for a worker out-of-memory condition.
pub const TAG_OUT_OF_MEMORY: &str = "OUTOFMEMORY";
/// Failure tag for an orchestrator/worker engine version mismatch.
pub const TAG_VERSION_MISMATCH: &str = "WRONGVERSION";

/// Per-call status document, JSON-encoded under the call's status key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStatus {
    /// Owning executor session.
    pub executor_id: ExecutorId,
    /// Owning job.
    pub job_id: JobId,
    /// Call within the job.
    pub call_id: CallId,
    /// Worker start timestamp (epoch seconds).
    pub start_time: f64,
    /// Worker end timestamp (epoch seconds).
    pub end_time: f64,
    /// Seconds spent unpacking the function/module bundle.
    pub setup_time: f64,
    /// Seconds spent inside the user function.
    pub exec_time: f64,
    /// Whether the call failed; absent means success.
    pub exception: Option<bool>,
    /// Failure tag and message parts; `exception_args[0]` carries one of the
    /// `TAG_*` values or the remote error type name.
    #[serde(default)]
    pub exception_args: Vec<String>,
    /// `"{job_id}/{count}"` marker set when this call spawned further calls.
    #[serde(default)]
    pub new_futures: Option<String>,
    /// Worker resource statistics.
    #[serde(default)]
    pub stats: BTreeMap<String, f64>,
    /// Worker engine version.
    pub engine_version: String,
}

impl CallStatus {
    /// The call key this status belongs to.
    pub fn call_key(&self) -> CallKey {
        CallKey {
            executor_id: self.executor_id.clone(),
            job_id: self.job_id.clone(),
            call_id: self.call_id.clone(),
        }
    }

    /// True when the worker reported a failure.
    pub fn failed(&self) -> bool {
        self.exception.unwrap_or(false)
    }

    /// Classifies a reported failure into the remote-error taxonomy.
    ///
    /// Returns `None` for successful calls. Unknown tags classify as a
    /// user-function failure carrying the tag as the remote type name.
    pub fn remote_error(&self) -> Option<RemoteError> {
        if !self.failed() {
            return None;
        }
        let tag = self.exception_args.first().map(String::as_str).unwrap_or("");
        let message = if self.exception_args.len() > 1 {
            self.exception_args[1..].join(": ")
        } else {
            tag.to_string()
        };
        let kind = match tag {
            TAG_TIMEOUT => RemoteErrorKind::Timeout,
            TAG_OUT_OF_MEMORY => RemoteErrorKind::OutOfMemory,
            TAG_VERSION_MISMATCH => RemoteErrorKind::VersionMismatch,
            "" => RemoteErrorKind::User {
                type_name: "unknown".to_string(),
            },
            other => RemoteErrorKind::User {
                type_name: other.to_string(),
            },
        };
        Some(RemoteError::new(kind, message))
    }

    /// Parses the `new_futures` marker into `(job_id, call_count)`.
    pub fn spawned_marker(&self) -> Option<(JobId, u32)> {
        let marker = self.new_futures.as_deref()?;
        let (job, count) = marker.split_once('/')?;
        let count = count.parse().ok()?;
        if job.is_empty() || count == 0 {
            return None;
        }
        Some((JobId(job.to_string()), count))
    }

    /// Decodes a status document from its JSON bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| CumuloError::Storage(format!("invalid status document: {e}")))
    }

    /// Encodes a status document to its JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CumuloError::Storage(format!("encode status: {e}")))
    }
}

/// Worker-side record of one failure, shipped inside the output envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteErrorRecord {
    /// One of the `TAG_*` values, or the remote error type name.
    pub tag: String,
    /// Human-readable message.
    pub message: String,
    /// Opaque remote traceback, when captured.
    pub remote_trace: Option<String>,
    /// Set when the worker could not encode the real failure and shipped a
    /// stringified bundle instead.
    #[serde(default)]
    pub encode_fallback: bool,
}

impl RemoteErrorRecord {
    /// Converts the record into the orchestrator-side tagged error.
    ///
    /// An `encode_fallback` record always classifies as a serialization
    /// failure carrying the stringified original, so the caller never trips
    /// over a second undecodable error value.
    pub fn to_remote_error(&self) -> RemoteError {
        let kind = if self.encode_fallback {
            RemoteErrorKind::Serialization
        } else {
            match self.tag.as_str() {
                TAG_TIMEOUT => RemoteErrorKind::Timeout,
                TAG_OUT_OF_MEMORY => RemoteErrorKind::OutOfMemory,
                TAG_VERSION_MISMATCH => RemoteErrorKind::VersionMismatch,
                other => RemoteErrorKind::User {
                    type_name: other.to_string(),
                },
            }
        };
        RemoteError {
            kind,
            message: self.message.clone(),
            remote_trace: self.remote_trace.clone(),
        }
    }
}

/// Output envelope written once per call, bincode-encoded under the call's
/// output key.
///
/// The return value itself stays an opaque serialized payload inside the
/// envelope; large outputs stream through storage rather than through the
/// status channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Whether the call succeeded.
    pub success: bool,
    /// Serialized return value, when successful and not a spawn.
    pub result: Option<Vec<u8>>,
    /// The failure record, when unsuccessful.
    pub error: Option<RemoteErrorRecord>,
    /// Child calls this call spawned; the caller must track these instead
    /// of this call's value.
    pub spawned: Option<Vec<CallKey>>,
}

impl ResultEnvelope {
    /// Envelope for a successful call returning `value`.
    pub fn success(value: &serde_json::Value) -> Result<Self> {
        let result = serde_json::to_vec(value)
            .map_err(|e| CumuloError::Storage(format!("encode result value: {e}")))?;
        Ok(Self {
            success: true,
            result: Some(result),
            error: None,
            spawned: None,
        })
    }

    /// Envelope for a failed call.
    pub fn failure(record: RemoteErrorRecord) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(record),
            spawned: None,
        }
    }

    /// Envelope for a call that spawned further calls.
    pub fn spawned(children: Vec<CallKey>) -> Self {
        Self {
            success: true,
            result: None,
            error: None,
            spawned: Some(children),
        }
    }

    /// Decodes the opaque return value payload.
    pub fn decode_value(&self) -> Result<Option<serde_json::Value>> {
        match &self.result {
            None => Ok(None),
            Some(raw) => serde_json::from_slice(raw)
                .map(Some)
                .map_err(|e| CumuloError::Storage(format!("invalid result value: {e}"))),
        }
    }

    /// Decodes an envelope from its binary bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| CumuloError::Storage(format!("invalid output envelope: {e}")))
    }

    /// Encodes an envelope to its binary bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CumuloError::Storage(format!("encode envelope: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulo_common::JobKind;

    fn status(args: Vec<&str>) -> CallStatus {
        CallStatus {
            executor_id: ExecutorId("e".into()),
            job_id: JobId::new(JobKind::Map, 0),
            call_id: CallId::new(0),
            start_time: 1.0,
            end_time: 2.0,
            setup_time: 0.1,
            exec_time: 0.9,
            exception: Some(true),
            exception_args: args.into_iter().map(String::from).collect(),
            new_futures: None,
            stats: BTreeMap::new(),
            engine_version: "0.0.0".into(),
        }
    }

    #[test]
    fn timeout_tag_classifies_as_timeout() {
        let err = status(vec![TAG_TIMEOUT, "call ran too long"])
            .remote_error()
            .expect("error");
        assert_eq!(err.kind, RemoteErrorKind::Timeout);
        assert_eq!(err.message, "call ran too long");
    }

    #[test]
    fn oom_and_version_tags_classify_specifically() {
        assert_eq!(
            status(vec![TAG_OUT_OF_MEMORY]).remote_error().expect("err").kind,
            RemoteErrorKind::OutOfMemory
        );
        assert_eq!(
            status(vec![TAG_VERSION_MISMATCH, "0.4.0 vs 0.3.0"])
                .remote_error()
                .expect("err")
                .kind,
            RemoteErrorKind::VersionMismatch
        );
    }

    #[test]
    fn unknown_tags_classify_as_user_errors() {
        let err = status(vec!["ValueError", "bad input"]).remote_error().expect("err");
        assert_eq!(
            err.kind,
            RemoteErrorKind::User {
                type_name: "ValueError".to_string()
            }
        );
        assert_eq!(err.message, "bad input");
    }

    #[test]
    fn successful_status_has_no_error() {
        let mut s = status(vec![]);
        s.exception = None;
        assert!(s.remote_error().is_none());
        assert!(!s.failed());
    }

    #[test]
    fn spawned_marker_parses_job_and_count() {
        let mut s = status(vec![]);
        s.exception = None;
        s.new_futures = Some("R003/4".to_string());
        assert_eq!(s.spawned_marker(), Some((JobId("R003".into()), 4)));
        s.new_futures = Some("bogus".to_string());
        assert_eq!(s.spawned_marker(), None);
    }

    #[test]
    fn encode_fallback_records_classify_as_serialization_failures() {
        let record = RemoteErrorRecord {
            tag: "WeirdError".into(),
            message: "original: unprintable".into(),
            remote_trace: None,
            encode_fallback: true,
        };
        assert_eq!(record.to_remote_error().kind, RemoteErrorKind::Serialization);
    }

    #[test]
    fn envelope_binary_roundtrip() {
        let env = ResultEnvelope::success(&serde_json::json!({"n": 42})).expect("build");
        let decoded = ResultEnvelope::decode(&env.encode().expect("encode")).expect("decode");
        assert!(decoded.success);
        assert_eq!(
            decoded.decode_value().expect("value"),
            Some(serde_json::json!({"n": 42}))
        );
    }

    #[test]
    fn spawned_envelopes_round_trip_their_child_keys() {
        let child = CallKey::new(ExecutorId("e".into()), JobId::new(JobKind::Reduce, 1), 0);
        let env = ResultEnvelope::spawned(vec![child.clone()]);
        let decoded = ResultEnvelope::decode(&env.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.spawned, Some(vec![child]));
    }
}
