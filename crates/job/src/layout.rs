//! Storage key layout shared by the orchestrator and the worker contract.
//!
//! All objects of one call live under
//! `{prefix}/{executor_id}/{job_id}/{call_id}/`; job-scoped objects
//! (function bundle, aggregated argument blob) live one level up. The
//! layout is append-mostly: every call writes exactly one status key and one
//! output key, unique per call, so key uniqueness is the only coordination
//! mechanism the storage layer needs.

use cumulo_common::{CallId, CallKey, ExecutorId, JobId};

/// File name of the per-call status document.
pub const STATUS_SUFFIX: &str = "status.json";
/// File name of the per-call output envelope.
pub const OUTPUT_SUFFIX: &str = "output.bin";

pub fn job_prefix(prefix: &str, executor_id: &ExecutorId, job_id: &JobId) -> String {
    format!("{prefix}/{executor_id}/{job_id}")
}

pub fn call_prefix(prefix: &str, key: &CallKey) -> String {
    format!(
        "{}/{}",
        job_prefix(prefix, &key.executor_id, &key.job_id),
        key.call_id
    )
}

pub fn status_key(prefix: &str, key: &CallKey) -> String {
    format!("{}/{STATUS_SUFFIX}", call_prefix(prefix, key))
}

pub fn output_key(prefix: &str, key: &CallKey) -> String {
    format!("{}/{OUTPUT_SUFFIX}", call_prefix(prefix, key))
}

pub fn func_key(prefix: &str, executor_id: &ExecutorId, job_id: &JobId) -> String {
    format!("{}/func.bin", job_prefix(prefix, executor_id, job_id))
}

pub fn agg_data_key(prefix: &str, executor_id: &ExecutorId, job_id: &JobId) -> String {
    format!("{}/aggdata.bin", job_prefix(prefix, executor_id, job_id))
}

/// Extracts the call id from a status key, as produced by a prefix listing
/// of one job. Returns `None` for job-scoped or foreign keys.
pub fn call_id_of_status_key(key: &str) -> Option<CallId> {
    let rest = key.strip_suffix(STATUS_SUFFIX)?;
    let rest = rest.strip_suffix('/')?;
    let call = rest.rsplit('/').next()?;
    if call.is_empty() || !call.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(CallId(call.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulo_common::JobKind;

    fn key() -> CallKey {
        CallKey::new(ExecutorId("exec42".into()), JobId::new(JobKind::Map, 0), 7)
    }

    #[test]
    fn call_keys_nest_under_job_prefix() {
        let k = key();
        assert_eq!(status_key("p", &k), "p/exec42/M000/00007/status.json");
        assert_eq!(output_key("p", &k), "p/exec42/M000/00007/output.bin");
        assert_eq!(
            func_key("p", &k.executor_id, &k.job_id),
            "p/exec42/M000/func.bin"
        );
        assert_eq!(
            agg_data_key("p", &k.executor_id, &k.job_id),
            "p/exec42/M000/aggdata.bin"
        );
    }

    #[test]
    fn status_keys_round_trip_their_call_id() {
        let k = key();
        let listed = status_key("p", &k);
        assert_eq!(call_id_of_status_key(&listed), Some(k.call_id));
    }

    #[test]
    fn non_status_keys_are_rejected() {
        assert_eq!(call_id_of_status_key("p/exec42/M000/func.bin"), None);
        assert_eq!(call_id_of_status_key("p/exec42/M000/00007/output.bin"), None);
        assert_eq!(call_id_of_status_key("p/exec42/M000/oops/status.json"), None);
    }
}
