use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cumulo_common::{
    CallKey, CumuloError, ExecutorConfig, ExecutorId, JobId, JobKind, RemoteErrorKind,
};
use cumulo_job::envelope::{CallStatus, RemoteErrorRecord, ResultEnvelope, TAG_TIMEOUT};
use cumulo_job::layout;
use cumulo_storage::{MemoryBackend, StorageBackend};
use serde_json::json;

use crate::future::{CallFuture, CallOutput, CallState};

fn fast_config() -> Arc<ExecutorConfig> {
    Arc::new(ExecutorConfig {
        status_poll_interval_ms: 10,
        output_fetch_retries: 3,
        output_fetch_backoff_ms: 5,
        ..ExecutorConfig::default()
    })
}

fn call_key(index: u32) -> CallKey {
    CallKey::new(ExecutorId("execf".into()), JobId::new(JobKind::Map, 0), index)
}

fn ok_status(key: &CallKey) -> CallStatus {
    CallStatus {
        executor_id: key.executor_id.clone(),
        job_id: key.job_id.clone(),
        call_id: key.call_id.clone(),
        start_time: 10.0,
        end_time: 11.0,
        setup_time: 0.2,
        exec_time: 0.8,
        exception: None,
        exception_args: Vec::new(),
        new_futures: None,
        stats: BTreeMap::new(),
        engine_version: cumulo_common::engine_version().to_string(),
    }
}

fn failed_status(key: &CallKey, args: &[&str]) -> CallStatus {
    CallStatus {
        exception: Some(true),
        exception_args: args.iter().map(|s| s.to_string()).collect(),
        ..ok_status(key)
    }
}

async fn write_status(store: &MemoryBackend, config: &ExecutorConfig, status: &CallStatus) {
    let key = layout::status_key(&config.storage_prefix, &status.call_key());
    store
        .put_object(&config.storage_bucket, &key, status.encode().expect("encode status"))
        .await
        .expect("write status");
}

async fn write_envelope(
    store: &MemoryBackend,
    config: &ExecutorConfig,
    key: &CallKey,
    envelope: &ResultEnvelope,
) {
    let out_key = layout::output_key(&config.storage_prefix, key);
    store
        .put_object(
            &config.storage_bucket,
            &out_key,
            envelope.encode().expect("encode envelope"),
        )
        .await
        .expect("write envelope");
}

#[tokio::test]
async fn undispatched_future_rejects_status_and_result() {
    let store = Arc::new(MemoryBackend::new());
    let config = fast_config();
    let mut fut = CallFuture::new(call_key(0), store, config);
    assert_eq!(fut.state(), CallState::New);
    let err = fut.status(true).await.unwrap_err();
    assert!(matches!(err, CumuloError::State(_)));
    let err = fut.result(true).await.unwrap_err();
    assert!(matches!(err, CumuloError::State(_)));
}

#[tokio::test]
async fn status_blocks_over_the_visibility_gap() {
    let store = Arc::new(MemoryBackend::new());
    let config = fast_config();
    let key = call_key(0);
    let mut fut = CallFuture::tracked(key.clone(), Arc::clone(&store) as Arc<dyn StorageBackend>, Arc::clone(&config));

    let writer_store = Arc::clone(&store);
    let writer_config = Arc::clone(&config);
    let writer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        write_status(&writer_store, &writer_config, &ok_status(&call_key(0))).await;
    });

    let status = fut.status(true).await.expect("status").expect("present");
    assert_eq!(status.call_id, key.call_id);
    assert_eq!(fut.state(), CallState::Ready);
    writer.await.expect("writer");
}

#[tokio::test]
async fn result_round_trips_the_returned_value() {
    let store = Arc::new(MemoryBackend::new());
    let config = fast_config();
    let key = call_key(1);
    write_status(&store, &config, &ok_status(&key)).await;
    write_envelope(&store, &config, &key, &ResultEnvelope::success(&json!({"v": 17})).expect("build envelope")).await;

    let mut fut = CallFuture::tracked(key, Arc::clone(&store) as Arc<dyn StorageBackend>, config);
    let output = fut.result(true).await.expect("result").expect("value");
    match output {
        CallOutput::Value(v) => assert_eq!(v, json!({"v": 17})),
        other => panic!("expected value output, got {other:?}"),
    }
    assert_eq!(fut.state(), CallState::Success);
}

#[tokio::test]
async fn resolved_results_are_cached_without_a_second_fetch() {
    let store = Arc::new(MemoryBackend::new());
    let config = fast_config();
    let key = call_key(2);
    write_status(&store, &config, &ok_status(&key)).await;
    write_envelope(&store, &config, &key, &ResultEnvelope::success(&json!(5)).expect("build envelope")).await;

    let mut fut = CallFuture::tracked(key.clone(), Arc::clone(&store) as Arc<dyn StorageBackend>, Arc::clone(&config));
    fut.result(true).await.expect("first result");

    // Remove the objects: a second call must serve from the cache.
    let keys = vec![
        layout::status_key(&config.storage_prefix, &key),
        layout::output_key(&config.storage_prefix, &key),
    ];
    store
        .delete_objects(&config.storage_bucket, &keys)
        .await
        .expect("delete");

    let output = fut.result(true).await.expect("cached").expect("value");
    match output {
        CallOutput::Value(v) => assert_eq!(v, json!(5)),
        other => panic!("expected cached value, got {other:?}"),
    }
}

#[tokio::test]
async fn timeout_tag_raises_a_timeout_error_and_parks_in_error_state() {
    let store = Arc::new(MemoryBackend::new());
    let config = fast_config();
    let key = call_key(3);
    write_status(&store, &config, &failed_status(&key, &[TAG_TIMEOUT, "exceeded 600s"])).await;

    let mut fut = CallFuture::tracked(key.clone(), Arc::clone(&store) as Arc<dyn StorageBackend>, Arc::clone(&config));
    let err = fut.result(true).await.unwrap_err();
    match err {
        CumuloError::Remote(remote) => assert_eq!(remote.kind, RemoteErrorKind::Timeout),
        other => panic!("expected remote timeout, got {other:?}"),
    }

    let mut quiet = CallFuture::tracked(key, Arc::clone(&store) as Arc<dyn StorageBackend>, config);
    let output = quiet.result(false).await.expect("no throw");
    assert!(output.is_none());
    assert_eq!(quiet.state(), CallState::Error);
}

#[tokio::test]
async fn spawned_envelopes_redirect_to_child_futures() {
    let store = Arc::new(MemoryBackend::new());
    let config = fast_config();
    let key = call_key(4);
    let child = CallKey::new(key.executor_id.clone(), JobId::new(JobKind::Reduce, 0), 0);
    write_status(&store, &config, &ok_status(&key)).await;
    write_envelope(&store, &config, &key, &ResultEnvelope::spawned(vec![child.clone()])).await;

    let mut fut = CallFuture::tracked(key, Arc::clone(&store) as Arc<dyn StorageBackend>, config);
    let output = fut.result(true).await.expect("result").expect("spawned");
    match output {
        CallOutput::Spawned(children) => {
            assert_eq!(children.len(), 1);
            assert_eq!(children[0].key(), &child);
            assert_eq!(children[0].state(), CallState::Invoked);
        }
        other => panic!("expected spawned output, got {other:?}"),
    }
    assert_eq!(fut.state(), CallState::Spawned);
}

#[tokio::test]
async fn missing_output_exhausts_retries_with_a_storage_error() {
    let store = Arc::new(MemoryBackend::new());
    let config = Arc::new(ExecutorConfig {
        output_fetch_retries: 1,
        output_fetch_backoff_ms: 5,
        status_poll_interval_ms: 5,
        ..ExecutorConfig::default()
    });
    let key = call_key(5);
    write_status(&store, &config, &ok_status(&key)).await;

    let mut fut = CallFuture::tracked(key, store, config);
    let err = fut.result(true).await.unwrap_err();
    assert!(err.to_string().contains("unable to get output"));
}

#[tokio::test]
async fn encode_fallback_failures_surface_as_serialization_errors() {
    let store = Arc::new(MemoryBackend::new());
    let config = fast_config();
    let key = call_key(6);
    write_status(&store, &config, &ok_status(&key)).await;
    write_envelope(
        &store,
        &config,
        &key,
        &ResultEnvelope::failure(RemoteErrorRecord {
            tag: "ExoticError".into(),
            message: "original failure was not encodable".into(),
            remote_trace: Some("remote trace".into()),
            encode_fallback: true,
        }),
    )
    .await;

    let mut fut = CallFuture::tracked(key, store, config);
    let err = fut.result(true).await.unwrap_err();
    match err {
        CumuloError::Remote(remote) => {
            assert_eq!(remote.kind, RemoteErrorKind::Serialization);
            assert!(remote.message.contains("not encodable"));
        }
        other => panic!("expected serialization failure, got {other:?}"),
    }
}

#[tokio::test]
async fn cancel_reports_not_supported() {
    let store = Arc::new(MemoryBackend::new());
    let fut = CallFuture::tracked(call_key(7), store, fast_config());
    let err = fut.cancel().unwrap_err();
    assert!(matches!(err, CumuloError::Unsupported(_)));
}
