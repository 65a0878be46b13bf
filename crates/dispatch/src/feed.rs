//! Push-based status feed.
//!
//! When a feed is configured, workers publish their status document to a
//! per-job topic instead of relying on the orchestrator polling storage.
//! The feed has queue semantics: messages published before a subscriber
//! attaches are retained and replayed, so an early-finishing call is never
//! lost to the subscribe race.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use cumulo_common::{CallKey, CumuloError, Result};
use cumulo_job::envelope::CallStatus;

/// Topic name of one job's status stream.
pub fn job_topic(key: &CallKey) -> String {
    format!("{}/{}", key.executor_id, key.job_id)
}

/// One subscriber's end of a job topic.
pub struct StatusSubscription {
    receiver: mpsc::Receiver<CallStatus>,
}

impl StatusSubscription {
    /// Blocks until the next status document arrives; `None` once the feed
    /// side is gone.
    pub async fn recv(&mut self) -> Option<CallStatus> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<CallStatus> {
        self.receiver.try_recv().ok()
    }
}

/// Message-broker contract for push-based completion monitoring.
#[async_trait]
pub trait StatusFeed: Send + Sync {
    /// Attaches a subscriber to `topic`, replaying any retained messages.
    async fn subscribe(&self, topic: &str) -> Result<StatusSubscription>;

    /// Publishes one status document to `topic`.
    async fn publish(&self, topic: &str, status: &CallStatus) -> Result<()>;
}

#[derive(Default)]
struct TopicState {
    retained: Vec<CallStatus>,
    senders: Vec<mpsc::Sender<CallStatus>>,
}

/// Process-local status feed for tests and single-process runs.
#[derive(Default)]
pub struct MemoryFeed {
    topics: RwLock<HashMap<String, TopicState>>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusFeed for MemoryFeed {
    async fn subscribe(&self, topic: &str) -> Result<StatusSubscription> {
        let mut topics = self.topics.write().await;
        let state = topics.entry(topic.to_string()).or_default();
        let backlog = state.retained.len().max(1) * 2 + 256;
        let (tx, rx) = mpsc::channel(backlog);
        for retained in &state.retained {
            tx.send(retained.clone())
                .await
                .map_err(|_| CumuloError::Storage("status feed subscriber gone".to_string()))?;
        }
        state.senders.push(tx);
        Ok(StatusSubscription { receiver: rx })
    }

    async fn publish(&self, topic: &str, status: &CallStatus) -> Result<()> {
        let mut topics = self.topics.write().await;
        let state = topics.entry(topic.to_string()).or_default();
        state.retained.push(status.clone());
        let mut live = Vec::with_capacity(state.senders.len());
        for sender in state.senders.drain(..) {
            if sender.send(status.clone()).await.is_ok() {
                live.push(sender);
            }
        }
        state.senders = live;
        Ok(())
    }
}
