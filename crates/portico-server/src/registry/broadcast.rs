//! Fan-out to every session of a registry, and liveness pings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use portico_core::{Opcode, ServerState, SessionId};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::SessionRegistry;
use crate::errors::Result;
use crate::metrics::WS_BROADCAST_FAILURES_TOTAL;
use crate::session::check_data;
use crate::transport::FrameCache;

/// Outcome of one broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastSummary {
    /// Sessions in the snapshot.
    pub recipients: usize,
    /// Frames written.
    pub delivered: usize,
    /// Frames that failed; each was logged.
    pub failed: usize,
    /// The registry left `Start` before every recipient was reached.
    pub interrupted: bool,
}

impl SessionRegistry {
    /// Send one message to every live session.
    ///
    /// A failing recipient is logged and counted; delivery to the others
    /// continues. Compressed forms are computed once per method.
    pub async fn broadcast(&self, opcode: Opcode, payload: Bytes) -> Result<BroadcastSummary> {
        check_data(opcode, &payload)?;
        let cache = FrameCache::with_compressor(payload, self.compressor());
        Ok(self.deliver(opcode, &cache).await)
    }

    /// [`Self::broadcast`] on a background task.
    ///
    /// Validation happens before spawning. The handle resolves exactly once,
    /// after the whole batch, even when there are no recipients.
    pub fn broadcast_async(
        self: &Arc<Self>,
        opcode: Opcode,
        payload: Bytes,
    ) -> Result<JoinHandle<BroadcastSummary>> {
        check_data(opcode, &payload)?;
        let cache = FrameCache::with_compressor(payload, self.compressor());
        let registry = Arc::clone(self);
        Ok(tokio::spawn(async move {
            registry.deliver(opcode, &cache).await
        }))
    }

    async fn deliver(&self, opcode: Opcode, cache: &FrameCache) -> BroadcastSummary {
        let recipients = self.sessions();
        let mut summary = BroadcastSummary {
            recipients: recipients.len(),
            ..BroadcastSummary::default()
        };

        let mut pending = Vec::with_capacity(recipients.len());
        for session in &recipients {
            if self.state() != ServerState::Start {
                summary.interrupted = true;
                break;
            }
            let id = session.id().clone();
            let delivery = session.transport().send(opcode, cache);
            pending.push(async move { (id, delivery.await) });
        }

        for (id, result) in join_all(pending).await {
            match result {
                Ok(()) => summary.delivered += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(path = %self.path, session_id = %id, error = %err, "broadcast delivery failed");
                }
            }
        }

        if summary.failed > 0 {
            metrics::counter!(WS_BROADCAST_FAILURES_TOTAL, "path" => self.path.clone())
                .increment(summary.failed as u64);
        }
        debug!(
            path = %self.path,
            %opcode,
            recipients = summary.recipients,
            delivered = summary.delivered,
            failed = summary.failed,
            "broadcast complete"
        );
        summary
    }

    /// Ping every live session concurrently, each bounded by `timeout`.
    pub async fn broadping(&self, payload: Bytes, timeout: Duration) -> HashMap<SessionId, bool> {
        let sessions = self.sessions();
        let pings = sessions.iter().map(|session| {
            let payload = payload.clone();
            async move {
                let alive = session.transport().ping(payload, timeout).await;
                (session.id().clone(), alive)
            }
        });
        join_all(pings).await.into_iter().collect()
    }

    /// Sessions that answered a ping within the wait time.
    pub async fn active_ids(&self) -> Vec<SessionId> {
        self.partition_by_liveness(true).await
    }

    /// Sessions that did not answer a ping within the wait time.
    pub async fn inactive_ids(&self) -> Vec<SessionId> {
        self.partition_by_liveness(false).await
    }

    async fn partition_by_liveness(&self, alive: bool) -> Vec<SessionId> {
        self.broadping(Bytes::new(), self.wait_time())
            .await
            .into_iter()
            .filter_map(|(id, answered)| (answered == alive).then_some(id))
            .collect()
    }
}
