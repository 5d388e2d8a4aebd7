//! Point-to-point and request/response messaging between nodes

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::protocol::{ControlMessage, ControlResponse};
use crate::topology::NodeId;

/// Messaging service provided by the group membership layer.
///
/// `invoke` fails with `SuspectedNode` when the target leaves the view
/// before answering and with `Timeout` when no answer arrives in time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Address of the local node
    fn local_node(&self) -> &NodeId;

    /// Fire-and-forget delivery
    async fn send(&self, target: &NodeId, message: ControlMessage) -> Result<()>;

    /// Request/response call bounded by `timeout`
    async fn invoke(
        &self,
        target: &NodeId,
        message: ControlMessage,
        timeout: Duration,
    ) -> Result<ControlResponse>;

    /// Send to every target, collecting per-target failures
    async fn send_to_many(&self, targets: &[NodeId], message: ControlMessage) -> Vec<(NodeId, Result<()>)> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let result = self.send(target, message.clone()).await;
            results.push((target.clone(), result));
        }
        results
    }

    /// Invoke every target concurrently and collect all outcomes
    async fn invoke_many(
        &self,
        targets: &[NodeId],
        message: ControlMessage,
        timeout: Duration,
    ) -> Vec<(NodeId, Result<ControlResponse>)> {
        let calls = targets.iter().map(|target| {
            let message = message.clone();
            async move {
                let result = self
                    .invoke(target, message, timeout)
                    .await
                    .and_then(ControlResponse::into_result);
                (target.clone(), result)
            }
        });
        futures::future::join_all(calls).await
    }
}
