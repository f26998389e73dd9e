//! Single in-flight gate for remote agent config pushes.
//!
//! Only one push may be outstanding at a time. A pusher sends the new config
//! and hands back a channel on which the agents acknowledge its hash; the
//! coordinator waits on it for a bounded time.

use crate::error::{Result, ServiceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Non-blocking mutual exclusion. Each instance is its own gate.
#[derive(Clone, Default)]
pub struct SingleFlight {
    busy: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Result<SingleFlightPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ServiceError::Busy("config push already in flight".into()))?;
        Ok(SingleFlightPermit {
            busy: Some(Arc::clone(&self.busy)),
        })
    }

    pub fn is_ready(&self) -> bool {
        !self.busy.load(Ordering::Acquire)
    }
}

#[must_use = "the gate is released when the permit is dropped"]
pub struct SingleFlightPermit {
    busy: Option<Arc<AtomicBool>>,
}

impl SingleFlightPermit {
    pub fn release(mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        if let Some(busy) = self.busy.take() {
            busy.store(false, Ordering::Release);
        }
    }
}

impl Drop for SingleFlightPermit {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Agent verdict on one config hash: `Err` carries the agent's message.
pub type AgentAck = std::result::Result<(), String>;

pub struct PushHandle {
    pub config_hash: String,
    pub ack: oneshot::Receiver<AgentAck>,
}

#[async_trait]
pub trait ConfigPusher: Send + Sync {
    async fn push(&self, payload: serde_json::Value) -> anyhow::Result<PushHandle>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum DeployStatus {
    Deployed,
    Failed(String),
}

pub struct ConfigPushCoordinator<P> {
    pusher: P,
    gate: SingleFlight,
    timeout: Duration,
}

impl<P: ConfigPusher> ConfigPushCoordinator<P> {
    pub fn new(pusher: P, timeout: Duration) -> Self {
        Self {
            pusher,
            gate: SingleFlight::new(),
            timeout,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    pub async fn deploy(&self, payload: serde_json::Value) -> Result<DeployStatus> {
        let permit = self.gate.try_acquire().map_err(|err| {
            warn!("rejected config push while another is in flight");
            err
        })?;

        let handle = self.pusher.push(payload).await?;
        let config_hash = handle.config_hash;
        let status = match tokio::time::timeout(self.timeout, handle.ack).await {
            Err(_) => {
                warn!(%config_hash, "agents did not acknowledge config in time");
                return Err(ServiceError::Timeout("operation timed out".into()));
            }
            Ok(Err(_)) => DeployStatus::Failed("agent acknowledgement channel closed".into()),
            Ok(Ok(Ok(()))) => DeployStatus::Deployed,
            Ok(Ok(Err(message))) => DeployStatus::Failed(message),
        };
        permit.release();

        info!(%config_hash, ?status, "config push finished");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn second_acquire_is_busy_until_release() {
        let gate = SingleFlight::new();
        let permit = gate.try_acquire().unwrap();
        assert!(!gate.is_ready());
        let err = gate.try_acquire().err().unwrap();
        assert_eq!(err.to_string(), "busy: config push already in flight");
        permit.release();
        assert!(gate.is_ready());
        drop(gate.try_acquire().unwrap());
        assert!(gate.is_ready());
    }

    #[test]
    fn instances_are_independent() {
        let first = SingleFlight::new();
        let second = SingleFlight::new();
        let _held = first.try_acquire().unwrap();
        assert!(second.try_acquire().is_ok());
    }

    /// Pusher whose acknowledgement is driven by the test.
    struct ScriptedPusher {
        ack: Mutex<Option<AgentAck>>,
        pending: Mutex<Vec<oneshot::Sender<AgentAck>>>,
    }

    #[async_trait]
    impl ConfigPusher for ScriptedPusher {
        async fn push(&self, _payload: serde_json::Value) -> anyhow::Result<PushHandle> {
            let (tx, rx) = oneshot::channel();
            if let Some(ack) = self.ack.lock().take() {
                let _ = tx.send(ack);
            } else {
                self.pending.lock().push(tx);
            }
            Ok(PushHandle {
                config_hash: "abc123".into(),
                ack: rx,
            })
        }
    }

    fn coordinator(ack: Option<AgentAck>) -> ConfigPushCoordinator<ScriptedPusher> {
        ConfigPushCoordinator::new(
            ScriptedPusher {
                ack: Mutex::new(ack),
                pending: Mutex::new(Vec::new()),
            },
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn acknowledged_push_is_deployed() {
        let coordinator = coordinator(Some(Ok(())));
        let status = coordinator.deploy(serde_json::json!({})).await.unwrap();
        assert_eq!(status, DeployStatus::Deployed);
        assert!(coordinator.is_ready());
    }

    #[tokio::test]
    async fn agent_error_is_failed_status() {
        let coordinator = coordinator(Some(Err("bad processor".into())));
        let status = coordinator.deploy(serde_json::json!({})).await.unwrap();
        assert_eq!(status, DeployStatus::Failed("bad processor".into()));
    }

    #[tokio::test]
    async fn missing_ack_times_out_and_frees_gate() {
        let coordinator = coordinator(None);
        let err = coordinator.deploy(serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "timeout: operation timed out");
        assert!(coordinator.is_ready());
    }
}
