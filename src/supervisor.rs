//! Background sweep over live sessions.
//!
//! Every `sweep_interval_secs` the supervisor:
//!
//! 1. probes the pod of each `running` session (once per pod) and stops the
//!    sessions whose pod is gone or terminating;
//! 2. fails `running` sessions whose task has exited on its own;
//! 3. fails sessions stuck in `starting`;
//! 4. purges terminal sessions past the retention period.
//!
//! Results are broadcast on the session event channel. A probe that errors
//! or times out is logged and skipped: an API hiccup never evicts anything.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::sessions::session::SessionStatus;
use crate::sessions::SessionRegistry;
use crate::target::{TargetError, TargetResolver, TargetState};

pub const POD_GONE_REASON: &str = "pod no longer exists";
pub const ORPHAN_REASON: &str = "relay task exited unexpectedly";

/// One action taken by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepEvent {
    Evicted {
        id: String,
        namespace: String,
        pod: String,
        state: TargetState,
    },
    Orphaned {
        id: String,
    },
    StaleStart {
        id: String,
    },
    Purged {
        id: String,
    },
}

impl SweepEvent {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Evicted {
                id,
                namespace,
                pod,
                state,
            } => json!({
                "type": "supervisor.evicted",
                "session_id": id,
                "namespace": namespace,
                "pod": pod,
                "pod_state": state.to_string(),
            }),
            Self::Orphaned { id } => json!({"type": "supervisor.orphaned", "session_id": id}),
            Self::StaleStart { id } => json!({"type": "supervisor.stale_start", "session_id": id}),
            Self::Purged { id } => json!({"type": "supervisor.purged", "session_id": id}),
        }
    }
}

pub struct SessionSupervisor {
    registry: SessionRegistry,
    resolver: Arc<dyn TargetResolver>,
    config: SupervisorConfig,
    events: broadcast::Sender<Value>,
}

impl SessionSupervisor {
    pub fn new(
        registry: SessionRegistry,
        resolver: Arc<dyn TargetResolver>,
        config: SupervisorConfig,
        events: broadcast::Sender<Value>,
    ) -> Self {
        Self {
            registry,
            resolver,
            config,
            events,
        }
    }

    /// Run one sweep and report what it did.
    pub async fn sweep(&self) -> Vec<SweepEvent> {
        let mut events = self.evict_lost_targets().await;

        for id in self.registry.orphaned().await {
            if self
                .registry
                .mark_status(&id, SessionStatus::Error, Some(ORPHAN_REASON.to_string()))
                .await
            {
                warn!("Session {id}: {ORPHAN_REASON}");
                events.push(SweepEvent::Orphaned { id });
            }
        }

        let start_timeout = Duration::from_secs(self.config.start_timeout_secs);
        for id in self.registry.stale_starting(start_timeout).await {
            let reason = format!(
                "session did not start within {}s",
                self.config.start_timeout_secs
            );
            if self
                .registry
                .mark_status(&id, SessionStatus::Error, Some(reason))
                .await
            {
                warn!("Session {id} stuck in starting, marked as error");
                events.push(SweepEvent::StaleStart { id });
            }
        }

        let retention = Duration::from_secs(self.config.retention_secs);
        for id in self.registry.purge_terminal(retention).await {
            events.push(SweepEvent::Purged { id });
        }

        events
    }

    async fn evict_lost_targets(&self) -> Vec<SweepEvent> {
        let mut by_target: HashMap<(String, String), Vec<String>> = HashMap::new();
        for (id, namespace, pod) in self.registry.running_targets().await {
            by_target.entry((namespace, pod)).or_default().push(id);
        }

        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let mut events = Vec::new();
        for ((namespace, pod), ids) in by_target {
            let probe = self.resolver.probe(&namespace, &pod);
            let state = match tokio::time::timeout(probe_timeout, probe).await {
                Ok(Ok(state)) => state,
                Ok(Err(TargetError::PodNotFound { .. })) => TargetState::Gone,
                Ok(Err(e)) => {
                    warn!("Supervisor: probe of {namespace}/{pod} failed: {e}");
                    continue;
                }
                Err(_) => {
                    warn!("Supervisor: probe of {namespace}/{pod} timed out");
                    continue;
                }
            };
            if state.is_alive() {
                continue;
            }

            info!(
                "Supervisor: pod {namespace}/{pod} is {state}, stopping {} session(s)",
                ids.len()
            );
            for id in ids {
                match self
                    .registry
                    .terminate(&id, Some(POD_GONE_REASON.to_string()))
                    .await
                {
                    Ok(()) => events.push(SweepEvent::Evicted {
                        id,
                        namespace: namespace.clone(),
                        pod: pod.clone(),
                        state,
                    }),
                    Err(e) => debug!("Supervisor: evicting {id}: {e}"),
                }
            }
        }
        events
    }

    /// Sweep every `sweep_interval_secs` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        for event in self.sweep().await {
                            let _ = self.events.send(event.to_json());
                        }
                    }
                }
            }
            debug!("Supervisor stopped");
        })
    }
}
