//! In-process [`TargetResolver`] for tests.
//!
//! Pods are entries in a map. `connect` hands out one end of an in-memory
//! duplex pipe whose other end echoes every byte back. Log streams replay a
//! scripted history and then follow a channel the test feeds. A request with
//! `since_time` replays the timestamped history lines from that second on.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::SubsecRound;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::{
    split_timestamp, BoxUpstream, LogLines, LogRequest, PodSummary, TargetError, TargetResolver,
    TargetState,
};

/// What the next read of a followed log yields.
#[derive(Debug, Clone)]
pub enum FollowEvent {
    Line(String),
    /// End the current stream; a reopen continues with later events.
    Eof,
    /// Fail the current read.
    Error(String),
}

pub struct FakeResolver {
    pods: Mutex<HashMap<(String, String), TargetState>>,
    history: Mutex<Vec<String>>,
    follow_tx: mpsc::UnboundedSender<FollowEvent>,
    follow_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<FollowEvent>>>,
    pub log_requests: Mutex<Vec<LogRequest>>,
    pub connects: AtomicUsize,
    pub probe_fails: AtomicBool,
    pub connect_fails: AtomicBool,
    pub log_open_fails: AtomicBool,
}

impl FakeResolver {
    pub fn new() -> Self {
        let (follow_tx, follow_rx) = mpsc::unbounded_channel();
        Self {
            pods: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            follow_tx,
            follow_rx: Arc::new(AsyncMutex::new(follow_rx)),
            log_requests: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            probe_fails: AtomicBool::new(false),
            connect_fails: AtomicBool::new(false),
            log_open_fails: AtomicBool::new(false),
        }
    }

    pub fn with_pod(self, namespace: &str, pod: &str, state: TargetState) -> Self {
        self.set_state(namespace, pod, state);
        self
    }

    pub fn set_state(&self, namespace: &str, pod: &str, state: TargetState) {
        self.pods
            .lock()
            .unwrap()
            .insert((namespace.to_string(), pod.to_string()), state);
    }

    pub fn set_history<S: Into<String>>(&self, lines: impl IntoIterator<Item = S>) {
        *self.history.lock().unwrap() = lines.into_iter().map(Into::into).collect();
    }

    /// Append to the history without touching open streams.
    pub fn push_history(&self, line: impl Into<String>) {
        self.history.lock().unwrap().push(line.into());
    }

    pub fn follow(&self, event: FollowEvent) {
        let _ = self.follow_tx.send(event);
    }

    fn state(&self, namespace: &str, pod: &str) -> TargetState {
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), pod.to_string()))
            .copied()
            .unwrap_or(TargetState::Gone)
    }
}

#[async_trait]
impl TargetResolver for FakeResolver {
    async fn probe(&self, namespace: &str, pod: &str) -> Result<TargetState, TargetError> {
        if self.probe_fails.load(Ordering::SeqCst) {
            return Err(TargetError::Api("connection refused".into()));
        }
        Ok(self.state(namespace, pod))
    }

    async fn describe(&self, namespace: &str, pod: &str) -> Result<PodSummary, TargetError> {
        let phase = match self.state(namespace, pod) {
            TargetState::Running | TargetState::Terminating => "Running",
            TargetState::Pending => "Pending",
            TargetState::Completed => "Succeeded",
            TargetState::Gone => {
                return Err(TargetError::PodNotFound {
                    namespace: namespace.into(),
                    pod: pod.into(),
                })
            }
        };
        Ok(PodSummary {
            phase: phase.to_string(),
            node: Some("node-1".to_string()),
        })
    }

    async fn connect(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<BoxUpstream, TargetError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_fails.load(Ordering::SeqCst) {
            return Err(TargetError::Connect {
                port,
                message: "upstream refused".into(),
            });
        }
        if !self.state(namespace, pod).is_alive() {
            return Err(TargetError::PodNotFound {
                namespace: namespace.into(),
                pod: pod.into(),
            });
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut rd, &mut wr).await;
            let _ = wr.shutdown().await;
        });
        Ok(Box::new(client))
    }

    async fn log_lines(
        &self,
        namespace: &str,
        pod: &str,
        request: LogRequest,
    ) -> Result<LogLines, TargetError> {
        self.log_requests.lock().unwrap().push(request);
        if self.log_open_fails.load(Ordering::SeqCst) {
            return Err(TargetError::Stream("container is waiting to start".into()));
        }
        if self.state(namespace, pod) == TargetState::Gone {
            return Err(TargetError::PodNotFound {
                namespace: namespace.into(),
                pod: pod.into(),
            });
        }

        let history = self.history.lock().unwrap().clone();
        let replayed: Vec<String> = match request.since_time {
            // sinceTime goes over the wire with second precision.
            Some(since) => {
                let since = since.trunc_subsecs(0);
                history
                    .into_iter()
                    .filter(|line| split_timestamp(line).is_some_and(|(at, _)| at >= since))
                    .collect()
            }
            None => {
                let start = history.len().saturating_sub(request.tail_lines as usize);
                history.into_iter().skip(start).collect()
            }
        };
        let replay = futures::stream::iter(replayed.into_iter().map(Ok::<_, io::Error>));
        if !request.follow {
            return Ok(replay.boxed());
        }

        let rx = Arc::clone(&self.follow_rx);
        let follow = futures::stream::unfold(rx, |rx| async move {
            let event = rx.lock().await.recv().await?;
            match event {
                FollowEvent::Line(line) => Some((Ok(line), rx)),
                FollowEvent::Eof => None,
                FollowEvent::Error(msg) => Some((Err(io::Error::other(msg)), rx)),
            }
        });
        Ok(replay.chain(follow).boxed())
    }
}
