//! Log stream sessions: one tail/follow loop per session.
//!
//! [`LogStreamManager::start`] spawns a task that opens the pod's container
//! log through the [`TargetResolver`], replays up to `tailLines` historical
//! lines and (in follow mode) keeps delivering new ones until stopped. Every
//! delivered message goes to exactly one consumer channel and into the
//! session's [`LogBuffer`].
//!
//! Before the first lines the consumer gets two `info` notices: the pod's
//! phase and node, and confirmation that the log is open.
//!
//! A followed log is read with kubelet timestamps. When it ends and the pod
//! is still there, the loop reopens it from the timestamp of the last
//! delivered line and skips what it already delivered.
//!
//! The consumer channel is bounded: when the consumer is slow the loop waits
//! on `send` rather than dropping lines. Stopping the session cancels the
//! task mid-read or mid-send; anything not yet delivered is discarded.

pub mod buffer;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LogsConfig;
use crate::error::SessionError;
use crate::sessions::handle::RelayHandle;
use crate::sessions::session::{LogStreamParams, SessionParams, SessionStats, SessionStatus};
use crate::sessions::SessionRegistry;
use crate::target::{split_timestamp, LogRequest, TargetError, TargetResolver};
use buffer::LogBuffer;

/// How long `start` waits for a task it could not attach.
const DETACHED_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Message tag. Pod output is `log`; the rest are transport notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
    Log,
}

/// One message on a log stream, serialized as `{type, message, time}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(rename = "type")]
    pub level: LogLevel,
    #[serde(rename = "message")]
    pub content: String,
    /// When the line was observed by this process.
    pub time: DateTime<Utc>,
}

impl LogMessage {
    /// A line of pod output.
    pub fn line(content: impl Into<String>) -> Self {
        Self::notice(LogLevel::Log, content)
    }

    pub fn notice(level: LogLevel, content: impl Into<String>) -> Self {
        Self {
            level,
            content: content.into(),
            time: Utc::now(),
        }
    }
}

/// Starts and drives log-stream sessions.
#[derive(Clone)]
pub struct LogStreamManager {
    registry: SessionRegistry,
    resolver: Arc<dyn TargetResolver>,
    config: LogsConfig,
}

impl LogStreamManager {
    pub fn new(
        registry: SessionRegistry,
        resolver: Arc<dyn TargetResolver>,
        config: LogsConfig,
    ) -> Self {
        Self {
            registry,
            resolver,
            config,
        }
    }

    pub fn config(&self) -> &LogsConfig {
        &self.config
    }

    /// Register a `starting` log-stream session.
    pub async fn open(
        &self,
        namespace: &str,
        pod: &str,
        params: LogStreamParams,
    ) -> Result<String, SessionError> {
        self.registry
            .create(namespace, pod, SessionParams::LogStream(params))
            .await
    }

    /// Spawn the stream loop for session `id`, delivering to `output`.
    ///
    /// The session becomes `running` once the log is open, or `error` if it
    /// cannot be opened. The channel is closed when the loop ends.
    pub async fn start(&self, id: &str, output: mpsc::Sender<LogMessage>) -> Result<(), SessionError> {
        let record = self.registry.record(id).await?;
        let SessionParams::LogStream(params) = record.params else {
            return Err(SessionError::InvalidParameter(format!(
                "session {id} is not a log stream"
            )));
        };
        if record.status != SessionStatus::Starting {
            return Err(SessionError::InvalidParameter(format!(
                "session {id} is already {}",
                record.status
            )));
        }
        let buffer = self.registry.log_buffer(id).await?;

        let cancel = CancellationToken::new();
        let stream = LogStreamTask {
            id: id.to_string(),
            namespace: record.namespace.clone(),
            pod: record.pod.clone(),
            params,
            registry: self.registry.clone(),
            resolver: Arc::clone(&self.resolver),
            config: self.config.clone(),
            stats: Arc::clone(&record.stats),
            buffer,
            output,
        };
        let token = cancel.clone();
        let task = tokio::spawn(async move { stream.run(token).await });

        if let Err(handle) = self
            .registry
            .attach_handle(id, RelayHandle::new(cancel, task))
            .await
        {
            // Stopped before we got here, or a one-shot stream that already
            // finished.
            handle.shutdown(DETACHED_SHUTDOWN_TIMEOUT).await;
        }
        info!(
            "Log stream {id} started for {}/{} (tail: {}, follow: {})",
            record.namespace, record.pod, params.tail_lines, params.follow
        );
        Ok(())
    }
}

/// Timestamp of the last delivered line and how many delivered lines carried
/// exactly that timestamp.
#[derive(Debug, Clone, Copy)]
struct ResumePoint {
    at: DateTime<Utc>,
    seen: usize,
}

impl ResumePoint {
    fn record(point: &mut Option<Self>, at: DateTime<Utc>) {
        match point {
            Some(p) if p.at == at => p.seen += 1,
            _ => *point = Some(Self { at, seen: 1 }),
        }
    }

    /// Whether a line replayed by a reopen was delivered before.
    fn already_delivered(&mut self, at: Option<DateTime<Utc>>) -> bool {
        match at {
            Some(at) if at < self.at => true,
            Some(at) if at == self.at && self.seen > 0 => {
                self.seen -= 1;
                true
            }
            _ => false,
        }
    }
}

/// How a stream loop ended on its own.
enum Outcome {
    /// One-shot tail delivered in full.
    Completed,
    /// The consumer dropped its receiver.
    ConsumerGone,
    /// The session was stopped before the log opened.
    Aborted,
    Failed(String),
}

struct LogStreamTask {
    id: String,
    namespace: String,
    pod: String,
    params: LogStreamParams,
    registry: SessionRegistry,
    resolver: Arc<dyn TargetResolver>,
    config: LogsConfig,
    stats: Arc<SessionStats>,
    buffer: Arc<Mutex<LogBuffer>>,
    output: mpsc::Sender<LogMessage>,
}

impl LogStreamTask {
    async fn run(self, cancel: CancellationToken) {
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("Log stream {} cancelled", self.id);
                return;
            }
            outcome = self.pump() => outcome,
        };

        let id = &self.id;
        match outcome {
            Outcome::Completed => {
                self.registry
                    .mark_status(id, SessionStatus::Stopped, None)
                    .await;
                info!("Log stream {id} completed");
            }
            Outcome::ConsumerGone => {
                self.registry
                    .mark_status(id, SessionStatus::Stopped, None)
                    .await;
                info!("Log stream {id}: consumer went away");
            }
            Outcome::Aborted => {}
            Outcome::Failed(message) => {
                warn!("Log stream {id} failed: {message}");
                self.registry
                    .mark_status(id, SessionStatus::Error, Some(message))
                    .await;
            }
        }
        // `self.output` is dropped here, closing the consumer channel after
        // the final status is visible.
    }

    fn request(&self, tail_lines: u32, since_time: Option<DateTime<Utc>>) -> LogRequest {
        LogRequest {
            tail_lines,
            follow: self.params.follow,
            // Followed logs need timestamps to resume.
            timestamps: self.params.follow || self.config.timestamps,
            since_time,
        }
    }

    /// The line as the consumer sees it.
    fn render(&self, line: String) -> String {
        if self.params.follow && !self.config.timestamps {
            if let Some((_, rest)) = split_timestamp(&line) {
                return rest.to_string();
            }
        }
        line
    }

    async fn pump(&self) -> Outcome {
        let (ns, pod) = (self.namespace.as_str(), self.pod.as_str());
        let mut request = self.request(self.params.tail_lines, None);
        let mut opened = false;
        let mut reconnects = 0u32;
        let mut resume: Option<ResumePoint> = None;

        match self.resolver.describe(ns, pod).await {
            Ok(summary) => {
                let node = summary.node.as_deref().unwrap_or("<unscheduled>");
                let notice = LogMessage::notice(
                    LogLevel::Info,
                    format!("Pod: {pod}, Status: {}, Node: {node}", summary.phase),
                );
                if !self.deliver(notice).await {
                    return Outcome::ConsumerGone;
                }
            }
            Err(e) => debug!("Log stream {}: describe failed: {e}", self.id),
        }

        loop {
            let mut lines = match self.resolver.log_lines(ns, pod, request).await {
                Ok(lines) => lines,
                Err(e) if !opened => return Outcome::Failed(format!("failed to open log stream: {e}")),
                Err(e) => return Outcome::Failed(format!("failed to reopen log stream: {e}")),
            };
            if !opened {
                if !self.registry.mark_running(&self.id).await {
                    return Outcome::Aborted;
                }
                opened = true;
                let notice = LogMessage::notice(LogLevel::Info, "Successfully connected to pod logs");
                if !self.deliver(notice).await {
                    return Outcome::ConsumerGone;
                }
            }

            // Only the start of a reopened stream can repeat delivered lines.
            let mut replayed = if request.since_time.is_some() { resume } else { None };
            let mut delivered = 0u64;
            loop {
                match lines.next().await {
                    Some(Ok(line)) => {
                        let stamp = split_timestamp(&line).map(|(at, _)| at);
                        if let Some(point) = replayed.as_mut() {
                            if point.already_delivered(stamp) {
                                continue;
                            }
                            replayed = None;
                        }
                        if !self.params.follow && delivered >= u64::from(self.params.tail_lines) {
                            break;
                        }
                        if !self.deliver(LogMessage::line(self.render(line))).await {
                            return Outcome::ConsumerGone;
                        }
                        if let Some(at) = stamp {
                            ResumePoint::record(&mut resume, at);
                        }
                        delivered += 1;
                    }
                    Some(Err(e)) => return Outcome::Failed(format!("log stream read error: {e}")),
                    None => break,
                }
            }
            drop(lines);

            if !self.params.follow {
                return Outcome::Completed;
            }
            if delivered > 0 {
                reconnects = 0;
            }

            // The followed log ended: the container restarted, or the pod is
            // going away.
            match self.resolver.probe(ns, pod).await {
                Ok(state) if !state.is_alive() => {
                    return Outcome::Failed(format!("target unavailable: pod {ns}/{pod} is {state}"));
                }
                Err(TargetError::PodNotFound { .. }) => {
                    return Outcome::Failed(format!("target unavailable: pod {ns}/{pod} not found"));
                }
                Err(e) => debug!("Log stream {}: probe failed: {e}", self.id),
                Ok(_) => {}
            }
            if reconnects >= self.config.max_follow_reconnects {
                return Outcome::Failed(format!(
                    "log stream ended after {reconnects} reconnect attempt(s)"
                ));
            }
            reconnects += 1;
            let notice = LogMessage::notice(
                LogLevel::Warning,
                format!(
                    "Log stream interrupted, reconnecting ({reconnects}/{})",
                    self.config.max_follow_reconnects
                ),
            );
            if !self.deliver(notice).await {
                return Outcome::ConsumerGone;
            }
            tokio::time::sleep(Duration::from_millis(self.config.follow_reconnect_delay_ms)).await;
            request = self.request(0, resume.map(|p| p.at));
        }
    }

    /// Send one message to the consumer; `false` once it is gone.
    async fn deliver(&self, message: LogMessage) -> bool {
        let is_line = message.level == LogLevel::Log;
        if self.output.send(message.clone()).await.is_err() {
            return false;
        }
        self.buffer.lock().await.push(message);
        if is_line {
            self.stats.lines_delivered.fetch_add(1, Ordering::Relaxed);
        }
        true
    }
}
