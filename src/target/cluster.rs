//! Kubernetes-backed [`TargetResolver`].

use std::path::Path;

use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info, warn};

use super::{
    BoxUpstream, LogLines, LogRequest, PodSummary, TargetError, TargetResolver, TargetState,
};

/// Annotation kubectl uses to pick the container when none is given.
const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";

/// Production resolver using the kube crate.
pub struct KubeResolver {
    client: Client,
}

impl KubeResolver {
    /// Build a client from an explicit kubeconfig and/or context, or fall
    /// back to the usual discovery (in-cluster service account, `KUBECONFIG`,
    /// `~/.kube/config`).
    pub async fn new(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Self, TargetError> {
        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            cluster: None,
            user: None,
        };
        let config = match kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path)
                    .map_err(|e| TargetError::Api(format!("{}: {e}", path.display())))?;
                Config::from_custom_kubeconfig(kc, &options)
                    .await
                    .map_err(|e| TargetError::Api(e.to_string()))?
            }
            None if context.is_some() => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| TargetError::Api(e.to_string()))?,
            None => Config::infer()
                .await
                .map_err(|e| TargetError::Api(e.to_string()))?,
        };
        info!("Kubernetes API: {}", config.cluster_url);
        let client = Client::try_from(config).map_err(|e| TargetError::Api(e.to_string()))?;
        Ok(Self { client })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_api_error(err: kube::Error, namespace: &str, pod: &str) -> TargetError {
    match err {
        kube::Error::Api(ref resp) if resp.code == 404 => TargetError::PodNotFound {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
        },
        other => TargetError::Api(other.to_string()),
    }
}

/// Classify a pod object.
pub fn pod_state(pod: &Pod) -> TargetState {
    if pod.metadata.deletion_timestamp.is_some() {
        return TargetState::Terminating;
    }
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    match phase {
        Some("Running") => TargetState::Running,
        Some("Succeeded" | "Failed") => TargetState::Completed,
        _ => TargetState::Pending,
    }
}

/// Container whose log is streamed: the kubectl default-container
/// annotation if present, else the first container in the spec.
fn log_container(pod: &Pod) -> Option<String> {
    if let Some(name) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DEFAULT_CONTAINER_ANNOTATION))
    {
        return Some(name.clone());
    }
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.clone())
}

pub fn pod_summary(pod: &Pod) -> PodSummary {
    PodSummary {
        phase: pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        node: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
    }
}

#[async_trait]
impl TargetResolver for KubeResolver {
    async fn probe(&self, namespace: &str, pod: &str) -> Result<TargetState, TargetError> {
        match self.pods(namespace).get_opt(pod).await {
            Ok(Some(p)) => Ok(pod_state(&p)),
            Ok(None) => Ok(TargetState::Gone),
            Err(e) => Err(map_api_error(e, namespace, pod)),
        }
    }

    async fn describe(&self, namespace: &str, pod: &str) -> Result<PodSummary, TargetError> {
        let object = self
            .pods(namespace)
            .get(pod)
            .await
            .map_err(|e| map_api_error(e, namespace, pod))?;
        Ok(pod_summary(&object))
    }

    async fn connect(
        &self,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<BoxUpstream, TargetError> {
        let mut forwarder = self
            .pods(namespace)
            .portforward(pod, &[port])
            .await
            .map_err(|e| match map_api_error(e, namespace, pod) {
                TargetError::Api(message) => TargetError::Connect { port, message },
                other => other,
            })?;
        let stream = forwarder.take_stream(port).ok_or_else(|| TargetError::Connect {
            port,
            message: "port-forward stream unavailable".to_string(),
        })?;

        let target = format!("{namespace}/{pod}:{port}");
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!("Port-forward websocket to {target} closed: {e}");
            }
        });
        Ok(Box::new(stream))
    }

    async fn log_lines(
        &self,
        namespace: &str,
        pod: &str,
        request: LogRequest,
    ) -> Result<LogLines, TargetError> {
        let pods = self.pods(namespace);
        let object = pods
            .get(pod)
            .await
            .map_err(|e| map_api_error(e, namespace, pod))?;

        let params = LogParams {
            container: log_container(&object),
            follow: request.follow,
            tail_lines: match request.since_time {
                Some(_) => None,
                None => Some(i64::from(request.tail_lines)),
            },
            since_time: request.since_time,
            timestamps: request.timestamps,
            ..LogParams::default()
        };
        debug!(
            "Requesting logs for {namespace}/{pod} (container: {:?}, follow: {}, tail: {}, since: {:?})",
            params.container, request.follow, request.tail_lines, request.since_time
        );

        let to_stream_error = |e: kube::Error| match map_api_error(e, namespace, pod) {
            TargetError::Api(message) => TargetError::Stream(message),
            other => other,
        };
        let reader = match pods.log_stream(pod, &params).await {
            Ok(reader) => reader,
            // Single-container pods accept a request without a name.
            Err(e) if params.container.is_some() => {
                warn!("Log request for {namespace}/{pod} failed ({e}), retrying without container name");
                let params = LogParams {
                    container: None,
                    ..params
                };
                pods.log_stream(pod, &params).await.map_err(to_stream_error)?
            }
            Err(e) => return Err(to_stream_error(e)),
        };

        Ok(reader.lines().boxed())
    }
}
