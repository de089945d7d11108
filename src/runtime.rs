//! Runtime Adapter (C1): the engine's sole egress boundary onto the
//! container runtime and the network.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, LogsOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::Docker;

use crate::error::RuntimeError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    Dead,
    Created,
    Other,
}

impl ContainerStatus {
    pub fn from_raw(s: &str) -> Self {
        match s {
            "running" => ContainerStatus::Running,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            "created" => ContainerStatus::Created,
            _ => ContainerStatus::Other,
        }
    }

    pub fn as_raw(self) -> &'static str {
        match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Created => "created",
            ContainerStatus::Other => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Inspect {
    pub status: ContainerStatus,
    pub image: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub networks: HashMap<String, Option<String>>,
}

/// A workload reconstructed from discovery labels on a running container.
#[derive(Debug, Clone)]
pub struct DiscoveredWorkload {
    pub name: String,
    pub host: String,
    pub target_port: Option<String>,
    pub start_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub network: Option<String>,
    pub redirect_path: Option<String>,
    pub icon: Option<String>,
    pub health_path: Option<String>,
    pub depends_on: Vec<String>,
}

pub const DISCOVERY_LABEL_ENABLED: &str = "wakegate.enable";
pub const DISCOVERY_LABEL_HOST: &str = "wakegate.host";
pub const DISCOVERY_LABEL_TARGET_PORT: &str = "wakegate.target-port";
pub const DISCOVERY_LABEL_START_TIMEOUT: &str = "wakegate.start-timeout";
pub const DISCOVERY_LABEL_IDLE_TIMEOUT: &str = "wakegate.idle-timeout";
pub const DISCOVERY_LABEL_NETWORK: &str = "wakegate.network";
pub const DISCOVERY_LABEL_REDIRECT_PATH: &str = "wakegate.redirect-path";
pub const DISCOVERY_LABEL_ICON: &str = "wakegate.icon";
pub const DISCOVERY_LABEL_HEALTH_PATH: &str = "wakegate.health-path";
pub const DISCOVERY_LABEL_DEPENDS_ON: &str = "wakegate.depends-on";

/// Capability surface consumed by the Discovery Merger, Lifecycle Manager,
/// and Server. Object-safe so callers hold `Arc<dyn RuntimeAdapter>`.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    async fn status(&self, name: &str) -> Result<ContainerStatus, RuntimeError>;
    async fn inspect(&self, name: &str) -> Result<Inspect, RuntimeError>;
    async fn start(&self, name: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;
    async fn tail_logs(&self, name: &str, n: usize) -> Result<Vec<String>, RuntimeError>;
    async fn list_labeled(&self) -> Result<Vec<DiscoveredWorkload>, RuntimeError>;
    async fn ip(&self, name: &str, network: &str) -> Result<IpAddr, RuntimeError>;

    /// Dial TCP, retrying every 300ms until success or `deadline`.
    async fn probe_tcp(&self, ip: IpAddr, port: u16, deadline: Instant) -> Result<(), RuntimeError>;

    /// GET `path` with a 2s per-attempt timeout, retrying every 500ms until
    /// any 2xx response or `deadline`.
    async fn probe_http(
        &self,
        ip: IpAddr,
        port: u16,
        path: &str,
        deadline: Instant,
    ) -> Result<(), RuntimeError>;
}

/// Concrete [`RuntimeAdapter`] backed by the Docker Engine API over `bollard`.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    fn map_bollard_err(name: &str, err: bollard::errors::Error) -> RuntimeError {
        let msg = err.to_string();
        if msg.contains("No such container") || msg.contains("404") {
            RuntimeError::NotFound(name.to_string())
        } else {
            RuntimeError::Other(anyhow::Error::new(err))
        }
    }
}

#[async_trait]
impl RuntimeAdapter for DockerRuntime {
    async fn status(&self, name: &str) -> Result<ContainerStatus, RuntimeError> {
        Ok(self.inspect(name).await?.status)
    }

    async fn inspect(&self, name: &str) -> Result<Inspect, RuntimeError> {
        let resp = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Self::map_bollard_err(name, e))?;

        let status = resp
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(|s| ContainerStatus::from_raw(&format!("{s:?}").to_lowercase()))
            .unwrap_or(ContainerStatus::Other);

        let image = resp.config.and_then(|c| c.image).unwrap_or_default();
        let started_at = resp.state.as_ref().and_then(|s| s.started_at.clone());
        let finished_at = resp.state.as_ref().and_then(|s| s.finished_at.clone());

        let networks = resp
            .network_settings
            .and_then(|ns| ns.networks)
            .map(|nets| {
                nets.into_iter()
                    .map(|(name, net)| (name, net.ip_address))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Inspect {
            status,
            image,
            started_at,
            finished_at,
            networks,
        })
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // idempotent: already running is not an error
            Err(e) if e.to_string().contains("already started") => Ok(()),
            Err(e) => Err(Self::map_bollard_err(name, e)),
        }
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .stop_container(name, None::<StopContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("304") => Ok(()),
            Err(e) => Err(Self::map_bollard_err(name, e)),
        }
    }

    async fn tail_logs(&self, name: &str, n: usize) -> Result<Vec<String>, RuntimeError> {
        use futures::StreamExt;

        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: n.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut raw = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => raw.extend_from_slice(&log.into_bytes()),
                Err(e) => return Err(Self::map_bollard_err(name, e)),
            }
        }
        Ok(tail_lines(&demux_frames(&raw), n))
    }

    async fn list_labeled(&self) -> Result<Vec<DiscoveredWorkload>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{DISCOVERY_LABEL_ENABLED}=true")],
        );
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Other(anyhow::Error::new(e)))?;

        let mut discovered = Vec::new();
        for c in containers {
            let labels = c.labels.unwrap_or_default();
            let name = c
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .or(c.id.clone())
                .unwrap_or_default();

            let Some(host) = labels.get(DISCOVERY_LABEL_HOST).filter(|h| !h.is_empty()) else {
                tracing::warn!(container = %name, "discovery: missing required host label, skipping");
                continue;
            };

            discovered.push(DiscoveredWorkload {
                name,
                host: host.clone(),
                target_port: labels.get(DISCOVERY_LABEL_TARGET_PORT).cloned(),
                start_timeout: parse_label_duration(&labels, DISCOVERY_LABEL_START_TIMEOUT),
                idle_timeout: parse_label_duration(&labels, DISCOVERY_LABEL_IDLE_TIMEOUT),
                network: labels.get(DISCOVERY_LABEL_NETWORK).cloned(),
                redirect_path: labels.get(DISCOVERY_LABEL_REDIRECT_PATH).cloned(),
                icon: labels.get(DISCOVERY_LABEL_ICON).cloned(),
                health_path: labels.get(DISCOVERY_LABEL_HEALTH_PATH).cloned(),
                depends_on: labels
                    .get(DISCOVERY_LABEL_DEPENDS_ON)
                    .map(|s| {
                        s.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            });
        }
        Ok(discovered)
    }

    async fn ip(&self, name: &str, network: &str) -> Result<IpAddr, RuntimeError> {
        let inspect = self.inspect(name).await?;
        let candidate = if !network.is_empty() {
            inspect.networks.get(network).cloned().flatten()
        } else {
            inspect.networks.values().find_map(|ip| ip.clone())
        };
        candidate
            .and_then(|s| s.parse().ok())
            .ok_or(RuntimeError::NoNetworkInterfaces)
    }

    async fn probe_tcp(
        &self,
        ip: IpAddr,
        port: u16,
        deadline: Instant,
    ) -> Result<(), RuntimeError> {
        probe_tcp(ip, port, deadline).await
    }

    async fn probe_http(
        &self,
        ip: IpAddr,
        port: u16,
        path: &str,
        deadline: Instant,
    ) -> Result<(), RuntimeError> {
        probe_http(ip, port, path, deadline).await
    }
}

fn parse_label_duration(labels: &HashMap<String, String>, key: &str) -> Option<Duration> {
    let raw = labels.get(key)?;
    match humantime::parse_duration(raw) {
        Ok(d) => Some(d),
        Err(_) => {
            tracing::warn!(label = key, value = %raw, "discovery: unparseable duration label, using default");
            None
        }
    }
}

/// Dials TCP every 300ms until success or `deadline`. Any successful
/// connection terminates immediately.
pub async fn probe_tcp(ip: IpAddr, port: u16, deadline: Instant) -> Result<(), RuntimeError> {
    loop {
        if tokio::net::TcpStream::connect((ip, port)).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RuntimeError::Other(anyhow::anyhow!(
                "tcp probe timed out on {ip}:{port}"
            )));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

/// GETs `path` with a 2s per-attempt timeout, retrying every 500ms until any
/// 2xx response or `deadline`.
pub async fn probe_http(
    ip: IpAddr,
    port: u16,
    path: &str,
    deadline: Instant,
) -> Result<(), RuntimeError> {
    let client = hyper::Client::new();
    let uri: hyper::Uri = format!("http://{ip}:{port}{path}")
        .parse()
        .map_err(|e| RuntimeError::Other(anyhow::Error::new(e)))?;
    loop {
        let attempt = tokio::time::timeout(Duration::from_secs(2), client.get(uri.clone())).await;
        if let Ok(Ok(resp)) = attempt {
            if resp.status().is_success() || resp.status().as_u16() / 100 == 2 {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(RuntimeError::Other(anyhow::anyhow!(
                "http probe timed out on {ip}:{port}{path}"
            )));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Strips Docker's multiplexed-frame headers from a raw log byte stream.
///
/// Frame format: an 8-byte header `[stream_type(1), 0, 0, 0, size_be32]`
/// followed by `size` bytes of payload. Handles concatenated frames and
/// gracefully accepts a declared size exceeding the remaining bytes by
/// consuming whatever is available, without error.
pub fn demux_frames(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut pos = 0;
    while pos + 8 <= raw.len() {
        let size = u32::from_be_bytes([
            raw[pos + 4],
            raw[pos + 5],
            raw[pos + 6],
            raw[pos + 7],
        ]) as usize;
        pos += 8;
        let available = raw.len() - pos;
        let take = size.min(available);
        out.extend_from_slice(&raw[pos..pos + take]);
        pos += take;
    }
    out
}

/// Splits demuxed log bytes into lines, trimming CR, dropping empties, and
/// truncating to the last `n` lines.
pub fn tail_lines(data: &[u8], n: usize) -> Vec<String> {
    let text = String::from_utf8_lossy(data);
    let lines: Vec<String> = text
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![stream_type, 0, 0, 0];
        v.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn single_well_formed_frame() {
        let raw = frame(1, b"hello\n");
        assert_eq!(demux_frames(&raw), b"hello\n");
    }

    #[test]
    fn concatenated_frames() {
        let mut raw = frame(1, b"line one\n");
        raw.extend(frame(2, b"line two\n"));
        assert_eq!(demux_frames(&raw), b"line one\nline two\n");
    }

    #[test]
    fn declared_size_exceeding_remaining_bytes_consumes_available() {
        let mut raw = vec![1, 0, 0, 0];
        raw.extend_from_slice(&1_000_000u32.to_be_bytes());
        raw.extend_from_slice(b"short");
        assert_eq!(demux_frames(&raw), b"short");
    }

    #[test]
    fn tail_lines_trims_cr_drops_empty_and_truncates() {
        let data = b"a\r\n\nb\r\nc\r\nd\r\n";
        let lines = tail_lines(data, 2);
        assert_eq!(lines, vec!["c".to_string(), "d".to_string()]);
    }
}
