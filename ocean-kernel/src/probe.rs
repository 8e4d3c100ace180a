/**
 * HEALTH PROBER - Test de joignabilité non intrusif
 *
 * RÔLE : Exécute le probe_spec de l'équipement : écho ICMP (via le binaire
 * ping du système, repli en connexion TCP si indisponible), connexion TCP,
 * ou GET HTTP (2xx/3xx = joignable). Jamais de reprise interne : les
 * reprises sont la décision du Monitor.
 */

use crate::config::{Device, ProbeSpec};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Budget maximal d'un probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Résultat d'un probe : joignable ou non, latence, détail lisible.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub reachable: bool,
    pub latency_ms: u64,
    pub detail: String,
}

impl ProbeReport {
    fn up(latency_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            reachable: true,
            latency_ms,
            detail: detail.into(),
        }
    }

    fn down(latency_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            latency_ms,
            detail: detail.into(),
        }
    }
}

/// Interface du prober, point d'injection des mocks de test.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, device: &Device) -> ProbeReport;
}

pub struct HealthProber {
    http: reqwest::Client,
}

impl HealthProber {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    async fn probe_icmp(&self, device: &Device) -> ProbeReport {
        let start = Instant::now();
        let mut command = tokio::process::Command::new("ping");
        if cfg!(target_os = "windows") {
            command.args(["-n", "1", "-w", "3000", &device.host]);
        } else {
            command.args(["-c", "1", "-W", "3", &device.host]);
        }
        command
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let spawned = command.status();
        match tokio::time::timeout(PROBE_TIMEOUT, spawned).await {
            Ok(Ok(status)) => {
                let latency = start.elapsed().as_millis() as u64;
                if status.success() {
                    ProbeReport::up(latency, "icmp echo reply")
                } else {
                    ProbeReport::down(latency, "no icmp echo reply")
                }
            }
            Ok(Err(e)) => {
                // ping indisponible (binaire absent, droits) : repli TCP.
                debug!(device_id = %device.id, error = %e, "ping unavailable, falling back to tcp");
                self.probe_tcp(device, device.effective_port()).await
            }
            Err(_) => ProbeReport::down(start.elapsed().as_millis() as u64, "icmp timeout"),
        }
    }

    async fn probe_tcp(&self, device: &Device, port: u16) -> ProbeReport {
        let start = Instant::now();
        let attempt = TcpStream::connect((device.host.as_str(), port));
        match tokio::time::timeout(PROBE_TIMEOUT, attempt).await {
            Ok(Ok(_stream)) => ProbeReport::up(
                start.elapsed().as_millis() as u64,
                format!("tcp connect to port {port}"),
            ),
            Ok(Err(e)) => ProbeReport::down(
                start.elapsed().as_millis() as u64,
                format!("tcp connect to port {port} failed: {e}"),
            ),
            Err(_) => ProbeReport::down(
                start.elapsed().as_millis() as u64,
                format!("tcp connect to port {port} timed out"),
            ),
        }
    }

    async fn probe_http(&self, device: &Device, path: &str) -> ProbeReport {
        let start = Instant::now();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let url = format!("http://{}:{}{path}", device.host, device.effective_port());
        match self.http.get(&url).send().await {
            Ok(response) => {
                let latency = start.elapsed().as_millis() as u64;
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    ProbeReport::up(latency, format!("http {status}"))
                } else {
                    ProbeReport::down(latency, format!("http {status}"))
                }
            }
            Err(e) => ProbeReport::down(
                start.elapsed().as_millis() as u64,
                format!("http get failed: {e}"),
            ),
        }
    }
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for HealthProber {
    async fn probe(&self, device: &Device) -> ProbeReport {
        match device.probe_spec.clone() {
            Some(ProbeSpec::Icmp) => self.probe_icmp(device).await,
            Some(ProbeSpec::Tcp { port }) => {
                let port = port.unwrap_or_else(|| device.effective_port());
                self.probe_tcp(device, port).await
            }
            Some(ProbeSpec::Http { path }) => self.probe_http(device, &path).await,
            // Sans probe_spec : connexion TCP sur le port de la famille.
            None => self.probe_tcp(device, device.effective_port()).await,
        }
    }
}
