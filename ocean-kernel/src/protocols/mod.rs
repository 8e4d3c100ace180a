/**
 * ADAPTATEURS PROTOCOLE - Pilotes par famille d'équipements
 *
 * RÔLE :
 * Ce module définit l'interface commune que chaque famille d'équipements
 * implémente (projecteur telnet, projecteur JSON-RPC, PC à réveil réseau,
 * TCP générique) et la classification des pannes réseau.
 *
 * FONCTIONNEMENT :
 * - ProtocolAdapter trait = interface commune (power_on/power_off/query_power)
 * - Une session réseau fraîche par appel, jamais de pool de connexions
 * - Classification : connexion refusée/injoignable -> UNREACHABLE,
 *   délai dépassé -> TIMEOUT, réponse inattendue -> PROTOCOL_ERROR
 * - Le délai par tentative est imposé au-dessus, par le Retry Executor
 */

mod jsonrpc;
mod tcp;
mod telnet;
mod wake;

pub use jsonrpc::JsonrpcProjector;
pub use tcp::GenericTcp;
pub use telnet::TelnetProjector;
pub use wake::PcWake;

use crate::config::{Device, DeviceType};
use crate::models::{Outcome, PowerState};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Erreurs d'un appel adaptateur, classées par nature de panne.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Erreur de protocole causée par une configuration incomplète
    /// (ex : MAC absente pour un réveil réseau). Jamais réessayée.
    #[error("configuration error: {0}")]
    Config(String),
}

impl AdapterError {
    pub fn outcome(&self) -> Outcome {
        match self {
            AdapterError::Unreachable(_) => Outcome::Unreachable,
            AdapterError::Timeout(_) => Outcome::Timeout,
            AdapterError::Protocol(_) | AdapterError::Config(_) => Outcome::ProtocolError,
        }
    }

    pub fn is_retriable(&self) -> bool {
        !matches!(self, AdapterError::Config(_))
    }
}

/// Classe une erreur d'E/S réseau selon le contrat de la spécification.
pub(crate) fn classify_io(context: &str, err: &std::io::Error) -> AdapterError {
    match err.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable
        | ErrorKind::AddrNotAvailable => AdapterError::Unreachable(format!("{context}: {err}")),
        ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            AdapterError::Timeout(format!("{context}: {err}"))
        }
        _ => AdapterError::Protocol(format!("{context}: {err}")),
    }
}

/// Capacités communes à toutes les familles d'équipements.
///
/// Chaque appel ouvre sa propre session et la referme avant de rendre la
/// main. Les implémentations ne réessaient jamais elles-mêmes.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    async fn power_on(&self, device: &Device) -> Result<(), AdapterError>;
    async fn power_off(&self, device: &Device) -> Result<(), AdapterError>;
    async fn query_power(&self, device: &Device) -> Result<PowerState, AdapterError>;
}

/// Sélection de l'adaptateur par variante de type d'équipement.
pub fn adapter_for(device_type: DeviceType) -> &'static dyn ProtocolAdapter {
    match device_type {
        DeviceType::TelnetProjector => &TelnetProjector,
        DeviceType::JsonrpcProjector => &JsonrpcProjector,
        DeviceType::PcWake => &PcWake,
        DeviceType::GenericTcp => &GenericTcp,
    }
}

/// Annuaire d'adaptateurs consulté par le Device Manager.
/// Point d'injection des adaptateurs scriptés en test.
pub trait AdapterSelector: Send + Sync {
    fn select(&self, device_type: DeviceType) -> &dyn ProtocolAdapter;
}

/// Annuaire réel : un pilote statique par famille.
pub struct DefaultAdapters;

impl AdapterSelector for DefaultAdapters {
    fn select(&self, device_type: DeviceType) -> &dyn ProtocolAdapter {
        adapter_for(device_type)
    }
}

/// Ouvre une session TCP vers l'équipement avec classification des pannes.
pub(crate) async fn connect(device: &Device, port: u16) -> Result<TcpStream, AdapterError> {
    TcpStream::connect((device.host.as_str(), port))
        .await
        .map_err(|e| classify_io("connect", &e))
}

/// Lit ce qui arrive sur la session pendant la fenêtre donnée.
/// Retourne les octets accumulés (possiblement vides) ; une connexion
/// fermée côté distant arrête simplement la lecture.
pub(crate) async fn read_window(
    stream: &mut TcpStream,
    window: Duration,
) -> Result<Vec<u8>, AdapterError> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(collected);
        }
        match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
            Err(_) => return Ok(collected),
            Ok(Ok(0)) => return Ok(collected),
            Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => {
                if collected.is_empty() {
                    return Err(classify_io("read", &e));
                }
                return Ok(collected);
            }
        }
    }
}
