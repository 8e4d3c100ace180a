/**
 * PROJECTEUR TELNET - Pilote RS232-over-TCP (famille Optoma)
 *
 * RÔLE : Session telnet courte par commande : bannière, login, commande
 * constructeur, acquittement. La commande suit le format ~AAAA N
 * (AAAA = id projecteur, 0000 pour broadcast ; N = code commande).
 */

use super::{classify_io, connect, read_window, AdapterError, ProtocolAdapter};
use crate::config::Device;
use crate::models::PowerState;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const CMD_POWER_ON: &str = "~0000 1\r";
const CMD_POWER_OFF: &str = "~0000 0\r";
const CMD_STATUS: &str = "~00124 1\r";

// Fenêtres internes de lecture ; le budget global d'une tentative est
// imposé par le Retry Executor.
const BANNER_WINDOW: Duration = Duration::from_millis(300);
const PROMPT_WINDOW: Duration = Duration::from_millis(1500);
const RESPONSE_WINDOW: Duration = Duration::from_secs(2);

pub struct TelnetProjector;

impl TelnetProjector {
    /// Ouvre la session, s'authentifie, envoie la commande et lit la réponse.
    /// La socket est refermée à la sortie quoi qu'il arrive.
    async fn send_command(&self, device: &Device, command: &str) -> Result<String, AdapterError> {
        let mut stream = connect(device, device.effective_port()).await?;
        let result = Self::run_session(&mut stream, device, command).await;
        let _ = stream.shutdown().await;
        result
    }

    async fn run_session(
        stream: &mut TcpStream,
        device: &Device,
        command: &str,
    ) -> Result<String, AdapterError> {
        let creds = device.credentials();
        let username = creds
            .username
            .ok_or_else(|| AdapterError::Config("telnet username missing".into()))?;
        let password = creds
            .password
            .ok_or_else(|| AdapterError::Config("telnet password missing".into()))?;

        // Bannière éventuelle, certains firmwares n'en envoient pas.
        let _ = read_window(stream, BANNER_WINDOW).await?;

        stream
            .write_all(format!("{username}\r\n").as_bytes())
            .await
            .map_err(|e| classify_io("send login", &e))?;
        stream
            .write_all(format!("{password}\r\n").as_bytes())
            .await
            .map_err(|e| classify_io("send password", &e))?;

        let prompt = read_window(stream, PROMPT_WINDOW).await?;
        let prompt = String::from_utf8_lossy(&prompt);
        if prompt.contains("Login incorrect") || prompt.contains("denied") {
            return Err(AdapterError::Protocol(format!(
                "login rejected: {}",
                prompt.trim()
            )));
        }

        stream
            .write_all(command.as_bytes())
            .await
            .map_err(|e| classify_io("send command", &e))?;

        let response = read_window(stream, RESPONSE_WINDOW).await?;
        Ok(String::from_utf8_lossy(&response).trim().to_string())
    }
}

#[async_trait]
impl ProtocolAdapter for TelnetProjector {
    async fn power_on(&self, device: &Device) -> Result<(), AdapterError> {
        let response = self.send_command(device, CMD_POWER_ON).await?;
        acknowledge(&response)
    }

    async fn power_off(&self, device: &Device) -> Result<(), AdapterError> {
        let response = self.send_command(device, CMD_POWER_OFF).await?;
        acknowledge(&response)
    }

    async fn query_power(&self, device: &Device) -> Result<PowerState, AdapterError> {
        let response = self.send_command(device, CMD_STATUS).await?;
        if response.is_empty() {
            return Err(AdapterError::Timeout("no status response".into()));
        }
        // Réponse constructeur : OK1 = allumé, OK0 = éteint.
        if response.contains("OK1") {
            Ok(PowerState::On)
        } else if response.contains("OK0") {
            Ok(PowerState::Off)
        } else if response.contains('P') {
            Ok(PowerState::Unknown)
        } else {
            Err(AdapterError::Protocol(format!(
                "unexpected status response: {response}"
            )))
        }
    }
}

/// Succès ssi un jeton d'acquittement positif est observé.
fn acknowledge(response: &str) -> Result<(), AdapterError> {
    if response.is_empty() {
        return Err(AdapterError::Timeout("no acknowledgement received".into()));
    }
    // 'P' = pass ; 'F' = fail sur cette famille.
    if response.contains('P') || response.contains("OK") {
        Ok(())
    } else if response.contains('F') {
        Err(AdapterError::Protocol(format!(
            "command rejected: {response}"
        )))
    } else {
        Err(AdapterError::Protocol(format!(
            "unexpected response token: {response}"
        )))
    }
}
