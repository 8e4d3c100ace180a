/**
 * TCP GÉNÉRIQUE - Famille sans contrôle d'alimentation
 *
 * RÔLE : Connexion/déconnexion uniquement, utilisée quand le pilotage n'est
 * pas disponible mais que la joignabilité compte encore. Les commandes
 * d'alimentation échouent en PROTOCOL_ERROR sans tentative réseau.
 */

use super::{connect, AdapterError, ProtocolAdapter};
use crate::config::Device;
use crate::models::PowerState;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

pub struct GenericTcp;

#[async_trait]
impl ProtocolAdapter for GenericTcp {
    async fn power_on(&self, device: &Device) -> Result<(), AdapterError> {
        Err(AdapterError::Config(format!(
            "device {}: power control not available for generic_tcp",
            device.id
        )))
    }

    async fn power_off(&self, device: &Device) -> Result<(), AdapterError> {
        Err(AdapterError::Config(format!(
            "device {}: power control not available for generic_tcp",
            device.id
        )))
    }

    async fn query_power(&self, device: &Device) -> Result<PowerState, AdapterError> {
        let mut stream = connect(device, device.effective_port()).await?;
        let _ = stream.shutdown().await;
        Ok(PowerState::Unknown)
    }
}
