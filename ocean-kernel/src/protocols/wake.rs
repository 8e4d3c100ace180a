/**
 * PC EXPOSITION - Réveil réseau et extinction douce
 *
 * RÔLE : power_on = magic packet Wake-on-LAN en broadcast UDP (ports 9 puis 7,
 * MAC répétée 16 fois). power_off = requête d'extinction sur le canal de
 * management TCP configuré ; sans canal configuré l'appel échoue
 * immédiatement, jamais de succès silencieux.
 */

use super::{classify_io, connect, read_window, AdapterError, ProtocolAdapter};
use crate::config::Device;
use crate::models::PowerState;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;

const WOL_PORTS: [u16; 2] = [9, 7];
const SHUTDOWN_REQUEST: &[u8] = b"shutdown\r\n";
const SHUTDOWN_ACK_WINDOW: Duration = Duration::from_secs(2);

pub struct PcWake;

pub(crate) fn parse_mac(mac: &str) -> Result<[u8; 6], AdapterError> {
    let hex: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if hex.len() != 12 {
        return Err(AdapterError::Config(format!("invalid MAC address: {mac}")));
    }
    let mut out = [0u8; 6];
    for i in 0..6 {
        out[i] = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| AdapterError::Config(format!("invalid MAC address: {mac}")))?;
    }
    Ok(out)
}

fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut pkt = [0u8; 102];
    // 6 x 0xFF
    for byte in pkt.iter_mut().take(6) {
        *byte = 0xFF;
    }
    // 16 fois l'adresse MAC
    for i in 0..16 {
        let base = 6 + i * 6;
        pkt[base..base + 6].copy_from_slice(&mac);
    }
    pkt
}

#[async_trait]
impl ProtocolAdapter for PcWake {
    async fn power_on(&self, device: &Device) -> Result<(), AdapterError> {
        let creds = device.credentials();
        let mac = creds
            .mac
            .as_deref()
            .ok_or_else(|| AdapterError::Config(format!("device {}: MAC missing", device.id)))?;
        let pkt = magic_packet(parse_mac(mac)?);

        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| classify_io("bind", &e))?;
        socket
            .set_broadcast(true)
            .map_err(|e| classify_io("set broadcast", &e))?;

        // On tente port 9 puis 7, un seul envoi réussi suffit.
        let mut last_err = None;
        let mut sent = false;
        for port in WOL_PORTS {
            let addr = SocketAddrV4::new(Ipv4Addr::BROADCAST, port);
            match socket.send_to(&pkt, addr).await {
                Ok(_) => sent = true,
                Err(e) => last_err = Some(classify_io("send magic packet", &e)),
            }
        }
        if sent {
            Ok(())
        } else {
            Err(last_err
                .unwrap_or_else(|| AdapterError::Unreachable("magic packet not sent".into())))
        }
    }

    async fn power_off(&self, device: &Device) -> Result<(), AdapterError> {
        let creds = device.credentials();
        let Some(port) = creds.management_port else {
            return Err(AdapterError::Config(format!(
                "device {}: no management channel configured for shutdown",
                device.id
            )));
        };
        let mut stream = connect(device, port).await?;
        stream
            .write_all(SHUTDOWN_REQUEST)
            .await
            .map_err(|e| classify_io("send shutdown", &e))?;
        // Acquittement optionnel ; un refus explicite est une erreur.
        let ack = read_window(&mut stream, SHUTDOWN_ACK_WINDOW).await?;
        let _ = stream.shutdown().await;
        let ack = String::from_utf8_lossy(&ack);
        if ack.to_ascii_lowercase().contains("denied") {
            return Err(AdapterError::Protocol(format!(
                "shutdown refused: {}",
                ack.trim()
            )));
        }
        Ok(())
    }

    async fn query_power(&self, _device: &Device) -> Result<PowerState, AdapterError> {
        // Pas d'interrogation d'état sur cette famille ; la joignabilité
        // relève du Health Prober.
        Ok(PowerState::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mac_accepts_common_formats() {
        assert_eq!(
            parse_mac("AA:BB:CC:DD:EE:FF").unwrap(),
            [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
        );
        assert_eq!(
            parse_mac("aa-bb-cc-dd-ee-ff").unwrap(),
            [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
        );
        assert_eq!(parse_mac("aabbccddeeff").unwrap()[0], 0xAA);
    }

    #[test]
    fn parse_mac_rejects_bad_input() {
        assert!(matches!(parse_mac("AA:BB:CC"), Err(AdapterError::Config(_))));
        assert!(matches!(parse_mac(""), Err(AdapterError::Config(_))));
    }

    #[test]
    fn magic_packet_repeats_mac_sixteen_times() {
        let mac = [1, 2, 3, 4, 5, 6];
        let pkt = magic_packet(mac);
        assert_eq!(&pkt[..6], &[0xFF; 6]);
        for i in 0..16 {
            let base = 6 + i * 6;
            assert_eq!(&pkt[base..base + 6], &mac);
        }
    }
}
