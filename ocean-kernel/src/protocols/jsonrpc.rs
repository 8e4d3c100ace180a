/**
 * PROJECTEUR JSON-RPC - Pilote JSON-RPC 2.0 (famille Barco)
 *
 * RÔLE : Chaque message est une trame [longueur u32 big-endian][JSON].
 * Compteur d'id séquentiel par session ; une session par appel.
 */

use super::{classify_io, connect, AdapterError, ProtocolAdapter};
use crate::config::Device;
use crate::models::PowerState;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const METHOD_POWER_ON: &str = "system.poweron";
const METHOD_POWER_OFF: &str = "system.poweroff";
const METHOD_POWER_STATE: &str = "system.powerstate.get";

// Garde-fou contre une longueur de trame aberrante.
const MAX_FRAME_LEN: u32 = 1 << 20;

pub struct JsonrpcProjector;

/// Session JSON-RPC éphémère avec son compteur d'id.
struct Session {
    stream: TcpStream,
    next_id: u64,
}

impl Session {
    async fn open(device: &Device) -> Result<Self, AdapterError> {
        let stream = connect(device, device.effective_port()).await?;
        Ok(Self { stream, next_id: 1 })
    }

    async fn call(&mut self, method: &str, params: Value) -> Result<Value, AdapterError> {
        let id = self.next_id;
        self.next_id += 1;

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let payload = serde_json::to_vec(&request)
            .map_err(|e| AdapterError::Protocol(format!("encode request: {e}")))?;

        let len = u32::try_from(payload.len())
            .map_err(|_| AdapterError::Protocol("request too large".into()))?;
        self.stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| classify_io("send frame header", &e))?;
        self.stream
            .write_all(&payload)
            .await
            .map_err(|e| classify_io("send frame", &e))?;

        let mut header = [0u8; 4];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|e| classify_io("read frame header", &e))?;
        let response_len = u32::from_be_bytes(header);
        if response_len == 0 || response_len > MAX_FRAME_LEN {
            return Err(AdapterError::Protocol(format!(
                "invalid frame length: {response_len}"
            )));
        }
        let mut body = vec![0u8; response_len as usize];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|e| classify_io("read frame", &e))?;

        let response: Value = serde_json::from_slice(&body)
            .map_err(|e| AdapterError::Protocol(format!("invalid JSON response: {e}")))?;

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unspecified error");
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            return Err(AdapterError::Protocol(format!(
                "rpc error {code}: {message}"
            )));
        }
        if response.get("id").and_then(Value::as_u64) != Some(id) {
            return Err(AdapterError::Protocol("response id mismatch".into()));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Succès ssi le résultat n'est pas une erreur et, quand l'équipement
/// renvoie un état, que celui-ci correspond à l'état demandé.
fn check_result(result: &Value, wanted: &str) -> Result<(), AdapterError> {
    match result {
        Value::Null | Value::Bool(true) => Ok(()),
        Value::Bool(false) => Err(AdapterError::Protocol(format!(
            "device refused {wanted} request"
        ))),
        Value::String(state) if state.eq_ignore_ascii_case(wanted) => Ok(()),
        Value::String(state) => Err(AdapterError::Protocol(format!(
            "device reported state {state}, wanted {wanted}"
        ))),
        other => Err(AdapterError::Protocol(format!(
            "unexpected result: {other}"
        ))),
    }
}

fn parse_power_state(result: &Value) -> PowerState {
    match result.as_str() {
        Some(s) if s.eq_ignore_ascii_case("on") => PowerState::On,
        Some(s) if s.eq_ignore_ascii_case("off") => PowerState::Off,
        _ => PowerState::Unknown,
    }
}

#[async_trait]
impl ProtocolAdapter for JsonrpcProjector {
    async fn power_on(&self, device: &Device) -> Result<(), AdapterError> {
        let mut session = Session::open(device).await?;
        let result = session.call(METHOD_POWER_ON, json!({})).await;
        session.close().await;
        check_result(&result?, "on")
    }

    async fn power_off(&self, device: &Device) -> Result<(), AdapterError> {
        let mut session = Session::open(device).await?;
        let result = session.call(METHOD_POWER_OFF, json!({})).await;
        session.close().await;
        check_result(&result?, "off")
    }

    async fn query_power(&self, device: &Device) -> Result<PowerState, AdapterError> {
        let mut session = Session::open(device).await?;
        let result = session.call(METHOD_POWER_STATE, json!({})).await;
        session.close().await;
        Ok(parse_power_state(&result?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_result_accepts_matching_state() {
        assert!(check_result(&json!(null), "on").is_ok());
        assert!(check_result(&json!(true), "on").is_ok());
        assert!(check_result(&json!("on"), "on").is_ok());
        assert!(check_result(&json!("ON"), "on").is_ok());
    }

    #[test]
    fn check_result_rejects_mismatch() {
        assert!(check_result(&json!("off"), "on").is_err());
        assert!(check_result(&json!(false), "on").is_err());
        assert!(check_result(&json!(42), "on").is_err());
    }

    #[test]
    fn power_state_parses_known_values() {
        assert_eq!(parse_power_state(&json!("on")), PowerState::On);
        assert_eq!(parse_power_state(&json!("off")), PowerState::Off);
        assert_eq!(parse_power_state(&json!("warming")), PowerState::Unknown);
        assert_eq!(parse_power_state(&json!(null)), PowerState::Unknown);
    }
}
