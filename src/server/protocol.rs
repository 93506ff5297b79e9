//! Codec des messages du canal de diffusion
//!
//! Tous les messages sont des objets JSON UTF-8, un objet par trame.
//! Enveloppe sortante: `{"message_type": …, "data": …, "timestamp": …}`,
//! horodatage ISO-8601 UTC à la milliseconde. Les commandes entrantes sont
//! validées contre une liste d'autorisation fermée.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FrelonError, Result};
use crate::metrics::SystemMetrics;
use crate::models::{truncate_to_millis, ts_ms, Alert, ConnectionSummary, NetworkEndpoint};

/// Version annoncée dans le message de bienvenue
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Types de messages sortants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Welcome,
    InitialState,
    MetricsUpdate,
    ConnectionsUpdate,
    AlertUpdate,
    CommandAck,
    Error,
}

/// Enveloppe sortante
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_type: MessageType,
    pub data: serde_json::Value,
    #[serde(with = "ts_ms")]
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    fn envelope(message_type: MessageType, data: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            message_type,
            data,
            timestamp: truncate_to_millis(now),
        }
    }

    pub fn welcome(now: DateTime<Utc>) -> Self {
        Self::envelope(
            MessageType::Welcome,
            serde_json::json!({
                "message": "Connecté au serveur de surveillance réseau",
                "server_version": SERVER_VERSION,
            }),
            now,
        )
    }

    pub fn initial_state(
        metrics: Option<&SystemMetrics>,
        connections: &[NetworkEndpoint],
        alerts: &[Alert],
        now: DateTime<Utc>,
    ) -> Self {
        Self::envelope(
            MessageType::InitialState,
            serde_json::json!({
                "metrics": metrics,
                "active_connections": connections,
                "alerts": alerts,
            }),
            now,
        )
    }

    pub fn metrics_update(metrics: &SystemMetrics, now: DateTime<Utc>) -> Self {
        Self::envelope(
            MessageType::MetricsUpdate,
            serde_json::to_value(metrics).unwrap_or(serde_json::Value::Null),
            now,
        )
    }

    pub fn connections_update(
        connections: &[NetworkEndpoint],
        alerts: &[Alert],
        summary: &ConnectionSummary,
        now: DateTime<Utc>,
    ) -> Self {
        Self::envelope(
            MessageType::ConnectionsUpdate,
            serde_json::json!({
                "active_connections": connections,
                "alerts": alerts,
                "summary": summary,
            }),
            now,
        )
    }

    pub fn alert_update(alerts: &[Alert], now: DateTime<Utc>) -> Self {
        Self::envelope(
            MessageType::AlertUpdate,
            serde_json::json!({ "alerts": alerts }),
            now,
        )
    }

    pub fn command_ack(
        id: Option<String>,
        ok: bool,
        result: Option<serde_json::Value>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::envelope(
            MessageType::CommandAck,
            serde_json::json!({
                "id": id,
                "ok": ok,
                "result": result,
                "error": error,
            }),
            now,
        )
    }

    pub fn error(error: &str, id: Option<String>, now: DateTime<Utc>) -> Self {
        Self::envelope(
            MessageType::Error,
            serde_json::json!({ "error": error, "id": id }),
            now,
        )
    }

    /// Les alertes ne sont jamais abandonnées par la contre-pression,
    /// sauf déconnexion forcée
    pub fn is_alert(&self) -> bool {
        self.message_type == MessageType::AlertUpdate
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"message_type":"error","data":{"error":"encodage impossible"}}"#.to_string()
        })
    }
}

/// Commande entrante d'un client
#[derive(Debug, Clone, Deserialize)]
pub struct InboundCommand {
    pub command: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub id: Option<String>,
}

/// Liste d'autorisation fermée des commandes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Hello,
    Ping,
    GetConnections,
    GetAlerts,
    GetMetrics,
    BlockIp,
    UnblockIp,
    PauseMonitoring,
    ResumeMonitoring,
    RefreshMetrics,
    Export,
}

impl CommandKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hello" => Some(Self::Hello),
            "ping" => Some(Self::Ping),
            "get_connections" => Some(Self::GetConnections),
            "get_alerts" => Some(Self::GetAlerts),
            "get_metrics" => Some(Self::GetMetrics),
            "block_ip" => Some(Self::BlockIp),
            "unblock_ip" => Some(Self::UnblockIp),
            "pause_monitoring" => Some(Self::PauseMonitoring),
            "resume_monitoring" => Some(Self::ResumeMonitoring),
            "refresh_metrics" => Some(Self::RefreshMetrics),
            "export" => Some(Self::Export),
            _ => None,
        }
    }
}

/// Taille maximale d'une trame entrante
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Décode une trame entrante en commande validée
pub fn decode_command(frame: &str) -> Result<(InboundCommand, CommandKind)> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(FrelonError::ClientProtocol(format!(
            "trame trop grande ({} octets)",
            frame.len()
        )));
    }
    let command: InboundCommand = serde_json::from_str(frame)
        .map_err(|e| FrelonError::ClientProtocol(format!("JSON invalide: {}", e)))?;
    let kind = CommandKind::from_name(&command.command).ok_or_else(|| {
        FrelonError::ClientProtocol(format!("commande inconnue: {}", command.command))
    })?;
    Ok((command, kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EndpointKey, Protocol};

    #[test]
    fn enveloppe_sortante() {
        let now = Utc::now();
        let msg = OutboundMessage::welcome(now);
        let value: serde_json::Value = serde_json::from_str(&msg.encode()).unwrap();
        assert_eq!(value["message_type"], "welcome");
        assert_eq!(value["data"]["server_version"], SERVER_VERSION);
        // Horodatage ISO-8601 à la milliseconde, suffixe Z
        let ts = value["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2026-01-01T00:00:00.000Z".len());
    }

    #[test]
    fn aller_retour_d_un_endpoint() {
        let key = EndpointKey::new("1.1.1.1", 443, Protocol::Tcp);
        let endpoint =
            crate::models::NetworkEndpoint::new(&key, "ESTABLISHED".into(), Utc::now());
        let json = serde_json::to_string(&endpoint).unwrap();
        let parsed: crate::models::NetworkEndpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.host, endpoint.host);
        assert_eq!(parsed.port, endpoint.port);
        assert_eq!(parsed.first_seen, endpoint.first_seen);
        assert_eq!(parsed.last_seen, endpoint.last_seen);
        assert_eq!(parsed.connection_count, endpoint.connection_count);
    }

    #[test]
    fn decodage_des_commandes() {
        let (cmd, kind) = decode_command(
            r#"{"command": "block_ip", "params": {"host": "5.6.7.8"}, "id": "abc"}"#,
        )
        .unwrap();
        assert_eq!(kind, CommandKind::BlockIp);
        assert_eq!(cmd.id.as_deref(), Some("abc"));
        assert_eq!(cmd.params["host"], "5.6.7.8");

        // Paramètres et id optionnels
        let (_, kind) = decode_command(r#"{"command": "ping"}"#).unwrap();
        assert_eq!(kind, CommandKind::Ping);
    }

    #[test]
    fn commande_inconnue_refusee() {
        let err = decode_command(r#"{"command": "shutdown"}"#).unwrap_err();
        assert!(matches!(err, FrelonError::ClientProtocol(_)));
    }

    #[test]
    fn json_invalide_refuse() {
        assert!(decode_command("{").is_err());
    }

    #[test]
    fn trame_trop_grande_refusee() {
        let frame = format!(
            r#"{{"command": "hello", "params": {{"filler": "{}"}}}}"#,
            "x".repeat(MAX_FRAME_BYTES)
        );
        assert!(decode_command(&frame).is_err());
    }

    #[test]
    fn seule_l_alerte_est_protegee() {
        let now = Utc::now();
        assert!(OutboundMessage::alert_update(&[], now).is_alert());
        assert!(!OutboundMessage::welcome(now).is_alert());
    }
}
