//! Hub de diffusion
//!
//! Serveur WebSocket qui entretient le registre des clients, pousse les
//! instantanés périodiques (métriques, connexions, alertes) et renvoie les
//! commandes des clients vers le moniteur. Chaque client est servi par ses
//! propres tâches de lecture et d'écriture: la défaillance de l'un
//! n'affecte jamais les autres.

mod client;
pub mod protocol;

pub use client::{ClientQueue, ProtocolStrikes, PushOutcome};
pub use protocol::{CommandKind, InboundCommand, MessageType, OutboundMessage};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};

use crate::config::Config;
use crate::error::FrelonError;
use crate::journal::Exporter;
use crate::metrics::MetricsCollector;
use crate::monitor::ConnectionMonitor;
use crate::probe::Clock;

/// Délai maximal d'une écriture vers un client
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Délai de vidage des files clientes à l'arrêt
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Taille maximale d'une trame acceptée par la couche WebSocket; les trames
/// au-delà de la limite du protocole sont rejetées applicativement pour
/// pouvoir répondre `error` sans couper la connexion
const WS_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Un client connecté
pub struct ClientHandle {
    pub id: u64,
    pub queue: ClientQueue,
    strikes: ProtocolStrikes,
    disconnecting: AtomicBool,
    disconnect: Notify,
}

impl ClientHandle {
    fn new(id: u64) -> Self {
        Self {
            id,
            queue: ClientQueue::new(),
            strikes: ProtocolStrikes::new(),
            disconnecting: AtomicBool::new(false),
            disconnect: Notify::new(),
        }
    }

    /// Demande la déconnexion du client
    pub fn close(&self, reason: &str) {
        if !self.disconnecting.swap(true, Ordering::Relaxed) {
            info!("Déconnexion du client {} ({})", self.id, reason);
            // notify_one conserve un permis: la demande survit si la tâche
            // d'écriture n'est pas encore en attente
            self.disconnect.notify_one();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.disconnecting.load(Ordering::Relaxed)
    }
}

/// État partagé du hub
pub struct HubState {
    pub config: Arc<Config>,
    pub monitor: Arc<ConnectionMonitor>,
    pub metrics: Arc<MetricsCollector>,
    pub exporter: Exporter,
    pub clock: Arc<dyn Clock>,
    clients: RwLock<HashMap<u64, Arc<ClientHandle>>>,
    next_client_id: AtomicU64,
}

impl HubState {
    pub fn new(
        config: Arc<Config>,
        monitor: Arc<ConnectionMonitor>,
        metrics: Arc<MetricsCollector>,
        exporter: Exporter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            monitor,
            metrics,
            exporter,
            clock,
            clients: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Diffuse un message à tous les clients; les files saturées
    /// déconnectent leur client avec la raison `backpressure`
    pub async fn broadcast(&self, message: OutboundMessage) {
        let clients: Vec<Arc<ClientHandle>> =
            self.clients.read().await.values().cloned().collect();
        for client in clients {
            if client.is_closing() {
                continue;
            }
            if client.queue.push(message.clone()) == PushOutcome::Saturated {
                client.close("backpressure");
            }
        }
    }

    async fn register(&self) -> Arc<ClientHandle> {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ClientHandle::new(id));
        self.clients.write().await.insert(id, handle.clone());
        info!(
            "Client {} enregistré ({} client(s) connecté(s))",
            id,
            self.clients.read().await.len()
        );
        handle
    }

    async fn unregister(&self, id: u64) {
        self.clients.write().await.remove(&id);
        info!(
            "Client {} parti ({} client(s) connecté(s))",
            id,
            self.clients.read().await.len()
        );
    }

    /// Vide les files sortantes dans la limite du délai d'arrêt, puis
    /// déconnecte tous les clients
    pub async fn shutdown_clients(&self) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        loop {
            let pending: usize = {
                let clients = self.clients.read().await;
                clients.values().map(|c| c.queue.len()).sum()
            };
            if pending == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for client in self.clients.read().await.values() {
            client.close("arrêt du serveur");
        }
    }
}

/// Construit le routeur axum du hub
pub fn router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HubState>>,
) -> impl IntoResponse {
    ws.max_message_size(WS_MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_client(socket, state))
}

/// Gère un client: enregistrement, état initial, boucle de lecture et
/// tâche d'écriture dédiée
async fn handle_client(socket: WebSocket, state: Arc<HubState>) {
    let handle = state.register().await;
    let (mut sender, mut receiver) = socket.split();

    // Bienvenue puis état initial
    let now = state.clock.now();
    handle.queue.push(OutboundMessage::welcome(now));
    let metrics = state.metrics.latest().await;
    let connections = state.monitor.connections_snapshot().await;
    let alerts = state.monitor.recent_alerts(10).await;
    handle.queue.push(OutboundMessage::initial_state(
        metrics.as_ref(),
        &connections,
        &alerts,
        now,
    ));

    // Tâche d'écriture: vide la file vers le socket, ordre FIFO par client
    let writer_handle = handle.clone();
    let writer = tokio::spawn(async move {
        loop {
            if writer_handle.is_closing() {
                break;
            }
            if let Some(message) = writer_handle.queue.pop() {
                let frame = Message::Text(message.encode());
                match tokio::time::timeout(CLIENT_WRITE_TIMEOUT, sender.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Écriture vers le client {}: {}", writer_handle.id, e);
                        break;
                    }
                    Err(_) => {
                        warn!(
                            "Client {} trop lent (délai d'écriture dépassé)",
                            writer_handle.id
                        );
                        break;
                    }
                }
            } else {
                tokio::select! {
                    _ = writer_handle.queue.wait() => {}
                    _ = writer_handle.disconnect.notified() => {}
                }
            }
        }
        let _ = sender.close().await;
    });

    // Boucle de lecture: commandes du client
    while let Some(frame) = receiver.next().await {
        if handle.is_closing() {
            break;
        }
        match frame {
            Ok(Message::Text(text)) => {
                handle_frame(&state, &handle, &text).await;
            }
            Ok(Message::Binary(_)) => {
                let reply = OutboundMessage::error(
                    "trames binaires non prises en charge",
                    None,
                    state.clock.now(),
                );
                handle.queue.push(reply);
                if handle.strikes.strike() {
                    handle.close("erreurs de protocole répétées");
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Lecture du client {}: {}", handle.id, e);
                break;
            }
        }
    }

    handle.close("fin de session");
    let _ = writer.await;
    state.unregister(handle.id).await;
}

/// Traite une trame texte: décodage, exécution, accusé de réception
async fn handle_frame(state: &Arc<HubState>, handle: &Arc<ClientHandle>, text: &str) {
    let limit = state.config.max_message_size;
    if text.len() > limit {
        let reply = OutboundMessage::error(
            &format!("trame trop grande ({} octets, limite {})", text.len(), limit),
            None,
            state.clock.now(),
        );
        handle.queue.push(reply);
        if handle.strikes.strike() {
            handle.close("erreurs de protocole répétées");
        }
        return;
    }

    match protocol::decode_command(text) {
        Ok((command, kind)) => {
            handle.strikes.reset();
            let reply = dispatch(state, command, kind).await;
            handle.queue.push(reply);
        }
        Err(FrelonError::ClientProtocol(message)) => {
            let reply = OutboundMessage::error(&message, None, state.clock.now());
            handle.queue.push(reply);
            if handle.strikes.strike() {
                handle.close("erreurs de protocole répétées");
            }
        }
        Err(e) => {
            error!("Erreur interne lors du décodage d'une commande: {}", e);
            let reply =
                OutboundMessage::error("erreur interne", None, state.clock.now());
            handle.queue.push(reply);
        }
    }
}

/// Exécute une commande validée et construit la réponse
async fn dispatch(
    state: &Arc<HubState>,
    command: InboundCommand,
    kind: CommandKind,
) -> OutboundMessage {
    let now = state.clock.now();
    let id = command.id.clone();

    match kind {
        CommandKind::Hello => OutboundMessage::command_ack(
            id,
            true,
            Some(serde_json::json!({
                "message": "bienvenue",
                "server_version": protocol::SERVER_VERSION,
            })),
            None,
            now,
        ),
        CommandKind::Ping => OutboundMessage::command_ack(
            id,
            true,
            Some(serde_json::json!({
                "pong": true,
                "server_time": crate::models::truncate_to_millis(now)
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            })),
            None,
            now,
        ),
        CommandKind::GetConnections => {
            let connections = state.monitor.connections_snapshot().await;
            let summary = state.monitor.summary().await;
            OutboundMessage::command_ack(
                id,
                true,
                Some(serde_json::json!({
                    "active_connections": connections,
                    "summary": summary,
                })),
                None,
                now,
            )
        }
        CommandKind::GetAlerts => {
            let alerts = state.monitor.recent_alerts(crate::monitor::ALERT_QUEUE_CAP).await;
            OutboundMessage::command_ack(
                id,
                true,
                Some(serde_json::json!({ "alerts": alerts })),
                None,
                now,
            )
        }
        CommandKind::GetMetrics => {
            let metrics = match state.metrics.latest().await {
                Some(metrics) => metrics,
                None => state.metrics.sample().await,
            };
            OutboundMessage::command_ack(
                id,
                true,
                Some(serde_json::to_value(&metrics).unwrap_or(serde_json::Value::Null)),
                None,
                now,
            )
        }
        CommandKind::BlockIp | CommandKind::UnblockIp => {
            let host = command.params.get("host").and_then(|v| v.as_str());
            match host {
                Some(host) if !host.is_empty() => {
                    let blocked = kind == CommandKind::BlockIp;
                    if blocked {
                        state.monitor.block_ip(host).await;
                    } else {
                        state.monitor.unblock_ip(host).await;
                    }
                    OutboundMessage::command_ack(
                        id,
                        true,
                        Some(serde_json::json!({ "host": host, "blocked": blocked })),
                        None,
                        now,
                    )
                }
                _ => OutboundMessage::command_ack(
                    id,
                    false,
                    None,
                    Some("paramètre host manquant".to_string()),
                    now,
                ),
            }
        }
        CommandKind::PauseMonitoring => {
            state.monitor.pause();
            OutboundMessage::command_ack(
                id,
                true,
                Some(serde_json::json!({ "paused": true })),
                None,
                now,
            )
        }
        CommandKind::ResumeMonitoring => {
            state.monitor.resume();
            OutboundMessage::command_ack(
                id,
                true,
                Some(serde_json::json!({ "paused": false })),
                None,
                now,
            )
        }
        CommandKind::RefreshMetrics => {
            state.monitor.refresh();
            OutboundMessage::command_ack(
                id,
                true,
                Some(serde_json::json!({ "refreshed": true })),
                None,
                now,
            )
        }
        CommandKind::Export => {
            let table = state.monitor.table_snapshot().await;
            let alerts = state.monitor.recent_alerts(crate::monitor::ALERT_QUEUE_CAP).await;
            let summary = state.monitor.summary().await;
            let blocked = state.monitor.blocked_hosts().await;
            match state.exporter.export(&table, blocked, alerts, summary, now) {
                Ok(path) => OutboundMessage::command_ack(
                    id,
                    true,
                    Some(serde_json::json!({ "file": path.display().to_string() })),
                    None,
                    now,
                ),
                Err(e) => {
                    error!("Échec de l'export: {}", e);
                    OutboundMessage::command_ack(
                        id,
                        false,
                        None,
                        Some(format!("export impossible: {}", e)),
                        now,
                    )
                }
            }
        }
    }
}


/// Boucles de diffusion périodiques du hub
pub async fn run_broadcasts(state: Arc<HubState>, mut shutdown: watch::Receiver<bool>) {
    let metrics_period = Duration::from_secs(state.config.metrics_interval.max(1));
    let connections_period = Duration::from_secs(state.config.scan_interval.max(1));

    let mut metrics_tick = tokio::time::interval(metrics_period);
    let mut connections_tick = tokio::time::interval(connections_period);

    loop {
        tokio::select! {
            _ = metrics_tick.tick() => {
                if state.client_count().await == 0 {
                    continue;
                }
                if let Some(metrics) = state.metrics.latest().await {
                    let now = state.clock.now();
                    state.broadcast(OutboundMessage::metrics_update(&metrics, now)).await;
                }
            }
            _ = connections_tick.tick() => {
                if state.client_count().await == 0 {
                    continue;
                }
                let now = state.clock.now();
                // Les alertes en attente partent toujours avant l'instantané
                // qui reflète un balayage plus récent
                let pending = state.monitor.alerts.drain();
                if !pending.is_empty() {
                    state.broadcast(OutboundMessage::alert_update(&pending, now)).await;
                }
                let connections = state.monitor.connections_snapshot().await;
                let alerts = state.monitor.recent_alerts(5).await;
                let summary = state.monitor.summary().await;
                state
                    .broadcast(OutboundMessage::connections_update(
                        &connections,
                        &alerts,
                        &summary,
                        now,
                    ))
                    .await;
            }
            _ = state.monitor.alerts.notified() => {
                // Livraison rapide: une alerte fraîche part sous 100 ms
                let pending = state.monitor.alerts.drain();
                if !pending.is_empty() {
                    let now = state.clock.now();
                    state.broadcast(OutboundMessage::alert_update(&pending, now)).await;
                }
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    debug!("Arrêt des boucles de diffusion");
                    break;
                }
            }
        }
    }
}
