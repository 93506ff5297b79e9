//! Moniteur de connexions
//!
//! Propriétaire de la table des endpoints. Une passe de balayage énumère
//! les sockets actifs, les rattache à leur processus, synthétise les
//! échantillons de trafic, évalue chaque endpoint vivant et émet les
//! alertes. Écrivain unique: le verrou exclusif n'est tenu que pendant la
//! phase de mutation de la table.

mod commands;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, RwLock};

use crate::blocklist::BlockList;
use crate::config::Config;
use crate::intel::{self, BehaviorFlags, ThreatCorpus};
use crate::journal::AlertJournal;
use crate::models::{
    truncate_to_millis, Alert, ConnectionSummary, EncryptionType, EndpointKey, NetworkEndpoint,
    RiskLevel,
};
use crate::probe::{Clock, HostProbe, SocketRecord};
use crate::sampler::DEFAULT_ENCRYPTED_PORTS;

/// Balayages consécutifs manqués avant qu'un endpoint ne soit marqué périmé
pub const STALE_SCAN_THRESHOLD: u32 = 3;
/// Durée de péremption avant éviction
pub const EVICTION_AFTER: Duration = Duration::from_secs(300);
/// Capacité de la file d'alertes et de l'historique
pub const ALERT_QUEUE_CAP: usize = 1000;
/// Durée de validité du cache DNS inverse
const DNS_CACHE_TTL: Duration = Duration::from_secs(300);
/// Fenêtre de détection des rafales de connexions
const BURST_WINDOW: Duration = Duration::from_secs(10);
/// Endpoints distincts d'un même processus déclenchant une rafale
const BURST_THRESHOLD: usize = 20;
/// Fenêtre de détection des balayages de ports
const PORT_SCAN_WINDOW: Duration = Duration::from_secs(30);
/// Ports distincts d'un même hôte déclenchant un balayage
const PORT_SCAN_THRESHOLD: usize = 15;
/// Fenêtre et seuil des reconnexions rapides
const RECONNECT_WINDOW: Duration = Duration::from_secs(60);
const RECONNECT_THRESHOLD: usize = 3;
/// Dépassements de cadence consécutifs avant alerte
const OVERRUN_THRESHOLD: u32 = 3;

/// File d'alertes bornée du moniteur vers le hub, éviction du plus ancien
pub struct AlertQueue {
    inner: Mutex<VecDeque<Alert>>,
    notify: Notify,
    cap: usize,
}

impl AlertQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap,
        }
    }

    pub fn push(&self, alert: Alert) {
        {
            let mut queue = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queue.len() >= self.cap {
                queue.pop_front();
            }
            queue.push_back(alert);
        }
        self.notify.notify_one();
    }

    /// Vide la file et retourne son contenu
    pub fn drain(&self) -> Vec<Alert> {
        let mut queue = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.drain(..).collect()
    }

    /// Attend qu'au moins une alerte soit disponible
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fenêtres comportementales entretenues entre les balayages
#[derive(Default)]
struct ScanState {
    /// pid → endpoints distincts récemment ouverts
    burst: HashMap<u32, HashMap<EndpointKey, DateTime<Utc>>>,
    /// hôte → ports de destination récemment observés
    ports: HashMap<String, HashMap<u16, DateTime<Utc>>>,
    /// Hôtes dont le balayage de ports a déjà été signalé
    flagged_scans: HashSet<String>,
    /// Processus dont la rafale a déjà été signalée
    flagged_bursts: HashSet<u32>,
    /// hôte → instants de reconnexion récents
    reconnects: HashMap<String, VecDeque<DateTime<Utc>>>,
}

/// Une observation normalisée issue d'un balayage
struct Observation {
    key: EndpointKey,
    state: String,
    local_port: u16,
    pid: Option<u32>,
    bytes_sent: Option<u64>,
    bytes_received: Option<u64>,
}

pub struct ConnectionMonitor {
    config: Arc<Config>,
    probe: Arc<dyn HostProbe>,
    clock: Arc<dyn Clock>,
    corpus: Arc<RwLock<ThreatCorpus>>,
    blocklist: Arc<RwLock<BlockList>>,
    endpoints: RwLock<HashMap<EndpointKey, NetworkEndpoint>>,
    /// File de livraison vers le hub
    pub alerts: AlertQueue,
    /// Historique borné servi par `get_alerts` et l'état initial
    recent_alerts: RwLock<VecDeque<Alert>>,
    journal: AlertJournal,
    paused: AtomicBool,
    force_scan: Notify,
    scan_counter: AtomicU64,
    overruns: AtomicU32,
    encrypted_ports: HashSet<u16>,
    dns_cache: DashMap<String, (DateTime<Utc>, Option<String>)>,
    state: Mutex<ScanState>,
}

impl ConnectionMonitor {
    pub fn new(
        config: Arc<Config>,
        probe: Arc<dyn HostProbe>,
        clock: Arc<dyn Clock>,
        corpus: Arc<RwLock<ThreatCorpus>>,
        blocklist: Arc<RwLock<BlockList>>,
        journal: AlertJournal,
    ) -> Self {
        let encrypted_ports = DEFAULT_ENCRYPTED_PORTS
            .iter()
            .copied()
            .chain(config.extra_encrypted_ports.iter().copied())
            .collect();
        Self {
            config,
            probe,
            clock,
            corpus,
            blocklist,
            endpoints: RwLock::new(HashMap::new()),
            alerts: AlertQueue::new(ALERT_QUEUE_CAP),
            recent_alerts: RwLock::new(VecDeque::new()),
            journal,
            paused: AtomicBool::new(false),
            force_scan: Notify::new(),
            scan_counter: AtomicU64::new(0),
            overruns: AtomicU32::new(0),
            encrypted_ports,
            dns_cache: DashMap::new(),
            state: Mutex::new(ScanState::default()),
        }
    }

    pub fn encrypted_ports(&self) -> &HashSet<u16> {
        &self.encrypted_ports
    }

    /// Nombre de balayages effectués depuis le démarrage
    pub fn scan_count(&self) -> u64 {
        self.scan_counter.load(Ordering::Relaxed)
    }

    /// Émet une alerte: journal sur disque, historique, file vers le hub
    pub async fn emit_alert(&self, alert: Alert) {
        self.journal.append(&alert);
        {
            let mut recent = self.recent_alerts.write().await;
            if recent.len() >= ALERT_QUEUE_CAP {
                recent.pop_front();
            }
            recent.push_back(alert.clone());
        }
        self.alerts.push(alert);
    }

    /// Boucle de balayage, cadencée par échéances. Un balayage qui déborde
    /// sa période déclenche le suivant immédiatement; trois débordements
    /// consécutifs remontent une alerte `monitor_overrun`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.scan_interval);
        let mut next_deadline = tokio::time::Instant::now();
        info!(
            "Démarrage du moniteur de connexions (cadence {} s)",
            self.config.scan_interval
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_deadline) => {
                    if self.paused.load(Ordering::Relaxed) {
                        next_deadline = tokio::time::Instant::now() + period;
                        continue;
                    }
                    let started = Instant::now();
                    self.scan().await;
                    let elapsed = started.elapsed();

                    if elapsed >= period {
                        let overruns = self.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                        if overruns == OVERRUN_THRESHOLD {
                            warn!("Le balayage déborde sa période depuis {} cycles", overruns);
                            let alert = Alert::new("monitor_overrun", self.clock.now())
                                .with_details(serde_json::json!({
                                    "period_ms": period.as_millis() as u64,
                                    "elapsed_ms": elapsed.as_millis() as u64,
                                }));
                            self.emit_alert(alert).await;
                        }
                        next_deadline = tokio::time::Instant::now();
                    } else {
                        self.overruns.store(0, Ordering::Relaxed);
                        next_deadline += period;
                    }
                }
                _ = self.force_scan.notified() => {
                    self.scan().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Arrêt du moniteur de connexions");
                        break;
                    }
                }
            }
        }
    }

    /// Une passe de balayage complète
    pub async fn scan(&self) {
        self.scan_counter.fetch_add(1, Ordering::Relaxed);

        let records = match self.probe.enumerate_sockets().await {
            Ok(records) => records,
            Err(e) => {
                // Balayage partiel: la boucle continue avec une liste vide
                error!("Énumération des sockets impossible: {}", e);
                Vec::new()
            }
        };

        let now = self.clock.now();
        let observations = normalize_records(&records);

        // Comptes de connexions par processus, repris dans ProcessInfo
        let mut pid_tcp: HashMap<u32, u32> = HashMap::new();
        let mut pid_udp: HashMap<u32, u32> = HashMap::new();
        for record in &records {
            if let Some(pid) = record.pid {
                match record.protocol {
                    crate::models::Protocol::Tcp => *pid_tcp.entry(pid).or_default() += 1,
                    crate::models::Protocol::Udp => *pid_udp.entry(pid).or_default() += 1,
                }
            }
        }

        // Attribution des processus, au plus une interrogation par pid et
        // par balayage, hors verrou d'écriture
        let pids: HashSet<u32> = observations.iter().filter_map(|o| o.pid).collect();
        let mut process_map = HashMap::new();
        for pid in pids {
            if let Some(mut info) = self.probe.process_info(pid).await {
                info.tcp_connections = pid_tcp.get(&pid).copied().unwrap_or(0);
                info.udp_connections = pid_udp.get(&pid).copied().unwrap_or(0);
                process_map.insert(pid, info);
            }
        }

        // Résolutions DNS inverses manquantes, servies par le cache 5 min
        let mut dns_map: HashMap<String, Option<String>> = HashMap::new();
        for obs in &observations {
            let host = obs.key.host.clone();
            if dns_map.contains_key(&host) {
                continue;
            }
            let resolved = self.cached_reverse_dns(&host, now).await;
            dns_map.insert(host, resolved);
        }

        let blocked = self.blocklist.read().await.snapshot();
        let corpus = self.corpus.read().await.clone();

        // Fenêtre des ports observés par hôte, et alertes de balayage
        let (scanning_hosts, host_ports, mut behavior_alerts) =
            self.update_port_windows(&observations, now);

        // Phase de mutation de la table, verrou exclusif court
        let mut alerts: Vec<Alert> = Vec::new();
        let mut opened: Vec<(u32, EndpointKey)> = Vec::new();
        {
            let mut table = self.endpoints.write().await;
            let live: HashSet<EndpointKey> =
                observations.iter().map(|o| o.key.clone()).collect();

            for obs in &observations {
                let is_new = !table.contains_key(&obs.key);
                let endpoint = table
                    .entry(obs.key.clone())
                    .or_insert_with(|| NetworkEndpoint::new(&obs.key, obs.state.clone(), now));

                if is_new {
                    if let Some(pid) = obs.pid {
                        opened.push((pid, obs.key.clone()));
                    }
                    if let Some(alert) = self.note_reconnection(&obs.key, now) {
                        alerts.push(alert);
                    }
                } else {
                    endpoint.last_seen = truncate_to_millis(now);
                    endpoint.connection_state = obs.state.clone();
                    if endpoint.stale_scans > 0 {
                        // Transition absent → présent
                        endpoint.connection_count += 1;
                        endpoint.stale_scans = 0;
                        endpoint.stale_since = None;
                        if let Some(pid) = obs.pid {
                            opened.push((pid, obs.key.clone()));
                        }
                        if let Some(alert) = self.note_reconnection(&obs.key, now) {
                            alerts.push(alert);
                        }
                    }
                }

                endpoint.pid = obs.pid;
                if let Some(pid) = obs.pid {
                    endpoint.process_info = process_map.get(&pid).cloned();
                }
                if endpoint.reverse_dns.is_none() {
                    if let Some(Some(name)) = dns_map.get(&endpoint.host) {
                        endpoint.reverse_dns = Some(name.clone());
                    }
                }
                endpoint.encryption_type = if self.encrypted_ports.contains(&endpoint.port) {
                    EncryptionType::Tls
                } else {
                    EncryptionType::Plain
                };
                if let Some(ports) = host_ports.get(&endpoint.host) {
                    endpoint.open_ports = ports.clone();
                }

                // Synthèse des échantillons à partir des deltas de compteurs
                if let (Some(sent), Some(received)) = (obs.bytes_sent, obs.bytes_received) {
                    let tls = endpoint.encryption_type == EncryptionType::Tls;
                    endpoint.traffic.synthesize(
                        sent,
                        received,
                        obs.local_port,
                        endpoint.port,
                        endpoint.protocol,
                        tls,
                        &self.encrypted_ports,
                        now,
                    );
                }
            }

            // Endpoints absents de ce balayage
            let mut to_evict = Vec::new();
            for (key, endpoint) in table.iter_mut() {
                if live.contains(key) {
                    continue;
                }
                if blocked.contains(&endpoint.host) {
                    // Un hôte bloqué n'est jamais évincé; il persiste sans
                    // échantillon vivant
                    endpoint.connection_state = "BLOCKED".to_string();
                    endpoint.traffic.clear_samples();
                    endpoint.stale_scans = 0;
                    endpoint.stale_since = None;
                    continue;
                }
                endpoint.stale_scans += 1;
                if endpoint.stale_scans >= STALE_SCAN_THRESHOLD {
                    endpoint.connection_state = "STALE".to_string();
                    let since = *endpoint.stale_since.get_or_insert(now);
                    if now.signed_duration_since(since)
                        >= ChronoDuration::from_std(EVICTION_AFTER).unwrap_or_default()
                    {
                        to_evict.push(key.clone());
                    }
                }
            }
            for key in to_evict {
                debug!("Éviction de l'endpoint périmé {}", key);
                table.remove(&key);
            }

            // Fenêtre des ouvertures par processus: rafales de connexions
            let (burst_pids, mut burst_alerts) = self.update_burst_windows(&opened, now);
            alerts.append(&mut burst_alerts);

            // Évaluation de chaque endpoint vivant
            for obs in &observations {
                if let Some(endpoint) = table.get_mut(&obs.key) {
                    let is_blocked = blocked.contains(&endpoint.host);
                    let flags = BehaviorFlags {
                        connection_burst: obs
                            .pid
                            .map(|pid| burst_pids.contains(&pid))
                            .unwrap_or(false),
                        port_scan: scanning_hosts.contains(&endpoint.host),
                    };
                    let previous = endpoint
                        .security_assessment
                        .as_ref()
                        .map(|a| a.risk_level);
                    let assessment = intel::assess(
                        endpoint,
                        &corpus,
                        is_blocked,
                        flags,
                        &self.config.allow_roots,
                        &self.encrypted_ports,
                    );
                    endpoint.is_safe = matches!(
                        assessment.risk_level,
                        RiskLevel::Low | RiskLevel::Medium
                    ) && !is_blocked;

                    if let Some(alert) =
                        escalation_alert(&obs.key, previous, assessment.risk_level, now)
                    {
                        alerts.push(alert);
                    }
                    endpoint.security_assessment = Some(assessment);
                }
            }

            // Publication avant de rendre le verrou: la visibilité des
            // alertes avance avec celle de la table, un `connections_update`
            // d'un balayage ultérieur ne peut donc jamais les précéder
            alerts.append(&mut behavior_alerts);
            for alert in alerts {
                self.emit_alert(alert).await;
            }
        }
    }

    /// Résolution DNS inverse avec cache borné dans le temps
    async fn cached_reverse_dns(&self, host: &str, now: DateTime<Utc>) -> Option<String> {
        if let Some(entry) = self.dns_cache.get(host) {
            let (cached_at, value) = entry.value().clone();
            if now.signed_duration_since(cached_at)
                < ChronoDuration::from_std(DNS_CACHE_TTL).unwrap_or_default()
            {
                return value;
            }
        }
        let resolved = self.probe.reverse_dns(host).await;
        self.dns_cache
            .insert(host.to_string(), (now, resolved.clone()));
        resolved
    }

    /// Met à jour la fenêtre des ports observés par hôte et retourne les
    /// hôtes en balayage, les ports connus par hôte et les alertes fraîches
    #[allow(clippy::type_complexity)]
    fn update_port_windows(
        &self,
        observations: &[Observation],
        now: DateTime<Utc>,
    ) -> (
        HashSet<String>,
        HashMap<String, std::collections::BTreeSet<u16>>,
        Vec<Alert>,
    ) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut alerts = Vec::new();

        let cutoff = now - ChronoDuration::from_std(PORT_SCAN_WINDOW).unwrap_or_default();

        for obs in observations {
            state
                .ports
                .entry(obs.key.host.clone())
                .or_default()
                .insert(obs.key.port, now);
        }
        for window in state.ports.values_mut() {
            window.retain(|_, t| *t > cutoff);
        }
        state.ports.retain(|_, w| !w.is_empty());

        let scanning_hosts: HashSet<String> = state
            .ports
            .iter()
            .filter(|(_, w)| w.len() >= PORT_SCAN_THRESHOLD)
            .map(|(host, _)| host.clone())
            .collect();

        // Une seule alerte par épisode de balayage
        for host in &scanning_hosts {
            if state.flagged_scans.insert(host.clone()) {
                let count = state.ports.get(host).map(|w| w.len()).unwrap_or(0);
                warn!("Balayage de ports détecté depuis l'hôte {}", host);
                alerts.push(
                    Alert::new("port_scan", now).with_details(serde_json::json!({
                        "host": host,
                        "distinct_ports": count,
                    })),
                );
            }
        }
        state
            .flagged_scans
            .retain(|host| scanning_hosts.contains(host));

        let host_ports: HashMap<String, std::collections::BTreeSet<u16>> = state
            .ports
            .iter()
            .map(|(host, w)| (host.clone(), w.keys().copied().collect()))
            .collect();

        (scanning_hosts, host_ports, alerts)
    }

    /// Met à jour la fenêtre des ouvertures d'endpoints par processus et
    /// retourne les processus en rafale avec les alertes fraîches
    fn update_burst_windows(
        &self,
        opened: &[(u32, EndpointKey)],
        now: DateTime<Utc>,
    ) -> (HashSet<u32>, Vec<Alert>) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut alerts = Vec::new();

        let cutoff = now - ChronoDuration::from_std(BURST_WINDOW).unwrap_or_default();

        for (pid, key) in opened {
            state.burst.entry(*pid).or_default().insert(key.clone(), now);
        }
        for window in state.burst.values_mut() {
            window.retain(|_, t| *t > cutoff);
        }
        state.burst.retain(|_, w| !w.is_empty());

        let burst_pids: HashSet<u32> = state
            .burst
            .iter()
            .filter(|(_, w)| w.len() >= BURST_THRESHOLD)
            .map(|(pid, _)| *pid)
            .collect();

        // Une seule alerte par épisode de rafale
        for pid in &burst_pids {
            if state.flagged_bursts.insert(*pid) {
                let count = state.burst.get(pid).map(|w| w.len()).unwrap_or(0);
                warn!("Rafale de connexions du processus {}", pid);
                alerts.push(
                    Alert::new("connection_burst", now).with_details(serde_json::json!({
                        "pid": pid,
                        "distinct_endpoints": count,
                    })),
                );
            }
        }
        state.flagged_bursts.retain(|pid| burst_pids.contains(pid));

        (burst_pids, alerts)
    }

    /// Consigne une transition absent → présent et signale les reconnexions
    /// rapides d'un même hôte
    fn note_reconnection(&self, key: &EndpointKey, now: DateTime<Utc>) -> Option<Alert> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cutoff = now - ChronoDuration::from_std(RECONNECT_WINDOW).unwrap_or_default();
        let window = state.reconnects.entry(key.host.clone()).or_default();
        window.push_back(now);
        while window.front().map(|t| *t <= cutoff).unwrap_or(false) {
            window.pop_front();
        }
        if window.len() == RECONNECT_THRESHOLD + 1 {
            Some(
                Alert::new("rapid_reconnection", now)
                    .with_endpoint(key.clone())
                    .with_details(serde_json::json!({
                        "host": key.host,
                        "count": window.len(),
                    })),
            )
        } else {
            None
        }
    }
}

/// Transforme les sockets bruts en observations canoniques. Les sockets
/// sans pair distant (écoute) sont écartés; les sockets multiples vers le
/// même pair agrègent leurs compteurs.
fn normalize_records(records: &[SocketRecord]) -> Vec<Observation> {
    let mut by_key: HashMap<EndpointKey, Observation> = HashMap::new();

    for record in records {
        let remote = match record.remote {
            Some(remote) => remote,
            None => continue,
        };
        let key = EndpointKey::new(&remote.ip().to_string(), remote.port(), record.protocol);

        match by_key.get_mut(&key) {
            Some(existing) => {
                if let Some(sent) = record.bytes_sent {
                    *existing.bytes_sent.get_or_insert(0) += sent;
                }
                if let Some(received) = record.bytes_received {
                    *existing.bytes_received.get_or_insert(0) += received;
                }
                if existing.pid.is_none() {
                    existing.pid = record.pid;
                }
            }
            None => {
                by_key.insert(
                    key.clone(),
                    Observation {
                        key,
                        state: record.state.clone(),
                        local_port: record.local.port(),
                        pid: record.pid,
                        bytes_sent: record.bytes_sent,
                        bytes_received: record.bytes_received,
                    },
                );
            }
        }
    }

    by_key.into_values().collect()
}

/// Alerte de transition de risque: montée de niveau, ou entrée en CRITICAL
fn escalation_alert(
    key: &EndpointKey,
    previous: Option<RiskLevel>,
    current: RiskLevel,
    now: DateTime<Utc>,
) -> Option<Alert> {
    // Une première évaluation n'est pas une transition, sauf si elle entre
    // directement en CRITICAL
    let went_up = match previous {
        Some(p) => current > p,
        None => current == RiskLevel::Critical,
    };
    if !went_up {
        return None;
    }
    let kind = if current == RiskLevel::Critical {
        "critical_risk"
    } else {
        "risk_escalation"
    };
    Some(
        Alert::new(kind, now)
            .with_endpoint(key.clone())
            .with_details(serde_json::json!({
                "from": previous.map(|p| p.as_str()),
                "to": current.as_str(),
            })),
    )
}

/// Résumé dérivé de la table, diffusé avec chaque mise à jour
pub fn summarize(
    table: &HashMap<EndpointKey, NetworkEndpoint>,
    blocked_count: usize,
) -> ConnectionSummary {
    let mut summary = ConnectionSummary {
        blocked: blocked_count,
        ..Default::default()
    };
    for endpoint in table.values() {
        if endpoint.stale_scans >= STALE_SCAN_THRESHOLD {
            continue;
        }
        summary.active += 1;
        if endpoint.is_safe {
            summary.safe += 1;
        }
        if endpoint
            .security_assessment
            .as_ref()
            .map(|a| a.risk_level >= RiskLevel::High)
            .unwrap_or(false)
        {
            summary.suspicious += 1;
        }
    }
    summary
}
