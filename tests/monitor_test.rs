//! Scénarios de bout en bout du moniteur, pilotés par une sonde scriptée
//! et une horloge manuelle

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

use frelon::blocklist::BlockList;
use frelon::config::Config;
use frelon::error::Result;
use frelon::intel::ThreatCorpus;
use frelon::journal::AlertJournal;
use frelon::models::{ProcessInfo, Protocol, RiskLevel};
use frelon::monitor::{ConnectionMonitor, EVICTION_AFTER, STALE_SCAN_THRESHOLD};
use frelon::probe::{Clock, HostProbe, NicCounters, SocketRecord};

/// Sonde dont les balayages sont fournis par le test
struct ScriptedProbe {
    records: Mutex<Vec<SocketRecord>>,
    processes: Mutex<HashMap<u32, ProcessInfo>>,
}

impl ScriptedProbe {
    fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            processes: Mutex::new(HashMap::new()),
        }
    }

    fn set_records(&self, records: Vec<SocketRecord>) {
        *self.records.lock().unwrap() = records;
    }

    fn set_process(&self, pid: u32, info: ProcessInfo) {
        self.processes.lock().unwrap().insert(pid, info);
    }
}

#[async_trait]
impl HostProbe for ScriptedProbe {
    async fn enumerate_sockets(&self) -> Result<Vec<SocketRecord>> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn process_info(&self, pid: u32) -> Option<ProcessInfo> {
        self.processes.lock().unwrap().get(&pid).cloned()
    }

    async fn nic_counters(&self) -> Result<NicCounters> {
        Ok(NicCounters::default())
    }

    async fn reverse_dns(&self, _host: &str) -> Option<String> {
        None
    }
}

/// Horloge avancée explicitement par le test
struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    fn new() -> Self {
        Self {
            now: Mutex::new(Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()),
        }
    }

    fn advance(&self, seconds: i64) {
        let mut now = self.now.lock().unwrap();
        *now += ChronoDuration::seconds(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

struct Harness {
    monitor: Arc<ConnectionMonitor>,
    probe: Arc<ScriptedProbe>,
    clock: Arc<ManualClock>,
    blocklist_path: PathBuf,
    _dir: tempfile::TempDir,
}

/// Construit un moniteur sur un répertoire de données temporaire
fn harness_with_corpus(database_json: Option<&str>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.setup_directories().unwrap();

    if let Some(contents) = database_json {
        std::fs::write(config.threat_db_path(), contents).unwrap();
    }

    let corpus = ThreatCorpus::load(
        &config.threat_db_path(),
        &config.malicious_ips_path(),
        &config.extra_suspicious_ports,
    )
    .unwrap();

    let blocklist_path = config.blocklist_path();
    let probe = Arc::new(ScriptedProbe::new());
    let clock = Arc::new(ManualClock::new());
    let journal = AlertJournal::new(config.alerts_dir());

    let monitor = Arc::new(ConnectionMonitor::new(
        Arc::new(config),
        probe.clone(),
        clock.clone(),
        Arc::new(RwLock::new(corpus)),
        Arc::new(RwLock::new(BlockList::load(&blocklist_path))),
        journal,
    ));

    Harness {
        monitor,
        probe,
        clock,
        blocklist_path,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with_corpus(None)
}

fn sock(remote_host: &str, remote_port: u16, pid: Option<u32>) -> SocketRecord {
    SocketRecord {
        local: "10.0.0.2:54321".parse::<SocketAddr>().unwrap(),
        remote: Some(SocketAddr::new(remote_host.parse().unwrap(), remote_port)),
        protocol: Protocol::Tcp,
        state: "ESTABLISHED".to_string(),
        pid,
        bytes_sent: None,
        bytes_received: None,
    }
}

fn curl_process() -> ProcessInfo {
    ProcessInfo {
        pid: 1234,
        name: "curl".into(),
        path: Some("/usr/bin/curl".into()),
        command_line: Some("curl https://example.com".into()),
        username: Some("alice".into()),
        creation_time: None,
        cpu_percent: 0.5,
        memory_percent: 0.1,
        status: "Run".into(),
        read_bytes: 0,
        write_bytes: 0,
        tcp_connections: 0,
        udp_connections: 0,
    }
}

#[tokio::test]
async fn balayage_initial_connexion_benigne() {
    let h = harness();
    h.probe.set_records(vec![sock("1.1.1.1", 443, Some(1234))]);
    h.probe.set_process(1234, curl_process());

    h.monitor.scan().await;

    let snapshot = h.monitor.connections_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    let endpoint = &snapshot[0];
    assert_eq!(endpoint.host, "1.1.1.1");
    assert_eq!(endpoint.port, 443);
    assert_eq!(endpoint.connection_state, "ESTABLISHED");
    assert_eq!(endpoint.process_info.as_ref().unwrap().name, "curl");

    // 0.7 de base + 0.1 de bonus TLS
    let assessment = endpoint.security_assessment.as_ref().unwrap();
    assert_eq!(assessment.risk_level, RiskLevel::Low);
    assert!((assessment.trust_score - 0.80).abs() < 1e-9);
    assert!(endpoint.is_safe);
}

#[tokio::test]
async fn ip_malveillante_critique_et_alertee() {
    let h = harness_with_corpus(Some(r#"{"malicious_ips": ["203.0.113.5"]}"#));
    h.probe.set_records(vec![sock("203.0.113.5", 80, None)]);

    h.monitor.scan().await;

    let snapshot = h.monitor.connections_snapshot().await;
    let assessment = snapshot[0].security_assessment.as_ref().unwrap();
    assert!(assessment
        .risk_factors
        .iter()
        .any(|f| f == "known_malicious_ip"));
    assert_eq!(assessment.trust_score, 0.0);
    assert_eq!(assessment.risk_level, RiskLevel::Critical);
    assert!(!snapshot[0].is_safe);

    // L'entrée directe en CRITICAL émet une alerte vers le hub
    let alerts = h.monitor.alerts.drain();
    assert!(alerts.iter().any(|a| a.kind == "critical_risk"));
}

#[tokio::test]
async fn detection_de_balayage_de_ports() {
    let h = harness();

    // 18 ports distincts sur le même hôte, étalés sur des balayages
    // consécutifs de 2 secondes
    let mut sockets = Vec::new();
    for round in 0u16..3 {
        for i in 0..6u16 {
            sockets.push(sock("198.51.100.7", 1000 + round * 6 + i, None));
        }
        h.probe.set_records(sockets.clone());
        h.monitor.scan().await;
        h.clock.advance(2);
    }

    let snapshot = h.monitor.connections_snapshot().await;
    assert_eq!(snapshot.len(), 18);
    for endpoint in &snapshot {
        let assessment = endpoint.security_assessment.as_ref().unwrap();
        assert!(
            assessment.risk_factors.iter().any(|f| f == "port_scan"),
            "port_scan attendu sur {}",
            endpoint.port
        );
    }

    let alerts = h.monitor.alerts.drain();
    let scans: Vec<_> = alerts.iter().filter(|a| a.kind == "port_scan").collect();
    // Une seule alerte au franchissement du seuil
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].details["host"], "198.51.100.7");
}

#[tokio::test]
async fn rafale_de_connexions_d_un_processus() {
    let h = harness();
    h.probe.set_process(4321, ProcessInfo {
        pid: 4321,
        ..curl_process()
    });

    // 25 endpoints distincts ouverts par le même pid en une fenêtre
    let sockets: Vec<SocketRecord> = (0..25u8)
        .map(|i| sock(&format!("192.0.2.{}", i + 1), 80, Some(4321)))
        .collect();
    h.probe.set_records(sockets);
    h.monitor.scan().await;

    let snapshot = h.monitor.connections_snapshot().await;
    assert_eq!(snapshot.len(), 25);
    for endpoint in &snapshot {
        let assessment = endpoint.security_assessment.as_ref().unwrap();
        assert!(assessment
            .risk_factors
            .iter()
            .any(|f| f == "connection_burst"));
    }
    let alerts = h.monitor.alerts.drain();
    assert!(alerts.iter().any(|a| a.kind == "connection_burst"));
}

#[tokio::test]
async fn commande_de_blocage() {
    let h = harness();
    h.probe.set_records(vec![sock("5.6.7.8", 8080, Some(1234))]);
    h.probe.set_process(1234, curl_process());
    h.monitor.scan().await;

    let changed = h.monitor.block_ip("5.6.7.8").await;
    assert!(changed);

    // Réévaluation immédiate: jamais sûr, jamais sous HIGH
    let snapshot = h.monitor.connections_snapshot().await;
    let endpoint = &snapshot[0];
    assert!(!endpoint.is_safe);
    let assessment = endpoint.security_assessment.as_ref().unwrap();
    assert!(assessment.risk_level >= RiskLevel::High);
    assert!(assessment.risk_factors.iter().any(|f| f == "blocked_host"));

    // La liste est persistée immédiatement
    let contents = std::fs::read_to_string(&h.blocklist_path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(value["hosts"][0], "5.6.7.8");

    // L'hôte disparaît du balayage: il reste épinglé BLOCKED, sans
    // échantillon vivant
    h.probe.set_records(vec![]);
    h.monitor.scan().await;
    let snapshot = h.monitor.connections_snapshot().await;
    assert_eq!(snapshot[0].connection_state, "BLOCKED");
    assert_eq!(snapshot[0].traffic.len(), 0);

    // Déblocage: retour à l'état antérieur de la liste
    assert!(h.monitor.unblock_ip("5.6.7.8").await);
    let contents = std::fs::read_to_string(&h.blocklist_path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(value["hosts"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn peremption_puis_eviction() {
    let h = harness();
    let socket = sock("9.9.9.9", 443, None);

    // Observé aux balayages 1 à 3
    h.probe.set_records(vec![socket.clone()]);
    for _ in 0..3 {
        h.monitor.scan().await;
        h.clock.advance(2);
    }

    // Absent ensuite: marqué périmé après 3 balayages manqués
    h.probe.set_records(vec![]);
    for _ in 0..STALE_SCAN_THRESHOLD {
        h.monitor.scan().await;
        h.clock.advance(2);
    }
    let snapshot = h.monitor.connections_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].connection_state, "STALE");

    // Toujours périmé après 5 minutes: évincé
    h.clock.advance(EVICTION_AFTER.as_secs() as i64 + 1);
    h.monitor.scan().await;
    assert!(h.monitor.connections_snapshot().await.is_empty());
}

#[tokio::test]
async fn le_blocage_empeche_l_eviction() {
    let h = harness();
    h.probe.set_records(vec![sock("9.9.9.9", 443, None)]);
    h.monitor.scan().await;
    h.monitor.block_ip("9.9.9.9").await;

    h.probe.set_records(vec![]);
    for _ in 0..10 {
        h.monitor.scan().await;
        h.clock.advance(60);
    }

    let snapshot = h.monitor.connections_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].connection_state, "BLOCKED");
}

#[tokio::test]
async fn balayages_identiques_idempotents() {
    let h = harness();
    h.probe.set_records(vec![
        sock("1.1.1.1", 443, Some(1234)),
        sock("9.9.9.9", 8080, None),
    ]);
    h.probe.set_process(1234, curl_process());

    h.monitor.scan().await;
    let first: HashMap<String, _> = h
        .monitor
        .connections_snapshot()
        .await
        .into_iter()
        .map(|e| (format!("{}:{}", e.host, e.port), e))
        .collect();

    h.clock.advance(2);
    h.monitor.scan().await;
    let second: HashMap<String, _> = h
        .monitor
        .connections_snapshot()
        .await
        .into_iter()
        .map(|e| (format!("{}:{}", e.host, e.port), e))
        .collect();

    assert_eq!(first.len(), second.len());
    for (key, a) in &first {
        let b = &second[key];
        // État identique modulo last_seen
        assert_eq!(a.first_seen, b.first_seen);
        assert_eq!(a.connection_count, b.connection_count);
        assert_eq!(a.traffic.bytes_sent, b.traffic.bytes_sent);
        assert_eq!(a.traffic.bytes_received, b.traffic.bytes_received);
        assert_eq!(a.traffic.len(), b.traffic.len());
        assert_eq!(a.security_assessment, b.security_assessment);
        assert_eq!(a.is_safe, b.is_safe);
        assert!(b.last_seen >= a.last_seen);
    }
}

#[tokio::test]
async fn compteurs_d_octets_monotones() {
    let h = harness();
    let mut socket = sock("1.1.1.1", 443, None);
    socket.bytes_sent = Some(1000);
    socket.bytes_received = Some(5000);
    h.probe.set_records(vec![socket.clone()]);
    h.monitor.scan().await;

    let before = &h.monitor.connections_snapshot().await[0];
    assert_eq!(before.traffic.bytes_sent, 1000);
    assert_eq!(before.traffic.bytes_received, 5000);
    assert_eq!(before.traffic.len(), 2);

    // Les compteurs OS reculent: les totaux de l'endpoint ne bougent pas
    socket.bytes_sent = Some(100);
    socket.bytes_received = Some(200);
    h.probe.set_records(vec![socket.clone()]);
    h.clock.advance(2);
    h.monitor.scan().await;

    let after = &h.monitor.connections_snapshot().await[0];
    assert_eq!(after.traffic.bytes_sent, 1000);
    assert_eq!(after.traffic.bytes_received, 5000);

    // Puis progressent: un échantillon par direction porteur du delta
    socket.bytes_sent = Some(1500);
    socket.bytes_received = Some(5200);
    h.probe.set_records(vec![socket]);
    h.clock.advance(2);
    h.monitor.scan().await;

    let last = &h.monitor.connections_snapshot().await[0];
    assert_eq!(last.traffic.bytes_sent, 1500);
    assert_eq!(last.traffic.bytes_received, 5200);
    assert_eq!(last.traffic.len(), 4);
}

#[tokio::test]
async fn reapparition_incremente_le_compteur() {
    let h = harness();
    let socket = sock("1.1.1.1", 443, None);

    h.probe.set_records(vec![socket.clone()]);
    h.monitor.scan().await;
    assert_eq!(h.monitor.connections_snapshot().await[0].connection_count, 1);

    // Absence d'un balayage puis retour
    h.probe.set_records(vec![]);
    h.clock.advance(2);
    h.monitor.scan().await;
    h.probe.set_records(vec![socket]);
    h.clock.advance(2);
    h.monitor.scan().await;

    assert_eq!(h.monitor.connections_snapshot().await[0].connection_count, 2);
}

#[tokio::test]
async fn pause_et_reprise() {
    let h = harness();
    assert!(!h.monitor.is_paused());
    h.monitor.pause();
    assert!(h.monitor.is_paused());
    h.monitor.resume();
    assert!(!h.monitor.is_paused());
}

#[tokio::test]
async fn echec_de_sonde_n_arrete_rien() {
    struct FailingProbe;

    #[async_trait]
    impl HostProbe for FailingProbe {
        async fn enumerate_sockets(&self) -> Result<Vec<SocketRecord>> {
            Err(frelon::error::FrelonError::Probe {
                message: "panne simulée".into(),
            })
        }
        async fn process_info(&self, _pid: u32) -> Option<ProcessInfo> {
            None
        }
        async fn nic_counters(&self) -> Result<NicCounters> {
            Ok(NicCounters::default())
        }
        async fn reverse_dns(&self, _host: &str) -> Option<String> {
            None
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.setup_directories().unwrap();
    let blocklist_path = config.blocklist_path();
    let journal = AlertJournal::new(config.alerts_dir());
    let corpus = ThreatCorpus::load(
        &config.threat_db_path(),
        &config.malicious_ips_path(),
        &[],
    )
    .unwrap();

    let monitor = ConnectionMonitor::new(
        Arc::new(config),
        Arc::new(FailingProbe),
        Arc::new(ManualClock::new()),
        Arc::new(RwLock::new(corpus)),
        Arc::new(RwLock::new(BlockList::load(&blocklist_path))),
        journal,
    );

    // Le balayage se termine avec des données partielles, sans paniquer
    monitor.scan().await;
    assert!(monitor.connections_snapshot().await.is_empty());
}
