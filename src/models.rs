use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use crate::sampler::TrafficLog;

/// Nombre maximal d'entrées conservées pour les listes bornées d'un endpoint
/// (requêtes DNS, requêtes HTTP)
pub const ENDPOINT_LIST_CAP: usize = 100;

/// Sérialisation des horodatages au format ISO-8601 UTC avec précision
/// milliseconde, tel qu'exigé par le protocole de diffusion
pub mod ts_ms {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Variante de `ts_ms` pour les champs optionnels
pub mod ts_ms_opt {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dt: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match dt {
            Some(dt) => serializer.serialize_some(&dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Tronque un horodatage à la milliseconde, pour que les valeurs en mémoire
/// soient identiques à leur forme sérialisée
pub fn truncate_to_millis(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(dt)
}

/// Protocole de transport d'un endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clé canonique d'un endpoint distant: `(hôte, port, protocole)`
///
/// L'hôte est canonicalisé avant insertion: une adresse IP est reparsée puis
/// réaffichée (ce qui normalise les formes IPv6), tout autre texte est mis en
/// minuscules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl EndpointKey {
    pub fn new(host: &str, port: u16, protocol: Protocol) -> Self {
        let host = match host.parse::<IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) => host.to_ascii_lowercase(),
        };
        Self {
            host,
            port,
            protocol,
        }
    }

    /// Adresse IP de l'hôte, si la clé en porte une
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.protocol)
    }
}

/// Niveau de risque d'un endpoint, ordonné du plus sûr au plus dangereux
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sévérité d'un motif de menace du corpus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Poids normalisé utilisé par le moteur de score (LOW=1 … CRITICAL=4, /4)
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Low => 0.25,
            Severity::Medium => 0.5,
            Severity::High => 0.75,
            Severity::Critical => 1.0,
        }
    }
}

/// Classification du chiffrement observé sur un endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EncryptionType {
    Tls,
    Plain,
    Unknown,
}

/// Direction d'un échantillon de trafic synthétisé
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    Outbound,
    Inbound,
}

/// Un échantillon de trafic observé sur un endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSample {
    #[serde(with = "ts_ms")]
    pub timestamp: DateTime<Utc>,
    pub source_port: u16,
    pub destination_port: u16,
    pub protocol: Protocol,
    pub payload_size: u64,
    pub is_encrypted: bool,
    /// Aperçu optionnel de la charge utile, tronqué à 64 octets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_data: Option<Vec<u8>>,
    pub packet_type: PacketKind,
}

impl TrafficSample {
    /// Taille maximale conservée pour `sample_data`
    pub const SAMPLE_DATA_CAP: usize = 64;

    pub fn with_sample_data(mut self, mut data: Vec<u8>) -> Self {
        data.truncate(Self::SAMPLE_DATA_CAP);
        self.sample_data = Some(data);
        self
    }
}

/// Attribution d'un endpoint au processus local propriétaire
///
/// Instantané immuable, rafraîchi au plus une fois par balayage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(with = "ts_ms_opt", default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub status: String,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub tcp_connections: u32,
    pub udp_connections: u32,
}

/// Évaluation de sécurité produite par le moteur de renseignement
///
/// Valeur pure, remplacée à chaque évaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAssessment {
    pub risk_level: RiskLevel,
    pub risk_factors: Vec<String>,
    pub threat_indicators: Vec<String>,
    pub detection_rules_triggered: Vec<String>,
    pub trust_score: f64,
    pub recommendation: String,
}

/// Enregistrement central: un endpoint réseau distant observé sur l'hôte
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,

    // Identité
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_dns: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    // Attribution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_info: Option<ProcessInfo>,

    // Trafic
    pub traffic: TrafficLog,

    // Sécurité
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_assessment: Option<SecurityAssessment>,

    // Comportement
    #[serde(with = "ts_ms")]
    pub first_seen: DateTime<Utc>,
    #[serde(with = "ts_ms")]
    pub last_seen: DateTime<Utc>,
    /// Nombre de transitions absent→présent de cette clé
    pub connection_count: u64,
    /// État rapporté par l'OS (ESTABLISHED, LISTEN, …) ou BLOCKED/STALE
    pub connection_state: String,
    pub encryption_type: EncryptionType,
    pub open_ports: BTreeSet<u16>,
    pub dns_queries: Vec<String>,
    pub http_requests: Vec<String>,

    // Indicateurs
    pub is_private: bool,
    pub is_safe: bool,
    /// Latence lissée (EWMA) en millisecondes
    pub latency: f64,
    pub packet_loss: f64,

    // Suivi interne de péremption, jamais sérialisé
    #[serde(skip)]
    pub stale_scans: u32,
    #[serde(skip)]
    pub stale_since: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub pid: Option<u32>,
}

impl NetworkEndpoint {
    pub fn new(key: &EndpointKey, state: String, now: DateTime<Utc>) -> Self {
        let is_private = key.ip().map(is_private_ip).unwrap_or(false);
        let now = truncate_to_millis(now);
        Self {
            host: key.host.clone(),
            port: key.port,
            protocol: key.protocol,
            reverse_dns: None,
            country: None,
            city: None,
            organization: None,
            process_info: None,
            traffic: TrafficLog::new(),
            security_assessment: None,
            first_seen: now,
            last_seen: now,
            connection_count: 1,
            connection_state: state,
            encryption_type: EncryptionType::Unknown,
            open_ports: BTreeSet::new(),
            dns_queries: Vec::new(),
            http_requests: Vec::new(),
            is_private,
            is_safe: false,
            latency: 0.0,
            packet_loss: 0.0,
            stale_scans: 0,
            stale_since: None,
            pid: None,
        }
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            host: self.host.clone(),
            port: self.port,
            protocol: self.protocol,
        }
    }

    /// Ajoute une requête DNS observée, liste bornée à 100 entrées
    pub fn record_dns_query(&mut self, query: String) {
        if self.dns_queries.len() >= ENDPOINT_LIST_CAP {
            self.dns_queries.remove(0);
        }
        self.dns_queries.push(query);
    }

    /// Ajoute un chemin de requête HTTP observé, liste bornée à 100 entrées
    pub fn record_http_request(&mut self, path: String) {
        if self.http_requests.len() >= ENDPOINT_LIST_CAP {
            self.http_requests.remove(0);
        }
        self.http_requests.push(path);
    }

    /// Met à jour la latence lissée (EWMA, facteur 0.3)
    pub fn update_latency(&mut self, sample_ms: f64) {
        if self.latency == 0.0 {
            self.latency = sample_ms;
        } else {
            self.latency = self.latency * 0.7 + sample_ms * 0.3;
        }
    }
}

/// Adresse privée au sens RFC1918, boucle locale ou lien local
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_link_local()
                || o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
        }
        IpAddr::V6(v6) => {
            // fe80::/10 lien local, fc00::/7 ULA
            v6.is_loopback()
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Alerte de sécurité émise par le moniteur
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    #[serde(with = "ts_ms")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "endpoint_key", default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointKey>,
    pub details: serde_json::Value,
}

impl Alert {
    pub fn new(kind: &str, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: truncate_to_millis(now),
            kind: kind.to_string(),
            endpoint: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_endpoint(mut self, key: EndpointKey) -> Self {
        self.endpoint = Some(key);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Résumé de l'état de la table des endpoints, diffusé avec chaque
/// `connections_update`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub active: usize,
    pub safe: usize,
    pub suspicious: usize,
    pub blocked: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalisation_des_cles() {
        // La forme longue IPv6 doit se normaliser
        let a = EndpointKey::new("2001:0db8:0000:0000:0000:0000:0000:0001", 443, Protocol::Tcp);
        let b = EndpointKey::new("2001:db8::1", 443, Protocol::Tcp);
        assert_eq!(a, b);

        // Un nom d'hôte est mis en minuscules
        let c = EndpointKey::new("Example.COM", 80, Protocol::Tcp);
        assert_eq!(c.host, "example.com");
    }

    #[test]
    fn detection_adresses_privees() {
        assert!(is_private_ip("10.1.2.3".parse().unwrap()));
        assert!(is_private_ip("172.16.0.1".parse().unwrap()));
        assert!(is_private_ip("172.31.255.1".parse().unwrap()));
        assert!(!is_private_ip("172.32.0.1".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("169.254.0.5".parse().unwrap()));
        assert!(!is_private_ip("1.1.1.1".parse().unwrap()));
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(!is_private_ip("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn troncature_sample_data() {
        let sample = TrafficSample {
            timestamp: truncate_to_millis(Utc::now()),
            source_port: 50000,
            destination_port: 443,
            protocol: Protocol::Tcp,
            payload_size: 1200,
            is_encrypted: true,
            sample_data: None,
            packet_type: PacketKind::Outbound,
        }
        .with_sample_data(vec![0u8; 200]);
        assert_eq!(sample.sample_data.unwrap().len(), 64);
    }

    #[test]
    fn listes_bornees_de_l_endpoint() {
        let key = EndpointKey::new("1.2.3.4", 80, Protocol::Tcp);
        let mut ep = NetworkEndpoint::new(&key, "ESTABLISHED".into(), Utc::now());
        for i in 0..150 {
            ep.record_http_request(format!("/page/{}", i));
        }
        assert_eq!(ep.http_requests.len(), ENDPOINT_LIST_CAP);
        // Éviction du plus ancien en premier
        assert_eq!(ep.http_requests[0], "/page/50");
    }

    #[test]
    fn lissage_de_la_latence() {
        let key = EndpointKey::new("1.2.3.4", 80, Protocol::Tcp);
        let mut ep = NetworkEndpoint::new(&key, "ESTABLISHED".into(), Utc::now());
        ep.update_latency(100.0);
        assert!((ep.latency - 100.0).abs() < f64::EPSILON);
        ep.update_latency(200.0);
        // 100 × 0.7 + 200 × 0.3
        assert!((ep.latency - 130.0).abs() < 1e-9);
    }

    #[test]
    fn ordre_des_niveaux_de_risque() {
        assert!(RiskLevel::Critical > RiskLevel::High);
        assert!(RiskLevel::High > RiskLevel::Medium);
        assert!(RiskLevel::Medium > RiskLevel::Low);
    }
}
