//! Sondes système abstraites et leur implémentation de production
//!
//! Le cœur ne parle jamais directement à l'OS: il passe par `HostProbe`
//! (énumération des sockets, attribution des processus, compteurs des
//! interfaces, DNS inverse) et `Clock`. `SystemProbe` est la colle
//! plateforme: `ss` pour les sockets, `sysinfo` pour les processus et les
//! compteurs, `nslookup` pour le DNS inverse.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, error};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Networks, Pid, System, Users};

use crate::error::{FrelonError, Result};
use crate::models::{ProcessInfo, Protocol};

/// Délai maximal d'une énumération de sockets
pub const ENUMERATE_TIMEOUT: Duration = Duration::from_millis(500);
/// Délai maximal d'une résolution DNS inverse
pub const REVERSE_DNS_TIMEOUT: Duration = Duration::from_millis(500);
/// Délai maximal d'une interrogation de processus
pub const PROCESS_INFO_TIMEOUT: Duration = Duration::from_millis(200);

/// Un socket rapporté par l'OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketRecord {
    pub local: SocketAddr,
    /// Absent pour les sockets en écoute
    pub remote: Option<SocketAddr>,
    pub protocol: Protocol,
    pub state: String,
    pub pid: Option<u32>,
    /// Compteurs d'octets par socket quand l'OS les expose
    pub bytes_sent: Option<u64>,
    pub bytes_received: Option<u64>,
}

/// Compteurs d'une interface réseau
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InterfaceCounters {
    pub sent: u64,
    pub recv: u64,
}

/// Compteurs réseau agrégés de l'hôte, monotones au sein d'une session
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NicCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub per_interface: HashMap<String, InterfaceCounters>,
}

/// Horloge abstraite du cœur
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Horloge de production
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Sonde d'hôte abstraite requise par le cœur
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Énumère les connexions réseau actives. Un échec produit une erreur
    /// remontée et un balayage partiel, jamais un arrêt.
    async fn enumerate_sockets(&self) -> Result<Vec<SocketRecord>>;

    /// Attribution d'un pid à ses métadonnées de processus. Absent si le
    /// processus s'est terminé entre l'énumération et l'interrogation.
    async fn process_info(&self, pid: u32) -> Option<ProcessInfo>;

    /// Compteurs d'octets par interface
    async fn nic_counters(&self) -> Result<NicCounters>;

    /// Résolution DNS inverse au mieux, bornée dans le temps
    async fn reverse_dns(&self, host: &str) -> Option<String>;
}

/// Sonde de production
pub struct SystemProbe {
    system: Arc<Mutex<System>>,
    users: Arc<Users>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
            users: Arc::new(Users::new_with_refreshed_list()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostProbe for SystemProbe {
    async fn enumerate_sockets(&self) -> Result<Vec<SocketRecord>> {
        let output = tokio::time::timeout(
            ENUMERATE_TIMEOUT,
            tokio::process::Command::new("ss")
                .args(["-tunapiH"])
                .output(),
        )
        .await
        .map_err(|_| FrelonError::Probe {
            message: "énumération des sockets: délai dépassé".to_string(),
        })?
        .map_err(|e| FrelonError::Probe {
            message: format!("impossible d'exécuter ss: {}", e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FrelonError::Probe {
                message: format!("ss a échoué: {}", stderr.trim()),
            });
        }

        Ok(parse_ss_output(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn process_info(&self, pid: u32) -> Option<ProcessInfo> {
        let system = Arc::clone(&self.system);
        let users = Arc::clone(&self.users);

        // sysinfo est entièrement synchrone: le travail part sur le pool
        // bloquant pour que le délai puisse réellement l'interrompre
        let task = tokio::task::spawn_blocking(move || {
            let mut system = match system.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let spid = Pid::from_u32(pid);
            system.refresh_memory();
            if !system.refresh_process(spid) {
                return None;
            }
            let total_memory = system.total_memory();
            let process = system.process(spid)?;

            let memory_percent = if total_memory > 0 {
                (process.memory() as f64 / total_memory as f64 * 100.0) as f32
            } else {
                0.0
            };
            let username = process
                .user_id()
                .and_then(|uid| users.get_user_by_id(uid))
                .map(|u| u.name().to_string());
            let disk = process.disk_usage();

            Some(ProcessInfo {
                pid,
                name: process.name().to_string(),
                path: process.exe().map(|p| p.display().to_string()),
                command_line: Some(process.cmd().join(" ")),
                username,
                creation_time: Utc
                    .timestamp_opt(process.start_time() as i64, 0)
                    .single(),
                cpu_percent: process.cpu_usage(),
                memory_percent,
                status: process.status().to_string(),
                read_bytes: disk.total_read_bytes,
                write_bytes: disk.total_written_bytes,
                // Complétés par le moniteur à partir du balayage courant
                tcp_connections: 0,
                udp_connections: 0,
            })
        });

        match tokio::time::timeout(PROCESS_INFO_TIMEOUT, task).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                error!("Interrogation du processus {}: {}", pid, e);
                None
            }
            Err(_) => {
                debug!("Interrogation du processus {}: délai dépassé", pid);
                None
            }
        }
    }

    async fn nic_counters(&self) -> Result<NicCounters> {
        let networks = Networks::new_with_refreshed_list();
        let mut counters = NicCounters::default();
        for (name, data) in networks.iter() {
            let iface = InterfaceCounters {
                sent: data.total_transmitted(),
                recv: data.total_received(),
            };
            counters.bytes_sent += iface.sent;
            counters.bytes_recv += iface.recv;
            counters.per_interface.insert(name.clone(), iface);
        }
        Ok(counters)
    }

    async fn reverse_dns(&self, host: &str) -> Option<String> {
        let result = tokio::time::timeout(
            REVERSE_DNS_TIMEOUT,
            tokio::process::Command::new("nslookup").arg(host).output(),
        )
        .await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!("Erreur lors de l'exécution de nslookup: {}", e);
                return None;
            }
            Err(_) => {
                debug!("DNS inverse pour {}: délai dépassé", host);
                return None;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Some(name) = line.split("name =").nth(1) {
                return Some(name.trim().trim_end_matches('.').to_string());
            }
        }
        None
    }
}

/// Analyse la sortie de `ss -tunapiH`. Les lignes d'information (`-i`)
/// sont indentées sous la ligne de leur socket et portent les compteurs
/// `bytes_acked` / `bytes_received`.
pub fn parse_ss_output(output: &str) -> Vec<SocketRecord> {
    let mut records: Vec<SocketRecord> = Vec::new();

    for line in output.lines() {
        if line.is_empty() {
            continue;
        }
        // Ligne d'information du socket précédent
        if line.starts_with(char::is_whitespace) {
            if let Some(last) = records.last_mut() {
                if let Some(acked) = extract_counter(line, "bytes_acked:") {
                    last.bytes_sent = Some(acked);
                }
                if let Some(received) = extract_counter(line, "bytes_received:") {
                    last.bytes_received = Some(received);
                }
            }
            continue;
        }
        if let Some(record) = parse_ss_line(line) {
            records.push(record);
        }
    }

    records
}

/// Analyse une ligne de socket de `ss`
fn parse_ss_line(line: &str) -> Option<SocketRecord> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 6 {
        return None;
    }

    let protocol = match parts[0] {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        _ => return None,
    };
    let state = normalize_state(parts[1]);
    let local = parse_addr_port(parts[4])?;
    let remote = parse_addr_port(parts[5]);

    // Colonne users:(("nom",pid=1234,fd=5)) quand -p est permis
    let pid = parts.get(6).and_then(|s| {
        s.split("pid=")
            .nth(1)
            .and_then(|p| p.split(',').next())
            .and_then(|p| p.parse().ok())
    });

    Some(SocketRecord {
        local,
        remote,
        protocol,
        state,
        pid,
        bytes_sent: None,
        bytes_received: None,
    })
}

/// Extrait un compteur `clef:valeur` d'une ligne d'information
fn extract_counter(line: &str, key: &str) -> Option<u64> {
    line.split(key)
        .nth(1)?
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()
}

/// Uniformise les états rapportés par ss (ESTAB → ESTABLISHED, tirets → soulignés)
fn normalize_state(state: &str) -> String {
    match state {
        "ESTAB" => "ESTABLISHED".to_string(),
        "UNCONN" => "UNCONNECTED".to_string(),
        other => other.replace('-', "_"),
    }
}

/// Découpe `adresse:port`, en tolérant les crochets IPv6. Les pairs
/// indéterminés (`*`, port `*`) produisent None.
fn parse_addr_port(s: &str) -> Option<SocketAddr> {
    let pos = s.rfind(':')?;
    let (addr, port) = (&s[..pos], &s[pos + 1..]);
    let port: u16 = port.parse().ok()?;
    let addr = addr.trim_start_matches('[').trim_end_matches(']');
    // ss affiche parfois le pseudo-hôte "*" ou un scope %iface
    let addr = addr.split('%').next()?;
    let ip: std::net::IpAddr = addr.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SS_OUTPUT: &str = "\
tcp   ESTAB      0      0        10.0.0.2:54321     1.1.1.1:443    users:((\"curl\",pid=1234,fd=5))
\t cubic wscale:7,7 rto:204 bytes_acked:5210 bytes_received:48333 segs_out:12
udp   UNCONN     0      0        10.0.0.2:68        0.0.0.0:*
tcp   LISTEN     0      128      0.0.0.0:22         0.0.0.0:*      users:((\"sshd\",pid=800,fd=3))
tcp   TIME-WAIT  0      0        [2001:db8::2]:33000 [2001:db8::1]:8443";

    #[test]
    fn analyse_sortie_ss() {
        let records = parse_ss_output(SS_OUTPUT);
        assert_eq!(records.len(), 4);

        let first = &records[0];
        assert_eq!(first.protocol, Protocol::Tcp);
        assert_eq!(first.state, "ESTABLISHED");
        assert_eq!(first.remote.unwrap().to_string(), "1.1.1.1:443");
        assert_eq!(first.pid, Some(1234));
        // Compteurs repris de la ligne d'information
        assert_eq!(first.bytes_sent, Some(5210));
        assert_eq!(first.bytes_received, Some(48333));

        let udp = &records[1];
        assert_eq!(udp.protocol, Protocol::Udp);
        assert!(udp.remote.is_none());

        let listen = &records[2];
        assert_eq!(listen.state, "LISTEN");
        assert!(listen.remote.is_none());

        let v6 = &records[3];
        assert_eq!(v6.state, "TIME_WAIT");
        assert_eq!(v6.remote.unwrap().port(), 8443);
    }

    #[test]
    fn ligne_tronquee_ignoree() {
        let records = parse_ss_output("tcp ESTAB 0 0\nn'importe quoi");
        assert!(records.is_empty());
    }
}
