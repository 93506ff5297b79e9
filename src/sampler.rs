//! Échantillonnage du trafic par endpoint
//!
//! Chaque endpoint porte un anneau FIFO borné d'échantillons et des totaux
//! cumulés. Les échantillons ne proviennent pas d'une capture filaire: ils
//! sont synthétisés à chaque balayage à partir des deltas des compteurs
//! d'octets rapportés par l'OS, un échantillon par direction.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};

use crate::models::{truncate_to_millis, PacketKind, Protocol, TrafficSample};

/// Capacité de l'anneau d'échantillons d'un endpoint
pub const SAMPLE_RING_CAP: usize = 1000;

/// Ports considérés chiffrés par défaut (TLS, SSH, IMAPS, POP3S, SMTPS)
pub static DEFAULT_ENCRYPTED_PORTS: Lazy<HashSet<u16>> =
    Lazy::new(|| [443, 8443, 22, 993, 995, 465, 587].into_iter().collect());

/// Statistiques dérivées de la fenêtre courante d'échantillons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub count: usize,
    pub bytes_total: u64,
    pub avg_size: f64,
    pub encrypted_fraction: f64,
    pub unique_peer_ports: usize,
}

/// Journal de trafic d'un endpoint: anneau borné + totaux monotones
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficLog {
    samples: VecDeque<TrafficSample>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TrafficLog {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Enregistre un échantillon, en évinçant strictement le plus ancien
    /// quand l'anneau est plein. O(1) amorti.
    pub fn record(&mut self, sample: TrafficSample) {
        if self.samples.len() >= SAMPLE_RING_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> impl Iterator<Item = &TrafficSample> {
        self.samples.iter()
    }

    /// Vide l'anneau sans toucher aux totaux (hôte bloqué: plus aucun
    /// échantillon vivant, les totaux restent monotones)
    pub fn clear_samples(&mut self) {
        self.samples.clear();
    }

    /// Taille moyenne de charge utile sur la fenêtre courante
    pub fn avg_packet_size(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|s| s.payload_size).sum();
        total as f64 / self.samples.len() as f64
    }

    /// Statistiques calculées sur la fenêtre courante uniquement
    pub fn stats(&self) -> TrafficStats {
        let count = self.samples.len();
        let bytes_total: u64 = self.samples.iter().map(|s| s.payload_size).sum();
        let encrypted = self.samples.iter().filter(|s| s.is_encrypted).count();
        let peer_ports: BTreeSet<u16> =
            self.samples.iter().map(|s| s.destination_port).collect();
        TrafficStats {
            count,
            bytes_total,
            avg_size: if count == 0 {
                0.0
            } else {
                bytes_total as f64 / count as f64
            },
            encrypted_fraction: if count == 0 {
                0.0
            } else {
                encrypted as f64 / count as f64
            },
            unique_peer_ports: peer_ports.len(),
        }
    }

    /// Synthétise les échantillons d'un balayage à partir des nouveaux
    /// compteurs d'octets de l'OS. Un échantillon par direction dont le
    /// compteur a augmenté; un compteur qui recule (redémarrage de socket)
    /// est ignoré pour préserver la monotonie des totaux.
    #[allow(clippy::too_many_arguments)]
    pub fn synthesize(
        &mut self,
        os_sent: u64,
        os_received: u64,
        local_port: u16,
        remote_port: u16,
        protocol: Protocol,
        tls_classified: bool,
        encrypted_ports: &HashSet<u16>,
        now: DateTime<Utc>,
    ) {
        let now = truncate_to_millis(now);
        let is_encrypted = tls_classified || encrypted_ports.contains(&remote_port);

        let sent_delta = os_sent.saturating_sub(self.bytes_sent);
        if os_sent > self.bytes_sent {
            self.bytes_sent = os_sent;
            self.record(TrafficSample {
                timestamp: now,
                source_port: local_port,
                destination_port: remote_port,
                protocol,
                payload_size: sent_delta,
                is_encrypted,
                sample_data: None,
                packet_type: PacketKind::Outbound,
            });
        }

        let recv_delta = os_received.saturating_sub(self.bytes_received);
        if os_received > self.bytes_received {
            self.bytes_received = os_received;
            self.record(TrafficSample {
                timestamp: now,
                source_port: remote_port,
                destination_port: local_port,
                protocol,
                payload_size: recv_delta,
                is_encrypted,
                sample_data: None,
                packet_type: PacketKind::Inbound,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(dest_port: u16, size: u64, encrypted: bool) -> TrafficSample {
        TrafficSample {
            timestamp: truncate_to_millis(Utc::now()),
            source_port: 50000,
            destination_port: dest_port,
            protocol: Protocol::Tcp,
            payload_size: size,
            is_encrypted: encrypted,
            sample_data: None,
            packet_type: PacketKind::Outbound,
        }
    }

    #[test]
    fn anneau_borne_eviction_fifo() {
        let mut log = TrafficLog::new();
        for i in 0..1200u64 {
            log.record(sample(443, i, false));
        }
        assert_eq!(log.len(), SAMPLE_RING_CAP);
        // Le plus ancien restant doit être l'échantillon 200
        assert_eq!(log.samples().next().unwrap().payload_size, 200);
    }

    #[test]
    fn statistiques_fenetre_courante() {
        let mut log = TrafficLog::new();
        log.record(sample(443, 100, true));
        log.record(sample(443, 300, true));
        log.record(sample(80, 200, false));
        let stats = log.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.bytes_total, 600);
        assert!((stats.avg_size - 200.0).abs() < f64::EPSILON);
        assert!((stats.encrypted_fraction - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.unique_peer_ports, 2);
    }

    #[test]
    fn synthese_des_deltas() {
        let mut log = TrafficLog::new();
        let ports = DEFAULT_ENCRYPTED_PORTS.clone();
        let now = Utc::now();

        log.synthesize(1000, 4000, 50000, 443, Protocol::Tcp, false, &ports, now);
        assert_eq!(log.len(), 2);
        assert_eq!(log.bytes_sent, 1000);
        assert_eq!(log.bytes_received, 4000);
        assert!(log.samples().all(|s| s.is_encrypted));

        // Même compteurs: aucun nouvel échantillon
        log.synthesize(1000, 4000, 50000, 443, Protocol::Tcp, false, &ports, now);
        assert_eq!(log.len(), 2);

        // Seul l'envoi progresse
        log.synthesize(1500, 4000, 50000, 443, Protocol::Tcp, false, &ports, now);
        assert_eq!(log.len(), 3);
        assert_eq!(log.bytes_sent, 1500);
        let last = log.samples().last().unwrap();
        assert_eq!(last.payload_size, 500);
        assert_eq!(last.packet_type, PacketKind::Outbound);
    }

    #[test]
    fn compteur_en_recul_ignore() {
        let mut log = TrafficLog::new();
        let ports = DEFAULT_ENCRYPTED_PORTS.clone();
        let now = Utc::now();
        log.synthesize(1000, 1000, 50000, 80, Protocol::Tcp, false, &ports, now);
        // Le compteur OS recule: les totaux ne doivent jamais décroître
        log.synthesize(200, 400, 50000, 80, Protocol::Tcp, false, &ports, now);
        assert_eq!(log.bytes_sent, 1000);
        assert_eq!(log.bytes_received, 1000);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn port_non_chiffre() {
        let mut log = TrafficLog::new();
        let ports = DEFAULT_ENCRYPTED_PORTS.clone();
        log.synthesize(100, 0, 50000, 80, Protocol::Tcp, false, &ports, Utc::now());
        assert!(!log.samples().next().unwrap().is_encrypted);

        // Classification TLS par aperçu de charge: prioritaire sur le port
        let mut log2 = TrafficLog::new();
        log2.synthesize(100, 0, 50000, 80, Protocol::Tcp, true, &ports, Utc::now());
        assert!(log2.samples().next().unwrap().is_encrypted);
    }
}
