//! Commandes acceptées par le moniteur
//!
//! Surface de contrôle exposée au hub de diffusion: instantanés de la
//! table, historique des alertes, blocage et déblocage d'hôtes avec
//! réévaluation immédiate, suspension et reprise du balayage.

use log::info;
use std::collections::HashMap;
use std::sync::atomic::Ordering;

use super::{summarize, ConnectionMonitor};
use crate::intel::{self, BehaviorFlags};
use crate::models::{
    Alert, ConnectionSummary, EndpointKey, NetworkEndpoint, RiskLevel,
};

impl ConnectionMonitor {
    /// Instantané complet de la table des endpoints
    pub async fn connections_snapshot(&self) -> Vec<NetworkEndpoint> {
        self.endpoints.read().await.values().cloned().collect()
    }

    /// Instantané de la table sous forme de map, pour les exports
    pub async fn table_snapshot(&self) -> HashMap<EndpointKey, NetworkEndpoint> {
        self.endpoints.read().await.clone()
    }

    /// Copie de l'historique des alertes, les plus récentes en dernier
    pub async fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let recent = self.recent_alerts.read().await;
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Copie triée de la liste de blocage
    pub async fn blocked_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.blocklist.read().await.snapshot().into_iter().collect();
        hosts.sort();
        hosts
    }

    /// Résumé courant de la table
    pub async fn summary(&self) -> ConnectionSummary {
        let blocked = self.blocklist.read().await.len();
        let table = self.endpoints.read().await;
        summarize(&table, blocked)
    }

    /// Bloque un hôte et réévalue immédiatement les endpoints concernés.
    /// Retourne vrai si la liste a changé.
    pub async fn block_ip(&self, host: &str) -> bool {
        let host = canonical_host(host);
        let changed = self.blocklist.write().await.block(&host);
        self.reassess_host(&host).await;

        let now = self.clock.now();
        self.emit_alert(
            Alert::new("ip_blocked", now).with_details(serde_json::json!({ "host": host })),
        )
        .await;
        changed
    }

    /// Débloque un hôte et réévalue immédiatement les endpoints concernés.
    /// Retourne vrai si la liste a changé.
    pub async fn unblock_ip(&self, host: &str) -> bool {
        let host = canonical_host(host);
        let changed = self.blocklist.write().await.unblock(&host);
        self.reassess_host(&host).await;

        let now = self.clock.now();
        self.emit_alert(
            Alert::new("ip_unblocked", now).with_details(serde_json::json!({ "host": host })),
        )
        .await;
        changed
    }

    /// Suspend la boucle de balayage; la table est gelée
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        info!("Surveillance suspendue");
    }

    /// Reprend la boucle de balayage
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        info!("Surveillance reprise");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Force un balayage hors cycle
    pub fn refresh(&self) {
        self.force_scan.notify_one();
    }

    /// Réévalue tous les endpoints d'un hôte après un changement de la
    /// liste de blocage
    async fn reassess_host(&self, host: &str) {
        let blocked = self.blocklist.read().await.contains(host);
        let corpus = self.corpus.read().await.clone();

        // Faits comportementaux courants, relus depuis les fenêtres
        let (scanning, burst_pids) = {
            let state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let scanning = state
                .ports
                .get(host)
                .map(|w| w.len() >= super::PORT_SCAN_THRESHOLD)
                .unwrap_or(false);
            let burst_pids: std::collections::HashSet<u32> = state
                .burst
                .iter()
                .filter(|(_, w)| w.len() >= super::BURST_THRESHOLD)
                .map(|(pid, _)| *pid)
                .collect();
            (scanning, burst_pids)
        };

        let mut table = self.endpoints.write().await;

        for endpoint in table.values_mut() {
            if endpoint.host != host {
                continue;
            }
            let flags = BehaviorFlags {
                connection_burst: endpoint
                    .pid
                    .map(|pid| burst_pids.contains(&pid))
                    .unwrap_or(false),
                port_scan: scanning,
            };
            let assessment = intel::assess(
                endpoint,
                &corpus,
                blocked,
                flags,
                &self.config.allow_roots,
                &self.encrypted_ports,
            );
            endpoint.is_safe =
                matches!(assessment.risk_level, RiskLevel::Low | RiskLevel::Medium) && !blocked;
            endpoint.security_assessment = Some(assessment);

            if blocked && endpoint.stale_scans > 0 {
                // L'hôte n'est plus vivant: il reste épinglé comme bloqué
                endpoint.connection_state = "BLOCKED".to_string();
                endpoint.traffic.clear_samples();
                endpoint.stale_scans = 0;
                endpoint.stale_since = None;
            }
        }
    }
}

/// Canonicalise un hôte comme le fait la clé d'endpoint
fn canonical_host(host: &str) -> String {
    match host.parse::<std::net::IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}
