//! Collecteur de métriques système
//!
//! Indépendant du moniteur de connexions: il échantillonne l'hôte sur sa
//! propre cadence d'une seconde et conserve une fenêtre glissante des 60
//! derniers instantanés.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::sync::{watch, RwLock};

use crate::models::{truncate_to_millis, ts_ms};
use crate::probe::{HostProbe, NicCounters};

/// Taille de la fenêtre glissante d'instantanés
pub const METRICS_WINDOW: usize = 60;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub percent: f32,
    pub cores: usize,
    /// Fréquence du premier cœur, en MHz
    pub frequency: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total: u64,
    pub used: u64,
    pub percent: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub total: u64,
    pub used: u64,
    pub percent: f32,
}

/// Instantané des métriques système diffusé aux clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub network: NicCounters,
    /// Temps de fonctionnement de l'hôte, en secondes
    pub uptime: u64,
    #[serde(with = "ts_ms")]
    pub timestamp: DateTime<Utc>,
}

/// Collecteur à fenêtre glissante
pub struct MetricsCollector {
    probe: Arc<dyn HostProbe>,
    system: Mutex<System>,
    window: RwLock<VecDeque<SystemMetrics>>,
    interval: Duration,
}

impl MetricsCollector {
    pub fn new(probe: Arc<dyn HostProbe>, interval_secs: u64) -> Self {
        Self {
            probe,
            system: Mutex::new(System::new()),
            window: RwLock::new(VecDeque::with_capacity(METRICS_WINDOW)),
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    /// Prend un instantané immédiat
    pub async fn sample(&self) -> SystemMetrics {
        let network = match self.probe.nic_counters().await {
            Ok(counters) => counters,
            Err(e) => {
                debug!("Compteurs réseau indisponibles: {}", e);
                NicCounters::default()
            }
        };

        let (cpu, memory) = {
            let mut system = match self.system.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            system.refresh_cpu();
            system.refresh_memory();

            let cpu = CpuMetrics {
                percent: system.global_cpu_info().cpu_usage(),
                cores: system.cpus().len(),
                frequency: system.cpus().first().map(|c| c.frequency()).unwrap_or(0),
            };
            let total = system.total_memory();
            let used = system.used_memory();
            let memory = MemoryMetrics {
                total,
                used,
                percent: if total > 0 {
                    (used as f64 / total as f64 * 100.0) as f32
                } else {
                    0.0
                },
            };
            (cpu, memory)
        };

        let disks = Disks::new_with_refreshed_list();
        let (mut disk_total, mut disk_used) = (0u64, 0u64);
        for disk in disks.iter() {
            disk_total += disk.total_space();
            disk_used += disk.total_space().saturating_sub(disk.available_space());
        }
        let disk = DiskMetrics {
            total: disk_total,
            used: disk_used,
            percent: if disk_total > 0 {
                (disk_used as f64 / disk_total as f64 * 100.0) as f32
            } else {
                0.0
            },
        };

        SystemMetrics {
            cpu,
            memory,
            disk,
            network,
            uptime: System::uptime(),
            timestamp: truncate_to_millis(Utc::now()),
        }
    }

    /// Dernier instantané de la fenêtre
    pub async fn latest(&self) -> Option<SystemMetrics> {
        self.window.read().await.back().cloned()
    }

    /// Copie de la fenêtre complète
    pub async fn window(&self) -> Vec<SystemMetrics> {
        self.window.read().await.iter().cloned().collect()
    }

    /// Boucle d'échantillonnage, cadence d'une seconde
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.sample().await;
                    let mut window = self.window.write().await;
                    if window.len() >= METRICS_WINDOW {
                        window.pop_front();
                    }
                    window.push_back(snapshot);
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        debug!("Arrêt du collecteur de métriques");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::models::ProcessInfo;
    use crate::probe::SocketRecord;
    use async_trait::async_trait;

    struct NullProbe;

    #[async_trait]
    impl HostProbe for NullProbe {
        async fn enumerate_sockets(&self) -> Result<Vec<SocketRecord>> {
            Ok(Vec::new())
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

    #[tokio::test]
    async fn instantane_complet() {
        let collector = MetricsCollector::new(Arc::new(NullProbe), 1);
        let snapshot = collector.sample().await;
        // Sur n'importe quel hôte réel ces valeurs sont renseignées
        assert!(snapshot.cpu.cores > 0);
        assert!(snapshot.memory.total > 0);
    }

    #[tokio::test]
    async fn fenetre_bornee() {
        let collector = Arc::new(MetricsCollector::new(Arc::new(NullProbe), 1));
        for _ in 0..70 {
            let snapshot = collector.sample().await;
            let mut window = collector.window.write().await;
            if window.len() >= METRICS_WINDOW {
                window.pop_front();
            }
            window.push_back(snapshot);
        }
        assert_eq!(collector.window().await.len(), METRICS_WINDOW);
    }
}
