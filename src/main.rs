mod blocklist;
mod cli;
mod config;
mod error;
mod intel;
mod journal;
mod metrics;
mod models;
mod monitor;
mod probe;
mod sampler;
mod server;

use clap::Parser;
use log::{error, info, warn};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, RwLock};

use cli::Cli;
use config::Config;
use error::{FrelonError, Result};
use intel::{CorpusWatcher, ThreatCorpus};
use journal::{AlertJournal, Exporter};
use metrics::MetricsCollector;
use models::Alert;
use monitor::ConnectionMonitor;
use probe::{Clock, HostProbe, SystemClock, SystemProbe};
use server::HubState;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Charger la configuration avant le logger pour connaître le niveau
    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Erreur de configuration: {}", e);
            exit(e.exit_code());
        }
    };
    config.apply_cli(&cli);

    env_logger::init_from_env(env_logger::Env::default().default_filter_or(&config.log_level));

    if let Err(e) = config.validate() {
        error!("{}", e);
        exit(e.exit_code());
    }

    if let Err(e) = run(Arc::new(config)).await {
        error!("{}", e);
        exit(e.exit_code());
    }
}

async fn run(config: Arc<Config>) -> Result<()> {
    config.setup_directories()?;

    let probe: Arc<dyn HostProbe> = Arc::new(SystemProbe::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Vérification de privilège: sans énumération des sockets, l'agent
    // n'a aucune raison d'être
    if let Err(e) = probe.enumerate_sockets().await {
        return Err(FrelonError::Privilege {
            message: format!("énumération des sockets impossible au démarrage: {}", e),
        });
    }

    // Corpus de renseignement; un corpus illisible au démarrage est signalé
    // et remplacé par un corpus vide, jamais silencieusement
    let corpus = match ThreatCorpus::load(
        &config.threat_db_path(),
        &config.malicious_ips_path(),
        &config.extra_suspicious_ports,
    ) {
        Ok(corpus) => corpus,
        Err(e) => {
            warn!("Corpus illisible au démarrage, corpus vide utilisé: {}", e);
            ThreatCorpus::empty(&config.extra_suspicious_ports)
        }
    };
    let corpus = Arc::new(RwLock::new(corpus));

    let blocklist = Arc::new(RwLock::new(blocklist::BlockList::load(
        &config.blocklist_path(),
    )));

    // Liaison du port avant de lancer quoi que ce soit
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| FrelonError::PortInUse {
            addr: addr.clone(),
            source: e,
        })?;
    info!("Serveur de diffusion à l'écoute sur {}", addr);
    if config.cert.is_some() {
        info!("Certificat TLS fourni: terminaison déléguée à l'enveloppe externe");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let journal = AlertJournal::new(config.alerts_dir());
    let monitor = Arc::new(ConnectionMonitor::new(
        config.clone(),
        probe.clone(),
        clock.clone(),
        corpus.clone(),
        blocklist.clone(),
        journal,
    ));
    let metrics = Arc::new(MetricsCollector::new(probe.clone(), config.metrics_interval));
    let hub = Arc::new(HubState::new(
        config.clone(),
        monitor.clone(),
        metrics.clone(),
        Exporter::new(config.exports_dir(), config.retention_days),
        clock.clone(),
    ));

    // Tâches de fond: balayage, métriques, diffusion, corpus, exports
    let monitor_task = tokio::spawn(monitor.clone().run(shutdown_rx.clone()));
    let metrics_task = tokio::spawn(metrics.clone().run(shutdown_rx.clone()));
    let broadcast_task = tokio::spawn(server::run_broadcasts(hub.clone(), shutdown_rx.clone()));
    spawn_corpus_watcher(
        config.clone(),
        corpus.clone(),
        monitor.clone(),
        clock.clone(),
        shutdown_rx.clone(),
    );
    spawn_periodic_export(config.clone(), monitor.clone(), clock.clone(), shutdown_rx);

    // Serveur axum avec arrêt gracieux commandé
    let app = server::router(hub.clone());
    let stop_accepting = Arc::new(Notify::new());
    let stop_signal = stop_accepting.clone();
    let serve_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                stop_signal.notified().await;
            })
            .await
    });

    shutdown_signal().await;
    info!("Signal d'arrêt reçu, arrêt en cours…");

    // Ordre d'arrêt: ne plus accepter, vider les files clientes,
    // déconnecter, arrêter moniteur et métriques, persister la liste
    stop_accepting.notify_waiters();
    hub.shutdown_clients().await;
    let _ = shutdown_tx.send(true);

    for task in [monitor_task, metrics_task, broadcast_task] {
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
    }
    if let Ok(Ok(Err(e))) = tokio::time::timeout(Duration::from_secs(5), serve_task).await {
        error!("Erreur du serveur à l'arrêt: {}", e);
    }

    blocklist.read().await.save()?;
    info!("Arrêt terminé");
    Ok(())
}

/// Recharge le corpus quand les fichiers changent; un rechargement échoué
/// conserve le corpus précédent et remonte une alerte
fn spawn_corpus_watcher(
    config: Arc<Config>,
    corpus: Arc<RwLock<ThreatCorpus>>,
    monitor: Arc<ConnectionMonitor>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut watcher = CorpusWatcher::new(
        config.threat_db_path(),
        config.malicious_ips_path(),
        config.extra_suspicious_ports.clone(),
    );
    let period = Duration::from_secs(config.corpus_reload_interval.max(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match watcher.check() {
                        None => {}
                        Some(Ok(new_corpus)) => {
                            *corpus.write().await = new_corpus;
                            info!("Corpus de renseignement rechargé");
                        }
                        Some(Err(e)) => {
                            error!("Rechargement du corpus échoué, corpus précédent conservé: {}", e);
                            let alert = Alert::new("corpus_reload_failed", clock.now())
                                .with_details(serde_json::json!({ "error": e.to_string() }));
                            monitor.emit_alert(alert).await;
                        }
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Exports automatiques de la table des endpoints
fn spawn_periodic_export(
    config: Arc<Config>,
    monitor: Arc<ConnectionMonitor>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    if config.export_interval == 0 {
        return;
    }
    let exporter = Exporter::new(config.exports_dir(), config.retention_days);
    let period = Duration::from_secs(config.export_interval);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // Le premier tick est immédiat: l'ignorer pour ne pas exporter
        // une table vide au démarrage
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let table = monitor.table_snapshot().await;
                    let alerts = monitor.recent_alerts(monitor::ALERT_QUEUE_CAP).await;
                    let summary = monitor.summary().await;
                    let blocked = monitor.blocked_hosts().await;
                    if let Err(e) = exporter.export(&table, blocked, alerts, summary, clock.now()) {
                        error!("Export automatique échoué: {}", e);
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Attend SIGINT ou SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Impossible d'installer le gestionnaire SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
