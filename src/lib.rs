pub mod blocklist;
pub mod cli;
pub mod config;
pub mod error;
pub mod intel;
pub mod journal;
pub mod metrics;
pub mod models;
pub mod monitor;
pub mod probe;
pub mod sampler;
pub mod server;

// Re-export des structures principales pour faciliter l'utilisation
pub use blocklist::BlockList;
pub use config::Config;
pub use error::{FrelonError, Result};
pub use intel::{BehaviorFlags, CorpusWatcher, ThreatCorpus};
pub use models::{
    Alert, ConnectionSummary, EndpointKey, NetworkEndpoint, ProcessInfo, Protocol, RiskLevel,
    SecurityAssessment, TrafficSample,
};
pub use monitor::ConnectionMonitor;
pub use probe::{Clock, HostProbe, SocketRecord, SystemClock, SystemProbe};
