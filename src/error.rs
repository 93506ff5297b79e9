//! Taxonomie des erreurs de l'agent
//!
//! Chaque frontière faillible retourne un `Result` portant l'une de ces
//! variantes. Les erreurs fatales au démarrage sont converties en code de
//! sortie par `main`.

use std::path::PathBuf;
use thiserror::Error;

/// Erreurs de l'agent Frelon
#[derive(Debug, Error)]
pub enum FrelonError {
    /// Échec transitoire d'une sonde (énumération de sockets, DNS, compteurs NIC)
    #[error("échec de la sonde: {message}")]
    Probe { message: String },

    /// Fichier de corpus de renseignement illisible ou malformé
    #[error("corpus illisible ({}): {message}", path.display())]
    Corpus { path: PathBuf, message: String },

    /// Erreur de protocole côté client (JSON malformé, commande inconnue, trame trop grande)
    #[error("erreur de protocole client: {0}")]
    ClientProtocol(String),

    /// Configuration invalide (fatal, code de sortie 1)
    #[error("configuration invalide: {message}")]
    Config { message: String },

    /// Port d'écoute déjà utilisé (fatal, code de sortie 2)
    #[error("port déjà utilisé ({addr}): {source}")]
    PortInUse {
        addr: String,
        source: std::io::Error,
    },

    /// Privilèges insuffisants pour l'énumération des sockets (fatal, code de sortie 3)
    #[error("privilèges insuffisants: {message}")]
    Privilege { message: String },

    /// Erreur d'entrée/sortie sur un fichier persisté
    #[error("erreur d'E/S sur {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Erreur de sérialisation JSON
    #[error("erreur de sérialisation: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl FrelonError {
    /// Code de sortie du processus pour les erreurs fatales au démarrage
    pub fn exit_code(&self) -> i32 {
        match self {
            FrelonError::Config { .. } => 1,
            FrelonError::PortInUse { .. } => 2,
            FrelonError::Privilege { .. } => 3,
            _ => 1,
        }
    }
}

/// Alias utilisé dans tout le crate
pub type Result<T> = std::result::Result<T, FrelonError>;
