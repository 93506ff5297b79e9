use clap::Parser;
use std::path::PathBuf;

/// Agent de surveillance réseau et d'intelligence de sécurité
#[derive(Debug, Parser)]
#[command(name = "frelon", version, about = "Surveillance des connexions réseau de l'hôte, évaluation de risque et diffusion temps réel")]
pub struct Cli {
    /// Chemin du fichier de configuration
    #[arg(long, default_value = crate::config::CONFIG_FILE)]
    pub config: PathBuf,

    /// Adresse d'écoute (remplace la configuration)
    #[arg(long)]
    pub host: Option<String>,

    /// Port d'écoute (remplace la configuration)
    #[arg(long)]
    pub port: Option<u16>,

    /// Répertoire des données persistées
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Certificat TLS (la terminaison est assurée par une enveloppe externe)
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// Clé privée TLS
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    /// Journalisation détaillée
    #[arg(short, long)]
    pub verbose: bool,
}
