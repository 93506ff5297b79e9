//! Moteur de renseignement
//!
//! Classifieur de risque déterministe: mêmes entrées, même évaluation.
//! Toute l'agrégation à état (fenêtres comportementales, historique de
//! balayage) vit dans le moniteur et est passée ici explicitement.

pub mod corpus;

pub use corpus::{CorpusWatcher, ThreatCorpus, ThreatPattern, DEFAULT_SUSPICIOUS_PORTS};

use std::collections::HashSet;

use crate::models::{
    EncryptionType, NetworkEndpoint, RiskLevel, SecurityAssessment,
};

/// Score de confiance de départ
pub const BASE_TRUST: f64 = 0.7;

/// Plafond de confiance d'un hôte bloqué, sous le seuil MEDIUM pour que
/// son niveau ne puisse jamais redescendre sous HIGH
const BLOCKED_TRUST_CAP: f64 = 0.45;

/// Indicateurs comportementaux calculés par le moniteur sur ses fenêtres
/// glissantes, passés au moteur comme simples faits
#[derive(Debug, Clone, Copy, Default)]
pub struct BehaviorFlags {
    /// Le processus source a ouvert ≥ 20 endpoints distincts en 10 s
    pub connection_burst: bool,
    /// ≥ 15 ports de destination distincts sur cet hôte en 30 s
    pub port_scan: bool,
}

/// Évalue un endpoint. Fonction pure.
pub fn assess(
    endpoint: &NetworkEndpoint,
    corpus: &ThreatCorpus,
    blocked: bool,
    flags: BehaviorFlags,
    allow_roots: &[String],
    encrypted_ports: &HashSet<u16>,
) -> SecurityAssessment {
    let mut trust = BASE_TRUST;
    let mut risk_factors = Vec::new();
    let mut threat_indicators = Vec::new();
    let mut rules = Vec::new();

    // 1. Vérification statique des indicateurs de compromission
    if let Some(ip) = endpoint.key().ip() {
        if corpus.matches_ip(&ip) {
            risk_factors.push("known_malicious_ip".to_string());
            threat_indicators.push(format!("l'adresse {} figure dans le corpus de menaces", ip));
            trust -= 0.8;
        }
    }

    for pattern in &corpus.threat_patterns {
        if pattern_matches(pattern, endpoint) {
            rules.push(pattern.name.clone());
            threat_indicators.push(format!("motif de menace « {} » reconnu", pattern.name));
            trust -= 0.2 * pattern.severity.weight();
        }
    }

    // 2. Heuristique de port
    if corpus.is_suspicious_port(endpoint.port) {
        risk_factors.push(format!("suspicious_port:{}", endpoint.port));
        trust -= 0.3;
    }

    // 3. Attribution au processus
    match &endpoint.process_info {
        None => {
            risk_factors.push("unattributed".to_string());
            trust -= 0.15;
        }
        Some(info) => {
            if let Some(path) = &info.path {
                if !allow_roots.iter().any(|root| path.starts_with(root)) {
                    risk_factors.push("foreign_binary".to_string());
                    trust -= 0.1;
                }
            }
        }
    }

    // 4. Comportement: rafale de connexions
    if flags.connection_burst {
        risk_factors.push("connection_burst".to_string());
        trust -= 0.2;
    }

    // 5. Comportement: balayage de ports
    if flags.port_scan {
        risk_factors.push("port_scan".to_string());
        trust -= 0.3;
    }

    // 6. Bonus de chiffrement sur port TLS standard
    if endpoint.encryption_type == EncryptionType::Tls
        && encrypted_ports.contains(&endpoint.port)
    {
        trust = (trust + 0.1).min(1.0);
    }

    // 7. Bonus réseau privé
    if endpoint.is_private {
        trust += 0.15;
    }

    // Un hôte bloqué ne redescend jamais sous HIGH
    if blocked {
        risk_factors.push("blocked_host".to_string());
        trust = trust.min(BLOCKED_TRUST_CAP);
    }

    // Arrondi à 10⁻⁴ pour que les seuils de la table soient exacts malgré
    // l'arithmétique flottante (0.7 − 0.2 doit valoir 0.50, pas 0.4999…)
    let trust_score = (trust.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0;
    let risk_level = risk_level_for(trust_score);
    let recommendation = recommendation_for(risk_level, &risk_factors);

    SecurityAssessment {
        risk_level,
        risk_factors,
        threat_indicators,
        detection_rules_triggered: rules,
        trust_score,
        recommendation,
    }
}

/// Un indicateur correspond s'il est une sous-chaîne du DNS inverse, de
/// l'organisation ou d'un chemin de requête HTTP enregistré
fn pattern_matches(pattern: &ThreatPattern, endpoint: &NetworkEndpoint) -> bool {
    pattern.indicators.iter().any(|indicator| {
        endpoint
            .reverse_dns
            .as_deref()
            .map(|s| s.contains(indicator.as_str()))
            .unwrap_or(false)
            || endpoint
                .organization
                .as_deref()
                .map(|s| s.contains(indicator.as_str()))
                .unwrap_or(false)
            || endpoint
                .http_requests
                .iter()
                .any(|path| path.contains(indicator.as_str()))
    })
}

/// Correspondance score → niveau de risque
pub fn risk_level_for(trust_score: f64) -> RiskLevel {
    if trust_score >= 0.75 {
        RiskLevel::Low
    } else if trust_score >= 0.50 {
        RiskLevel::Medium
    } else if trust_score >= 0.25 {
        RiskLevel::High
    } else {
        RiskLevel::Critical
    }
}

/// Table fixe des recommandations
fn recommendation_for(risk: RiskLevel, factors: &[String]) -> String {
    let blocked = factors.iter().any(|f| f == "blocked_host");
    let malicious = factors.iter().any(|f| f == "known_malicious_ip");

    match risk {
        RiskLevel::Critical if malicious => {
            "Action immédiate requise: bloquer la connexion et ouvrir une investigation".to_string()
        }
        RiskLevel::Critical => {
            "Action immédiate requise: isoler l'endpoint et analyser le processus source".to_string()
        }
        RiskLevel::High if blocked => {
            "Hôte bloqué: maintenir le blocage et surveiller les tentatives".to_string()
        }
        RiskLevel::High => {
            "Action recommandée: surveiller de près et envisager un blocage".to_string()
        }
        RiskLevel::Medium => "Prudence: surveiller les comportements suspects".to_string(),
        RiskLevel::Low => "Surveillance normale".to_string(),
    }
}
