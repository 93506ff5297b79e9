//! État par client du hub de diffusion
//!
//! Chaque client possède une file sortante bornée avec politique de
//! contre-pression: au-delà de 100 messages les plus anciens messages non
//! prioritaires sont abandonnés, au-delà de 500 le client est déconnecté.
//! Les `alert_update` ne sont jamais abandonnés avant la déconnexion.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

use super::protocol::OutboundMessage;

/// Seuil au-delà duquel les messages non prioritaires sont abandonnés
pub const QUEUE_DROP_THRESHOLD: usize = 100;
/// Seuil au-delà duquel le client est déconnecté
pub const QUEUE_DISCONNECT_THRESHOLD: usize = 500;
/// Erreurs de protocole consécutives avant déconnexion
pub const PROTOCOL_STRIKES: u32 = 3;

/// Résultat d'une tentative d'enfilement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Message enfilé
    Queued,
    /// Message enfilé après abandon du plus ancien non prioritaire
    QueuedWithDrop,
    /// File saturée: le client doit être déconnecté
    Saturated,
}

/// File sortante bornée d'un client
pub struct ClientQueue {
    inner: Mutex<VecDeque<OutboundMessage>>,
    notify: Notify,
}

impl ClientQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Enfile un message en appliquant la politique de contre-pression
    pub fn push(&self, message: OutboundMessage) -> PushOutcome {
        let outcome = {
            let mut queue = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            if queue.len() >= QUEUE_DISCONNECT_THRESHOLD {
                return PushOutcome::Saturated;
            }

            queue.push_back(message);

            if queue.len() > QUEUE_DROP_THRESHOLD {
                // Abandonner d'abord le plus ancien message non prioritaire
                if let Some(pos) = queue.iter().position(|m| !m.is_alert()) {
                    queue.remove(pos);
                    PushOutcome::QueuedWithDrop
                } else {
                    PushOutcome::Queued
                }
            } else {
                PushOutcome::Queued
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Retire le prochain message, ou None si la file est vide
    pub fn pop(&self) -> Option<OutboundMessage> {
        let mut queue = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    /// Attend qu'un message soit disponible
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ClientQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Compteur d'erreurs de protocole consécutives d'un client
pub struct ProtocolStrikes {
    count: AtomicU32,
}

impl ProtocolStrikes {
    pub fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Enregistre une erreur; vrai si le client doit être déconnecté
    pub fn strike(&self) -> bool {
        self.count.fetch_add(1, Ordering::Relaxed) + 1 >= PROTOCOL_STRIKES
    }

    /// Une commande valide remet le compteur à zéro
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}

impl Default for ProtocolStrikes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn plain_message() -> OutboundMessage {
        OutboundMessage::welcome(Utc::now())
    }

    fn alert_message() -> OutboundMessage {
        OutboundMessage::alert_update(&[], Utc::now())
    }

    #[test]
    fn abandon_des_plus_anciens_non_prioritaires() {
        let queue = ClientQueue::new();
        // Une alerte en tête, puis saturation de messages ordinaires
        assert_eq!(queue.push(alert_message()), PushOutcome::Queued);
        for _ in 0..QUEUE_DROP_THRESHOLD {
            queue.push(plain_message());
        }
        // Le dépassement abandonne un message ordinaire, jamais l'alerte
        let outcome = queue.push(plain_message());
        assert_eq!(outcome, PushOutcome::QueuedWithDrop);
        assert_eq!(queue.len(), QUEUE_DROP_THRESHOLD + 1);
        assert!(queue.pop().unwrap().is_alert());
    }

    #[test]
    fn saturation_entraine_deconnexion() {
        let queue = ClientQueue::new();
        // Remplir uniquement d'alertes: rien n'est abandonnable
        for _ in 0..QUEUE_DISCONNECT_THRESHOLD {
            queue.push(alert_message());
        }
        assert_eq!(queue.push(alert_message()), PushOutcome::Saturated);
        assert_eq!(queue.len(), QUEUE_DISCONNECT_THRESHOLD);
    }

    #[test]
    fn ordre_fifo_preserve() {
        let queue = ClientQueue::new();
        queue.push(plain_message());
        queue.push(alert_message());
        assert!(!queue.pop().unwrap().is_alert());
        assert!(queue.pop().unwrap().is_alert());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn trois_erreurs_consecutives() {
        let strikes = ProtocolStrikes::new();
        assert!(!strikes.strike());
        assert!(!strikes.strike());
        assert!(strikes.strike());

        // Une commande valide remet le compteur à zéro
        let strikes = ProtocolStrikes::new();
        assert!(!strikes.strike());
        strikes.reset();
        assert!(!strikes.strike());
        assert!(!strikes.strike());
        assert!(strikes.strike());
    }
}
