use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::CallError;

type CallKey = (String, String);

#[derive(Debug, Default)]
struct Slots {
    calls: HashSet<CallKey>,
    offers: HashSet<CallKey>,
}

/// Set of live calls and unanswered offers, keyed by `(participant, exchange)`.
///
/// Every [`SignalingTransport`](crate::SignalingTransport) carries one, so all controllers
/// sharing a session share it. Controllers claim an entry before doing any work; the claim
/// is released when the returned [`CallClaim`] is dropped.
#[derive(Debug, Clone, Default)]
pub struct CallRegistry {
    slots: Arc<Mutex<Slots>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn claim(&self, participant_id: &str, exchange_id: &str) -> Result<CallClaim, CallError> {
        let key = (participant_id.to_string(), exchange_id.to_string());
        if !self.lock().calls.insert(key.clone()) {
            return Err(CallError::CallAlreadyInProgress {
                exchange_id: exchange_id.to_string(),
            });
        }
        debug!(participant = participant_id, exchange = exchange_id, "claimed call slot");
        Ok(CallClaim {
            registry: self.clone(),
            key,
        })
    }

    /// Take charge of an incoming offer. `None` when a call for the exchange is already
    /// live or another controller holds the offer.
    pub fn claim_offer(&self, participant_id: &str, exchange_id: &str) -> Option<OfferClaim> {
        let key = (participant_id.to_string(), exchange_id.to_string());
        let mut slots = self.lock();
        if slots.calls.contains(&key) || !slots.offers.insert(key.clone()) {
            return None;
        }
        Some(OfferClaim {
            registry: self.clone(),
            key,
        })
    }

    pub fn is_active(&self, participant_id: &str, exchange_id: &str) -> bool {
        self.lock()
            .calls
            .contains(&(participant_id.to_string(), exchange_id.to_string()))
    }

    pub fn active_count(&self) -> usize {
        self.lock().calls.len()
    }
}

/// Ownership of one registry slot.
#[derive(Debug)]
pub struct CallClaim {
    registry: CallRegistry,
    key: CallKey,
}

impl Drop for CallClaim {
    fn drop(&mut self) {
        self.registry.lock().calls.remove(&self.key);
    }
}

/// Ownership of one pending incoming offer.
#[derive(Debug)]
pub struct OfferClaim {
    registry: CallRegistry,
    key: CallKey,
}

impl Drop for OfferClaim {
    fn drop(&mut self) {
        self.registry.lock().offers.remove(&self.key);
    }
}
