//! Hash-chained audit log — §6.
//!
//! Each event's hash covers the previous event's hash, its own payload, and
//! its timestamp, so the log can be verified end to end without trusting the
//! store: a single tampered row breaks the chain from that point forward.

use crate::ids::AccountId;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Closed vocabulary of things worth auditing. Deliberately not open to
/// arbitrary strings: a new kind of event should be a new variant, not a
/// typo waiting to happen in a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    OrderPlaced,
    OrderFilled,
    OrderCancelled,
    PositionOpened,
    PositionClosed,
    TpTriggered,
    SlTriggered,
    LiquidationTriggered,
    DailyLossBreach,
    DrawdownBreach,
    MarginUpdate,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::OrderPlaced => "ORDER_PLACED",
            AuditEventType::OrderFilled => "ORDER_FILLED",
            AuditEventType::OrderCancelled => "ORDER_CANCELLED",
            AuditEventType::PositionOpened => "POSITION_OPENED",
            AuditEventType::PositionClosed => "POSITION_CLOSED",
            AuditEventType::TpTriggered => "TP_TRIGGERED",
            AuditEventType::SlTriggered => "SL_TRIGGERED",
            AuditEventType::LiquidationTriggered => "LIQUIDATION_TRIGGERED",
            AuditEventType::DailyLossBreach => "DAILY_LOSS_BREACH",
            AuditEventType::DrawdownBreach => "DRAWDOWN_BREACH",
            AuditEventType::MarginUpdate => "MARGIN_UPDATE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub account_id: Option<AccountId>,
    pub event_type: AuditEventType,
    pub payload: String,
    pub previous_hash: String,
    pub event_hash: String,
    pub timestamp: DateTime<Utc>,
}

fn hash_hex(previous_hash: &str, payload: &str, timestamp: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(payload.as_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}

/// Genesis hash for the first event in a chain (or a chain whose tail we
/// have not yet loaded from the store).
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000";

/// Appends one event to a chain, given the hash of the event before it.
/// Callers own the running tail (typically cached in memory and refreshed
/// from the store on startup) and pass it in rather than this type tracking
/// it, so the same chain can be built up from multiple call sites without a
/// shared mutable tracker.
pub struct AuditChain {
    tail_hash: String,
}

impl AuditChain {
    pub fn new(tail_hash: impl Into<String>) -> Self {
        Self { tail_hash: tail_hash.into() }
    }

    pub fn genesis() -> Self {
        Self::new(GENESIS_HASH)
    }

    pub fn tail_hash(&self) -> &str {
        &self.tail_hash
    }

    /// Builds and appends an event, serializing `payload` to JSON. Advances
    /// the chain's tail so the next call links onto this one.
    pub fn append<T: Serialize>(
        &mut self,
        account_id: Option<AccountId>,
        event_type: AuditEventType,
        payload: &T,
        now: DateTime<Utc>,
    ) -> AuditEvent {
        let payload_json = serde_json::to_string(payload).unwrap_or_default();
        let event_hash = hash_hex(&self.tail_hash, &payload_json, &now);
        let event = AuditEvent {
            account_id,
            event_type,
            payload: payload_json,
            previous_hash: self.tail_hash.clone(),
            event_hash: event_hash.clone(),
            timestamp: now,
        };
        self.tail_hash = event_hash;
        event
    }
}

/// Keeps one running tail per account, plus a system-wide chain (keyed on
/// `None`) for events with no single owning account, so two accounts
/// auditing concurrently never contend on a shared tail. This is the thing
/// call sites actually hold — `AuditChain` itself stays a bare, owner-supplied
/// tail for whoever needs just one chain (tests, single-account tools).
pub struct AuditLog {
    chains: RwLock<HashMap<Option<AccountId>, Mutex<AuditChain>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self { chains: RwLock::new(HashMap::new()) }
    }

    /// Appends one event to the chain for `account_id` (or the system chain
    /// if `None`), creating it at genesis on first use.
    pub fn record<T: Serialize>(
        &self,
        account_id: Option<AccountId>,
        event_type: AuditEventType,
        payload: &T,
        now: DateTime<Utc>,
    ) -> AuditEvent {
        if let Some(chain) = self.chains.read().get(&account_id) {
            return chain.lock().append(account_id, event_type, payload, now);
        }
        let mut chains = self.chains.write();
        chains
            .entry(account_id)
            .or_insert_with(|| Mutex::new(AuditChain::genesis()))
            .lock()
            .append(account_id, event_type, payload, now)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-derives every event's hash from its recorded `previous_hash`/`payload`/
/// `timestamp` and checks the chain links up; returns the index of the first
/// broken link, if any.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), usize> {
    let mut expected_previous = GENESIS_HASH.to_string();
    for (index, event) in events.iter().enumerate() {
        if event.previous_hash != expected_previous {
            return Err(index);
        }
        let recomputed = hash_hex(&event.previous_hash, &event.payload, &event.timestamp);
        if recomputed != event.event_hash {
            return Err(index);
        }
        expected_previous = event.event_hash.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn appended_events_link_into_a_valid_chain() {
        let mut chain = AuditChain::genesis();
        let now = Utc::now();
        let first = chain.append(None, AuditEventType::PositionOpened, &json!({"id": 1}), now);
        let second = chain.append(None, AuditEventType::PositionClosed, &json!({"id": 1}), now);

        assert_eq!(first.previous_hash, GENESIS_HASH);
        assert_eq!(second.previous_hash, first.event_hash);
        assert!(verify_chain(&[first, second]).is_ok());
    }

    #[test]
    fn tampering_with_a_payload_breaks_verification() {
        let mut chain = AuditChain::genesis();
        let now = Utc::now();
        let mut first = chain.append(None, AuditEventType::MarginUpdate, &json!({"margin": 100}), now);
        let second = chain.append(None, AuditEventType::MarginUpdate, &json!({"margin": 200}), now);

        first.payload = "{\"margin\": 999}".to_string();
        assert_eq!(verify_chain(&[first, second]), Err(0));
    }

    #[test]
    fn audit_log_keeps_independent_chains_per_account() {
        use crate::ids::AccountId;

        let log = AuditLog::new();
        let a = AccountId::new();
        let b = AccountId::new();
        let now = Utc::now();

        let a1 = log.record(Some(a), AuditEventType::PositionOpened, &json!({"id": 1}), now);
        let b1 = log.record(Some(b), AuditEventType::PositionOpened, &json!({"id": 2}), now);
        let a2 = log.record(Some(a), AuditEventType::PositionClosed, &json!({"id": 1}), now);

        assert_eq!(a1.previous_hash, GENESIS_HASH);
        assert_eq!(b1.previous_hash, GENESIS_HASH);
        assert_eq!(a2.previous_hash, a1.event_hash);
        assert!(verify_chain(&[a1, a2]).is_ok());
    }
}
