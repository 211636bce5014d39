//! Service-node matchmaker. Holds the read-only projection of orders a
//! relay node supervises: pending orders waiting for a taker, matched trades
//! moving through settlement, and the pre-signed trader refunds used by the
//! refund fallback watch. The node never takes custody of anything.

use log::{debug, info};
use parking_lot::Mutex;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::order::{now_micros, OrderId, DEADLINE_TTL, PENDING_TTL};
use crate::utxo::UtxoEntry;

/// Settlement progress of a supervised trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeState {
    /// Announced by the maker, waiting for a taker.
    Pending,
    /// Taker matched, both parties notified.
    Joined,
    Finished,
    Cancelled,
}

/// One side of a supervised trade.
#[derive(Debug, Clone, Default)]
pub struct TraderLeg {
    pub source_address: Vec<u8>,
    pub dest_address: Vec<u8>,
    pub currency: String,
    pub amount: u64,
    pub utxos: Vec<UtxoEntry>,
    pub m_pubkey: Vec<u8>,
    pub lock_time: u32,
    /// Pre-signed refund of the trader's deposit, broadcast by the node when
    /// the trader goes offline past their locktime.
    pub refund_tx: String,
    pub refunded: bool,
}

/// A trade supervised by the service node.
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: OrderId,
    pub created_us: u64,
    pub state: TradeState,
    pub a: TraderLeg,
    pub b: TraderLeg,
}

impl Trade {
    fn new(id: OrderId, a: TraderLeg) -> Self {
        Trade {
            id,
            created_us: now_micros(),
            state: TradeState::Pending,
            a,
            b: TraderLeg::default(),
        }
    }

    pub fn lifetime_seconds(&self) -> u64 {
        now_micros().saturating_sub(self.created_us) / 1_000_000
    }
}

pub type TradePtr = Arc<Mutex<Trade>>;

/// Matchmaker state of a service node.
#[derive(Default)]
pub struct Exchange {
    enabled: Mutex<bool>,
    wallets: Mutex<HashSet<String>>,
    trades: Mutex<HashMap<OrderId, TradePtr>>,
}

impl Exchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable matchmaking. Called on nodes that advertise exchange wallets.
    pub fn init(&self, enabled: bool) {
        *self.enabled.lock() = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    /// Matchmaking runs only when enabled and at least one wallet is up.
    pub fn is_started(&self) -> bool {
        self.is_enabled() && !self.wallets.lock().is_empty()
    }

    /// Replace the set of connected wallets after a refresh cycle.
    pub fn load_wallets(&self, wallets: HashSet<String>) {
        debug!("exchange wallets updated: {:?}", wallets);
        *self.wallets.lock() = wallets;
    }

    pub fn connected_wallets(&self) -> HashSet<String> {
        self.wallets.lock().clone()
    }

    pub fn has_wallet(&self, currency: &str) -> bool {
        self.wallets.lock().contains(currency)
    }

    /// Accept a maker announcement. Re-announcements of a known order only
    /// refresh its timestamp; returns true when the order is new.
    pub fn create_transaction(&self, id: OrderId, a: TraderLeg) -> bool {
        let mut trades = self.trades.lock();
        if let Some(existing) = trades.get(&id) {
            existing.lock().created_us = now_micros();
            return false;
        }
        info!("exchange: new pending order {}", id);
        trades.insert(id, Arc::new(Mutex::new(Trade::new(id, a))));
        true
    }

    /// Match a taker against a pending order.
    pub fn accept_transaction(&self, id: OrderId, b: TraderLeg) -> Option<TradePtr> {
        let trades = self.trades.lock();
        let trade = trades.get(&id)?;
        {
            let mut t = trade.lock();
            if t.state != TradeState::Pending {
                return None;
            }
            t.b = b;
            t.state = TradeState::Joined;
        }
        Some(trade.clone())
    }

    pub fn transaction(&self, id: &OrderId) -> Option<TradePtr> {
        self.trades.lock().get(id).cloned()
    }

    pub fn pending_transactions(&self) -> Vec<TradePtr> {
        self.trades
            .lock()
            .values()
            .filter(|t| t.lock().state == TradeState::Pending)
            .cloned()
            .collect()
    }

    pub fn delete_transaction(&self, id: &OrderId) {
        self.trades.lock().remove(id);
    }

    /// Drop pending orders past the pending TTL and any trade past the hard
    /// deadline.
    pub fn erase_expired_transactions(&self) {
        let mut trades = self.trades.lock();
        trades.retain(|id, trade| {
            let t = trade.lock();
            let age = t.lifetime_seconds();
            let keep = match t.state {
                TradeState::Pending => age <= PENDING_TTL,
                _ => age <= DEADLINE_TTL,
            };
            if !keep {
                info!("exchange: erasing expired order {}", id);
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leg(currency: &str, amount: u64) -> TraderLeg {
        TraderLeg {
            currency: currency.into(),
            amount,
            ..TraderLeg::default()
        }
    }

    #[test]
    fn started_requires_wallets() {
        let e = Exchange::new();
        e.init(true);
        assert!(e.is_enabled());
        assert!(!e.is_started());
        e.load_wallets(["BTC".to_string()].iter().cloned().collect());
        assert!(e.is_started());
    }

    #[test]
    fn create_is_idempotent() {
        let e = Exchange::new();
        let id = OrderId::from_bytes([1u8; 32]);
        assert!(e.create_transaction(id, leg("BTC", 100)));
        assert!(!e.create_transaction(id, leg("BTC", 100)));
        assert_eq!(e.pending_transactions().len(), 1);
    }

    #[test]
    fn accept_moves_to_joined() {
        let e = Exchange::new();
        let id = OrderId::from_bytes([2u8; 32]);
        e.create_transaction(id, leg("BTC", 100));

        let trade = e.accept_transaction(id, leg("LTC", 200)).unwrap();
        assert_eq!(trade.lock().state, TradeState::Joined);
        // A joined trade cannot be accepted twice.
        assert!(e.accept_transaction(id, leg("LTC", 200)).is_none());
        assert!(e.pending_transactions().is_empty());
    }

    #[test]
    fn expired_pending_orders_are_erased() {
        let e = Exchange::new();
        let id = OrderId::from_bytes([3u8; 32]);
        e.create_transaction(id, leg("BTC", 100));
        {
            let trade = e.transaction(&id).unwrap();
            trade.lock().created_us = now_micros() - (PENDING_TTL + 1) * 1_000_000;
        }
        e.erase_expired_transactions();
        assert!(e.transaction(&id).is_none());
    }

    #[test]
    fn joined_trades_survive_pending_ttl() {
        let e = Exchange::new();
        let id = OrderId::from_bytes([4u8; 32]);
        e.create_transaction(id, leg("BTC", 100));
        e.accept_transaction(id, leg("LTC", 200));
        {
            let trade = e.transaction(&id).unwrap();
            trade.lock().created_us = now_micros() - (PENDING_TTL + 1) * 1_000_000;
        }
        e.erase_expired_transactions();
        assert!(e.transaction(&id).is_some());
    }
}
