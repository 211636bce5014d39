//! Per-order record and its lifecycle state machine. An order is owned by
//! the process that created or accepted it; the service node only holds a
//! read-only projection inside the exchange. Reservations and ephemeral keys
//! live and die with the record.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::secp256k1::{PublicKey, SecretKey};
use serde::Serialize;
use serde_json::json;

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::consensus::{self, Decodable, Encodable};
use crate::error::Error;
use crate::utxo::UtxoEntry;

/// Amount denomination used by order amounts.
pub const COIN: u64 = 100_000_000;

/// Seconds before a new order is considered offline and an open order
/// expired.
pub const PENDING_TTL: u64 = 300;
/// Seconds before expired or offline orders are erased from the live map.
pub const TTL: u64 = 3600;
/// Seconds after creation before a stuck open order is hard-erased.
pub const DEADLINE_TTL: u64 = 7200;

/// Microseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_micros() as u64
}

/// 32-byte order identifier derived from the creation parameters, making
/// replay of identical orders infeasible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderId([u8; 32]);

impl OrderId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        OrderId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash over the order creation inputs, including the signature of the
    /// first reserved UTXO.
    #[allow(clippy::too_many_arguments)]
    pub fn derive(
        from_addr: &str,
        from_currency: &str,
        from_amount: u64,
        to_addr: &str,
        to_currency: &str,
        to_amount: u64,
        created_us: u64,
        block_hash: &[u8; 32],
        first_utxo_sig: &[u8],
    ) -> Self {
        let mut buf = Vec::new();
        let mut put = |bytes: &[u8]| buf.extend_from_slice(bytes);
        put(&consensus::serialize(&from_addr.to_owned()));
        put(&consensus::serialize(&from_currency.to_owned()));
        put(&consensus::serialize(&from_amount));
        put(&consensus::serialize(&to_addr.to_owned()));
        put(&consensus::serialize(&to_currency.to_owned()));
        put(&consensus::serialize(&to_amount));
        put(&consensus::serialize(&created_us));
        put(block_hash);
        put(&consensus::serialize(&first_utxo_sig.to_vec()));
        OrderId(sha256d::Hash::hash(&buf).into_inner())
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Trading side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwapRole {
    /// Role A, initiates and broadcasts the order.
    Maker,
    /// Role B, accepts an existing order.
    Taker,
}

impl SwapRole {
    pub fn as_char(&self) -> char {
        match self {
            SwapRole::Maker => 'A',
            SwapRole::Taker => 'B',
        }
    }
}

/// Order lifecycle states. Progression is monotone along the allowed
/// transitions; the terminal set never transitions out. The declaration
/// order doubles as the progression order for coarse comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum State {
    New,
    Pending,
    Accepting,
    Accepted,
    Hold,
    Initialized,
    Created,
    Signed,
    Commited,
    Finished,
    Cancelled,
    Rollback,
    Expired,
    Offline,
    Dropped,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            State::Finished
                | State::Cancelled
                | State::Rollback
                | State::Expired
                | State::Dropped
        )
    }

    /// Whether `next` is reachable from `self` in one step.
    pub fn can_transition_to(&self, next: State) -> bool {
        if self.is_terminal() || next == *self {
            return false;
        }
        // Any live order can be cancelled, rolled back, expired or dropped.
        if matches!(
            next,
            State::Cancelled | State::Rollback | State::Expired | State::Dropped
        ) {
            return true;
        }
        matches!(
            (*self, next),
            (State::New, State::Pending)
                | (State::New, State::Offline)
                | (State::Pending, State::Accepting)
                | (State::Pending, State::Hold)
                | (State::Accepting, State::Accepted)
                | (State::Accepting, State::Hold)
                | (State::Accepted, State::Hold)
                | (State::Hold, State::Initialized)
                | (State::Initialized, State::Created)
                | (State::Created, State::Signed)
                | (State::Signed, State::Commited)
                | (State::Commited, State::Finished)
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            State::New => "new",
            State::Pending => "open",
            State::Accepting => "accepting",
            State::Accepted => "accepted",
            State::Hold => "hold",
            State::Initialized => "initialized",
            State::Created => "created",
            State::Signed => "signed",
            State::Commited => "commited",
            State::Finished => "finished",
            State::Cancelled => "canceled",
            State::Rollback => "rolled back",
            State::Expired => "expired",
            State::Offline => "offline",
            State::Dropped => "dropped",
        };
        write!(f, "{}", s)
    }
}

/// Reason stored on an order when it terminates without finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CancelReason {
    Unknown,
    BadSettings,
    UserRequest,
    NoMoney,
    BadUtxo,
    Dust,
    RpcError,
    NotSigned,
    NotAccepted,
    Rollback,
    RpcRequest,
    BridgeRejected,
    InvalidAddress,
    FeeChainError,
    BadADepositTx,
    BadBDepositTx,
    Timeout,
    BadLockTime,
    BadALockTime,
    BadBLockTime,
    BadAUtxo,
    BadBUtxo,
    BadARefundTx,
    BadBRefundTx,
    BadFeeTx,
}

impl Encodable for CancelReason {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        (*self as u32).consensus_encode(writer)
    }
}

impl Decodable for CancelReason {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        use CancelReason::*;
        const ALL: [CancelReason; 25] = [
            Unknown,
            BadSettings,
            UserRequest,
            NoMoney,
            BadUtxo,
            Dust,
            RpcError,
            NotSigned,
            NotAccepted,
            Rollback,
            RpcRequest,
            BridgeRejected,
            InvalidAddress,
            FeeChainError,
            BadADepositTx,
            BadBDepositTx,
            Timeout,
            BadLockTime,
            BadALockTime,
            BadBLockTime,
            BadAUtxo,
            BadBUtxo,
            BadARefundTx,
            BadBRefundTx,
            BadFeeTx,
        ];
        let tag = u32::consensus_decode(d)?;
        ALL.get(tag as usize)
            .copied()
            .ok_or(consensus::Error::UnknownType)
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The central per-order record.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: OrderId,
    pub role: SwapRole,
    /// Whether this process created or accepted the order.
    pub local: bool,

    pub from: Vec<u8>,
    pub from_addr: String,
    pub from_currency: String,
    pub from_amount: u64,
    pub to: Vec<u8>,
    pub to_addr: String,
    pub to_currency: String,
    pub to_amount: u64,

    pub state: State,
    pub reason: CancelReason,

    pub created_us: u64,
    pub txtime_us: u64,
    pub block_hash: [u8; 32],

    /// Ephemeral signing key for packets and the refund HTLC path.
    pub m_pubkey: Option<PublicKey>,
    pub m_privkey: Option<SecretKey>,
    /// Ephemeral secret; HASH160 of the public half is the HTLC hashlock.
    /// The private half never leaves the maker.
    pub x_pubkey: Option<PublicKey>,
    pub x_privkey: Option<SecretKey>,

    pub used_coins: Vec<UtxoEntry>,
    pub fee_utxos: Vec<UtxoEntry>,
    pub raw_fee_tx: String,

    /// Our own deposit output, watched for counterparty spends.
    pub bin_txid: String,
    pub bin_vout: u32,
    /// Counterparty deposit and the redeem script guarding it.
    pub counterparty_bin_txid: String,
    pub counterparty_bin_vout: u32,
    pub inner_script: Vec<u8>,
    /// Pre-signed refund of our own deposit.
    pub refund_tx: String,
    pub lock_time: u32,

    /// Selected service node: 20-byte address and 33-byte public key.
    pub hub_address: Vec<u8>,
    pub s_pubkey: Vec<u8>,
    pub excluded_nodes: HashSet<Vec<u8>>,

    watching: bool,
    watching_done: bool,
    pub watch_start_block: u32,
    watch_current_block: u32,
    pub other_pay_txid: Option<String>,
    pub redeemed_counterparty: bool,
    secret: Option<Vec<u8>>,
}

impl Order {
    pub fn new(id: OrderId, role: SwapRole) -> Self {
        let now = now_micros();
        Order {
            id,
            role,
            local: false,
            from: Vec::new(),
            from_addr: String::new(),
            from_currency: String::new(),
            from_amount: 0,
            to: Vec::new(),
            to_addr: String::new(),
            to_currency: String::new(),
            to_amount: 0,
            state: State::New,
            reason: CancelReason::Unknown,
            created_us: now,
            txtime_us: now,
            block_hash: [0u8; 32],
            m_pubkey: None,
            m_privkey: None,
            x_pubkey: None,
            x_privkey: None,
            used_coins: Vec::new(),
            fee_utxos: Vec::new(),
            raw_fee_tx: String::new(),
            bin_txid: String::new(),
            bin_vout: 0,
            counterparty_bin_txid: String::new(),
            counterparty_bin_vout: 0,
            inner_script: Vec::new(),
            refund_tx: String::new(),
            lock_time: 0,
            hub_address: Vec::new(),
            s_pubkey: Vec::new(),
            excluded_nodes: HashSet::new(),
            watching: false,
            watching_done: false,
            watch_start_block: 0,
            watch_current_block: 0,
            other_pay_txid: None,
            redeemed_counterparty: false,
            secret: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Move to `next`, rejecting transitions outside the state machine.
    pub fn set_state(&mut self, next: State) -> Result<(), Error> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidState);
        }
        self.state = next;
        Ok(())
    }

    /// Restore a prior state after a failed acceptance attempt. Only used to
    /// unwind the accepting state before any packet left the process.
    pub(crate) fn revert_state(&mut self, prior: State) {
        self.state = prior;
    }

    pub fn update_timestamp(&mut self) {
        self.txtime_us = now_micros();
    }

    /// Seconds since the last send or refresh.
    pub fn age_seconds(&self) -> u64 {
        now_micros().saturating_sub(self.txtime_us) / 1_000_000
    }

    /// Seconds since creation.
    pub fn lifetime_seconds(&self) -> u64 {
        now_micros().saturating_sub(self.created_us) / 1_000_000
    }

    /// Move the current service node into the exclusion set and assign a new
    /// one.
    pub fn assign_servicenode(&mut self, address: Vec<u8>, pubkey: Vec<u8>) {
        if !self.s_pubkey.is_empty() {
            self.excluded_nodes.insert(self.s_pubkey.clone());
        }
        self.hub_address = address;
        self.s_pubkey = pubkey;
    }

    pub fn set_watching(&mut self, watching: bool) {
        self.watching = watching;
    }

    pub fn is_watching(&self) -> bool {
        self.watching
    }

    pub fn done_watching(&mut self) {
        self.watching_done = true;
    }

    pub fn is_done_watching(&self) -> bool {
        self.watching_done
    }

    pub fn set_watch_block(&mut self, block: u32) {
        self.watch_current_block = block;
    }

    pub fn watch_current_block(&self) -> u32 {
        if self.watch_current_block == 0 {
            self.watch_start_block
        } else {
            self.watch_current_block
        }
    }

    /// Record the counterparty pay transaction. The first observation wins.
    pub fn set_other_pay_txid(&mut self, txid: String) {
        if self.other_pay_txid.is_none() {
            self.other_pay_txid = Some(txid);
        }
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some() || self.x_pubkey.is_some()
    }

    pub fn set_secret(&mut self, secret: Vec<u8>) {
        self.secret = Some(secret);
    }

    pub fn secret(&self) -> Option<&[u8]> {
        if let Some(s) = &self.secret {
            return Some(s);
        }
        None
    }

    pub fn clear_used_coins(&mut self) {
        self.used_coins.clear();
        self.fee_utxos.clear();
    }

    /// Structured order description for the log stream.
    pub fn log_value(&self) -> serde_json::Value {
        json!({
            "orderid": self.id.to_string(),
            "role": self.role.as_char().to_string(),
            "maker": self.from_currency,
            "maker_size": self.from_amount as f64 / COIN as f64,
            "maker_addr": self.from_addr,
            "taker": self.to_currency,
            "taker_size": self.to_amount as f64 / COIN as f64,
            "taker_addr": self.to_addr,
            "state": self.state,
            "block_hash": hex::encode(self.block_hash),
            "cancel_reason": self.reason,
            "utxos": self.used_coins,
        })
    }
}
