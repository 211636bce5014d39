//! Unspent outputs and the process-wide reservation registry preventing the
//! same output from backing two live orders (or an order and a fee payment)
//! at once.

use parking_lot::Mutex;
use serde::Serialize;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A wallet unspent output together with the ownership proof attached when
/// the output is committed to an order. Two entries are the same output when
/// their `txid` and `vout` match; amount, address and signature are carried
/// data.
#[derive(Debug, Clone, Serialize)]
pub struct UtxoEntry {
    /// Funding transaction id, hex string as reported by the wallet.
    pub txid: String,
    /// Output index inside the funding transaction.
    pub vout: u32,
    /// Amount in chain units (not in COIN denomination).
    pub amount: f64,
    /// Owning address in the chain's string encoding.
    pub address: String,
    /// 20-byte hash of the owning address.
    #[serde(skip)]
    pub raw_address: Vec<u8>,
    /// 65-byte recoverable signature proving ownership of the output.
    #[serde(skip)]
    pub signature: Vec<u8>,
}

impl UtxoEntry {
    pub fn new(txid: String, vout: u32, amount: f64, address: String) -> Self {
        UtxoEntry {
            txid,
            vout,
            amount,
            address,
            raw_address: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// The text a wallet signs to prove ownership of this output.
    pub fn signing_message(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }
}

impl PartialEq for UtxoEntry {
    fn eq(&self, other: &Self) -> bool {
        self.txid == other.txid && self.vout == other.vout
    }
}

impl Eq for UtxoEntry {}

impl Hash for UtxoEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.txid.hash(state);
        self.vout.hash(state);
    }
}

impl fmt::Display for UtxoEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

#[derive(Default)]
struct Registry {
    fee_utxos: HashSet<UtxoEntry>,
    utxos_dict: HashMap<String, HashSet<UtxoEntry>>,
}

/// Two-tiered reservation table keyed by currency ticker. Order reservations
/// live in a per-currency set, fee reservations in a dedicated set; both are
/// serialized under a single mutex. Callers must not hold any other registry
/// lock while invoking.
#[derive(Default)]
pub struct UtxoLocker {
    inner: Mutex<Registry>,
}

impl UtxoLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `utxos` for an order on `currency`. Fails atomically: if any
    /// requested output is already reserved, none are added.
    pub fn lock_coins(&self, currency: &str, utxos: &[UtxoEntry]) -> bool {
        let mut reg = self.inner.lock();
        let set = reg.utxos_dict.entry(currency.to_owned()).or_default();
        if utxos.iter().any(|u| set.contains(u)) {
            return false;
        }
        set.extend(utxos.iter().cloned());
        true
    }

    /// Release order reservations. Unknown outputs are ignored.
    pub fn unlock_coins(&self, currency: &str, utxos: &[UtxoEntry]) {
        let mut reg = self.inner.lock();
        if let Some(set) = reg.utxos_dict.get_mut(currency) {
            for u in utxos {
                set.remove(u);
            }
        }
    }

    /// Reserve outputs for a service-node fee payment.
    pub fn lock_fee_utxos(&self, utxos: &[UtxoEntry]) {
        let mut reg = self.inner.lock();
        reg.fee_utxos.extend(utxos.iter().cloned());
    }

    /// Release fee reservations.
    pub fn unlock_fee_utxos(&self, utxos: &[UtxoEntry]) {
        let mut reg = self.inner.lock();
        for u in utxos {
            reg.fee_utxos.remove(u);
        }
    }

    /// Fee reservations currently held.
    pub fn fee_utxos(&self) -> HashSet<UtxoEntry> {
        self.inner.lock().fee_utxos.clone()
    }

    /// Order reservations currently held for `currency`.
    pub fn locked_utxos(&self, currency: &str) -> HashSet<UtxoEntry> {
        self.inner
            .lock()
            .utxos_dict
            .get(currency)
            .cloned()
            .unwrap_or_default()
    }

    /// Union of order reservations for `currency` and all fee reservations.
    pub fn all_locked_utxos(&self, currency: &str) -> HashSet<UtxoEntry> {
        let reg = self.inner.lock();
        let mut all = reg.fee_utxos.clone();
        if let Some(set) = reg.utxos_dict.get(currency) {
            all.extend(set.iter().cloned());
        }
        all
    }
}
