//! Per-chain wallet capability. A [`WalletConnector`] represents one
//! connected chain: UTXO listing, address codec, transaction assembly,
//! signing, broadcast and block queries. The JSON-RPC transport behind it is
//! an external collaborator consumed through the [`WalletRpc`] interface;
//! the connectors implement everything that is protocol logic rather than
//! plumbing.

use bitcoin::hashes::sha256d;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use thiserror::Error;

use std::collections::HashSet;
use std::str::FromStr;

use crate::error::Error as XError;
use crate::utxo::UtxoEntry;

pub mod bch;
pub mod btc;
pub mod tx;

pub use bch::BchWalletConnector;
pub use btc::BtcWalletConnector;
pub use tx::XTxIn;

/// Fee paid by the taker to the selected service node, in fee-chain units.
pub const SERVICE_NODE_FEE: f64 = 0.015;

/// RPC error code: transaction already in chain.
pub const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;
/// RPC error code: invalid address or key.
pub const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
/// RPC error code: transaction rejected by verification.
pub const RPC_VERIFY_REJECTED: i32 = -26;

/// Connector-level errors. RPC failures keep the wallet error code so that
/// the watch loops can recognize terminal broadcast outcomes.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport or wallet-side failure.
    #[error("wallet RPC error {code}: {message}")]
    Rpc { code: i32, message: String },
    /// Address failed the chain codec.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Local signing failed.
    #[error("signing failed: {0}")]
    Signing(String),
    /// Malformed transaction data.
    #[error("malformed transaction: {0}")]
    Transaction(&'static str),
}

impl Error {
    pub fn rpc<S: Into<String>>(message: S) -> Self {
        Error::Rpc {
            code: 0,
            message: message.into(),
        }
    }

    /// The wallet error code, when the failure came from the wallet.
    pub fn rpc_code(&self) -> Option<i32> {
        match self {
            Error::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<Error> for XError {
    fn from(e: Error) -> XError {
        match e {
            Error::Rpc { .. } => XError::Unknown(e.to_string()),
            Error::InvalidAddress(_) => XError::InvalidAddress,
            Error::Signing(_) => XError::FundsNotSigned,
            Error::Transaction(_) => XError::InvalidParameters,
        }
    }
}

/// Transaction construction method advertised by a chain configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateTxMethod {
    Btc,
    Sys,
    Bch,
    Dgb,
    /// Recognized in configurations but not supported by this coordinator.
    Eth,
}

impl FromStr for CreateTxMethod {
    type Err = XError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BTC" => Ok(CreateTxMethod::Btc),
            "SYS" => Ok(CreateTxMethod::Sys),
            "BCH" => Ok(CreateTxMethod::Bch),
            "DGB" => Ok(CreateTxMethod::Dgb),
            "ETH" | "ETHER" | "ETHEREUM" => Ok(CreateTxMethod::Eth),
            _ => Err(XError::InvalidCurrency),
        }
    }
}

/// Static parameters of one connected chain, read from the per-ticker
/// configuration section.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletParam {
    pub currency: String,
    pub title: String,
    pub address: String,
    pub ip: String,
    pub port: String,
    pub username: String,
    pub password: String,
    pub addr_prefix: u8,
    pub script_prefix: u8,
    pub secret_prefix: u8,
    pub coin: u64,
    pub minimum_amount: u64,
    pub tx_version: u32,
    pub dust_amount: u64,
    pub method: CreateTxMethod,
    pub get_new_key_supported: bool,
    pub import_with_no_scan_supported: bool,
    pub min_tx_fee: u64,
    pub block_time: u32,
    pub fee_per_byte: u64,
    pub required_confirmations: u32,
    pub tx_with_time_field: bool,
    pub lock_coins_supported: bool,
    pub json_version: String,
    pub content_type: String,
}

/// External wallet JSON-RPC surface. Implementations live outside the core
/// (one per chain daemon flavor); tests provide in-memory fakes.
pub trait WalletRpc: Send + Sync {
    /// Reachability probe, returns the current block count.
    fn get_info(&self) -> Result<u32, Error>;
    fn list_unspent(&self) -> Result<Vec<UtxoEntry>, Error>;
    fn get_block_count(&self) -> Result<u32, Error>;
    fn get_block_hash(&self, height: u32) -> Result<String, Error>;
    fn get_transactions_in_block(&self, block_hash: &str) -> Result<Vec<String>, Error>;
    fn get_raw_mempool(&self) -> Result<Vec<String>, Error>;
    fn get_raw_transaction(&self, txid: &str) -> Result<String, Error>;
    /// Round-trip a raw transaction through the wallet decoder, returning
    /// the txid the wallet reports.
    fn decode_raw_transaction(&self, raw: &str) -> Result<String, Error>;
    fn send_raw_transaction(&self, raw: &str) -> Result<String, Error>;
    /// Sign an arbitrary message with the wallet key of `address`; returns a
    /// base64 recoverable signature.
    fn sign_message(&self, address: &str, message: &str) -> Result<String, Error>;
    /// Sign a raw transaction whose inputs the wallet owns.
    fn sign_raw_transaction(&self, raw: &str) -> Result<String, Error>;
    fn is_valid_address(&self, address: &str) -> Result<bool, Error>;
}

/// One connected chain as seen by the coordinator.
pub trait WalletConnector: Send + Sync {
    fn currency(&self) -> &str;
    fn params(&self) -> &WalletParam;

    /// Reachability check, used by the periodic wallet refresh.
    fn init(&self) -> bool;

    /// Unspent outputs minus the excluded reservations.
    fn get_unspent(&self, exclude: &HashSet<UtxoEntry>) -> Result<Vec<UtxoEntry>, Error>;

    /// Spendable balance outside `exclude`, optionally restricted to one
    /// address.
    fn get_wallet_balance(&self, exclude: &HashSet<UtxoEntry>, address: &str)
        -> Result<f64, Error>;

    fn get_block_count(&self) -> Result<u32, Error>;
    fn get_block_hash(&self, height: u32) -> Result<String, Error>;
    fn get_transactions_in_block(&self, block_hash: &str) -> Result<Vec<String>, Error>;
    fn get_raw_mempool(&self) -> Result<Vec<String>, Error>;

    /// Whether transaction `txid` spends the outpoint
    /// `(outpoint_txid, outpoint_vout)`.
    fn is_utxo_spent_in_tx(
        &self,
        txid: &str,
        outpoint_txid: &str,
        outpoint_vout: u32,
    ) -> Result<bool, Error>;

    fn get_raw_transaction(&self, txid: &str) -> Result<String, Error>;
    fn send_raw_transaction(&self, raw: &str) -> Result<String, Error>;

    /// Locking script paying to a chain address.
    fn script_pubkey(&self, address: &str) -> Result<bitcoin::Script, Error>;
    /// Sign a raw transaction whose inputs the wallet owns.
    fn sign_raw_transaction(&self, raw: &str) -> Result<String, Error>;

    /// Decode a chain address into its 20-byte hash.
    fn to_x_addr(&self, address: &str) -> Result<Vec<u8>, Error>;
    /// Encode a 20-byte hash into the chain address format.
    fn from_x_addr(&self, raw: &[u8]) -> String;
    fn is_valid_address(&self, address: &str) -> bool;

    /// Fresh ephemeral keypair for HTLC keys.
    fn new_key_pair(&self) -> (SecretKey, PublicKey);
    fn get_key_id(&self, pubkey: &PublicKey) -> [u8; 20];

    /// DER signature over a 32-byte hash with low-S normalization.
    fn sign(&self, privkey: &SecretKey, hash: &sha256d::Hash) -> Result<Vec<u8>, Error>;
    /// Wallet message signature for UTXO ownership proofs (base64, 65-byte
    /// recoverable once decoded).
    fn sign_message(&self, address: &str, message: &str) -> Result<String, Error>;

    /// Fee for the deposit transaction given its shape, in chain units.
    fn min_tx_fee1(&self, inputs: u32, outputs: u32) -> f64;
    /// Fee for the follow-up spend given its shape, in chain units.
    fn min_tx_fee2(&self, inputs: u32, outputs: u32) -> f64;
    fn is_dust_amount(&self, amount: f64) -> bool;
    fn service_node_fee(&self) -> f64;

    /// Build and sign the timelocked refund spend of an HTLC deposit.
    /// Returns `(txid, raw transaction)`.
    fn create_refund_transaction(
        &self,
        inputs: &[XTxIn],
        outputs: &[(String, f64)],
        m_pubkey: &[u8],
        m_privkey: &SecretKey,
        inner_script: &[u8],
        lock_time: u32,
    ) -> Result<(String, String), Error>;

    /// Build and sign the secret-revealing payment spend of an HTLC deposit.
    /// Returns `(txid, raw transaction)`.
    fn create_payment_transaction(
        &self,
        inputs: &[XTxIn],
        outputs: &[(String, f64)],
        m_pubkey: &[u8],
        m_privkey: &SecretKey,
        x_pubkey: &[u8],
        inner_script: &[u8],
    ) -> Result<(String, String), Error>;
}
