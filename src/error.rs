//! Errors surfaced to API callers of the exchange coordinator. Local code
//! paths are allowed to report and continue; everything that crosses the
//! public API boundary maps onto one of these kinds.

use thiserror::Error;

use crate::consensus;

/// A list of errors reported by order creation, acceptance, cancellation and
/// the maintenance loops.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A currency ticker is unknown or malformed (tickers are 1-8 bytes).
    #[error("Invalid currency")]
    InvalidCurrency,
    /// A packet or UTXO-ownership signature failed verification.
    #[error("Invalid signature")]
    InvalidSignature,
    /// An address failed the chain codec or length checks.
    #[error("Invalid address")]
    InvalidAddress,
    /// Parameters do not satisfy the operation's preconditions.
    #[error("Invalid parameters")]
    InvalidParameters,
    /// On-chain metadata does not fit the data-carrier limits.
    #[error("Invalid on-chain history")]
    InvalidOnchainHistory,
    /// The from-chain wallet cannot cover amount plus fees.
    #[error("Insufficient funds")]
    InsufficientFunds,
    /// The fee-chain wallet cannot cover the service-node fee.
    #[error("Insufficient funds for the exchange fee")]
    InsufficientFundsDx,
    /// Selected funds could not be signed for ownership proof.
    #[error("Funds not signed")]
    FundsNotSigned,
    /// No order with the given identifier exists.
    #[error("Transaction not found")]
    TransactionNotFound,
    /// No wallet session is connected for the requested chain.
    #[error("No session for currency")]
    NoSession,
    /// No service node advertises the requested currency pair.
    #[error("No service node")]
    NoServiceNode,
    /// An amount is below the chain dust threshold.
    #[error("Dust amount")]
    Dust,
    /// The request is malformed or arrived in the wrong direction.
    #[error("Bad request")]
    BadRequest,
    /// The order is not in a state that permits the operation.
    #[error("Invalid order state")]
    InvalidState,
    /// Any error not part of this list.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<consensus::Error> for Error {
    fn from(e: consensus::Error) -> Self {
        Error::Unknown(e.to_string())
    }
}

/// Result of a coordinator-level operation, wraps the crate level
/// [`enum@Error`] type.
pub type Res<T> = Result<T, Error>;
