//! Core library of a decentralized cross-chain atomic exchange. Two traders
//! swap value held on two independent UTXO chains without a custodian; a
//! service node relays their signed packets, matches makers with takers and
//! runs a refund fallback for traders that go offline. This crate implements
//! the pieces that make that safe:
//!
//! - the order lifecycle state machine from creation to settlement or refund
//! - HTLC construction and signing, including the replay-protected fork-id
//!   sighash used by BCH-style chains
//! - process-wide UTXO reservation across concurrent orders
//! - the rebroadcast and service-node re-selection loop keeping orders live
//! - the on-chain watch loops for deposit spends and trader refunds
//!
//! Wallet RPC transports, the P2P gossip layer and the service-node registry
//! are external collaborators consumed through the [`connector::WalletRpc`],
//! [`app::PacketSink`] and [`nodes::NodeDirectory`] interfaces.

// Coding conventions
#![forbid(unsafe_code)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(unused_mut)]

pub mod app;
pub mod connector;
pub mod consensus;
pub mod error;
pub mod exchange;
pub mod nodes;
pub mod order;
pub mod packet;
pub mod script;
pub mod session;
pub mod settings;
pub mod sighash;
pub mod timer;
pub mod utxo;
pub mod watch;

pub use error::{Error, Res};
