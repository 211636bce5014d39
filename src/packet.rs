//! Signed protocol packets. Every message carried by the relay network is a
//! packet: a fixed header, the sender's ephemeral public key, a 64-byte
//! compact signature over header and payload, and the command payload
//! itself. Packets failing shape or signature checks are dropped before any
//! dispatch.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey, Signature};

use std::io::{self, Read};

use crate::consensus::{self, Decodable, Encodable};
use crate::order::now_micros;

/// Protocol version advertised in every packet header.
pub const PROTOCOL_VERSION: u32 = 49;

/// Header bytes preceding the payload:
/// version, command, body size, timestamp, public key, signature.
pub const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 33 + 64;

/// Commands understood by the exchange protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Invalid,
    /// Maker announces a new order to its service node.
    Transaction,
    /// Service node relays an order as open, confirming receipt.
    TransactionPending,
    /// Taker asks the service node to accept an order.
    TransactionAccepting,
    TransactionHold,
    TransactionInit,
    TransactionCreated,
    TransactionSigned,
    TransactionCommited,
    TransactionFinished,
    TransactionCancel,
}

impl Command {
    fn to_u32(self) -> u32 {
        match self {
            Command::Invalid => 0,
            Command::Transaction => 1,
            Command::TransactionPending => 2,
            Command::TransactionAccepting => 3,
            Command::TransactionHold => 4,
            Command::TransactionInit => 5,
            Command::TransactionCreated => 6,
            Command::TransactionSigned => 7,
            Command::TransactionCommited => 8,
            Command::TransactionFinished => 9,
            Command::TransactionCancel => 10,
        }
    }

    fn from_u32(v: u32) -> Option<Command> {
        Some(match v {
            0 => Command::Invalid,
            1 => Command::Transaction,
            2 => Command::TransactionPending,
            3 => Command::TransactionAccepting,
            4 => Command::TransactionHold,
            5 => Command::TransactionInit,
            6 => Command::TransactionCreated,
            7 => Command::TransactionSigned,
            8 => Command::TransactionCommited,
            9 => Command::TransactionFinished,
            10 => Command::TransactionCancel,
            _ => return None,
        })
    }
}

impl Encodable for Command {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.to_u32().consensus_encode(writer)
    }
}

impl Decodable for Command {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Command::from_u32(Decodable::consensus_decode(d)?)
            .ok_or(consensus::Error::UnknownType)
    }
}

/// A protocol packet, signed with the order's ephemeral m-key.
#[derive(Debug, Clone)]
pub struct Packet {
    version: u32,
    command: Command,
    timestamp: u64,
    pubkey: [u8; 33],
    signature: [u8; 64],
    payload: Vec<u8>,
}

impl Packet {
    pub fn new(command: Command) -> Self {
        Packet {
            version: PROTOCOL_VERSION,
            command,
            timestamp: now_micros(),
            pubkey: [0u8; 33],
            signature: [0u8; 64],
            payload: Vec::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn pubkey(&self) -> &[u8; 33] {
        &self.pubkey
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.payload.extend_from_slice(bytes);
    }

    pub fn push_u32(&mut self, value: u32) {
        self.payload.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_u64(&mut self, value: u64) {
        self.payload.extend_from_slice(&value.to_le_bytes());
    }

    /// Full wire form: header, key, signature, payload.
    pub fn body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.command.to_u32().to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.pubkey);
        buf.extend_from_slice(&self.signature);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Hash signed by [`Packet::sign`]: everything except key and signature.
    fn signing_hash(&self) -> sha256d::Hash {
        let mut buf = Vec::with_capacity(20 + self.payload.len());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.command.to_u32().to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        sha256d::Hash::hash(&buf)
    }

    /// Sign the packet with an ephemeral keypair. The signature is the raw
    /// 64-byte compact form; UTXO-ownership signatures elsewhere stay 65-byte
    /// recoverable and must not be conflated with this one.
    pub fn sign(&mut self, pubkey: &PublicKey, privkey: &SecretKey) -> Result<(), consensus::Error> {
        self.pubkey = pubkey.serialize();
        let secp = Secp256k1::signing_only();
        let msg = Message::from_slice(&self.signing_hash().into_inner())
            .map_err(consensus::Error::new)?;
        let mut sig = secp.sign(&msg, privkey);
        sig.normalize_s();
        self.signature = sig.serialize_compact();
        Ok(())
    }

    /// Verify the embedded signature against the embedded key. Malformed
    /// keys or signatures verify as false.
    pub fn verify(&self) -> bool {
        let pubkey = match PublicKey::from_slice(&self.pubkey) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let sig = match Signature::from_compact(&self.signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        let msg = match Message::from_slice(&self.signing_hash().into_inner()) {
            Ok(m) => m,
            Err(_) => return false,
        };
        let secp = Secp256k1::verification_only();
        secp.verify(&msg, &sig, &pubkey).is_ok()
    }

    /// Parse a packet from raw bytes, validating sizes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Packet, consensus::Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(consensus::Error::ParseFailed("packet shorter than header"));
        }
        let mut r = io::Cursor::new(bytes);
        let version = u32::consensus_decode(&mut r)?;
        let command = Command::consensus_decode(&mut r)?;
        let body_size = u32::consensus_decode(&mut r)? as usize;
        let timestamp = u64::consensus_decode(&mut r)?;
        let pubkey = <[u8; 33]>::consensus_decode(&mut r)?;
        let signature = <[u8; 64]>::consensus_decode(&mut r)?;
        let mut payload = Vec::new();
        r.read_to_end(&mut payload)
            .map_err(consensus::Error::from)?;
        if payload.len() != body_size {
            return Err(consensus::Error::ParseFailed("packet body size mismatch"));
        }
        Ok(Packet {
            version,
            command,
            timestamp,
            pubkey,
            signature,
            payload,
        })
    }

    /// Cheap version check on raw bytes before full parsing.
    pub fn check_version(bytes: &[u8]) -> bool {
        bytes.len() >= 4
            && u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == PROTOCOL_VERSION
    }
}

/// Currency tickers travel as 8-byte zero-padded fields.
pub fn pad_currency(ticker: &str) -> [u8; 8] {
    let mut field = [0u8; 8];
    let bytes = ticker.as_bytes();
    let n = bytes.len().min(8);
    field[..n].copy_from_slice(&bytes[..n]);
    field
}

/// Inverse of [`pad_currency`]; trailing zero padding is stripped.
pub fn unpad_currency(field: &[u8; 8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(8);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Sequential reader over a packet payload.
pub struct PayloadReader<'a> {
    cursor: io::Cursor<&'a [u8]>,
}

impl<'a> PayloadReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        PayloadReader {
            cursor: io::Cursor::new(payload),
        }
    }

    pub fn read_u32(&mut self) -> Result<u32, consensus::Error> {
        u32::consensus_decode(&mut self.cursor)
    }

    pub fn read_u64(&mut self) -> Result<u64, consensus::Error> {
        u64::consensus_decode(&mut self.cursor)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], consensus::Error> {
        let mut buf = [0u8; N];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, consensus::Error> {
        let mut buf = vec![0u8; n];
        self.cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Remaining unread bytes.
    pub fn rest(&mut self) -> Vec<u8> {
        let mut buf = Vec::new();
        let _ = self.cursor.read_to_end(&mut buf);
        buf
    }
}
