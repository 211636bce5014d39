//! Raw transaction container shared by every connected chain. Kept separate
//! from `bitcoin::Transaction` because several supported chains serialize an
//! extra 32-bit time field right after the version; the container otherwise
//! follows the Bitcoin wire format (compact sizes, little-endian integers).

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::OutPoint;
use bitcoin::hashes::hex::FromHex;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::Txid;

use std::io::{self, Read, Write};

use super::Error;
use crate::script::SEQUENCE_FINAL;

/// Spend request input: the output being consumed and its amount in chain
/// units. The amount is needed by fork-id sighashes which commit to it.
#[derive(Debug, Clone)]
pub struct XTxIn {
    pub txid: String,
    pub vout: u32,
    pub amount: f64,
}

impl XTxIn {
    pub fn new(txid: String, vout: u32, amount: f64) -> Self {
        XTxIn { txid, vout, amount }
    }
}

/// Transaction input.
#[derive(Debug, Clone)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxIn {
    /// Serialize the outpoint only (txid bytes followed by the index), the
    /// form committed to by signature hashes.
    pub fn encode_prevout<W: Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        w.write_all(&self.prevout.txid.as_hash().into_inner())?;
        w.write_all(&self.prevout.vout.to_le_bytes())?;
        Ok(36)
    }

    fn encode<W: Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = self.encode_prevout(w)?;
        len += write_script(w, &self.script_sig)?;
        w.write_all(&self.sequence.to_le_bytes())?;
        Ok(len + 4)
    }

    fn decode<R: Read>(r: &mut R) -> Result<Self, Error> {
        let mut txid = [0u8; 32];
        r.read_exact(&mut txid).map_err(malformed)?;
        let vout = read_u32(r)?;
        let script_sig = read_script(r)?;
        let sequence = read_u32(r)?;
        Ok(TxIn {
            prevout: OutPoint::new(Txid::from_hash(sha256d::Hash::from_inner(txid)), vout),
            script_sig,
            sequence,
        })
    }
}

/// Transaction output. The value is signed so that the legacy sighash can
/// represent the `-1` null-output sentinel.
#[derive(Debug, Clone)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Script,
}

impl TxOut {
    /// The null output substituted for skipped outputs by `SIGHASH_SINGLE`.
    pub fn null() -> Self {
        TxOut {
            value: -1,
            script_pubkey: Script::new(),
        }
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        w.write_all(&self.value.to_le_bytes())?;
        let len = write_script(w, &self.script_pubkey)?;
        Ok(8 + len)
    }

    fn decode<R: Read>(r: &mut R) -> Result<Self, Error> {
        let mut value = [0u8; 8];
        r.read_exact(&mut value).map_err(malformed)?;
        Ok(TxOut {
            value: i64::from_le_bytes(value),
            script_pubkey: read_script(r)?,
        })
    }
}

/// An unsigned or signed transaction in the wire layout of the target chain.
#[derive(Debug, Clone)]
pub struct RawTransaction {
    pub version: u32,
    /// Present only on chains configured with `TxWithTimeField`.
    pub time: Option<u32>,
    pub input: Vec<TxIn>,
    pub output: Vec<TxOut>,
    pub lock_time: u32,
}

impl RawTransaction {
    pub fn new(version: u32, time: Option<u32>, lock_time: u32) -> Self {
        RawTransaction {
            version,
            time,
            input: Vec::new(),
            output: Vec::new(),
            lock_time,
        }
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<usize, io::Error> {
        let mut len = 4;
        w.write_all(&self.version.to_le_bytes())?;
        if let Some(time) = self.time {
            w.write_all(&time.to_le_bytes())?;
            len += 4;
        }
        len += write_compact_size(w, self.input.len() as u64)?;
        for txin in &self.input {
            len += txin.encode(w)?;
        }
        len += write_compact_size(w, self.output.len() as u64)?;
        for txout in &self.output {
            len += txout.encode(w)?;
        }
        w.write_all(&self.lock_time.to_le_bytes())?;
        Ok(len + 4)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf).expect("writing to a Vec never fails");
        buf
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.serialize())
    }

    /// Double-SHA256 of the serialization, displayed in the usual reversed
    /// hex order by the chain tooling.
    pub fn txid(&self) -> Txid {
        Txid::from_hash(sha256d::Hash::hash(&self.serialize()))
    }

    /// Decode a transaction from raw bytes. `with_time` must match the
    /// chain's `TxWithTimeField` setting.
    pub fn decode(bytes: &[u8], with_time: bool) -> Result<Self, Error> {
        let mut r = io::Cursor::new(bytes);
        let version = read_u32(&mut r)?;
        let time = if with_time {
            Some(read_u32(&mut r)?)
        } else {
            None
        };
        let n_in = read_compact_size(&mut r)?;
        let mut input = Vec::new();
        for _ in 0..n_in {
            input.push(TxIn::decode(&mut r)?);
        }
        let n_out = read_compact_size(&mut r)?;
        let mut output = Vec::new();
        for _ in 0..n_out {
            output.push(TxOut::decode(&mut r)?);
        }
        let lock_time = read_u32(&mut r)?;
        if (r.position() as usize) != bytes.len() {
            return Err(Error::Transaction("trailing bytes after transaction"));
        }
        Ok(RawTransaction {
            version,
            time,
            input,
            output,
            lock_time,
        })
    }

    pub fn from_hex(s: &str, with_time: bool) -> Result<Self, Error> {
        let bytes = Vec::<u8>::from_hex(s).map_err(|_| Error::Transaction("invalid hex"))?;
        Self::decode(&bytes, with_time)
    }
}

/// Build an unsigned transaction from spend requests and `(address, amount)`
/// outputs. Input scripts are left empty and sequences final; amounts are
/// converted into the chain's base denomination with `coin`.
pub fn assemble_transaction<F>(
    inputs: &[XTxIn],
    outputs: &[(String, f64)],
    coin: u64,
    version: u32,
    lock_time: u32,
    with_time: bool,
    script_for_address: F,
) -> Result<RawTransaction, Error>
where
    F: Fn(&str) -> Result<Script, Error>,
{
    let time = if with_time { Some(0) } else { None };
    let mut tx = RawTransaction::new(version, time, lock_time);

    for xin in inputs {
        let txid =
            Txid::from_hex(&xin.txid).map_err(|_| Error::Transaction("invalid input txid"))?;
        tx.input.push(TxIn {
            prevout: OutPoint::new(txid, xin.vout),
            script_sig: Script::new(),
            sequence: SEQUENCE_FINAL,
        });
    }

    for (address, amount) in outputs {
        let script_pubkey = script_for_address(address)?;
        tx.output.push(TxOut {
            value: (amount * coin as f64).round() as i64,
            script_pubkey,
        });
    }

    Ok(tx)
}

pub(crate) fn write_compact_size<W: Write>(w: &mut W, n: u64) -> Result<usize, io::Error> {
    if n < 0xfd {
        w.write_all(&[n as u8])?;
        Ok(1)
    } else if n <= 0xffff {
        w.write_all(&[0xfd])?;
        w.write_all(&(n as u16).to_le_bytes())?;
        Ok(3)
    } else if n <= 0xffff_ffff {
        w.write_all(&[0xfe])?;
        w.write_all(&(n as u32).to_le_bytes())?;
        Ok(5)
    } else {
        w.write_all(&[0xff])?;
        w.write_all(&n.to_le_bytes())?;
        Ok(9)
    }
}

fn read_compact_size<R: Read>(r: &mut R) -> Result<u64, Error> {
    let mut tag = [0u8; 1];
    r.read_exact(&mut tag).map_err(malformed)?;
    match tag[0] {
        0xfd => {
            let mut b = [0u8; 2];
            r.read_exact(&mut b).map_err(malformed)?;
            Ok(u16::from_le_bytes(b) as u64)
        }
        0xfe => {
            let mut b = [0u8; 4];
            r.read_exact(&mut b).map_err(malformed)?;
            Ok(u32::from_le_bytes(b) as u64)
        }
        0xff => {
            let mut b = [0u8; 8];
            r.read_exact(&mut b).map_err(malformed)?;
            Ok(u64::from_le_bytes(b))
        }
        n => Ok(n as u64),
    }
}

/// Serialize a script as a length-prefixed byte vector, the form used both on
/// the wire and inside signature-hash preimages.
pub(crate) fn write_script<W: Write>(w: &mut W, script: &Script) -> Result<usize, io::Error> {
    let bytes = script.as_bytes();
    let len = write_compact_size(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(len + bytes.len())
}

fn read_script<R: Read>(r: &mut R) -> Result<Script, Error> {
    let len = read_compact_size(r)?;
    if len > 10_000_000 {
        return Err(Error::Transaction("script too large"));
    }
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes).map_err(malformed)?;
    Ok(Script::from(bytes))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, Error> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).map_err(malformed)?;
    Ok(u32::from_le_bytes(b))
}

fn malformed(_: io::Error) -> Error {
    Error::Transaction("unexpected end of transaction data")
}
