//! Signature hashes for HTLC spends. Two algorithms are provided: the
//! fork-aware precomputed-hash variant used by BCH-style chains (with the
//! additional replay-protection transform of the sighash fork value) and the
//! legacy whole-transaction variant used by every other supported chain.
//!
//! Both are pure functions over `(scriptCode, transaction, input index,
//! sighash type, amount, flags)`.

use bitcoin::blockdata::script::Script;
use bitcoin::hashes::{sha256d, Hash, HashEngine};

use std::io;

use crate::connector::tx::{write_script, RawTransaction, TxOut};
use crate::consensus::{self, Decodable, Encodable};

pub const SIGHASH_ALL: u32 = 1;
pub const SIGHASH_NONE: u32 = 2;
pub const SIGHASH_SINGLE: u32 = 3;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Script verification flag activating the fork-id sighash.
pub const SCRIPT_ENABLE_SIGHASH_FORKID: u32 = 1 << 16;
/// Script verification flag activating the replay-protection transform of
/// the fork value.
pub const SCRIPT_ENABLE_REPLAY_PROTECTION: u32 = 1 << 17;

/// Base signature hash types. Base types not defined in this enum may appear
/// on-chain but are treated as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseSigHashType {
    Unsupported,
    All,
    None,
    Single,
}

/// Signature hash type wrapper: the low byte carries the base type and the
/// FORKID / ANYONECANPAY modifiers, the upper 24 bits the fork value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigHashType(u32);

impl Default for SigHashType {
    fn default() -> Self {
        SigHashType(SIGHASH_ALL)
    }
}

impl SigHashType {
    pub fn new(raw: u32) -> Self {
        SigHashType(raw)
    }

    pub fn all() -> Self {
        SigHashType(SIGHASH_ALL)
    }

    pub fn with_base_type(self, base: BaseSigHashType) -> Self {
        let base = match base {
            BaseSigHashType::Unsupported => 0,
            BaseSigHashType::All => SIGHASH_ALL,
            BaseSigHashType::None => SIGHASH_NONE,
            BaseSigHashType::Single => SIGHASH_SINGLE,
        };
        SigHashType((self.0 & !0x1f) | base)
    }

    pub fn with_fork_value(self, fork_id: u32) -> Self {
        SigHashType((fork_id << 8) | (self.0 & 0xff))
    }

    pub fn with_fork_id(self) -> Self {
        SigHashType(self.0 | SIGHASH_FORKID)
    }

    pub fn with_anyone_can_pay(self) -> Self {
        SigHashType(self.0 | SIGHASH_ANYONECANPAY)
    }

    pub fn base_type(&self) -> BaseSigHashType {
        match self.0 & 0x1f {
            SIGHASH_ALL => BaseSigHashType::All,
            SIGHASH_NONE => BaseSigHashType::None,
            SIGHASH_SINGLE => BaseSigHashType::Single,
            _ => BaseSigHashType::Unsupported,
        }
    }

    pub fn fork_value(&self) -> u32 {
        self.0 >> 8
    }

    pub fn is_defined(&self) -> bool {
        let base = self.0 & !(SIGHASH_FORKID | SIGHASH_ANYONECANPAY);
        (SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base)
    }

    pub fn has_fork_id(&self) -> bool {
        self.0 & SIGHASH_FORKID != 0
    }

    pub fn has_anyone_can_pay(&self) -> bool {
        self.0 & SIGHASH_ANYONECANPAY != 0
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl Encodable for SigHashType {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(writer)
    }
}

impl Decodable for SigHashType {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(SigHashType(Decodable::consensus_decode(d)?))
    }
}

fn hash_prevouts(tx: &RawTransaction) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    for txin in &tx.input {
        let mut buf = Vec::new();
        txin.encode_prevout(&mut buf)
            .expect("writing to a Vec never fails");
        engine.input(&buf);
    }
    sha256d::Hash::from_engine(engine)
}

fn hash_sequence(tx: &RawTransaction) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    for txin in &tx.input {
        engine.input(&txin.sequence.to_le_bytes());
    }
    sha256d::Hash::from_engine(engine)
}

fn hash_outputs(outputs: &[TxOut]) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    for txout in outputs {
        let mut buf = Vec::new();
        txout.encode(&mut buf).expect("writing to a Vec never fails");
        engine.input(&buf);
    }
    sha256d::Hash::from_engine(engine)
}

/// Fork-aware signature hash over the precomputed prevout/sequence/output
/// hashes.
///
/// When `SCRIPT_ENABLE_REPLAY_PROTECTION` is set the 24-bit fork value is
/// first replaced with `0xff0000 | (forkValue ^ 0xdead)`; xoring guarantees a
/// value distinct from the original even when it already starts with `0xff`.
/// Returns the all-zero hash when the type does not carry `SIGHASH_FORKID`
/// or the flag is not enabled; callers on fork-id chains never take that
/// path.
pub fn signature_hash(
    script_code: &Script,
    tx: &RawTransaction,
    n_in: usize,
    sig_hash_type: SigHashType,
    amount: i64,
    flags: u32,
) -> sha256d::Hash {
    let mut sig_hash_type = sig_hash_type;
    if flags & SCRIPT_ENABLE_REPLAY_PROTECTION != 0 {
        let new_fork_value = sig_hash_type.fork_value() ^ 0xdead;
        sig_hash_type = sig_hash_type.with_fork_value(0xff0000 | new_fork_value);
    }

    if !(sig_hash_type.has_fork_id() && flags & SCRIPT_ENABLE_SIGHASH_FORKID != 0) {
        return sha256d::Hash::default();
    }

    let zero = sha256d::Hash::default();
    let base = sig_hash_type.base_type();

    let prevouts = if sig_hash_type.has_anyone_can_pay() {
        zero
    } else {
        hash_prevouts(tx)
    };

    let sequences = if !sig_hash_type.has_anyone_can_pay()
        && base != BaseSigHashType::Single
        && base != BaseSigHashType::None
    {
        hash_sequence(tx)
    } else {
        zero
    };

    let outputs = if base != BaseSigHashType::Single && base != BaseSigHashType::None {
        hash_outputs(&tx.output)
    } else if base == BaseSigHashType::Single && n_in < tx.output.len() {
        hash_outputs(&tx.output[n_in..=n_in])
    } else {
        zero
    };

    let mut engine = sha256d::Hash::engine();
    engine.input(&tx.version.to_le_bytes());
    engine.input(&prevouts.into_inner());
    engine.input(&sequences.into_inner());
    let mut outpoint = Vec::new();
    tx.input[n_in]
        .encode_prevout(&mut outpoint)
        .expect("writing to a Vec never fails");
    engine.input(&outpoint);
    let mut code = Vec::new();
    write_script(&mut code, script_code).expect("writing to a Vec never fails");
    engine.input(&code);
    engine.input(&amount.to_le_bytes());
    engine.input(&tx.input[n_in].sequence.to_le_bytes());
    engine.input(&outputs.into_inner());
    engine.input(&tx.lock_time.to_le_bytes());
    engine.input(&sig_hash_type.raw().to_le_bytes());

    sha256d::Hash::from_engine(engine)
}

/// Legacy whole-transaction signature hash used by chains without fork-id
/// signing: script signatures are blanked, the script code substituted into
/// the signed input, and NONE/SINGLE/ANYONECANPAY prune the committed data.
pub fn signature_hash_legacy(
    script_code: &Script,
    tx: &RawTransaction,
    n_in: usize,
    sig_hash_type: SigHashType,
) -> sha256d::Hash {
    // Out-of-range SIGHASH_SINGLE commits to the `1` sentinel.
    if sig_hash_type.base_type() == BaseSigHashType::Single && n_in >= tx.output.len() {
        let mut one = [0u8; 32];
        one[0] = 1;
        return sha256d::Hash::from_inner(one);
    }

    let mut templ = tx.clone();
    for txin in templ.input.iter_mut() {
        txin.script_sig = Script::new();
    }
    templ.input[n_in].script_sig = script_code.clone();

    match sig_hash_type.base_type() {
        BaseSigHashType::None => {
            templ.output.clear();
            for (i, txin) in templ.input.iter_mut().enumerate() {
                if i != n_in {
                    txin.sequence = 0;
                }
            }
        }
        BaseSigHashType::Single => {
            templ.output.truncate(n_in + 1);
            for txout in templ.output.iter_mut().take(n_in) {
                *txout = TxOut::null();
            }
            for (i, txin) in templ.input.iter_mut().enumerate() {
                if i != n_in {
                    txin.sequence = 0;
                }
            }
        }
        _ => {}
    }

    if sig_hash_type.has_anyone_can_pay() {
        templ.input = vec![templ.input[n_in].clone()];
    }

    let mut engine = sha256d::Hash::engine();
    engine.input(&templ.serialize());
    engine.input(&sig_hash_type.raw().to_le_bytes());
    sha256d::Hash::from_engine(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::tx::TxIn;
    use crate::script::{deposit_script, SEQUENCE_FINAL};
    use bitcoin::blockdata::script::Builder;
    use bitcoin::blockdata::transaction::OutPoint;
    use bitcoin::Txid;

    const FLAGS: u32 = SCRIPT_ENABLE_SIGHASH_FORKID | SCRIPT_ENABLE_REPLAY_PROTECTION;

    fn fixture_tx() -> RawTransaction {
        let mut tx = RawTransaction::new(1, None, 0);
        tx.input.push(TxIn {
            prevout: OutPoint::new(Txid::default(), 0),
            script_sig: Script::new(),
            sequence: SEQUENCE_FINAL,
        });
        tx.output.push(TxOut {
            value: 12000,
            script_pubkey: Builder::new().push_slice(&[0x8au8; 20]).into_script(),
        });
        tx
    }

    fn fixture_script() -> Script {
        deposit_script(600_000, &[0x8au8; 20], &[0x8au8; 20])
    }

    fn with_extra_input(mut tx: RawTransaction) -> RawTransaction {
        use bitcoin::hashes::hex::FromHex;
        tx.input.push(TxIn {
            prevout: OutPoint::new(
                Txid::from_hex(
                    "e15426c0d1fbb5b78943c8425a9232fdfc1670d77f987707292a77ec6dce5aca",
                )
                .unwrap(),
                1,
            ),
            script_sig: Script::new(),
            sequence: SEQUENCE_FINAL,
        });
        tx
    }

    fn fixture_tx2() -> RawTransaction {
        let mut tx = with_extra_input(fixture_tx());
        tx.output.push(TxOut {
            value: 34000,
            script_pubkey: Builder::new().push_slice(&[0x9bu8; 20]).into_script(),
        });
        tx
    }

    #[test]
    fn type_transforms() {
        let t = SigHashType::all().with_fork_id();
        assert!(t.has_fork_id());
        assert!(!t.has_anyone_can_pay());
        assert!(t.is_defined());
        assert_eq!(t.base_type(), BaseSigHashType::All);
        assert_eq!(t.raw(), SIGHASH_ALL | SIGHASH_FORKID);

        let t = t.with_fork_value(0xff0000 | (t.fork_value() ^ 0xdead));
        assert_eq!(t.fork_value(), 0xff0000 | 0xdead);
        assert_eq!(t.raw() & 0xff, SIGHASH_ALL | SIGHASH_FORKID);
    }

    #[test]
    fn type_serialization_roundtrip() {
        for raw in [
            SIGHASH_ALL,
            SIGHASH_ALL | SIGHASH_FORKID,
            SIGHASH_SINGLE | SIGHASH_ANYONECANPAY,
            0xffdead41,
        ]
        .iter()
        .copied()
        {
            let t = SigHashType::new(raw);
            let decoded: SigHashType =
                consensus::deserialize(&consensus::serialize(&t)).unwrap();
            assert_eq!(decoded, t);
        }
    }

    #[test]
    fn fork_aware_hash_is_deterministic() {
        let tx = fixture_tx();
        let script = fixture_script();
        let t = SigHashType::all().with_fork_id();

        let h1 = signature_hash(&script, &tx, 0, t, 12000, FLAGS);
        let h2 = signature_hash(&script, &tx, 0, t, 12000, FLAGS);
        assert_eq!(h1, h2);
        assert_ne!(h1, sha256d::Hash::default());
    }

    #[test]
    fn replay_protection_changes_hash() {
        let tx = fixture_tx();
        let script = fixture_script();
        let t = SigHashType::all().with_fork_id();

        let protected = signature_hash(&script, &tx, 0, t, 12000, FLAGS);
        let standard =
            signature_hash(&script, &tx, 0, t, 12000, SCRIPT_ENABLE_SIGHASH_FORKID);
        assert_ne!(protected, standard);
    }

    #[test]
    fn amount_is_committed() {
        let tx = fixture_tx();
        let script = fixture_script();
        let t = SigHashType::all().with_fork_id();

        let h1 = signature_hash(&script, &tx, 0, t, 12000, FLAGS);
        let h2 = signature_hash(&script, &tx, 0, t, 12001, FLAGS);
        assert_ne!(h1, h2);
    }

    #[test]
    fn missing_fork_id_yields_zero() {
        let tx = fixture_tx();
        let script = fixture_script();

        let h = signature_hash(&script, &tx, 0, SigHashType::all(), 12000, FLAGS);
        assert_eq!(h, sha256d::Hash::default());
    }

    #[test]
    fn anyone_can_pay_skips_prevouts() {
        let tx = fixture_tx();
        let script = fixture_script();
        let t = SigHashType::all().with_fork_id();

        let plain = signature_hash(&script, &tx, 0, t, 12000, FLAGS);
        let acp = signature_hash(&script, &tx, 0, t.with_anyone_can_pay(), 12000, FLAGS);
        assert_ne!(plain, acp);
    }

    #[test]
    fn legacy_hash_single_out_of_range() {
        let mut tx = fixture_tx();
        tx.output.clear();
        let t = SigHashType::new(SIGHASH_SINGLE);
        let h = signature_hash_legacy(&fixture_script(), &tx, 0, t);
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(h, sha256d::Hash::from_inner(one));
    }

    #[test]
    fn legacy_hash_commits_to_script_code() {
        let tx = fixture_tx();
        let t = SigHashType::all();
        let h1 = signature_hash_legacy(&fixture_script(), &tx, 0, t);
        let other = Builder::new().push_slice(&[1u8; 20]).into_script();
        let h2 = signature_hash_legacy(&other, &tx, 0, t);
        assert_ne!(h1, h2);
    }

    #[test]
    fn legacy_none_ignores_outputs_and_other_sequences() {
        let tx = fixture_tx2();
        let t = SigHashType::new(SIGHASH_NONE);
        let base = signature_hash_legacy(&fixture_script(), &tx, 0, t);

        // Outputs are cleared from the commitment.
        let mut changed_outputs = tx.clone();
        changed_outputs.output[0].value = 1;
        changed_outputs.output[1].script_pubkey = Script::new();
        assert_eq!(
            signature_hash_legacy(&fixture_script(), &changed_outputs, 0, t),
            base
        );

        // Sequences of the other inputs are zeroed out.
        let mut other_seq = tx.clone();
        other_seq.input[1].sequence = 5;
        assert_eq!(
            signature_hash_legacy(&fixture_script(), &other_seq, 0, t),
            base
        );

        // The signed input's sequence stays committed.
        let mut own_seq = tx;
        own_seq.input[0].sequence = 5;
        assert_ne!(
            signature_hash_legacy(&fixture_script(), &own_seq, 0, t),
            base
        );
    }

    #[test]
    fn legacy_single_commits_to_matching_output_only() {
        let tx = fixture_tx2();
        let t = SigHashType::new(SIGHASH_SINGLE);
        let base = signature_hash_legacy(&fixture_script(), &tx, 0, t);

        // Outputs past the signed index are truncated away.
        let mut later = tx.clone();
        later.output[1].value = 1;
        assert_eq!(
            signature_hash_legacy(&fixture_script(), &later, 0, t),
            base
        );

        let mut matching = tx;
        matching.output[0].value = 1;
        assert_ne!(
            signature_hash_legacy(&fixture_script(), &matching, 0, t),
            base
        );
    }

    #[test]
    fn legacy_anyone_can_pay_drops_other_inputs() {
        let one = fixture_tx();
        let two = with_extra_input(fixture_tx());
        let acp = SigHashType::new(SIGHASH_ALL | SIGHASH_ANYONECANPAY);

        // Only the signed input remains in the commitment.
        assert_eq!(
            signature_hash_legacy(&fixture_script(), &two, 0, acp),
            signature_hash_legacy(&fixture_script(), &one, 0, acp)
        );

        // Without the modifier the extra input is committed.
        let all = SigHashType::all();
        assert_ne!(
            signature_hash_legacy(&fixture_script(), &two, 0, all),
            signature_hash_legacy(&fixture_script(), &one, 0, all)
        );
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn sighash_type_roundtrip(raw in any::<u32>()) {
            let t = SigHashType::new(raw);
            let decoded: SigHashType =
                consensus::deserialize(&consensus::serialize(&t)).unwrap();
            prop_assert_eq!(decoded, t);
        }

        #[test]
        fn fork_value_transform_keeps_low_byte(raw in any::<u32>()) {
            let t = SigHashType::new(raw);
            let transformed = t.with_fork_value(0xff0000 | (t.fork_value() ^ 0xdead));
            prop_assert_eq!(transformed.raw() & 0xff, raw & 0xff);
            // The replay-protected fork value always differs from the
            // original.
            prop_assert_ne!(transformed.fork_value(), t.fork_value());
        }
    }
}
