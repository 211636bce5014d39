//! HTLC scripts guarding swap deposits. The redeem script encodes two
//! mutually exclusive spend paths: a timelocked refund for the depositor and
//! an immediate redeem for the counterparty who presents the 33-byte secret
//! whose HASH160 is committed in the script. Publishing that secret on-chain
//! is what lets the other side complete their own redeem.

use bitcoin::blockdata::opcodes::{all, OP_FALSE, OP_TRUE};
use bitcoin::blockdata::script::{Builder, Script};
use bitcoin::hashes::{hash160, Hash};
use bitcoin::secp256k1::PublicKey;

/// Final input sequence, disables locktime enforcement for the input.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// HASH160 of a compressed public key, the 20-byte id pushed into scripts.
pub fn key_id(pubkey: &PublicKey) -> [u8; 20] {
    hash160::Hash::hash(&pubkey.serialize()).into_inner()
}

/// Build the deposit redeem script.
///
/// The `IF` branch refunds the depositor key after `lock_time` (absolute,
/// enforced with `OP_CHECKLOCKTIMEVERIFY`); the `ELSE` branch pays the
/// counterparty key immediately, provided a 33-byte preimage hashing to
/// `x_key_id` is revealed.
pub fn deposit_script(lock_time: u32, counterparty_key_id: &[u8], x_key_id: &[u8]) -> Script {
    Builder::new()
        .push_opcode(all::OP_IF)
        .push_int(lock_time as i64)
        .push_opcode(all::OP_CLTV)
        .push_opcode(all::OP_DROP)
        .push_opcode(all::OP_DUP)
        .push_opcode(all::OP_HASH160)
        .push_slice(counterparty_key_id)
        .push_opcode(all::OP_EQUALVERIFY)
        .push_opcode(all::OP_CHECKSIG)
        .push_opcode(all::OP_ELSE)
        .push_opcode(all::OP_DUP)
        .push_opcode(all::OP_HASH160)
        .push_slice(counterparty_key_id)
        .push_opcode(all::OP_EQUALVERIFY)
        .push_opcode(all::OP_CHECKSIGVERIFY)
        .push_opcode(all::OP_SIZE)
        .push_int(33)
        .push_opcode(all::OP_EQUALVERIFY)
        .push_opcode(all::OP_HASH160)
        .push_slice(x_key_id)
        .push_opcode(all::OP_EQUAL)
        .push_opcode(all::OP_ENDIF)
        .into_script()
}

/// Input script spending the refund path: `<sig> <pubkey> OP_TRUE <redeem>`.
pub fn refund_spend_script(signature: &[u8], pubkey: &[u8], redeem: &[u8]) -> Script {
    Builder::new()
        .push_slice(signature)
        .push_slice(pubkey)
        .push_opcode(OP_TRUE)
        .push_slice(redeem)
        .into_script()
}

/// Input script spending the redeem path:
/// `<preimage> <sig> <pubkey> OP_FALSE <redeem>`.
pub fn payment_spend_script(
    x_pubkey: &[u8],
    signature: &[u8],
    pubkey: &[u8],
    redeem: &[u8],
) -> Script {
    Builder::new()
        .push_slice(x_pubkey)
        .push_slice(signature)
        .push_slice(pubkey)
        .push_opcode(OP_FALSE)
        .push_slice(redeem)
        .into_script()
}

/// Recover the hashlock from a deposit redeem script. The script ends with
/// `OP_HASH160 <20B> OP_EQUAL OP_ENDIF`; anything else is not a deposit
/// script.
pub fn x_key_id_from_deposit_script(script: &[u8]) -> Option<[u8; 20]> {
    let n = script.len();
    if n < 24
        || script[n - 1] != all::OP_ENDIF.into_u8()
        || script[n - 2] != all::OP_EQUAL.into_u8()
        || script[n - 23] != 0x14
        || script[n - 24] != all::OP_HASH160.into_u8()
    {
        return None;
    }
    let mut id = [0u8; 20];
    id.copy_from_slice(&script[n - 22..n - 2]);
    Some(id)
}

/// Sequence for a refund input. CLTV requires a non-final sequence, so when
/// a locktime is set the sequence drops to `SEQUENCE_FINAL - 1`.
pub fn refund_sequence(lock_time: u32) -> u32 {
    if lock_time > 0 {
        SEQUENCE_FINAL - 1
    } else {
        SEQUENCE_FINAL
    }
}
