//! Connector variant for BCH-style chains. Identical to the base connector
//! except that HTLC spends are signed with the fork-id sighash plus the
//! replay-protection transform, which keeps signatures invalid on the legacy
//! chain the fork split from. Cashaddr text encoding is not consumed here;
//! addresses arrive in the legacy base58 form.

use bitcoin::blockdata::script::Script;
use bitcoin::hashes::sha256d;
use bitcoin::secp256k1::{PublicKey, SecretKey};

use std::collections::HashSet;
use std::sync::Arc;

use super::btc::BtcWalletConnector;
use super::tx::XTxIn;
use super::{Error, WalletConnector, WalletParam, WalletRpc};
use crate::script::{payment_spend_script, refund_sequence, refund_spend_script, SEQUENCE_FINAL};
use crate::sighash::{
    signature_hash, SigHashType, SCRIPT_ENABLE_REPLAY_PROTECTION, SCRIPT_ENABLE_SIGHASH_FORKID,
};
use crate::utxo::UtxoEntry;

const SPEND_FLAGS: u32 = SCRIPT_ENABLE_SIGHASH_FORKID | SCRIPT_ENABLE_REPLAY_PROTECTION;

pub struct BchWalletConnector {
    inner: BtcWalletConnector,
}

impl BchWalletConnector {
    pub fn new(params: WalletParam, rpc: Arc<dyn WalletRpc>) -> Self {
        BchWalletConnector {
            inner: BtcWalletConnector::new(params, rpc),
        }
    }

    fn input_amount(&self, input: &XTxIn) -> i64 {
        (input.amount * self.inner.params.coin as f64).round() as i64
    }
}

impl WalletConnector for BchWalletConnector {
    fn currency(&self) -> &str {
        self.inner.currency()
    }

    fn params(&self) -> &WalletParam {
        self.inner.params()
    }

    fn init(&self) -> bool {
        self.inner.init()
    }

    fn get_unspent(&self, exclude: &HashSet<UtxoEntry>) -> Result<Vec<UtxoEntry>, Error> {
        self.inner.get_unspent(exclude)
    }

    fn get_wallet_balance(
        &self,
        exclude: &HashSet<UtxoEntry>,
        address: &str,
    ) -> Result<f64, Error> {
        self.inner.get_wallet_balance(exclude, address)
    }

    fn get_block_count(&self) -> Result<u32, Error> {
        self.inner.get_block_count()
    }

    fn get_block_hash(&self, height: u32) -> Result<String, Error> {
        self.inner.get_block_hash(height)
    }

    fn get_transactions_in_block(&self, block_hash: &str) -> Result<Vec<String>, Error> {
        self.inner.get_transactions_in_block(block_hash)
    }

    fn get_raw_mempool(&self) -> Result<Vec<String>, Error> {
        self.inner.get_raw_mempool()
    }

    fn is_utxo_spent_in_tx(
        &self,
        txid: &str,
        outpoint_txid: &str,
        outpoint_vout: u32,
    ) -> Result<bool, Error> {
        self.inner.is_utxo_spent_in_tx(txid, outpoint_txid, outpoint_vout)
    }

    fn get_raw_transaction(&self, txid: &str) -> Result<String, Error> {
        self.inner.get_raw_transaction(txid)
    }

    fn send_raw_transaction(&self, raw: &str) -> Result<String, Error> {
        self.inner.send_raw_transaction(raw)
    }

    fn script_pubkey(&self, address: &str) -> Result<Script, Error> {
        self.inner.script_pubkey(address)
    }

    fn sign_raw_transaction(&self, raw: &str) -> Result<String, Error> {
        self.inner.sign_raw_transaction(raw)
    }

    fn to_x_addr(&self, address: &str) -> Result<Vec<u8>, Error> {
        self.inner.to_x_addr(address)
    }

    fn from_x_addr(&self, raw: &[u8]) -> String {
        self.inner.from_x_addr(raw)
    }

    fn is_valid_address(&self, address: &str) -> bool {
        self.inner.is_valid_address(address)
    }

    fn new_key_pair(&self) -> (SecretKey, PublicKey) {
        self.inner.new_key_pair()
    }

    fn get_key_id(&self, pubkey: &PublicKey) -> [u8; 20] {
        self.inner.get_key_id(pubkey)
    }

    fn sign(&self, privkey: &SecretKey, hash: &sha256d::Hash) -> Result<Vec<u8>, Error> {
        self.inner.sign(privkey, hash)
    }

    fn sign_message(&self, address: &str, message: &str) -> Result<String, Error> {
        self.inner.sign_message(address, message)
    }

    fn min_tx_fee1(&self, inputs: u32, outputs: u32) -> f64 {
        self.inner.min_tx_fee1(inputs, outputs)
    }

    fn min_tx_fee2(&self, inputs: u32, outputs: u32) -> f64 {
        self.inner.min_tx_fee2(inputs, outputs)
    }

    fn is_dust_amount(&self, amount: f64) -> bool {
        self.inner.is_dust_amount(amount)
    }

    fn service_node_fee(&self) -> f64 {
        self.inner.service_node_fee()
    }

    fn create_refund_transaction(
        &self,
        inputs: &[XTxIn],
        outputs: &[(String, f64)],
        m_pubkey: &[u8],
        m_privkey: &SecretKey,
        inner_script: &[u8],
        lock_time: u32,
    ) -> Result<(String, String), Error> {
        let mut tx_unsigned = self.inner.assemble_unsigned(inputs, outputs, lock_time)?;
        let sequence = refund_sequence(lock_time);
        tx_unsigned.input[0].sequence = sequence;

        let inner = Script::from(inner_script.to_vec());
        let sig_hash_type = SigHashType::all().with_fork_id();
        let hash = signature_hash(
            &inner,
            &tx_unsigned,
            0,
            sig_hash_type,
            self.input_amount(&inputs[0]),
            SPEND_FLAGS,
        );
        let mut signature = self.inner.sign(m_privkey, &hash)?;
        signature.push(sig_hash_type.raw() as u8);

        let script_sig = refund_spend_script(&signature, m_pubkey, inner_script);
        let tx = self.inner.finalize_spend(&tx_unsigned, script_sig, sequence);

        let raw = tx.to_hex();
        let txid = self.inner.decoded_txid(&raw)?;
        Ok((txid, raw))
    }

    fn create_payment_transaction(
        &self,
        inputs: &[XTxIn],
        outputs: &[(String, f64)],
        m_pubkey: &[u8],
        m_privkey: &SecretKey,
        x_pubkey: &[u8],
        inner_script: &[u8],
    ) -> Result<(String, String), Error> {
        let tx_unsigned = self.inner.assemble_unsigned(inputs, outputs, 0)?;

        let inner = Script::from(inner_script.to_vec());
        let sig_hash_type = SigHashType::all().with_fork_id();
        let hash = signature_hash(
            &inner,
            &tx_unsigned,
            0,
            sig_hash_type,
            self.input_amount(&inputs[0]),
            SPEND_FLAGS,
        );
        let mut signature = self.inner.sign(m_privkey, &hash)?;
        signature.push(sig_hash_type.raw() as u8);

        let script_sig = payment_spend_script(x_pubkey, &signature, m_pubkey, inner_script);
        let tx = self.inner.finalize_spend(&tx_unsigned, script_sig, SEQUENCE_FINAL);

        let raw = tx.to_hex();
        let txid = self.inner.decoded_txid(&raw)?;
        Ok((txid, raw))
    }
}
