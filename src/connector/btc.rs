//! Base connector for BTC-style chains: legacy sighash signing, base58check
//! address codec and the fixed per-byte fee model. Chain variants wrap this
//! connector and override what their consensus rules change.

use bitcoin::blockdata::opcodes::all;
use bitcoin::blockdata::script::{Builder, Script};
use bitcoin::hashes::{hash160, sha256d, Hash};
use bitcoin::secp256k1::rand::thread_rng;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::util::base58;
use bitcoin::Txid;
use log::warn;

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use super::tx::{assemble_transaction, RawTransaction, TxIn, XTxIn};
use super::{Error, WalletConnector, WalletParam, WalletRpc, SERVICE_NODE_FEE};
use crate::script::{payment_spend_script, refund_sequence, refund_spend_script};
use crate::sighash::{signature_hash_legacy, SigHashType};

/// Dust threshold applied when the chain configuration does not set one.
const DEFAULT_DUST: u64 = 546;

/// Connector for chains signed with the legacy whole-transaction sighash.
pub struct BtcWalletConnector {
    pub(crate) params: WalletParam,
    pub(crate) rpc: Arc<dyn WalletRpc>,
    pub(crate) secp: Secp256k1<All>,
}

impl BtcWalletConnector {
    pub fn new(params: WalletParam, rpc: Arc<dyn WalletRpc>) -> Self {
        BtcWalletConnector {
            params,
            rpc,
            secp: Secp256k1::new(),
        }
    }

    /// Locking script for a legacy address of this chain.
    pub(crate) fn script_pubkey_for_address(&self, address: &str) -> Result<Script, Error> {
        let payload = base58::from_check(address)
            .map_err(|_| Error::InvalidAddress(address.to_owned()))?;
        if payload.len() != 21 {
            return Err(Error::InvalidAddress(address.to_owned()));
        }
        let hash = &payload[1..21];
        if payload[0] == self.params.addr_prefix {
            Ok(Builder::new()
                .push_opcode(all::OP_DUP)
                .push_opcode(all::OP_HASH160)
                .push_slice(hash)
                .push_opcode(all::OP_EQUALVERIFY)
                .push_opcode(all::OP_CHECKSIG)
                .into_script())
        } else if payload[0] == self.params.script_prefix {
            Ok(Builder::new()
                .push_opcode(all::OP_HASH160)
                .push_slice(hash)
                .push_opcode(all::OP_EQUAL)
                .into_script())
        } else {
            Err(Error::InvalidAddress(address.to_owned()))
        }
    }

    /// Assemble the unsigned spend, then finalize it with the computed input
    /// script. Shared by the refund and payment paths.
    pub(crate) fn finalize_spend(
        &self,
        tx_unsigned: &RawTransaction,
        script_sig: Script,
        sequence: u32,
    ) -> RawTransaction {
        let mut tx = RawTransaction::new(
            tx_unsigned.version,
            tx_unsigned.time,
            tx_unsigned.lock_time,
        );
        tx.input.push(TxIn {
            prevout: tx_unsigned.input[0].prevout,
            script_sig,
            sequence,
        });
        tx.output = tx_unsigned.output.clone();
        tx
    }

    pub(crate) fn assemble_unsigned(
        &self,
        inputs: &[XTxIn],
        outputs: &[(String, f64)],
        lock_time: u32,
    ) -> Result<RawTransaction, Error> {
        assemble_transaction(
            inputs,
            outputs,
            self.params.coin,
            self.params.tx_version,
            lock_time,
            self.params.tx_with_time_field,
            |a| self.script_pubkey_for_address(a),
        )
    }

    /// Report the txid the wallet decoder assigns to `raw`. A decoder
    /// failure fails the construction.
    pub(crate) fn decoded_txid(&self, raw: &str) -> Result<String, Error> {
        self.rpc.decode_raw_transaction(raw).map_err(|e| {
            warn!(
                "{}: decode of signed transaction failed: {}",
                self.params.currency, e
            );
            e
        })
    }

    fn fee_for_bytes(&self, bytes: u64) -> f64 {
        let fee = bytes * self.params.fee_per_byte;
        let fee = fee.max(self.params.min_tx_fee);
        fee as f64 / self.params.coin as f64
    }
}

impl WalletConnector for BtcWalletConnector {
    fn currency(&self) -> &str {
        &self.params.currency
    }

    fn params(&self) -> &WalletParam {
        &self.params
    }

    fn init(&self) -> bool {
        self.rpc.get_info().is_ok()
    }

    fn get_unspent(&self, exclude: &HashSet<crate::utxo::UtxoEntry>) -> Result<Vec<crate::utxo::UtxoEntry>, Error> {
        let mut outputs = self.rpc.list_unspent()?;
        outputs.retain(|u| !exclude.contains(u));
        Ok(outputs)
    }

    fn get_wallet_balance(
        &self,
        exclude: &HashSet<crate::utxo::UtxoEntry>,
        address: &str,
    ) -> Result<f64, Error> {
        let outputs = self.get_unspent(exclude)?;
        Ok(outputs
            .iter()
            .filter(|u| address.is_empty() || u.address == address)
            .map(|u| u.amount)
            .sum())
    }

    fn get_block_count(&self) -> Result<u32, Error> {
        self.rpc.get_block_count()
    }

    fn get_block_hash(&self, height: u32) -> Result<String, Error> {
        self.rpc.get_block_hash(height)
    }

    fn get_transactions_in_block(&self, block_hash: &str) -> Result<Vec<String>, Error> {
        self.rpc.get_transactions_in_block(block_hash)
    }

    fn get_raw_mempool(&self) -> Result<Vec<String>, Error> {
        self.rpc.get_raw_mempool()
    }

    fn is_utxo_spent_in_tx(
        &self,
        txid: &str,
        outpoint_txid: &str,
        outpoint_vout: u32,
    ) -> Result<bool, Error> {
        let raw = self.rpc.get_raw_transaction(txid)?;
        let tx = RawTransaction::from_hex(&raw, self.params.tx_with_time_field)?;
        let target =
            Txid::from_str(outpoint_txid).map_err(|_| Error::Transaction("invalid txid"))?;
        Ok(tx
            .input
            .iter()
            .any(|i| i.prevout.txid == target && i.prevout.vout == outpoint_vout))
    }

    fn get_raw_transaction(&self, txid: &str) -> Result<String, Error> {
        self.rpc.get_raw_transaction(txid)
    }

    fn send_raw_transaction(&self, raw: &str) -> Result<String, Error> {
        self.rpc.send_raw_transaction(raw)
    }

    fn script_pubkey(&self, address: &str) -> Result<Script, Error> {
        self.script_pubkey_for_address(address)
    }

    fn sign_raw_transaction(&self, raw: &str) -> Result<String, Error> {
        self.rpc.sign_raw_transaction(raw)
    }

    fn to_x_addr(&self, address: &str) -> Result<Vec<u8>, Error> {
        let payload = base58::from_check(address)
            .map_err(|_| Error::InvalidAddress(address.to_owned()))?;
        if payload.len() != 21
            || (payload[0] != self.params.addr_prefix && payload[0] != self.params.script_prefix)
        {
            return Err(Error::InvalidAddress(address.to_owned()));
        }
        Ok(payload[1..21].to_vec())
    }

    fn from_x_addr(&self, raw: &[u8]) -> String {
        let mut payload = Vec::with_capacity(21);
        payload.push(self.params.addr_prefix);
        payload.extend_from_slice(raw);
        base58::check_encode_slice(&payload)
    }

    fn is_valid_address(&self, address: &str) -> bool {
        self.to_x_addr(address).is_ok()
    }

    fn new_key_pair(&self) -> (SecretKey, PublicKey) {
        let privkey = SecretKey::new(&mut thread_rng());
        let pubkey = PublicKey::from_secret_key(&self.secp, &privkey);
        (privkey, pubkey)
    }

    fn get_key_id(&self, pubkey: &PublicKey) -> [u8; 20] {
        hash160::Hash::hash(&pubkey.serialize()).into_inner()
    }

    fn sign(&self, privkey: &SecretKey, hash: &sha256d::Hash) -> Result<Vec<u8>, Error> {
        let msg = Message::from_slice(&hash.into_inner())
            .map_err(|e| Error::Signing(e.to_string()))?;
        let mut sig = self.secp.sign(&msg, privkey);
        sig.normalize_s();
        Ok(sig.serialize_der().to_vec())
    }

    fn sign_message(&self, address: &str, message: &str) -> Result<String, Error> {
        self.rpc.sign_message(address, message)
    }

    fn min_tx_fee1(&self, inputs: u32, outputs: u32) -> f64 {
        self.fee_for_bytes(148 * inputs as u64 + 34 * outputs as u64 + 10)
    }

    fn min_tx_fee2(&self, inputs: u32, outputs: u32) -> f64 {
        self.fee_for_bytes(148 * inputs as u64 + 34 * outputs as u64 + 10)
    }

    fn is_dust_amount(&self, amount: f64) -> bool {
        let threshold = if self.params.dust_amount > 0 {
            self.params.dust_amount
        } else {
            DEFAULT_DUST
        };
        amount * (self.params.coin as f64) < threshold as f64
    }

    fn service_node_fee(&self) -> f64 {
        SERVICE_NODE_FEE
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
        let mut tx_unsigned = self.assemble_unsigned(inputs, outputs, lock_time)?;
        // CLTV requires a non-final sequence when a locktime is set.
        let sequence = refund_sequence(lock_time);
        tx_unsigned.input[0].sequence = sequence;

        let inner = Script::from(inner_script.to_vec());
        let sig_hash_type = SigHashType::all();
        let hash = signature_hash_legacy(&inner, &tx_unsigned, 0, sig_hash_type);
        let mut signature = self.sign(m_privkey, &hash)?;
        signature.push(sig_hash_type.raw() as u8);

        let script_sig = refund_spend_script(&signature, m_pubkey, inner_script);
        let tx = self.finalize_spend(&tx_unsigned, script_sig, sequence);

        let raw = tx.to_hex();
        let txid = self.decoded_txid(&raw)?;
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
        let tx_unsigned = self.assemble_unsigned(inputs, outputs, 0)?;

        let inner = Script::from(inner_script.to_vec());
        let sig_hash_type = SigHashType::all();
        let hash = signature_hash_legacy(&inner, &tx_unsigned, 0, sig_hash_type);
        let mut signature = self.sign(m_privkey, &hash)?;
        signature.push(sig_hash_type.raw() as u8);

        let script_sig = payment_spend_script(x_pubkey, &signature, m_pubkey, inner_script);
        let tx = self.finalize_spend(&tx_unsigned, script_sig, crate::script::SEQUENCE_FINAL);

        let raw = tx.to_hex();
        let txid = self.decoded_txid(&raw)?;
        Ok((txid, raw))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utxo::UtxoEntry;

    /// In-memory wallet used by connector tests.
    pub(crate) struct FakeRpc {
        pub unspent: Vec<UtxoEntry>,
        pub raw_txs: std::collections::HashMap<String, String>,
        pub fail_decode: bool,
    }

    impl Default for FakeRpc {
        fn default() -> Self {
            FakeRpc {
                unspent: Vec::new(),
                raw_txs: std::collections::HashMap::new(),
                fail_decode: false,
            }
        }
    }

    impl WalletRpc for FakeRpc {
        fn get_info(&self) -> Result<u32, Error> {
            Ok(100)
        }
        fn list_unspent(&self) -> Result<Vec<UtxoEntry>, Error> {
            Ok(self.unspent.clone())
        }
        fn get_block_count(&self) -> Result<u32, Error> {
            Ok(100)
        }
        fn get_block_hash(&self, height: u32) -> Result<String, Error> {
            Ok(format!("hash{}", height))
        }
        fn get_transactions_in_block(&self, _h: &str) -> Result<Vec<String>, Error> {
            Ok(Vec::new())
        }
        fn get_raw_mempool(&self) -> Result<Vec<String>, Error> {
            Ok(Vec::new())
        }
        fn get_raw_transaction(&self, txid: &str) -> Result<String, Error> {
            self.raw_txs
                .get(txid)
                .cloned()
                .ok_or_else(|| Error::rpc("no such transaction"))
        }
        fn decode_raw_transaction(&self, raw: &str) -> Result<String, Error> {
            if self.fail_decode {
                return Err(Error::rpc("decode failed"));
            }
            let tx = RawTransaction::from_hex(raw, false)?;
            Ok(tx.txid().to_string())
        }
        fn send_raw_transaction(&self, raw: &str) -> Result<String, Error> {
            self.decode_raw_transaction(raw)
        }
        fn sign_raw_transaction(&self, raw: &str) -> Result<String, Error> {
            Ok(raw.to_owned())
        }
        fn sign_message(&self, _a: &str, _m: &str) -> Result<String, Error> {
            Ok(base64::encode(vec![7u8; 65]))
        }
        fn is_valid_address(&self, _a: &str) -> Result<bool, Error> {
            Ok(true)
        }
    }

    pub(crate) fn test_params(currency: &str) -> WalletParam {
        WalletParam {
            currency: currency.to_owned(),
            title: currency.to_owned(),
            address: String::new(),
            ip: "127.0.0.1".to_owned(),
            port: "8332".to_owned(),
            username: "user".to_owned(),
            password: "pass".to_owned(),
            addr_prefix: 0x00,
            script_prefix: 0x05,
            secret_prefix: 0x80,
            coin: 100_000_000,
            minimum_amount: 0,
            tx_version: 1,
            dust_amount: 0,
            method: super::super::CreateTxMethod::Btc,
            get_new_key_supported: true,
            import_with_no_scan_supported: true,
            min_tx_fee: 10_000,
            block_time: 600,
            fee_per_byte: 20,
            required_confirmations: 1,
            tx_with_time_field: false,
            lock_coins_supported: false,
            json_version: String::new(),
            content_type: String::new(),
        }
    }

    pub(crate) fn connector() -> BtcWalletConnector {
        BtcWalletConnector::new(test_params("BTC"), Arc::new(FakeRpc::default()))
    }

    fn refund_fixture(
        conn: &dyn WalletConnector,
    ) -> (Vec<XTxIn>, Vec<(String, f64)>, Vec<u8>, SecretKey, Vec<u8>) {
        let (privkey, pubkey) = conn.new_key_pair();
        let key_id = conn.get_key_id(&pubkey);
        let inner = crate::script::deposit_script(600_000, &key_id, &key_id);
        let inputs = vec![XTxIn::new(
            "0000000000000000000000000000000000000000000000000000000000000000".into(),
            0,
            0.00012,
        )];
        let outputs = vec![(conn.from_x_addr(&key_id), 0.00012)];
        (
            inputs,
            outputs,
            pubkey.serialize().to_vec(),
            privkey,
            inner.as_bytes().to_vec(),
        )
    }

    #[test]
    fn address_roundtrip() {
        let conn = connector();
        let addr = conn.from_x_addr(&[0x8au8; 20]);
        assert!(conn.is_valid_address(&addr));
        assert_eq!(conn.to_x_addr(&addr).unwrap(), vec![0x8au8; 20]);
    }

    #[test]
    fn rejects_foreign_prefix() {
        let conn = connector();
        // A script-prefix payload decodes, an unknown prefix does not.
        let p2sh = base58::check_encode_slice(&{
            let mut v = vec![0x05u8];
            v.extend_from_slice(&[1u8; 20]);
            v
        });
        assert!(conn.to_x_addr(&p2sh).is_ok());
        let foreign = base58::check_encode_slice(&{
            let mut v = vec![0x6fu8];
            v.extend_from_slice(&[1u8; 20]);
            v
        });
        assert!(conn.to_x_addr(&foreign).is_err());
    }

    #[test]
    fn fee_model_respects_minimum() {
        let conn = connector();
        // One input, one output: 192 bytes * 20 sat < 10000 sat minimum.
        assert_eq!(conn.min_tx_fee1(1, 1), 10_000.0 / 100_000_000.0);
        // Large transactions pay by size.
        let many = conn.min_tx_fee1(100, 3);
        assert!(many > conn.min_tx_fee1(1, 1));
    }

    #[test]
    fn dust_threshold_defaults() {
        let conn = connector();
        assert!(conn.is_dust_amount(0.000001));
        assert!(!conn.is_dust_amount(0.001));
    }

    #[test]
    fn spend_detection_scans_inputs() {
        let target = "e15426c0d1fbb5b78943c8425a9232fdfc1670d77f987707292a77ec6dce5aca";
        let mut spend = RawTransaction::new(1, None, 0);
        spend.input.push(TxIn {
            prevout: bitcoin::OutPoint::new(Txid::from_str(target).unwrap(), 1),
            script_sig: Script::new(),
            sequence: crate::script::SEQUENCE_FINAL,
        });
        let mut rpc = FakeRpc::default();
        rpc.raw_txs.insert("spender".into(), spend.to_hex());

        let conn = BtcWalletConnector::new(test_params("BTC"), Arc::new(rpc));
        assert!(conn.is_utxo_spent_in_tx("spender", target, 1).unwrap());
        assert!(!conn.is_utxo_spent_in_tx("spender", target, 0).unwrap());
    }

    #[test]
    fn refund_transaction_buildable() {
        let conn = connector();
        let (inputs, outputs, pubkey, privkey, inner) = refund_fixture(&conn);
        let (txid, raw) = conn
            .create_refund_transaction(&inputs, &outputs, &pubkey, &privkey, &inner, 600_000)
            .unwrap();
        assert!(!txid.is_empty());

        let tx = RawTransaction::from_hex(&raw, false).unwrap();
        assert_eq!(tx.lock_time, 600_000);
        assert_eq!(tx.input[0].sequence, crate::script::SEQUENCE_FINAL - 1);
    }

    #[test]
    fn payment_transaction_reveals_preimage() {
        let conn = connector();
        let (inputs, outputs, pubkey, privkey, inner) = refund_fixture(&conn);
        let x_pubkey = vec![0x03u8; 33];
        let (_, raw) = conn
            .create_payment_transaction(&inputs, &outputs, &pubkey, &privkey, &x_pubkey, &inner)
            .unwrap();
        let tx = RawTransaction::from_hex(&raw, false).unwrap();
        assert_eq!(tx.lock_time, 0);
        assert!(tx.input[0]
            .script_sig
            .as_bytes()
            .windows(33)
            .any(|w| w == &x_pubkey[..]));
    }

    #[test]
    fn decode_failure_fails_construction() {
        let mut rpc = FakeRpc::default();
        rpc.fail_decode = true;
        let conn = BtcWalletConnector::new(test_params("BTC"), Arc::new(rpc));
        let (inputs, outputs, pubkey, privkey, inner) = refund_fixture(&conn);
        assert!(conn
            .create_refund_transaction(&inputs, &outputs, &pubkey, &privkey, &inner, 600_000)
            .is_err());
    }
}
