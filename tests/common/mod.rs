//! Shared fixtures: in-memory wallets, a static node directory and a
//! capturing packet sink wired into a coordinator.

#![allow(dead_code)]

use parking_lot::Mutex;

use std::collections::HashMap;
use std::sync::Arc;

use crossbridge_core::app::{App, PacketSink, RpcFactory};
use crossbridge_core::connector::tx::RawTransaction;
use crossbridge_core::connector::{Error as ConnError, WalletParam, WalletRpc};
use crossbridge_core::nodes::{NodeDirectory, ServiceNodeEntry};
use crossbridge_core::settings::{Settings, StartupOptions};
use crossbridge_core::utxo::UtxoEntry;

/// Legacy address with version byte 0 over a constant 20-byte payload.
pub fn addr20(tag: u8) -> String {
    let mut payload = vec![0u8];
    payload.extend_from_slice(&[tag; 20]);
    bitcoin::util::base58::check_encode_slice(&payload)
}

#[derive(Default)]
pub struct ChainState {
    pub unspent: Vec<UtxoEntry>,
    pub block_count: u32,
    pub blocks: HashMap<String, Vec<String>>,
    pub mempool: Vec<String>,
    pub raw_txs: HashMap<String, String>,
    pub sent: Vec<String>,
    pub unreachable: bool,
}

/// In-memory wallet RPC.
pub struct MockRpc {
    pub state: Mutex<ChainState>,
}

impl MockRpc {
    pub fn new() -> Arc<MockRpc> {
        Arc::new(MockRpc {
            state: Mutex::new(ChainState {
                block_count: 100,
                ..ChainState::default()
            }),
        })
    }

    pub fn fund(&self, txid: &str, vout: u32, amount: f64, address: &str) {
        self.state
            .lock()
            .unspent
            .push(UtxoEntry::new(txid.into(), vout, amount, address.into()));
    }
}

fn check(reachable: bool) -> Result<(), ConnError> {
    if reachable {
        Ok(())
    } else {
        Err(ConnError::rpc("wallet unreachable"))
    }
}

impl WalletRpc for MockRpc {
    fn get_info(&self) -> Result<u32, ConnError> {
        let s = self.state.lock();
        check(!s.unreachable)?;
        Ok(s.block_count)
    }

    fn list_unspent(&self) -> Result<Vec<UtxoEntry>, ConnError> {
        Ok(self.state.lock().unspent.clone())
    }

    fn get_block_count(&self) -> Result<u32, ConnError> {
        let s = self.state.lock();
        check(!s.unreachable)?;
        Ok(s.block_count)
    }

    fn get_block_hash(&self, height: u32) -> Result<String, ConnError> {
        Ok(format!("hash{}", height))
    }

    fn get_transactions_in_block(&self, block_hash: &str) -> Result<Vec<String>, ConnError> {
        Ok(self
            .state
            .lock()
            .blocks
            .get(block_hash)
            .cloned()
            .unwrap_or_default())
    }

    fn get_raw_mempool(&self) -> Result<Vec<String>, ConnError> {
        Ok(self.state.lock().mempool.clone())
    }

    fn get_raw_transaction(&self, txid: &str) -> Result<String, ConnError> {
        self.state
            .lock()
            .raw_txs
            .get(txid)
            .cloned()
            .ok_or_else(|| ConnError::rpc("no such transaction"))
    }

    fn decode_raw_transaction(&self, raw: &str) -> Result<String, ConnError> {
        let tx = RawTransaction::from_hex(raw, false)?;
        Ok(tx.txid().to_string())
    }

    fn send_raw_transaction(&self, raw: &str) -> Result<String, ConnError> {
        let txid = self.decode_raw_transaction(raw)?;
        self.state.lock().sent.push(raw.to_owned());
        Ok(txid)
    }

    fn sign_message(&self, _address: &str, _message: &str) -> Result<String, ConnError> {
        Ok(base64::encode(vec![0x17u8; 65]))
    }

    fn sign_raw_transaction(&self, raw: &str) -> Result<String, ConnError> {
        Ok(raw.to_owned())
    }

    fn is_valid_address(&self, _address: &str) -> Result<bool, ConnError> {
        Ok(true)
    }
}

/// Static node directory with an optional active (own) node.
pub struct MockDirectory {
    pub nodes: Mutex<Vec<ServiceNodeEntry>>,
    pub active: Mutex<Option<ServiceNodeEntry>>,
}

impl MockDirectory {
    pub fn new(nodes: Vec<ServiceNodeEntry>) -> Arc<MockDirectory> {
        Arc::new(MockDirectory {
            nodes: Mutex::new(nodes),
            active: Mutex::new(None),
        })
    }
}

impl NodeDirectory for MockDirectory {
    fn list(&self) -> Vec<ServiceNodeEntry> {
        self.nodes.lock().clone()
    }

    fn active_node(&self) -> Option<ServiceNodeEntry> {
        self.active.lock().clone()
    }
}

pub fn snode(tag: u8, services: &[&str]) -> ServiceNodeEntry {
    ServiceNodeEntry {
        pubkey: vec![tag; 33],
        services: services.iter().map(|s| s.to_string()).collect(),
        protocol_version: App::version(),
        collateral_address: addr20(0xC0 | (tag & 0x0f)),
        running: true,
    }
}

/// Records every outbound envelope.
#[derive(Default)]
pub struct CapturingSink {
    pub sent: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
}

impl CapturingSink {
    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Packet bytes of envelope `n` (envelope = peer id, timestamp, packet).
    pub fn packet_bytes(&self, n: usize) -> Vec<u8> {
        self.sent.lock()[n].1[28..].to_vec()
    }

    pub fn peer(&self, n: usize) -> Vec<u8> {
        self.sent.lock()[n].0.clone()
    }
}

impl PacketSink for CapturingSink {
    fn send(&self, peer_id: &[u8], message: &[u8]) {
        self.sent.lock().push((peer_id.to_vec(), message.to_vec()));
    }
}

pub struct MockFactory {
    pub rpcs: Mutex<HashMap<String, Arc<MockRpc>>>,
}

impl RpcFactory for MockFactory {
    fn connect(&self, params: &WalletParam) -> Option<Arc<dyn WalletRpc>> {
        self.rpcs
            .lock()
            .get(&params.currency)
            .cloned()
            .map(|rpc| rpc as Arc<dyn WalletRpc>)
    }
}

pub struct Fixture {
    pub app: Arc<App>,
    pub rpcs: HashMap<String, Arc<MockRpc>>,
    pub sink: Arc<CapturingSink>,
    pub directory: Arc<MockDirectory>,
}

fn config_for(currencies: &[&str]) -> Settings {
    let mut content = format!(
        "[Main]\nExchangeWallets={}\nFullLog=true\n",
        currencies.join(",")
    );
    for currency in currencies {
        content.push_str(&format!(
            "\n[{}]\nTitle={}\nIp=127.0.0.1\nPort=4000\nUsername=u\nPassword=p\n\
             AddressPrefix=0\nScriptPrefix=5\nSecretPrefix=128\nCOIN=100000000\n\
             TxVersion=1\nCreateTxMethod=BTC\nMinTxFee=10000\nBlockTime=60\n\
             FeePerByte=20\nConfirmations=2\n",
            currency, currency
        ));
    }
    Settings::parse(&content)
}

/// Build a coordinator over in-memory wallets for `currencies`, with the
/// given directory, and connect every wallet.
pub fn fixture_with_directory(currencies: &[&str], directory: Arc<MockDirectory>) -> Fixture {
    let mut rpcs = HashMap::new();
    for currency in currencies {
        rpcs.insert(currency.to_string(), MockRpc::new());
    }

    let sink = Arc::new(CapturingSink::default());
    let factory = Arc::new(MockFactory {
        rpcs: Mutex::new(rpcs.clone()),
    });

    let app = App::new(
        config_for(currencies),
        StartupOptions::default(),
        directory.clone(),
        sink.clone(),
        factory,
    );
    app.update_active_wallets();

    Fixture {
        app,
        rpcs,
        sink,
        directory,
    }
}

pub fn fixture(currencies: &[&str]) -> Fixture {
    let services: Vec<&str> = currencies.to_vec();
    let directory = MockDirectory::new(vec![snode(1, &services)]);
    fixture_with_directory(currencies, directory)
}
