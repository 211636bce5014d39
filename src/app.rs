//! The exchange coordinator. Owns the connector and session registries, the
//! live and historic order maps, the UTXO reservation registry and the
//! maintenance loops driving retries, expiry and on-chain watches. There is
//! no global instance: embedders construct an [`App`] and thread the handle
//! through; background tasks hold clones.

use bitcoin::blockdata::opcodes::all;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::hex::FromHex;
use bitcoin::hashes::{sha256d, Hash};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::json;

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use crate::connector::tx::{RawTransaction, TxIn};
use crate::connector::{
    BchWalletConnector, BtcWalletConnector, CreateTxMethod, WalletConnector, WalletParam,
    WalletRpc,
};
use crate::error::{Error, Res};
use crate::exchange::Exchange;
use crate::nodes::{find_shuffled_nodes_with_service, has_node_service, NodeDirectory,
    ServiceNodeEntry};
use crate::order::{
    now_micros, CancelReason, Order, OrderId, State, SwapRole, COIN, DEADLINE_TTL, PENDING_TTL,
    TTL,
};
use crate::packet::{pad_currency, Command, Packet, PROTOCOL_VERSION};
use crate::script::SEQUENCE_FINAL;
use crate::session::Session;
use crate::settings::{Settings, StartupOptions};
use crate::timer::{Timer, WorkerPool, TIMER_INTERVAL};
use crate::utxo::{UtxoEntry, UtxoLocker};
use crate::watch;

/// Ticker of the chain carrying service-node fees and the recent-block-hash
/// anchor of order ids.
pub const FEE_CURRENCY: &str = "BLOCK";

/// Fee rate of the fee transaction, in satoshis per byte.
const FEE_TX_PER_BYTE: u64 = 40;

/// Bytes available to the fee transaction OP_RETURN payload, minus the
/// script overhead.
const MAX_DATACARRIER_BYTES: usize = 83 - 3;

/// Seconds a wallet stays on the bad list before the next probe.
const BAD_WALLET_RETRY_SECONDS: u64 = 300;

pub type OrderPtr = Arc<Mutex<Order>>;
pub type ConnectorPtr = Arc<dyn WalletConnector>;

/// Hook delivering outbound envelopes to the P2P layer. An all-zero peer id
/// requests a broadcast.
pub trait PacketSink: Send + Sync {
    fn send(&self, peer_id: &[u8], message: &[u8]);
}

/// Builds the RPC transport for a configured chain. Lives outside the core;
/// returns `None` when no transport can be built from the parameters.
pub trait RpcFactory: Send + Sync {
    fn connect(&self, params: &WalletParam) -> Option<Arc<dyn WalletRpc>>;
}

#[derive(Default)]
struct SessionQueue {
    queue: VecDeque<Arc<Session>>,
    by_addr: HashMap<Vec<u8>, Arc<Session>>,
}

#[derive(Default)]
struct Connectors {
    list: Vec<ConnectorPtr>,
    by_currency: HashMap<String, ConnectorPtr>,
    by_addr: HashMap<Vec<u8>, ConnectorPtr>,
}

#[derive(Default)]
struct OrderMaps {
    live: HashMap<OrderId, OrderPtr>,
    historic: HashMap<OrderId, OrderPtr>,
}

/// Watch bookkeeping. Only order ids are stored; the order and trade
/// records are resolved from their arenas at sweep time, so a watch entry
/// never keeps a retired record alive.
#[derive(Default)]
pub(crate) struct WatchTable {
    pub(crate) entries: HashSet<OrderId>,
    pub(crate) sweeping: bool,
}

#[derive(Default)]
struct WalletRefresh {
    in_progress: bool,
    bad_wallets: HashMap<String, u64>,
}

struct Runtime {
    pool: Arc<WorkerPool>,
    timer: Timer,
}

/// Coordinator context.
pub struct App {
    settings: Settings,
    options: StartupOptions,
    directory: Arc<dyn NodeDirectory>,
    sink: Arc<dyn PacketSink>,
    rpc_factory: Arc<dyn RpcFactory>,

    sessions: Mutex<SessionQueue>,
    connectors: Mutex<Connectors>,
    messages: Mutex<HashSet<[u8; 32]>>,
    orders: Mutex<OrderMaps>,
    pending_packets: Mutex<HashMap<OrderId, Packet>>,
    pub(crate) watch_deposits: Mutex<WatchTable>,
    pub(crate) watch_traders: Mutex<WatchTable>,

    utxos: UtxoLocker,
    /// Serializes whole selection cycles so two orders cannot race between
    /// listing unspents and locking them.
    utxos_order_lock: Mutex<()>,

    exchange: Exchange,
    updating: Mutex<WalletRefresh>,
    runtime: Mutex<Option<Runtime>>,

    stopped: AtomicBool,
    /// Rebroadcasts of open orders that went out without a service-node
    /// reassignment.
    pub stuck_rebroadcasts: AtomicU64,
}

fn hash_message(bytes: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(bytes).into_inner()
}

impl App {
    pub fn new(
        settings: Settings,
        options: StartupOptions,
        directory: Arc<dyn NodeDirectory>,
        sink: Arc<dyn PacketSink>,
        rpc_factory: Arc<dyn RpcFactory>,
    ) -> Arc<App> {
        let mut sessions = SessionQueue::default();
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        for _ in 0..workers {
            let session = Session::new();
            sessions.by_addr.insert(session.addr().to_vec(), session.clone());
            sessions.queue.push_back(session);
        }

        let app = Arc::new(App {
            settings,
            options,
            directory,
            sink,
            rpc_factory,
            sessions: Mutex::new(sessions),
            connectors: Mutex::new(Connectors::default()),
            messages: Mutex::new(HashSet::new()),
            orders: Mutex::new(OrderMaps::default()),
            pending_packets: Mutex::new(HashMap::new()),
            watch_deposits: Mutex::new(WatchTable::default()),
            watch_traders: Mutex::new(WatchTable::default()),
            utxos: UtxoLocker::new(),
            utxos_order_lock: Mutex::new(()),
            exchange: Exchange::new(),
            updating: Mutex::new(WalletRefresh::default()),
            runtime: Mutex::new(None),
            stopped: AtomicBool::new(false),
            stuck_rebroadcasts: AtomicU64::new(0),
        });

        app.exchange.init(!app.settings.exchange_wallets().is_empty());
        app
    }

    pub fn version() -> u32 {
        PROTOCOL_VERSION
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn options(&self) -> &StartupOptions {
        &self.options
    }

    pub fn directory(&self) -> &dyn NodeDirectory {
        self.directory.as_ref()
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn utxos(&self) -> &UtxoLocker {
        &self.utxos
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether this process participates in the exchange at all.
    pub fn is_enabled(&self) -> bool {
        !self.connectors.lock().list.is_empty()
            || self.exchange.is_enabled()
            || (self.options.dx_no_wallets && self.settings.show_all_orders())
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Spawn the worker pool and the maintenance timer.
    pub fn start(self: &Arc<Self>) {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pool = Arc::new(WorkerPool::new(workers));

        let app = self.clone();
        let tick_pool = pool.clone();
        let mut tick: u64 = 0;
        let timer = Timer::start(TIMER_INTERVAL, move || {
            tick += 1;
            app.on_timer(&tick_pool, tick);
        });

        *self.runtime.lock() = Some(Runtime { pool, timer });
        self.stopped.store(false, Ordering::SeqCst);
        info!("exchange coordinator started with {} workers", workers);
    }

    /// Cancel the timer, drain the workers and join all threads. In-flight
    /// RPC results are discarded by their tasks once `stopped` is observed.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping exchange coordinator threads...");
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.timer.shutdown();
            match Arc::try_unwrap(runtime.pool) {
                Ok(pool) => pool.shutdown(),
                Err(_) => warn!("worker pool still referenced at shutdown"),
            }
        }
    }

    /// One maintenance tick; every task is posted onto the workers.
    fn on_timer(self: &Arc<Self>, pool: &Arc<WorkerPool>, tick: u64) {
        if self.is_stopped() {
            return;
        }

        let session = self.session();
        let app = self.clone();
        pool.post(move || session.check_finished_transactions(&app));

        if tick % 2 == 0 {
            let app = self.clone();
            pool.post(move || app.update_active_wallets());
        }

        let app = self.clone();
        pool.post(move || app.check_and_relay_pending_orders());

        let app = self.clone();
        pool.post(move || app.check_and_erase_expired_transactions());

        let servicenode = self.exchange.is_started();
        if !servicenode {
            let app = self.clone();
            pool.post(move || watch::check_watches_on_deposit_spends(&app));
        } else if tick % 40 == 0 {
            let app = self.clone();
            pool.post(move || watch::watch_trader_deposits(&app));
        }

        if self.directory.active_node().is_some() && tick % 12 == 0 {
            let directory = self.directory.clone();
            pool.post(move || directory.send_ping());
        }

        if tick % 2 == 0 {
            let deferred: Vec<Packet> = {
                let mut pp = self.pending_packets.lock();
                pp.drain().map(|(_, p)| p).collect()
            };
            for packet in deferred {
                let session = self.session();
                let app = self.clone();
                pool.post(move || {
                    if let Err(e) = session.process_packet(&app, &packet) {
                        debug!("deferred packet failed: {}", e);
                    }
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Sessions

    /// Next session in rotation; busy sessions are left in the queue and a
    /// fresh one is added instead.
    pub fn session(&self) -> Arc<Session> {
        let mut q = self.sessions.lock();
        if let Some(ptr) = q.queue.pop_front() {
            q.queue.push_back(ptr.clone());
            if !ptr.is_working() {
                return ptr;
            }
        }
        let fresh = Session::new();
        q.by_addr.insert(fresh.addr().to_vec(), fresh.clone());
        q.queue.push_back(fresh.clone());
        fresh
    }

    pub fn session_for_addr(&self, addr: &[u8]) -> Option<Arc<Session>> {
        self.sessions.lock().by_addr.get(addr).cloned()
    }

    // ------------------------------------------------------------------
    // Connectors

    pub fn connectors(&self) -> Vec<ConnectorPtr> {
        self.connectors.lock().list.clone()
    }

    pub fn connector_by_currency(&self, currency: &str) -> Option<ConnectorPtr> {
        self.connectors.lock().by_currency.get(currency).cloned()
    }

    pub fn has_currency(&self, currency: &str) -> bool {
        self.connectors.lock().by_currency.contains_key(currency)
    }

    pub fn available_currencies(&self) -> Vec<String> {
        self.connectors.lock().by_currency.keys().cloned().collect()
    }

    /// Wallets supported across the network, from the node directory.
    pub fn network_currencies(&self) -> Vec<String> {
        let mut coins = BTreeSet::new();
        for node in self.directory.list() {
            if !node.running {
                continue;
            }
            coins.extend(node.services.iter().cloned());
        }
        coins.into_iter().collect()
    }

    pub fn add_connector(&self, conn: ConnectorPtr) {
        let mut c = self.connectors.lock();
        let currency = conn.currency().to_owned();
        c.list.retain(|x| x.currency() != currency);
        c.list.push(conn.clone());
        // Re-point addresses previously registered for this chain.
        let addrs: Vec<Vec<u8>> = c
            .by_addr
            .iter()
            .filter(|(_, x)| x.currency() == currency)
            .map(|(a, _)| a.clone())
            .collect();
        for addr in addrs {
            c.by_addr.insert(addr, conn.clone());
        }
        c.by_currency.insert(currency, conn);
    }

    pub fn remove_connector(&self, currency: &str) {
        let mut c = self.connectors.lock();
        c.list.retain(|x| x.currency() != currency);
        c.by_currency.remove(currency);
        c.by_addr.retain(|_, x| x.currency() != currency);
    }

    /// Register a trade address with its connector so incoming packets for
    /// that address find a session.
    pub fn update_connector(&self, conn: &ConnectorPtr, addr: &[u8], currency: &str) {
        let mut c = self.connectors.lock();
        c.by_addr.insert(addr.to_vec(), conn.clone());
        c.by_currency.insert(currency.to_owned(), conn.clone());
    }

    /// Probe every configured wallet and swap the connector set to the
    /// reachable ones. Probes run on up to `rpcthreads` threads; wallets
    /// that fail enter a cooldown before the next attempt.
    pub fn update_active_wallets(&self) {
        {
            let mut u = self.updating.lock();
            if u.in_progress {
                return;
            }
            u.in_progress = true;
        }
        if self.is_stopped() {
            self.updating.lock().in_progress = false;
            return;
        }

        let wallets = self.settings.exchange_wallets();

        // Disconnect wallets removed from the configuration.
        let to_remove: Vec<String> = {
            let c = self.connectors.lock();
            c.by_currency
                .keys()
                .filter(|cur| !wallets.contains(*cur))
                .cloned()
                .collect()
        };
        for currency in to_remove {
            self.remove_connector(&currency);
        }

        let bad_wallets = self.updating.lock().bad_wallets.clone();
        let now = now_micros() / 1_000_000;

        let mut conns: Vec<ConnectorPtr> = Vec::new();
        for ticker in wallets {
            if let Some(last) = bad_wallets.get(&ticker) {
                if now.saturating_sub(*last) < BAD_WALLET_RETRY_SECONDS {
                    continue;
                }
                self.updating.lock().bad_wallets.remove(&ticker);
            }

            let wp = match self.settings.wallet_param(&ticker) {
                Ok(wp) => wp,
                Err(e) => {
                    error!("{}", e);
                    self.remove_connector(&ticker);
                    continue;
                }
            };

            if wp.method == CreateTxMethod::Eth {
                info!("{}: ETH connectors are not supported", ticker);
                continue;
            }

            let rpc = match self.rpc_factory.connect(&wp) {
                Some(rpc) => rpc,
                None => {
                    error!("{} \"{}\" failed to connect, check the config", wp.currency, wp.title);
                    self.remove_connector(&ticker);
                    continue;
                }
            };

            let conn: ConnectorPtr = match wp.method {
                CreateTxMethod::Bch => Arc::new(BchWalletConnector::new(wp, rpc)),
                _ => Arc::new(BtcWalletConnector::new(wp, rpc)),
            };
            conns.push(conn);
        }

        // Reachability checks fan out to at most `rpcthreads` workers.
        let mut valid: Vec<ConnectorPtr> = Vec::new();
        let mut bad: Vec<ConnectorPtr> = Vec::new();
        if !conns.is_empty() {
            let rpc_threads = self.options.rpc_threads.max(1) as usize;
            let queue = Arc::new(Mutex::new(conns));
            let (tx, rx) = mpsc::channel::<(ConnectorPtr, bool)>();
            let mut handles = Vec::new();
            let total = queue.lock().len();
            for _ in 0..rpc_threads.min(total) {
                let queue = queue.clone();
                let tx = tx.clone();
                handles.push(thread::spawn(move || loop {
                    let conn = match queue.lock().pop() {
                        Some(c) => c,
                        None => break,
                    };
                    let ok = conn.init();
                    if tx.send((conn, ok)).is_err() {
                        break;
                    }
                }));
            }
            drop(tx);
            for (conn, ok) in rx {
                if ok {
                    valid.push(conn);
                } else {
                    bad.push(conn);
                }
            }
            for h in handles {
                let _ = h.join();
            }
        }

        if !self.is_stopped() {
            let mut valid_wallets = HashSet::new();
            for conn in valid {
                info!(
                    "{} \"{}\" connected {}:{}",
                    conn.currency(),
                    conn.params().title,
                    conn.params().ip,
                    conn.params().port
                );
                valid_wallets.insert(conn.currency().to_owned());
                self.add_connector(conn);
            }
            for conn in bad {
                warn!(
                    "{} \"{}\" failed to connect, check the config",
                    conn.currency(),
                    conn.params().title
                );
                self.remove_connector(conn.currency());
                self.updating
                    .lock()
                    .bad_wallets
                    .insert(conn.currency().to_owned(), now);
            }
            self.exchange.load_wallets(valid_wallets);
        }

        self.updating.lock().in_progress = false;
    }

    // ------------------------------------------------------------------
    // Known messages

    pub fn is_known_message(&self, message: &[u8]) -> bool {
        self.messages.lock().contains(&hash_message(message))
    }

    pub fn add_to_known(&self, message: &[u8]) {
        self.add_to_known_hash(hash_message(message));
    }

    fn add_to_known_hash(&self, hash: [u8; 32]) {
        let mut messages = self.messages.lock();
        // Bound the set by the configured mempool cap (64 bytes per hash
        // estimated).
        let max_bytes = self.options.max_mempool_mb as usize * 1_000_000;
        if messages.len() * 64 > max_bytes {
            messages.clear();
        }
        messages.insert(hash);
    }

    // ------------------------------------------------------------------
    // Orders

    pub fn transaction(&self, id: &OrderId) -> Option<OrderPtr> {
        let maps = self.orders.lock();
        if let Some(ptr) = maps.live.get(id) {
            if maps.historic.contains_key(id) {
                error!("duplicate order {}", id);
            }
            return Some(ptr.clone());
        }
        maps.historic.get(id).cloned()
    }

    pub fn transactions(&self) -> HashMap<OrderId, OrderPtr> {
        self.orders.lock().live.clone()
    }

    pub fn history(&self) -> HashMap<OrderId, OrderPtr> {
        self.orders.lock().historic.clone()
    }

    /// Insert a relayed order; an already known live order only refreshes
    /// its timestamp, historic orders are never resurrected.
    pub fn append_transaction(&self, ptr: OrderPtr) {
        let id = ptr.lock().id;
        let mut maps = self.orders.lock();
        if maps.historic.contains_key(&id) {
            return;
        }
        if let Some(existing) = maps.live.get(&id) {
            existing.lock().update_timestamp();
            return;
        }
        maps.live.insert(id, ptr);
    }

    pub fn insert_transaction(&self, ptr: OrderPtr) {
        let id = ptr.lock().id;
        self.orders.lock().live.insert(id, ptr);
    }

    /// Retire an order: move it to history, release its reservations, drop
    /// its deferred packets.
    pub fn move_transaction_to_history(&self, id: &OrderId) {
        let moved = {
            let mut maps = self.orders.lock();
            match maps.live.remove(id) {
                Some(ptr) => {
                    if maps.historic.contains_key(id) {
                        error!("duplicate order {} in history", id);
                        None
                    } else {
                        maps.historic.insert(*id, ptr.clone());
                        Some(ptr)
                    }
                }
                None => None,
            }
        };
        if let Some(ptr) = moved {
            let order = ptr.lock();
            self.unlock_order_coins(&order);
        }
        self.remove_packets(id);
    }

    pub(crate) fn unlock_order_coins(&self, order: &Order) {
        self.utxos.unlock_coins(&order.from_currency, &order.used_coins);
        self.utxos.unlock_fee_utxos(&order.fee_utxos);
    }

    /// Drop cancelled orders older than `min_age_seconds` from both maps.
    pub fn flush_cancelled_orders(&self, min_age_seconds: u64) -> Vec<OrderId> {
        let keep_after = now_micros().saturating_sub(min_age_seconds * 1_000_000);
        let mut flushed = Vec::new();
        let mut maps = self.orders.lock();
        let maps = &mut *maps;
        for map in [&mut maps.live, &mut maps.historic].iter_mut() {
            map.retain(|id, ptr| {
                let order = ptr.lock();
                let drop = order.state == State::Cancelled && order.txtime_us < keep_after;
                if drop {
                    flushed.push(*id);
                }
                !drop
            });
        }
        flushed
    }

    /// Drop foreign orders whose wallets are no longer connected.
    pub fn clear_non_local_orders(&self) {
        let connected: HashSet<String> = {
            let c = self.connectors.lock();
            c.by_currency.keys().cloned().collect()
        };
        let mut maps = self.orders.lock();
        maps.live.retain(|_, ptr| {
            let order = ptr.lock();
            order.is_local()
                || (connected.contains(&order.from_currency)
                    && connected.contains(&order.to_currency))
        });
    }

    // ------------------------------------------------------------------
    // Packets

    pub fn process_later(&self, id: OrderId, packet: &Packet) {
        self.pending_packets.lock().insert(id, packet.clone());
    }

    pub fn remove_packets(&self, id: &OrderId) {
        self.pending_packets.lock().remove(id);
    }

    /// Wrap a packet into the relay envelope and hand it to the P2P layer.
    pub fn send_packet(&self, addr: &[u8], packet: &Packet) {
        if addr.len() != 20 {
            error!("bad send address, {} bytes", addr.len());
            return;
        }
        let mut msg = addr.to_vec();
        msg.extend_from_slice(&now_micros().to_le_bytes());
        msg.extend_from_slice(&packet.body());
        self.add_to_known_hash(hash_message(&msg));
        self.sink.send(addr, &msg);
    }

    pub fn send_packet_broadcast(&self, packet: &Packet) {
        self.send_packet(&[0u8; 20], packet);
    }

    /// Entry point for packets addressed to a peer id.
    pub fn on_message_received(self: &Arc<Self>, id: &[u8], message: &[u8]) {
        if self.is_known_message(message) {
            return;
        }
        self.add_to_known(message);

        if !Packet::check_version(message) {
            return;
        }
        let packet = match Packet::from_bytes(message) {
            Ok(p) => p,
            Err(_) => {
                warn!("incorrect packet received");
                return;
            }
        };
        if !packet.verify() {
            warn!("unsigned packet or signature error");
            return;
        }
        debug!("received message to {} command {:?}", hex::encode(id), packet.command());

        let session = match self.session_for_addr(id) {
            Some(s) => Some(s),
            None => {
                let routed = self.connectors.lock().by_addr.contains_key(id);
                if routed {
                    Some(self.session())
                } else if self.exchange.is_started() {
                    // Service node: process packets addressed to this node.
                    self.directory
                        .active_node()
                        .filter(|n| n.address() == id)
                        .map(|_| self.session())
                } else {
                    None
                }
            }
        };

        if let Some(session) = session {
            if let Err(e) = session.process_packet(self, &packet) {
                debug!("packet processing failed: {}", e);
            }
        }
    }

    /// Entry point for broadcast packets.
    pub fn on_broadcast_received(self: &Arc<Self>, message: &[u8]) {
        if self.is_known_message(message) {
            return;
        }
        self.add_to_known(message);

        if !Packet::check_version(message) {
            return;
        }
        let packet = match Packet::from_bytes(message) {
            Ok(p) => p,
            Err(_) => {
                warn!("incorrect packet received");
                return;
            }
        };
        if !packet.verify() {
            warn!("unsigned packet or signature error");
            return;
        }

        let session = self.session();
        if let Err(e) = session.process_packet(self, &packet) {
            debug!("broadcast processing failed: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Service nodes

    /// Uniform-random node advertising every requested service.
    pub fn find_node_with_service(
        &self,
        services: &BTreeSet<String>,
        not_in: &HashSet<Vec<u8>>,
    ) -> Option<ServiceNodeEntry> {
        find_shuffled_nodes_with_service(
            self.directory.as_ref(),
            services,
            Self::version(),
            not_in,
        )
        .into_iter()
        .next()
    }

    // ------------------------------------------------------------------
    // Maker: create order

    /// Create and announce a new order (role A). Returns the derived order
    /// id. UTXO and fee reservations are fully rolled back on failure.
    pub fn send_transaction(
        &self,
        from: &str,
        from_currency: &str,
        from_amount: u64,
        to: &str,
        to_currency: &str,
        to_amount: u64,
    ) -> Res<OrderId> {
        if from_currency.is_empty()
            || to_currency.is_empty()
            || from_currency.len() > 8
            || to_currency.len() > 8
        {
            warn!("invalid currency pair {}/{}", from_currency, to_currency);
            return Err(Error::InvalidCurrency);
        }
        if from_amount == 0 || to_amount == 0 {
            return Err(Error::InvalidParameters);
        }

        let services: BTreeSet<String> =
            [from_currency.to_owned(), to_currency.to_owned()].iter().cloned().collect();
        let snode = self
            .find_node_with_service(&services, &HashSet::new())
            .ok_or_else(|| {
                error!(
                    "failed to find service node for pair {}/{}",
                    from_currency, to_currency
                );
                Error::NoServiceNode
            })?;

        let conn_from = self
            .connector_by_currency(from_currency)
            .ok_or(Error::NoSession)?;
        let conn_to = self
            .connector_by_currency(to_currency)
            .ok_or(Error::NoSession)?;

        if conn_from.is_dust_amount(from_amount as f64 / COIN as f64)
            || conn_to.is_dust_amount(to_amount as f64 / COIN as f64)
        {
            return Err(Error::Dust);
        }

        // Addresses must decode before anything is reserved.
        let from_raw = conn_from.to_x_addr(from).map_err(Error::from)?;
        let to_raw = conn_to.to_x_addr(to).map_err(Error::from)?;

        // Balance above the smallest supported amount.
        let excluded = self.utxos.all_locked_utxos(from_currency);
        let balance = conn_from
            .get_wallet_balance(&excluded, "")
            .map_err(Error::from)?;
        if balance < from_amount as f64 / COIN as f64 {
            warn!("insufficient funds for <{}>", from_currency);
            return Err(Error::InsufficientFunds);
        }

        // Selection and reservation are one atomic cycle.
        let outputs_for_use = {
            let _guard = self.utxos_order_lock.lock();

            let excluded = self.utxos.all_locked_utxos(from_currency);
            let outputs = conn_from.get_unspent(&excluded).map_err(Error::from)?;

            let (mut selected, utxo_amount, fee1, fee2) =
                select_utxos(from, &outputs, conn_from.as_ref(), from_amount, COIN)
                    .ok_or_else(|| {
                        warn!("insufficient funds for <{}>", from_currency);
                        Error::InsufficientFunds
                    })?;

            debug!(
                "utxo selection for order: amount {} required {} fee1 {} fee2 {}",
                utxo_amount,
                from_amount,
                fee1,
                fee2
            );

            for entry in selected.iter_mut() {
                self.sign_utxo_ownership(conn_from.as_ref(), entry)?;
            }

            if !self.utxos.lock_coins(from_currency, &selected) {
                error!(
                    "failed to create order, cannot reuse utxo inputs for {} across multiple orders",
                    from_currency
                );
                return Err(Error::InsufficientFunds);
            }
            selected
        };

        let created_us = now_micros();
        let block_hash = self.recent_block_hash();
        let id = OrderId::derive(
            from,
            from_currency,
            from_amount,
            to,
            to_currency,
            to_amount,
            created_us,
            &block_hash,
            &outputs_for_use[0].signature,
        );

        let mut order = Order::new(id, SwapRole::Maker);
        order.local = true;
        order.created_us = created_us;
        order.txtime_us = created_us;
        order.from_addr = from.to_owned();
        order.from = from_raw;
        order.from_currency = from_currency.to_owned();
        order.from_amount = from_amount;
        order.to_addr = to.to_owned();
        order.to = to_raw;
        order.to_currency = to_currency.to_owned();
        order.to_amount = to_amount;
        order.block_hash = block_hash;
        order.used_coins = outputs_for_use;
        order.hub_address = snode.address();
        order.s_pubkey = snode.pubkey.clone();

        // Ephemeral keys live on the receiving chain.
        let (m_priv, m_pub) = conn_to.new_key_pair();
        order.m_privkey = Some(m_priv);
        order.m_pubkey = Some(m_pub);
        let (x_priv, x_pub) = conn_to.new_key_pair();
        order.x_privkey = Some(x_priv);
        order.x_pubkey = Some(x_pub);

        info!(
            "using service node {} for order {}",
            hex::encode(&order.s_pubkey),
            id
        );

        self.update_connector(&conn_from, &order.from.clone(), from_currency);
        self.update_connector(&conn_to, &order.to.clone(), to_currency);

        let ptr = Arc::new(Mutex::new(order));
        self.send_pending_transaction(&ptr);
        info!("order created: {}", ptr.lock().log_value());
        self.insert_transaction(ptr);

        Ok(id)
    }

    /// Sign one reserved output with its wallet key and validate shape.
    fn sign_utxo_ownership(
        &self,
        conn: &dyn WalletConnector,
        entry: &mut UtxoEntry,
    ) -> Res<()> {
        let signature = conn
            .sign_message(&entry.address, &entry.signing_message())
            .map_err(|_| {
                warn!("funds not signed <{}>", conn.currency());
                Error::FundsNotSigned
            })?;
        entry.signature = base64::decode(&signature).map_err(|_| {
            warn!("invalid signature <{}>", conn.currency());
            Error::FundsNotSigned
        })?;
        entry.raw_address = conn.to_x_addr(&entry.address).map_err(Error::from)?;
        if entry.signature.len() != 65 {
            error!("incorrect signature length, need 65 bytes");
            return Err(Error::InvalidSignature);
        }
        if entry.raw_address.len() != 20 {
            error!("incorrect raw address length, need 20 bytes");
            return Err(Error::InvalidAddress);
        }
        Ok(())
    }

    /// Hash of the previous-to-tip block of the fee chain (or the first
    /// connected chain), anchoring order ids to recent history.
    fn recent_block_hash(&self) -> [u8; 32] {
        let conn = self
            .connector_by_currency(FEE_CURRENCY)
            .or_else(|| self.connectors().into_iter().next());
        let conn = match conn {
            Some(c) => c,
            None => return [0u8; 32],
        };
        let hash = conn
            .get_block_count()
            .and_then(|h| conn.get_block_hash(h.saturating_sub(1)));
        match hash {
            Ok(s) => sha256d::Hash::from_hex(&s)
                .map(|h| h.into_inner())
                .unwrap_or([0u8; 32]),
            Err(_) => [0u8; 32],
        }
    }

    /// Announce a local order to its service node.
    pub fn send_pending_transaction(&self, ptr: &OrderPtr) -> bool {
        let order = ptr.lock();
        if order.hub_address.is_empty() {
            debug_assert!(false, "no service node defined for order");
            return false;
        }
        if order.from.is_empty() || order.to.is_empty() {
            return false;
        }
        let (m_pub, m_priv) = match (order.m_pubkey, order.m_privkey) {
            (Some(p), Some(s)) => (p, s),
            _ => return false,
        };

        let mut packet = Packet::new(Command::Transaction);
        packet.push_bytes(order.id.as_bytes());
        packet.push_bytes(&order.from);
        packet.push_bytes(&pad_currency(&order.from_currency));
        packet.push_u64(order.from_amount);
        packet.push_bytes(&order.to);
        packet.push_bytes(&pad_currency(&order.to_currency));
        packet.push_u64(order.to_amount);
        packet.push_u64(order.created_us);
        packet.push_bytes(&order.block_hash);
        push_utxo_items(&mut packet, &order.used_coins);

        if packet.sign(&m_pub, &m_priv).is_err() {
            return false;
        }
        let hub = order.hub_address.clone();
        drop(order);

        self.send_packet(&hub, &packet);
        true
    }

    // ------------------------------------------------------------------
    // Taker: accept order

    /// Accept an open order (role B). On any failure after a successful
    /// fee-lock or coin-lock the reservations are released and the prior
    /// state restored.
    pub fn accept_transaction(&self, id: &OrderId, from: &str, to: &str) -> Res<()> {
        let ptr = self.transaction(id).ok_or_else(|| {
            warn!("order {} not found", id);
            Error::TransactionNotFound
        })?;

        let prior_state;
        {
            let mut order = ptr.lock();
            let order = &mut *order;
            if order.state >= State::Accepting {
                warn!("not accepting, order {} already accepted", id);
                return Err(Error::BadRequest);
            }
            prior_state = order.state;
            order.state = State::Accepting;

            // Store the order from the taker's perspective.
            std::mem::swap(&mut order.from_currency, &mut order.to_currency);
            std::mem::swap(&mut order.from_amount, &mut order.to_amount);
            order.from_addr = from.to_owned();
            order.to_addr = to.to_owned();
            order.role = SwapRole::Taker;
        }

        let revert = |order_ptr: &OrderPtr| {
            let mut order = order_ptr.lock();
            let order = &mut *order;
            std::mem::swap(&mut order.from_currency, &mut order.to_currency);
            std::mem::swap(&mut order.from_amount, &mut order.to_amount);
            order.revert_state(prior_state);
        };

        match self.accept_transaction_inner(&ptr, from, to) {
            Ok(()) => Ok(()),
            Err(e) => {
                revert(&ptr);
                Err(e)
            }
        }
    }

    fn accept_transaction_inner(&self, ptr: &OrderPtr, from: &str, to: &str) -> Res<()> {
        let (id, from_currency, to_currency, from_amount, to_amount, s_pubkey) = {
            let order = ptr.lock();
            (
                order.id,
                order.from_currency.clone(),
                order.to_currency.clone(),
                order.from_amount,
                order.to_amount,
                order.s_pubkey.clone(),
            )
        };

        let conn_from = self
            .connector_by_currency(&from_currency)
            .ok_or(Error::NoSession)?;
        let conn_to = self
            .connector_by_currency(&to_currency)
            .ok_or(Error::NoSession)?;

        if conn_from.is_dust_amount(from_amount as f64 / COIN as f64)
            || conn_to.is_dust_amount(to_amount as f64 / COIN as f64)
        {
            return Err(Error::Dust);
        }

        // Addresses must decode before anything is reserved.
        let from_raw = conn_from.to_x_addr(from).map_err(Error::from)?;
        let to_raw = conn_to.to_x_addr(to).map_err(Error::from)?;

        // The service-node fee is paid on the fee chain.
        let conn_fee = self
            .connector_by_currency(FEE_CURRENCY)
            .ok_or(Error::InsufficientFundsDx)?;
        let fee = conn_to.service_node_fee();
        if self.available_fee_balance(&conn_fee)? < fee {
            return Err(Error::InsufficientFundsDx);
        }

        if s_pubkey.len() != 33 {
            warn!(
                "not accepting order {}, bad service node public key length ({})",
                id,
                s_pubkey.len()
            );
            return Err(Error::NoServiceNode);
        }
        let snode = self.directory.get(&s_pubkey).ok_or_else(|| {
            warn!("not accepting order {}, unknown service node", id);
            Error::NoServiceNode
        })?;

        // OP_RETURN metadata: order id (truncated when space is short) and
        // the traded pair.
        let base = json!(["", from_currency, from_amount, to_currency, to_amount]).to_string();
        let mut order_id_text = id.to_string();
        if base.len() + order_id_text.len() > MAX_DATACARRIER_BYTES {
            order_id_text.truncate(MAX_DATACARRIER_BYTES.saturating_sub(base.len()));
        }
        let info = json!([order_id_text, from_currency, from_amount, to_currency, to_amount])
            .to_string();
        if info.len() > MAX_DATACARRIER_BYTES {
            return Err(Error::InvalidOnchainHistory);
        }

        // Fee transaction, then order coins; both under the selection lock.
        {
            let _guard = self.utxos_order_lock.lock();

            let fee_excluded = self.utxos.all_locked_utxos(FEE_CURRENCY);
            let fee_outputs = conn_fee.get_unspent(&fee_excluded).map_err(|_| {
                warn!("insufficient {} funds for service node fee payment", FEE_CURRENCY);
                Error::InsufficientFunds
            })?;

            let (fee_utxos, raw_fee_tx) = self
                .create_fee_transaction(
                    conn_fee.as_ref(),
                    &snode.collateral_address,
                    fee,
                    info.as_bytes(),
                    fee_outputs,
                )
                .map_err(|e| {
                    warn!("order {} not accepted, failed to prepare the service node fee", id);
                    e
                })?;
            self.utxos.lock_fee_utxos(&fee_utxos);

            {
                let mut order = ptr.lock();
                order.fee_utxos = fee_utxos;
                order.raw_fee_tx = raw_fee_tx;
            }

            let result: Res<()> = (|| {
                let excluded = self.utxos.all_locked_utxos(&from_currency);
                let outputs = conn_from.get_unspent(&excluded).map_err(Error::from)?;

                let (mut selected, _amount, _fee1, _fee2) =
                    select_utxos(from, &outputs, conn_from.as_ref(), from_amount, COIN)
                        .ok_or_else(|| {
                            warn!(
                                "not accepting order {}, insufficient funds for <{}>",
                                id, from_currency
                            );
                            Error::InsufficientFunds
                        })?;

                for entry in selected.iter_mut() {
                    self.sign_utxo_ownership(conn_from.as_ref(), entry)?;
                }

                if !self.utxos.lock_coins(&from_currency, &selected) {
                    warn!(
                        "not accepting order {}, cannot reuse utxo inputs for {} across multiple orders",
                        id, from_currency
                    );
                    return Err(Error::InsufficientFunds);
                }
                ptr.lock().used_coins = selected;
                Ok(())
            })();

            if let Err(e) = result {
                let mut order = ptr.lock();
                self.utxos.unlock_fee_utxos(&order.fee_utxos);
                order.fee_utxos.clear();
                return Err(e);
            }
        }

        // Heights and hashes of both chains ride along in the accept.
        let heights = conn_from
            .get_block_count()
            .and_then(|fh| conn_from.get_block_hash(fh).map(|fhash| (fh, fhash)))
            .and_then(|(fh, fhash)| {
                conn_to
                    .get_block_count()
                    .and_then(|th| conn_to.get_block_hash(th).map(|thash| (fh, fhash, th, thash)))
            });
        let (from_height, from_hash, to_height, to_hash) = match heights {
            Ok(h) => h,
            Err(_) => {
                let mut order = ptr.lock();
                self.utxos.unlock_coins(&from_currency, &order.used_coins);
                self.utxos.unlock_fee_utxos(&order.fee_utxos);
                order.clear_used_coins();
                return Err(Error::NoSession);
            }
        };

        {
            let mut order = ptr.lock();
            order.local = true;
            order.from_addr = from.to_owned();
            order.from = from_raw;
            order.to_addr = to.to_owned();
            order.to = to_raw;

            let (m_priv, m_pub) = conn_to.new_key_pair();
            order.m_privkey = Some(m_priv);
            order.m_pubkey = Some(m_pub);
        }

        {
            let order = ptr.lock();
            self.update_connector(&conn_from, &order.from.clone(), &from_currency);
            self.update_connector(&conn_to, &order.to.clone(), &to_currency);
        }

        // Once the accept is on the wire the order is accepted on our side;
        // the hold follows from the service node.
        if self.send_accepting_transaction(ptr, from_height, to_height, &from_hash, &to_hash) {
            let _ = ptr.lock().set_state(State::Accepted);
        }
        info!("order accepted: {}", ptr.lock().log_value());
        Ok(())
    }

    /// Spendable fee-chain balance outside reservations.
    fn available_fee_balance(&self, conn_fee: &ConnectorPtr) -> Res<f64> {
        let excluded = self.utxos.all_locked_utxos(FEE_CURRENCY);
        conn_fee
            .get_wallet_balance(&excluded, "")
            .map_err(Error::from)
    }

    /// Whether the fee chain can cover `fee` outside current reservations.
    pub fn can_afford_fee_payment(&self, fee: f64) -> bool {
        match self.connector_by_currency(FEE_CURRENCY) {
            Some(conn) => matches!(self.available_fee_balance(&conn), Ok(b) if b >= fee),
            None => false,
        }
    }

    /// Build and wallet-sign the service-node fee payment: collateral
    /// output, OP_RETURN metadata, change above dust.
    fn create_fee_transaction(
        &self,
        conn: &dyn WalletConnector,
        collateral_address: &str,
        fee: f64,
        data: &[u8],
        mut available: Vec<UtxoEntry>,
    ) -> Res<(Vec<UtxoEntry>, String)> {
        let coin = conn.params().coin as f64;
        available.sort_by(|a, b| a.amount.partial_cmp(&b.amount).unwrap_or(CmpOrdering::Equal));

        let mut selected: Vec<UtxoEntry> = Vec::new();
        let mut sum = 0f64;
        let mut tx_fee = 0f64;
        for utxo in available {
            selected.push(utxo);
            sum = selected.iter().map(|u| u.amount).sum();
            let bytes = selected.len() as u64 * 148 + 2 * 34 + 10 + data.len() as u64 + 10;
            tx_fee = (bytes * FEE_TX_PER_BYTE) as f64 / coin;
            if sum >= fee + tx_fee {
                break;
            }
        }
        if selected.is_empty() || sum < fee + tx_fee {
            return Err(Error::InsufficientFunds);
        }

        let mut tx = RawTransaction::new(
            conn.params().tx_version,
            if conn.params().tx_with_time_field { Some(0) } else { None },
            0,
        );
        for utxo in &selected {
            let txid = bitcoin::Txid::from_hex(&utxo.txid).map_err(|_| Error::BadRequest)?;
            tx.input.push(TxIn {
                prevout: bitcoin::OutPoint::new(txid, utxo.vout),
                script_sig: bitcoin::Script::new(),
                sequence: SEQUENCE_FINAL,
            });
        }
        tx.output.push(crate::connector::tx::TxOut {
            value: (fee * coin).round() as i64,
            script_pubkey: conn
                .script_pubkey(collateral_address)
                .map_err(Error::from)?,
        });
        tx.output.push(crate::connector::tx::TxOut {
            value: 0,
            script_pubkey: Builder::new()
                .push_opcode(all::OP_RETURN)
                .push_slice(data)
                .into_script(),
        });
        let change = sum - fee - tx_fee;
        if !conn.is_dust_amount(change) {
            tx.output.push(crate::connector::tx::TxOut {
                value: (change * coin).round() as i64,
                script_pubkey: conn
                    .script_pubkey(&selected[0].address)
                    .map_err(Error::from)?,
            });
        }

        let signed = conn
            .sign_raw_transaction(&tx.to_hex())
            .map_err(|_| Error::InsufficientFunds)?;
        Ok((selected, signed))
    }

    /// Send the accept to the order's service node.
    pub fn send_accepting_transaction(
        &self,
        ptr: &OrderPtr,
        from_height: u32,
        to_height: u32,
        from_hash: &str,
        to_hash: &str,
    ) -> bool {
        let order = ptr.lock();
        let (m_pub, m_priv) = match (order.m_pubkey, order.m_privkey) {
            (Some(p), Some(s)) => (p, s),
            _ => return false,
        };

        let mut packet = Packet::new(Command::TransactionAccepting);
        packet.push_bytes(&order.hub_address);
        packet.push_bytes(order.id.as_bytes());
        packet.push_bytes(&order.from);
        packet.push_bytes(&pad_currency(&order.from_currency));
        packet.push_u64(order.from_amount);
        packet.push_u32(from_height);
        packet.push_bytes(&hash_prefix8(from_hash));
        packet.push_bytes(&order.to);
        packet.push_bytes(&pad_currency(&order.to_currency));
        packet.push_u64(order.to_amount);
        packet.push_u32(to_height);
        packet.push_bytes(&hash_prefix8(to_hash));
        push_utxo_items(&mut packet, &order.used_coins);

        if packet.sign(&m_pub, &m_priv).is_err() {
            return false;
        }
        let hub = order.hub_address.clone();
        drop(order);

        self.send_packet(&hub, &packet);
        true
    }

    // ------------------------------------------------------------------
    // Cancel

    /// Cancel a local order not yet committed on-chain.
    pub fn cancel_transaction(&self, id: &OrderId, reason: CancelReason) -> Res<()> {
        let ptr = self.transaction(id).ok_or(Error::TransactionNotFound)?;
        {
            let order = ptr.lock();
            if !order.is_local() {
                info!("order {} not found or not local", id);
                return Err(Error::TransactionNotFound);
            }
            if order.state > State::Created {
                info!("order {} already in work", id);
                return Err(Error::InvalidState);
            }
            if self.connector_by_currency(&order.from_currency).is_none() {
                warn!("no session for <{}>", order.from_currency);
                return Err(Error::NoSession);
            }
        }

        let session = self.session();
        session.send_cancel_transaction(self, &ptr, reason);
        Ok(())
    }

    /// Cancel every local order; on a service node, cancel every pending
    /// trade instead.
    pub fn cancel_my_transactions(&self) {
        if self.exchange.is_started() {
            let session = self.session();
            for trade in self.exchange.pending_transactions() {
                let id = trade.lock().id;
                session.send_trade_cancel(self, &id, CancelReason::Timeout);
            }
            return;
        }

        for (id, ptr) in self.transactions() {
            if ptr.lock().is_local() {
                let _ = self.cancel_transaction(&id, CancelReason::UserRequest);
            }
        }
    }

    // ------------------------------------------------------------------
    // Rebroadcast & reselection

    /// Re-send stuck local orders, moving unresponsive service nodes into
    /// the exclusion set.
    pub fn check_and_relay_pending_orders(&self) {
        let txs = self.transactions();
        for ptr in txs.values() {
            let mut order = match ptr.try_lock() {
                Some(o) => o,
                None => continue,
            };
            if !order.is_local() {
                continue;
            }

            let age = order.age_seconds();
            match order.state {
                State::New if age >= 15 => {
                    if !self.reassign_servicenode(&mut order) {
                        info!(
                            "order {} may be stuck, trying to submit order to previous service node",
                            order.id
                        );
                    }
                    order.update_timestamp();
                    drop(order);
                    self.send_pending_transaction(ptr);
                }
                State::Pending if age >= 240 => {
                    order.update_timestamp();
                    let serves_both = has_node_service(
                        self.directory.as_ref(),
                        &order.s_pubkey,
                        &order.from_currency,
                    ) && has_node_service(
                        self.directory.as_ref(),
                        &order.s_pubkey,
                        &order.to_currency,
                    );
                    if !serves_both && !self.reassign_servicenode(&mut order) {
                        info!(
                            "failed to find service node, order {} may be stuck",
                            order.id
                        );
                        self.stuck_rebroadcasts.fetch_add(1, Ordering::Relaxed);
                    }
                    drop(order);
                    // Resend regardless, a reassignment failure should not
                    // stall the order.
                    self.send_pending_transaction(ptr);
                }
                _ => {}
            }
        }
    }

    /// Pick a new service node outside the order's exclusion set. The
    /// current node joins the exclusion set only when a replacement exists.
    fn reassign_servicenode(&self, order: &mut Order) -> bool {
        let mut not_in = order.excluded_nodes.clone();
        if !order.s_pubkey.is_empty() {
            not_in.insert(order.s_pubkey.clone());
        }
        let services: BTreeSet<String> = [
            order.from_currency.clone(),
            order.to_currency.clone(),
        ]
        .iter()
        .cloned()
        .collect();

        match self.find_node_with_service(&services, &not_in) {
            Some(node) => {
                order.assign_servicenode(node.address(), node.pubkey);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Expiry

    /// Age out stale orders: new orders go offline, open orders expire, expired
    /// and offline orders are erased after the TTL, stuck open orders
    /// are hard-erased at the deadline.
    pub fn check_and_erase_expired_transactions(&self) {
        self.exchange.erase_expired_transactions();

        let txs = self.transactions();
        let mut for_erase = Vec::new();
        for (id, ptr) in txs {
            let mut order = match ptr.try_lock() {
                Some(o) => o,
                None => continue,
            };
            let td = order.age_seconds();
            let tc = order.lifetime_seconds();
            match order.state {
                State::New if td > PENDING_TTL => {
                    let _ = order.set_state(State::Offline);
                }
                State::Pending if td > PENDING_TTL => {
                    let _ = order.set_state(State::Expired);
                }
                State::Expired | State::Offline if td > TTL => for_erase.push(id),
                State::Pending if tc > DEADLINE_TTL => for_erase.push(id),
                _ => {}
            }
        }

        for id in for_erase {
            let removed = self.orders.lock().live.remove(&id);
            if let Some(ptr) = removed {
                info!("erasing expired order {}", id);
                let order = ptr.lock();
                self.unlock_order_coins(&order);
            }
        }
    }

    // ------------------------------------------------------------------
    // Watches

    /// Watch a local order's deposit for the counterparty spend.
    pub fn watch_for_spent_deposit(&self, id: OrderId) {
        self.watch_deposits.lock().entries.insert(id);
    }

    pub fn unwatch_spent_deposit(&self, id: &OrderId) {
        self.watch_deposits.lock().entries.remove(id);
    }

    /// Supervise a trade for the refund fallback (service node).
    pub fn watch_trader_deposit(&self, id: OrderId) {
        self.watch_traders.lock().entries.insert(id);
    }

    pub fn unwatch_trader_deposit(&self, id: &OrderId) {
        self.watch_traders.lock().entries.remove(id);
    }
}

/// First eight bytes of a block-hash string, zero padded.
fn hash_prefix8(hash: &str) -> [u8; 8] {
    let mut out = [0u8; 8];
    let bytes = hash.as_bytes();
    let n = bytes.len().min(8);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Append the reserved outputs to a payload:
/// count, then `txid | vout | rawAddress | signature` per entry.
fn push_utxo_items(packet: &mut Packet, coins: &[UtxoEntry]) {
    packet.push_u32(coins.len() as u32);
    for entry in coins {
        let txid = sha256d::Hash::from_hex(&entry.txid)
            .map(|h| h.into_inner())
            .unwrap_or([0u8; 32]);
        packet.push_bytes(&txid);
        packet.push_u32(entry.vout);
        packet.push_bytes(&entry.raw_address);
        packet.push_bytes(&entry.signature);
    }
}

/// Fee-aware greedy UTXO selection.
///
/// Prefers a single output just above the required amount (within a 1000x
/// fee-delta window), then the smallest sufficient output, then accumulates
/// smaller outputs largest-first until the total covers amount plus fees.
/// Returns the selection with its total and both fee components in COIN
/// denomination.
pub fn select_utxos(
    addr: &str,
    outputs: &[UtxoEntry],
    conn: &dyn WalletConnector,
    required_amount: u64,
    coin: u64,
) -> Option<(Vec<UtxoEntry>, u64, u64, u64)> {
    let fee_amount =
        |amt: f64, ins: u32, outs: u32| amt + conn.min_tx_fee1(ins, outs) + conn.min_tx_fee2(1, 1);
    let amt = required_amount as f64 / coin as f64;

    // Candidates sorted by amount, descending.
    let mut utxos: Vec<UtxoEntry> = outputs.to_vec();
    utxos.sort_by(|a, b| b.amount.partial_cmp(&a.amount).unwrap_or(CmpOrdering::Equal));

    let min_amount = fee_amount(amt, 1, 3);
    let mut selected: Vec<UtxoEntry> = Vec::new();
    let mut gt: Vec<UtxoEntry> = Vec::new();
    let mut lt: Vec<UtxoEntry> = Vec::new();

    for utxo in &utxos {
        if utxo.amount >= min_amount
            && utxo.amount < min_amount + (conn.min_tx_fee1(1, 3) + conn.min_tx_fee2(1, 1)) * 1000.0
            && (utxo.address == addr || addr.is_empty())
        {
            selected.push(utxo.clone());
            break;
        } else if utxo.amount >= min_amount {
            gt.push(utxo.clone());
        } else {
            lt.push(utxo.clone());
        }
    }

    if selected.is_empty() {
        if gt.len() == 1 {
            selected.push(gt[0].clone());
        } else if gt.len() > 1 {
            // Smallest sufficient output.
            gt.sort_by(|a, b| a.amount.partial_cmp(&b.amount).unwrap_or(CmpOrdering::Equal));
            selected.push(gt[0].clone());
        } else if lt.len() < 2 {
            return None;
        } else {
            lt.sort_by(|a, b| b.amount.partial_cmp(&a.amount).unwrap_or(CmpOrdering::Equal));
            let mut sel: Vec<UtxoEntry> = Vec::new();
            for utxo in &lt {
                sel.push(utxo.clone());
                let fee1 = conn.min_tx_fee1(sel.len() as u32, 3);
                let fee2 = conn.min_tx_fee2(1, 1);
                let running: f64 = sel.iter().map(|u| u.amount).sum::<f64>() - fee1 - fee2;
                if running >= min_amount {
                    selected.extend(sel.iter().cloned());
                    break;
                }
            }
        }
    }

    if selected.is_empty() {
        return None;
    }

    let utxo_amount: u64 = selected
        .iter()
        .map(|u| (u.amount * coin as f64).round() as u64)
        .sum();
    let fee1 = (conn.min_tx_fee1(selected.len() as u32, 3) * coin as f64).round() as u64;
    let fee2 = (conn.min_tx_fee2(1, 1) * coin as f64).round() as u64;
    Some((selected, utxo_amount, fee1, fee2))
}
