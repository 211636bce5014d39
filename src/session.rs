//! Packet processing. A session verifies and dispatches incoming commands,
//! advances the order state machine, keeps the service-node matchmaker in
//! step, and performs the deposit redemptions the watch loops trigger.
//! Sessions are pooled and rotated by the coordinator; each carries its own
//! ephemeral keypair for node-originated packets.

use bitcoin::blockdata::script::Instruction;
use bitcoin::hashes::{hash160, sha256d, Hash};
use bitcoin::secp256k1::rand::thread_rng;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use log::{debug, info, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::app::{App, OrderPtr};
use crate::connector::tx::{RawTransaction, XTxIn};
use crate::connector::{
    RPC_INVALID_ADDRESS_OR_KEY, RPC_VERIFY_ALREADY_IN_CHAIN, RPC_VERIFY_REJECTED,
};
use crate::consensus;
use crate::error::{Error, Res};
use crate::exchange::TraderLeg;
use crate::order::{CancelReason, Order, OrderId, State, SwapRole, COIN};
use crate::packet::{pad_currency, unpad_currency, Command, Packet, PayloadReader};
use crate::script::x_key_id_from_deposit_script;
use crate::utxo::UtxoEntry;

/// One packet-processing context.
pub struct Session {
    addr: Vec<u8>,
    pubkey: PublicKey,
    privkey: SecretKey,
    working: AtomicBool,
}

impl Session {
    pub fn new() -> Arc<Session> {
        let secp = Secp256k1::new();
        let privkey = SecretKey::new(&mut thread_rng());
        let pubkey = PublicKey::from_secret_key(&secp, &privkey);
        let addr = hash160::Hash::hash(&pubkey.serialize()).into_inner().to_vec();
        Arc::new(Session {
            addr,
            pubkey,
            privkey,
            working: AtomicBool::new(false),
        })
    }

    /// Session address, the peer id this session answers for.
    pub fn addr(&self) -> &[u8] {
        &self.addr
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    /// Dispatch one verified packet. The working flag keeps the session out
    /// of the rotation while a packet is in flight.
    pub fn process_packet(&self, app: &App, packet: &Packet) -> Res<()> {
        self.working.store(true, Ordering::SeqCst);
        let result = self.dispatch(app, packet);
        self.working.store(false, Ordering::SeqCst);
        result
    }

    fn dispatch(&self, app: &App, packet: &Packet) -> Res<()> {
        match packet.command() {
            Command::Transaction => self.on_transaction(app, packet),
            Command::TransactionPending => self.on_transaction_pending(app, packet),
            Command::TransactionAccepting => self.on_transaction_accepting(app, packet),
            Command::TransactionHold => self.on_transaction_hold(app, packet),
            Command::TransactionInit => self.on_transaction_init(app, packet),
            Command::TransactionCreated => self.on_transaction_created(app, packet),
            Command::TransactionSigned => self.on_transaction_signed(app, packet),
            Command::TransactionCommited => self.on_transaction_commited(app, packet),
            Command::TransactionFinished => self.on_transaction_finished(app, packet),
            Command::TransactionCancel => self.on_transaction_cancel(app, packet),
            Command::Invalid => Err(Error::BadRequest),
        }
    }

    // ------------------------------------------------------------------
    // Service-node side

    /// Maker announcement. Registers the pending order and relays it to the
    /// network as open.
    fn on_transaction(&self, app: &App, packet: &Packet) -> Res<()> {
        if !app.exchange().is_started() {
            return Ok(());
        }

        let mut r = PayloadReader::new(packet.payload());
        let id = OrderId::from_bytes(r.read_array::<32>()?);
        let from = r.read_bytes(20)?;
        let from_currency = unpad_currency(&r.read_array::<8>()?);
        let from_amount = r.read_u64()?;
        let to = r.read_bytes(20)?;
        let to_currency = unpad_currency(&r.read_array::<8>()?);
        let to_amount = r.read_u64()?;
        let created_us = r.read_u64()?;
        let _block_hash = r.read_array::<32>()?;
        let utxos = read_utxo_items(&mut r)?;

        if from_amount == 0 || to_amount == 0 || utxos.is_empty() {
            return Err(Error::InvalidParameters);
        }
        if !app.exchange().has_wallet(&from_currency) || !app.exchange().has_wallet(&to_currency) {
            debug!(
                "ignoring order {} for unsupported pair {}/{}",
                id, from_currency, to_currency
            );
            return Ok(());
        }

        let leg = TraderLeg {
            source_address: from,
            dest_address: to,
            currency: from_currency.clone(),
            amount: from_amount,
            utxos,
            m_pubkey: packet.pubkey().to_vec(),
            ..TraderLeg::default()
        };
        app.exchange().create_transaction(id, leg);

        // Relay the order as open so takers across the network can list it.
        let (hub_address, hub_pubkey) = match app.directory().active_node() {
            Some(node) => (node.address(), node.pubkey.clone()),
            None => (self.addr.clone(), self.pubkey.serialize().to_vec()),
        };
        let mut reply = Packet::new(Command::TransactionPending);
        reply.push_bytes(id.as_bytes());
        reply.push_bytes(&pad_currency(&from_currency));
        reply.push_u64(from_amount);
        reply.push_bytes(&pad_currency(&to_currency));
        reply.push_u64(to_amount);
        reply.push_bytes(&hub_address);
        reply.push_bytes(&hub_pubkey);
        reply.push_u64(created_us);
        reply
            .sign(&self.pubkey, &self.privkey)
            .map_err(Error::from)?;
        app.send_packet_broadcast(&reply);
        Ok(())
    }

    /// Taker acceptance. Matches the pending order and puts both traders on
    /// hold.
    fn on_transaction_accepting(&self, app: &App, packet: &Packet) -> Res<()> {
        if !app.exchange().is_started() {
            return Ok(());
        }

        let mut r = PayloadReader::new(packet.payload());
        let _hub = r.read_bytes(20)?;
        let id = OrderId::from_bytes(r.read_array::<32>()?);
        let from = r.read_bytes(20)?;
        let from_currency = unpad_currency(&r.read_array::<8>()?);
        let from_amount = r.read_u64()?;
        let _from_height = r.read_u32()?;
        let _from_hash = r.read_array::<8>()?;
        let to = r.read_bytes(20)?;
        let to_currency = unpad_currency(&r.read_array::<8>()?);
        let to_amount = r.read_u64()?;
        let _to_height = r.read_u32()?;
        let _to_hash = r.read_array::<8>()?;
        let utxos = read_utxo_items(&mut r)?;

        if from_amount == 0 || to_amount == 0 || utxos.is_empty() {
            return Err(Error::InvalidParameters);
        }
        if !app.exchange().has_wallet(&from_currency) || !app.exchange().has_wallet(&to_currency) {
            return Ok(());
        }

        let leg = TraderLeg {
            source_address: from,
            dest_address: to,
            currency: from_currency,
            amount: from_amount,
            utxos,
            m_pubkey: packet.pubkey().to_vec(),
            ..TraderLeg::default()
        };

        match app.exchange().accept_transaction(id, leg) {
            Some(trade) => {
                let (a_addr, b_addr) = {
                    let t = trade.lock();
                    (t.a.source_address.clone(), t.b.source_address.clone())
                };
                for addr in [a_addr, b_addr].iter() {
                    let mut hold = Packet::new(Command::TransactionHold);
                    hold.push_bytes(id.as_bytes());
                    hold.push_bytes(addr);
                    hold.sign(&self.pubkey, &self.privkey)
                        .map_err(Error::from)?;
                    app.send_packet(addr, &hold);
                }
                Ok(())
            }
            None => {
                debug!("accept of order {} rejected by the matchmaker", id);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Trader side

    /// Relay confirmation or a foreign open order for the book.
    fn on_transaction_pending(&self, app: &App, packet: &Packet) -> Res<()> {
        let mut r = PayloadReader::new(packet.payload());
        let id = OrderId::from_bytes(r.read_array::<32>()?);
        let from_currency = unpad_currency(&r.read_array::<8>()?);
        let from_amount = r.read_u64()?;
        let to_currency = unpad_currency(&r.read_array::<8>()?);
        let to_amount = r.read_u64()?;
        let hub_address = r.read_bytes(20)?;
        let s_pubkey = r.read_bytes(33)?;
        let created_us = r.read_u64()?;

        if let Some(ptr) = app.transaction(&id) {
            let mut order = ptr.lock();
            if order.is_local() && order.state == State::New {
                order.set_state(State::Pending)?;
            }
            order.update_timestamp();
            return Ok(());
        }

        // A foreign order is only listed when both wallets are usable here,
        // unless the embedder asked for the full book.
        let visible = (app.has_currency(&from_currency) && app.has_currency(&to_currency))
            || (app.options().dx_no_wallets && app.settings().show_all_orders());
        if !visible {
            return Ok(());
        }

        let mut order = Order::new(id, SwapRole::Maker);
        order.from_currency = from_currency;
        order.from_amount = from_amount;
        order.to_currency = to_currency;
        order.to_amount = to_amount;
        order.hub_address = hub_address;
        order.s_pubkey = s_pubkey;
        order.created_us = created_us;
        order.set_state(State::Pending)?;
        app.append_transaction(Arc::new(parking_lot::Mutex::new(order)));
        Ok(())
    }

    /// Look up the order a settlement packet refers to. A missing order may
    /// simply not have arrived yet; the packet is parked for a later tick.
    fn local_order(&self, app: &App, packet: &Packet) -> Res<Option<(OrderPtr, OrderId)>> {
        let mut r = PayloadReader::new(packet.payload());
        let id = OrderId::from_bytes(r.read_array::<32>()?);
        match app.transaction(&id) {
            Some(ptr) => Ok(Some((ptr, id))),
            None => {
                app.process_later(id, packet);
                Ok(None)
            }
        }
    }

    fn on_transaction_hold(&self, app: &App, packet: &Packet) -> Res<()> {
        let (ptr, _) = match self.local_order(app, packet)? {
            Some(found) => found,
            None => return Ok(()),
        };
        let mut order = ptr.lock();
        if !order.is_local() {
            return Ok(());
        }
        order.set_state(State::Hold)?;
        order.update_timestamp();
        Ok(())
    }

    fn on_transaction_init(&self, app: &App, packet: &Packet) -> Res<()> {
        let (ptr, _) = match self.local_order(app, packet)? {
            Some(found) => found,
            None => return Ok(()),
        };
        let mut order = ptr.lock();
        if !order.is_local() {
            return Ok(());
        }
        order.set_state(State::Initialized)?;
        order.update_timestamp();
        Ok(())
    }

    /// Counterparty deposit announcement: the deposit outpoint, the redeem
    /// script guarding it, and the locktime of our refund path.
    fn on_transaction_created(&self, app: &App, packet: &Packet) -> Res<()> {
        let mut r = PayloadReader::new(packet.payload());
        let id = OrderId::from_bytes(r.read_array::<32>()?);
        let lock_time = r.read_u32()?;
        let vout = r.read_u32()?;
        let txid_len = r.read_u32()? as usize;
        let txid = String::from_utf8(r.read_bytes(txid_len)?)
            .map_err(|_| Error::InvalidParameters)?;
        let script_len = r.read_u32()? as usize;
        let inner_script = r.read_bytes(script_len)?;

        let ptr = match app.transaction(&id) {
            Some(ptr) => ptr,
            None => {
                app.process_later(id, packet);
                return Ok(());
            }
        };
        let mut order = ptr.lock();
        if !order.is_local() {
            return Ok(());
        }
        order.counterparty_bin_txid = txid;
        order.counterparty_bin_vout = vout;
        order.inner_script = inner_script;
        order.lock_time = lock_time;
        order.set_state(State::Created)?;
        order.update_timestamp();
        Ok(())
    }

    fn on_transaction_signed(&self, app: &App, packet: &Packet) -> Res<()> {
        let (ptr, _) = match self.local_order(app, packet)? {
            Some(found) => found,
            None => return Ok(()),
        };
        let mut order = ptr.lock();
        if !order.is_local() {
            return Ok(());
        }
        order.set_state(State::Signed)?;
        order.update_timestamp();
        Ok(())
    }

    /// Own deposit confirmed on-chain: record the watched outpoint and the
    /// pre-signed refund; takers start the deposit-spend watch.
    fn on_transaction_commited(&self, app: &App, packet: &Packet) -> Res<()> {
        let mut r = PayloadReader::new(packet.payload());
        let id = OrderId::from_bytes(r.read_array::<32>()?);
        let vout = r.read_u32()?;
        let txid_len = r.read_u32()? as usize;
        let txid = String::from_utf8(r.read_bytes(txid_len)?)
            .map_err(|_| Error::InvalidParameters)?;
        let refund_len = r.read_u32()? as usize;
        let refund_tx = String::from_utf8(r.read_bytes(refund_len)?)
            .map_err(|_| Error::InvalidParameters)?;

        let ptr = match app.transaction(&id) {
            Some(ptr) => ptr,
            None => {
                app.process_later(id, packet);
                return Ok(());
            }
        };
        let start_watch = {
            let mut order = ptr.lock();
            if !order.is_local() {
                return Ok(());
            }
            order.bin_txid = txid;
            order.bin_vout = vout;
            if !refund_tx.is_empty() {
                order.refund_tx = refund_tx;
            }
            order.set_state(State::Commited)?;
            order.update_timestamp();

            if order.role == SwapRole::Taker {
                if let Some(conn) = app.connector_by_currency(&order.from_currency) {
                    if let Ok(height) = conn.get_block_count() {
                        order.watch_start_block = height;
                        order.set_watch_block(height);
                    }
                }
                true
            } else {
                false
            }
        };

        if start_watch {
            app.watch_for_spent_deposit(id);
        }
        Ok(())
    }

    fn on_transaction_finished(&self, app: &App, packet: &Packet) -> Res<()> {
        let (ptr, id) = match self.local_order(app, packet)? {
            Some(found) => found,
            None => return Ok(()),
        };
        {
            let mut order = ptr.lock();
            order.set_state(State::Finished)?;
        }
        app.unwatch_spent_deposit(&id);
        app.move_transaction_to_history(&id);
        Ok(())
    }

    /// Cancellation. Local orders require the packet to originate from the
    /// order's service node or from our own ephemeral key; foreign orders
    /// simply leave the book.
    fn on_transaction_cancel(&self, app: &App, packet: &Packet) -> Res<()> {
        let mut r = PayloadReader::new(packet.payload());
        let id = OrderId::from_bytes(r.read_array::<32>()?);
        let reason: CancelReason = consensus::deserialize(&r.read_bytes(4)?)?;

        if app.exchange().is_started() {
            app.exchange().delete_transaction(&id);
        }

        let ptr = match app.transaction(&id) {
            Some(p) => p,
            None => return Ok(()),
        };

        {
            let mut order = ptr.lock();
            if order.is_local() {
                let own_key = order
                    .m_pubkey
                    .map(|pk| pk.serialize().to_vec())
                    .unwrap_or_default();
                let sender = packet.pubkey().to_vec();
                if sender != order.s_pubkey && sender != own_key {
                    warn!("ignoring cancel of order {} from unknown origin", id);
                    return Err(Error::InvalidSignature);
                }
            }
            if order.state.can_transition_to(State::Cancelled) {
                let _ = order.set_state(State::Cancelled);
            }
            order.reason = reason;
            app.unlock_order_coins(&order);
        }
        app.unwatch_spent_deposit(&id);
        info!("order {} cancelled ({})", id, reason);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance operations

    /// Move terminal orders into history.
    pub fn check_finished_transactions(&self, app: &App) {
        for (id, ptr) in app.transactions() {
            let terminal = match ptr.try_lock() {
                Some(order) => order.state.is_terminal(),
                None => false,
            };
            if terminal {
                app.move_transaction_to_history(&id);
            }
        }
    }

    /// Cancel an order on behalf of this node and tell the network.
    pub fn send_cancel_transaction(
        &self,
        app: &App,
        ptr: &OrderPtr,
        reason: CancelReason,
    ) {
        let id = {
            let mut order = ptr.lock();
            let mut packet = Packet::new(Command::TransactionCancel);
            packet.push_bytes(order.id.as_bytes());
            packet.push_bytes(&consensus::serialize(&reason));

            let signed = match (order.m_pubkey, order.m_privkey) {
                (Some(pk), Some(sk)) => packet.sign(&pk, &sk),
                _ => packet.sign(&self.pubkey, &self.privkey),
            };
            if signed.is_ok() {
                app.send_packet_broadcast(&packet);
            }

            if order.state.can_transition_to(State::Cancelled) {
                let _ = order.set_state(State::Cancelled);
            }
            order.reason = reason;
            app.unlock_order_coins(&order);
            order.id
        };
        app.unwatch_spent_deposit(&id);
    }

    /// Cancel a supervised trade (service node only).
    pub fn send_trade_cancel(&self, app: &App, id: &OrderId, reason: CancelReason) {
        let mut packet = Packet::new(Command::TransactionCancel);
        packet.push_bytes(id.as_bytes());
        packet.push_bytes(&consensus::serialize(&reason));
        if packet.sign(&self.pubkey, &self.privkey).is_ok() {
            app.send_packet_broadcast(&packet);
        }
        app.exchange().delete_transaction(id);
    }

    /// Broadcast the pre-signed refund of our own deposit. Returns true when
    /// the deposit is recovered (or provably already spent).
    pub fn redeem_order_deposit(&self, app: &App, ptr: &OrderPtr) -> bool {
        let (id, refund_tx, from_currency) = {
            let order = ptr.lock();
            (order.id, order.refund_tx.clone(), order.from_currency.clone())
        };
        if refund_tx.is_empty() {
            return false;
        }
        let conn = match app.connector_by_currency(&from_currency) {
            Some(c) => c,
            None => return false,
        };

        let done = match conn.send_raw_transaction(&refund_tx) {
            Ok(txid) => {
                info!("order {} deposit refunded in {}", id, txid);
                true
            }
            Err(e) => match e.rpc_code() {
                Some(RPC_VERIFY_ALREADY_IN_CHAIN)
                | Some(RPC_INVALID_ADDRESS_OR_KEY)
                | Some(RPC_VERIFY_REJECTED) => true,
                _ => {
                    debug!("order {} refund broadcast failed: {}", id, e);
                    false
                }
            },
        };

        if done {
            let mut order = ptr.lock();
            if order.state.can_transition_to(State::Rollback) {
                let _ = order.set_state(State::Rollback);
            }
            order.reason = CancelReason::Rollback;
        }
        done
    }

    /// Spend the counterparty deposit with the secret revealed by their pay
    /// transaction.
    pub fn redeem_order_counterparty_deposit(&self, app: &App, ptr: &OrderPtr) -> bool {
        let (id, pay_txid, inner_script, from_currency, to_currency, to_addr, to_amount,
            counterparty_txid, counterparty_vout, keys, known_secret) = {
            let order = ptr.lock();
            let keys = match (order.m_pubkey, order.m_privkey) {
                (Some(pk), Some(sk)) => (pk, sk),
                _ => return false,
            };
            (
                order.id,
                order.other_pay_txid.clone(),
                order.inner_script.clone(),
                order.from_currency.clone(),
                order.to_currency.clone(),
                order.to_addr.clone(),
                order.to_amount,
                order.counterparty_bin_txid.clone(),
                order.counterparty_bin_vout,
                keys,
                order.secret().map(|s| s.to_vec()),
            )
        };
        if counterparty_txid.is_empty() || inner_script.is_empty() {
            return false;
        }

        let secret = match known_secret {
            Some(s) => s,
            None => {
                let pay_txid = match pay_txid {
                    Some(t) => t,
                    None => return false,
                };
                let conn_from = match app.connector_by_currency(&from_currency) {
                    Some(c) => c,
                    None => return false,
                };
                let x_id = match x_key_id_from_deposit_script(&inner_script) {
                    Some(x) => x,
                    None => {
                        warn!("order {} carries a malformed deposit script", id);
                        return false;
                    }
                };
                match extract_revealed_secret(conn_from.as_ref(), &pay_txid, &x_id) {
                    Some(secret) => {
                        ptr.lock().set_secret(secret.clone());
                        secret
                    }
                    None => {
                        debug!("order {}: secret not found in pay tx {}", id, pay_txid);
                        return false;
                    }
                }
            }
        };

        let conn_to = match app.connector_by_currency(&to_currency) {
            Some(c) => c,
            None => return false,
        };

        let deposit_amount = to_amount as f64 / COIN as f64;
        let fee = conn_to.min_tx_fee2(1, 1);
        let inputs = vec![XTxIn::new(counterparty_txid, counterparty_vout, deposit_amount)];
        let outputs = vec![(to_addr, deposit_amount - fee)];

        let (txid, raw) = match conn_to.create_payment_transaction(
            &inputs,
            &outputs,
            &keys.0.serialize(),
            &keys.1,
            &secret,
            &inner_script,
        ) {
            Ok(r) => r,
            Err(e) => {
                warn!("order {}: payment construction failed: {}", id, e);
                return false;
            }
        };

        let done = match conn_to.send_raw_transaction(&raw) {
            Ok(_) => {
                info!("order {} counterparty deposit redeemed in {}", id, txid);
                true
            }
            Err(e) => matches!(
                e.rpc_code(),
                Some(RPC_VERIFY_ALREADY_IN_CHAIN)
                    | Some(RPC_INVALID_ADDRESS_OR_KEY)
                    | Some(RPC_VERIFY_REJECTED)
            ),
        };

        if done {
            let mut order = ptr.lock();
            order.redeemed_counterparty = true;
            if order.state.can_transition_to(State::Finished) {
                let _ = order.set_state(State::Finished);
            }
        }
        done
    }

    /// Submit a trader's pre-signed refund on their behalf (service node).
    /// Returns the wallet error code on failure.
    pub fn refund_trader_deposit(
        &self,
        app: &App,
        currency: &str,
        ref_tx: &str,
    ) -> Result<String, Option<i32>> {
        let conn = app.connector_by_currency(currency).ok_or(None)?;
        conn.send_raw_transaction(ref_tx).map_err(|e| e.rpc_code())
    }
}

/// Parse the reserved-output items of an announcement payload, enforcing
/// the 65-byte signature and 20-byte address shapes.
fn read_utxo_items(r: &mut PayloadReader) -> Res<Vec<UtxoEntry>> {
    let count = r.read_u32()?;
    if count > 1024 {
        return Err(Error::InvalidParameters);
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let txid_bytes = r.read_array::<32>()?;
        let txid = bitcoin::Txid::from_hash(sha256d::Hash::from_inner(txid_bytes)).to_string();
        let vout = r.read_u32()?;
        let raw_address = r.read_bytes(20)?;
        let signature = r.read_bytes(65)?;
        let mut entry = UtxoEntry::new(txid, vout, 0.0, String::new());
        entry.raw_address = raw_address;
        entry.signature = signature;
        items.push(entry);
    }
    Ok(items)
}

/// Scan a pay transaction for the 33-byte push whose HASH160 matches the
/// deposit hashlock.
fn extract_revealed_secret(
    conn: &dyn crate::connector::WalletConnector,
    pay_txid: &str,
    x_id: &[u8; 20],
) -> Option<Vec<u8>> {
    let raw = conn.get_raw_transaction(pay_txid).ok()?;
    let tx = RawTransaction::from_hex(&raw, conn.params().tx_with_time_field).ok()?;
    for input in &tx.input {
        for ins in input.script_sig.instructions() {
            if let Ok(Instruction::PushBytes(data)) = ins {
                if data.len() == 33 && hash160::Hash::hash(data).into_inner() == *x_id {
                    return Some(data.to_vec());
                }
            }
        }
    }
    None
}
