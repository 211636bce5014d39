//! On-chain watch loops. Takers watch their own deposit for the
//! counterparty's secret-revealing spend and then redeem the counterparty
//! deposit; service nodes watch supervised trader deposits and broadcast the
//! pre-signed refunds once locktimes expire. Each loop carries a re-entry
//! guard so a slow sweep is never overlapped by the next tick.

use log::{debug, info};

use crate::app::{App, ConnectorPtr, OrderPtr};
use crate::connector::{
    RPC_INVALID_ADDRESS_OR_KEY, RPC_VERIFY_ALREADY_IN_CHAIN, RPC_VERIFY_REJECTED,
};
use crate::exchange::{TradePtr, TradeState};
use crate::order::OrderId;
use crate::session::Session;

/// Seconds past an expired locktime after which the refund fallback stops
/// trying.
const REFUND_GIVE_UP_SECONDS: u64 = 3600;

/// Taker-side sweep: scan new blocks (or the mempool while still on the
/// start block) for a transaction spending the watched deposit outpoint;
/// once found, the counterparty pay tx carries the secret. Independently,
/// attempt the refund path when our locktime has passed.
pub fn check_watches_on_deposit_spends(app: &App) {
    let watches: Vec<OrderId> = {
        let mut table = app.watch_deposits.lock();
        if table.sweeping {
            return;
        }
        table.sweeping = true;
        table.entries.iter().copied().collect()
    };

    for id in watches {
        if app.is_stopped() {
            break;
        }

        // Resolve the watched order from the arena; retired orders drop
        // their watch.
        let ptr: OrderPtr = match app.transaction(&id) {
            Some(p) => p,
            None => {
                app.unwatch_spent_deposit(&id);
                continue;
            }
        };

        let (from_currency, already_watching) = {
            let order = ptr.lock();
            (order.from_currency.clone(), order.is_watching())
        };
        if already_watching {
            continue;
        }

        // The wallet may have gone offline; skip until it returns.
        let conn = match app.connector_by_currency(&from_currency) {
            Some(c) => c,
            None => continue,
        };

        ptr.lock().set_watching(true);

        let block_count = match conn.get_block_count() {
            Ok(b) => b,
            Err(_) => {
                ptr.lock().set_watching(false);
                continue;
            }
        };

        let has_secret = ptr.lock().has_secret();
        if !has_secret {
            if let Err(()) = scan_for_pay_tx(&ptr, conn.as_ref(), block_count) {
                ptr.lock().set_watching(false);
                continue;
            }
        }

        let mut done = false;
        let (lock_time, done_watching, redeemed) = {
            let order = ptr.lock();
            (
                order.lock_time,
                order.is_done_watching(),
                order.redeemed_counterparty,
            )
        };

        // Our own deposit can be taken back once the locktime passed.
        if lock_time != 0 && lock_time <= block_count {
            let session = app.session();
            if session.redeem_order_deposit(app, &ptr) {
                done = true;
            }
        }

        // The found pay tx revealed the secret; claim the counterparty
        // deposit.
        if done_watching && !redeemed {
            let session = app.session();
            if session.redeem_order_counterparty_deposit(app, &ptr) {
                done = true;
            }
        }

        if done {
            ptr.lock().done_watching();
            app.unwatch_spent_deposit(&id);
        }
        ptr.lock().set_watching(false);
    }

    app.watch_deposits.lock().sweeping = false;
}

/// Collect candidate txids and record the first one spending the watched
/// outpoint. `Err(())` indicates an RPC failure; the block marker advances
/// only past fully processed blocks.
fn scan_for_pay_tx(
    ptr: &OrderPtr,
    conn: &dyn crate::connector::WalletConnector,
    block_count: u32,
) -> Result<(), ()> {
    let (watch_start, watch_current, bin_txid, bin_vout) = {
        let order = ptr.lock();
        (
            order.watch_start_block,
            order.watch_current_block(),
            order.bin_txid.clone(),
            order.bin_vout,
        )
    };
    if bin_txid.is_empty() {
        return Ok(());
    }

    let mut txids: Vec<String> = Vec::new();
    if watch_start == block_count {
        txids = conn.get_raw_mempool().map_err(|_| ())?;
    } else {
        let mut blocks = watch_current;
        while blocks <= block_count {
            let hash = conn.get_block_hash(blocks).map_err(|_| ())?;
            let txs = conn.get_transactions_in_block(&hash).map_err(|_| ())?;
            txids.extend(txs);
            blocks += 1;
            ptr.lock().set_watch_block(blocks);
        }
    }

    for txid in txids {
        if let Ok(true) = conn.is_utxo_spent_in_tx(&txid, &bin_txid, bin_vout) {
            info!("found counterparty pay tx {} for watched deposit {}", txid, bin_txid);
            let mut order = ptr.lock();
            order.set_other_pay_txid(txid);
            order.done_watching();
            break;
        }
    }
    Ok(())
}

/// Service-node sweep: broadcast trader refunds whose locktimes expired.
/// Certain wallet error codes mean the refund is already settled and count
/// as completion; a locktime expired for longer than the give-up window is
/// abandoned.
pub fn watch_trader_deposits(app: &App) {
    let watches: Vec<OrderId> = {
        let mut table = app.watch_traders.lock();
        if table.sweeping {
            return;
        }
        table.sweeping = true;
        table.entries.iter().copied().collect()
    };

    for id in watches {
        if app.is_stopped() {
            break;
        }

        let trade: TradePtr = match app.exchange().transaction(&id) {
            Some(t) => t,
            None => {
                app.unwatch_trader_deposit(&id);
                continue;
            }
        };

        let session = app.session();
        let snapshot = trade.lock().clone();

        if !snapshot.a.refunded
            && !snapshot.a.refund_tx.is_empty()
            && snapshot.state != TradeState::Finished
        {
            if let Some(conn) = app.connector_by_currency(&snapshot.a.currency) {
                if check_trader_refund(
                    app,
                    &session,
                    &id,
                    &conn,
                    snapshot.a.lock_time,
                    &snapshot.a.refund_tx,
                ) {
                    trade.lock().a.refunded = true;
                }
            }
        }

        if !snapshot.b.refunded
            && !snapshot.b.refund_tx.is_empty()
            && snapshot.state != TradeState::Finished
        {
            if let Some(conn) = app.connector_by_currency(&snapshot.b.currency) {
                if check_trader_refund(
                    app,
                    &session,
                    &id,
                    &conn,
                    snapshot.b.lock_time,
                    &snapshot.b.refund_tx,
                ) {
                    trade.lock().b.refunded = true;
                }
            }
        }

        let finished = {
            let t = trade.lock();
            (t.a.refunded && t.b.refunded) || t.state == TradeState::Finished
        };
        if finished {
            app.unwatch_trader_deposit(&id);
        }
    }

    app.watch_traders.lock().sweeping = false;
}

fn check_trader_refund(
    app: &App,
    session: &Session,
    order_id: &OrderId,
    conn: &ConnectorPtr,
    lock_time: u32,
    ref_tx: &str,
) -> bool {
    let block_count = match conn.get_block_count() {
        Ok(b) => b,
        Err(_) => return false,
    };
    if lock_time > block_count {
        return false;
    }

    let mut done = false;
    match session.refund_trader_deposit(app, conn.currency(), ref_tx) {
        Ok(txid) => {
            info!("order {} trader deposit refunded in {}", order_id, txid);
            done = true;
        }
        Err(code) => {
            if matches!(
                code,
                Some(RPC_VERIFY_ALREADY_IN_CHAIN)
                    | Some(RPC_INVALID_ADDRESS_OR_KEY)
                    | Some(RPC_VERIFY_REJECTED)
            ) {
                done = true;
            } else {
                debug!("order {} trader refund broadcast failed", order_id);
            }
        }
    }

    // Expired for longer than the give-up window: stop trying.
    if !done
        && (block_count - lock_time) as u64 * conn.params().block_time as u64
            > REFUND_GIVE_UP_SECONDS
    {
        done = true;
    }
    done
}
