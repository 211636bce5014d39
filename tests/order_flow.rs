//! Order creation and acceptance against in-memory wallets: reservations,
//! rollbacks and the wire traffic each flow produces.

mod common;

use parking_lot::Mutex;
use std::sync::Arc;

use common::{addr20, fixture, Fixture};
use crossbridge_core::error::Error;
use crossbridge_core::order::{Order, OrderId, State, SwapRole};

fn funded_maker(fx: &Fixture) -> String {
    let maker_addr = addr20(0xAA);
    fx.rpcs["BTC"].fund("aa01", 0, 0.51, &maker_addr);
    maker_addr
}

fn create_order(fx: &Fixture) -> OrderId {
    let maker_addr = funded_maker(fx);
    let dest_addr = addr20(0xAB);
    fx.app
        .send_transaction(&maker_addr, "BTC", 50_000_000, &dest_addr, "LTC", 60_000_000)
        .expect("order created")
}

/// Insert a relayed open order as a taker-side app would see it.
fn foreign_order(fx: &Fixture, tag: u8) -> OrderId {
    let id = OrderId::from_bytes([tag; 32]);
    let mut order = Order::new(id, SwapRole::Maker);
    order.from_currency = "BTC".into();
    order.from_amount = 50_000_000;
    order.to_currency = "LTC".into();
    order.to_amount = 60_000_000;
    order.hub_address = fx.directory.nodes.lock()[0].address();
    order.s_pubkey = fx.directory.nodes.lock()[0].pubkey.clone();
    order.set_state(State::Pending).unwrap();
    fx.app.append_transaction(Arc::new(Mutex::new(order)));
    id
}

#[test]
fn maker_create_announces_and_reserves() {
    let fx = fixture(&["BTC", "LTC", "BLOCK"]);
    let id = create_order(&fx);

    let ptr = fx.app.transaction(&id).expect("order stored");
    {
        let order = ptr.lock();
        assert_eq!(order.state, State::New);
        assert_eq!(order.role, SwapRole::Maker);
        assert!(order.is_local());
        assert_eq!(order.used_coins.len(), 1);
        assert_eq!(order.used_coins[0].signature.len(), 65);
        assert!(order.m_privkey.is_some() && order.x_privkey.is_some());
    }

    // The announcement went to the selected service node.
    assert_eq!(fx.sink.count(), 1);
    assert_eq!(fx.sink.peer(0), fx.directory.nodes.lock()[0].address());

    // The selected output is reserved.
    assert_eq!(fx.app.utxos().locked_utxos("BTC").len(), 1);
}

#[test]
fn overlapping_order_cannot_reuse_reserved_coins() {
    let fx = fixture(&["BTC", "LTC", "BLOCK"]);
    let id = create_order(&fx);

    // Same wallet, same single output: the second order must fail and the
    // first order's reservation must stay intact.
    let maker_addr = addr20(0xAA);
    let err = fx
        .app
        .send_transaction(&maker_addr, "BTC", 50_000_000, &addr20(0xAC), "LTC", 60_000_000)
        .unwrap_err();
    assert_eq!(err, Error::InsufficientFunds);

    let locked = fx.app.utxos().locked_utxos("BTC");
    assert_eq!(locked.len(), 1);
    let ptr = fx.app.transaction(&id).unwrap();
    assert_eq!(ptr.lock().used_coins[0].txid, "aa01");
}

#[test]
fn create_without_service_node_fails() {
    let fx = fixture(&["BTC", "LTC", "BLOCK"]);
    fx.directory.nodes.lock().clear();
    funded_maker(&fx);

    let err = fx
        .app
        .send_transaction(&addr20(0xAA), "BTC", 50_000_000, &addr20(0xAB), "LTC", 60_000_000)
        .unwrap_err();
    assert_eq!(err, Error::NoServiceNode);
    assert!(fx.app.utxos().locked_utxos("BTC").is_empty());
}

#[test]
fn create_rejects_dust_and_bad_currency() {
    let fx = fixture(&["BTC", "LTC", "BLOCK"]);
    funded_maker(&fx);

    let err = fx
        .app
        .send_transaction(&addr20(0xAA), "BTC", 100, &addr20(0xAB), "LTC", 60_000_000)
        .unwrap_err();
    assert_eq!(err, Error::Dust);

    let err = fx
        .app
        .send_transaction(&addr20(0xAA), "TOOLONGTICKER", 50_000_000, &addr20(0xAB), "LTC", 1)
        .unwrap_err();
    assert_eq!(err, Error::InvalidCurrency);
}

#[test]
fn accept_without_fee_balance_locks_nothing() {
    let fx = fixture(&["BTC", "LTC", "BLOCK"]);
    let id = foreign_order(&fx, 9);

    // Taker has LTC to trade with, but the fee wallet is empty.
    let taker_from = addr20(0xBA);
    fx.rpcs["LTC"].fund("bb01", 0, 0.7, &taker_from);

    let err = fx
        .app
        .accept_transaction(&id, &taker_from, &addr20(0xBB))
        .unwrap_err();
    assert_eq!(err, Error::InsufficientFundsDx);

    // No fee reservation survived and the order is untouched.
    assert!(fx.app.utxos().fee_utxos().is_empty());
    assert!(fx.app.utxos().locked_utxos("LTC").is_empty());
    let ptr = fx.app.transaction(&id).unwrap();
    let order = ptr.lock();
    assert_eq!(order.state, State::Pending);
    assert_eq!(order.from_currency, "BTC");
}

#[test]
fn accept_reserves_fee_and_order_coins() {
    let fx = fixture(&["BTC", "LTC", "BLOCK"]);
    let id = foreign_order(&fx, 10);

    let taker_from = addr20(0xBA);
    fx.rpcs["LTC"].fund("bb01", 0, 0.7, &taker_from);
    fx.rpcs["BLOCK"].fund("fee1", 0, 0.1, &addr20(0xFE));

    fx.sink.clear();
    fx.app
        .accept_transaction(&id, &taker_from, &addr20(0xBB))
        .expect("accepted");

    let ptr = fx.app.transaction(&id).unwrap();
    {
        let order = ptr.lock();
        assert_eq!(order.state, State::Accepted);
        assert_eq!(order.role, SwapRole::Taker);
        // The taker gives the maker's wanted side.
        assert_eq!(order.from_currency, "LTC");
        assert_eq!(order.from_amount, 60_000_000);
        assert!(!order.raw_fee_tx.is_empty());
        assert!(!order.fee_utxos.is_empty());
    }

    assert!(!fx.app.utxos().fee_utxos().is_empty());
    assert_eq!(fx.app.utxos().locked_utxos("LTC").len(), 1);

    // Exactly one accept went out, addressed to the order's service node.
    assert_eq!(fx.sink.count(), 1);
    assert_eq!(fx.sink.peer(0), fx.directory.nodes.lock()[0].address());
}

#[test]
fn accept_twice_is_rejected() {
    let fx = fixture(&["BTC", "LTC", "BLOCK"]);
    let id = foreign_order(&fx, 11);

    let taker_from = addr20(0xBA);
    fx.rpcs["LTC"].fund("bb01", 0, 0.7, &taker_from);
    fx.rpcs["BLOCK"].fund("fee1", 0, 0.1, &addr20(0xFE));

    fx.app
        .accept_transaction(&id, &taker_from, &addr20(0xBB))
        .expect("accepted");
    let err = fx
        .app
        .accept_transaction(&id, &taker_from, &addr20(0xBB))
        .unwrap_err();
    assert_eq!(err, Error::BadRequest);
}

#[test]
fn reservations_span_orders_and_fees() {
    // Live orders plus fee reservations never share an output.
    let fx = fixture(&["BTC", "LTC", "BLOCK"]);
    let maker_id = create_order(&fx);
    let foreign_id = foreign_order(&fx, 12);

    let taker_from = addr20(0xBA);
    fx.rpcs["LTC"].fund("bb01", 0, 0.7, &taker_from);
    fx.rpcs["BLOCK"].fund("fee1", 0, 0.1, &addr20(0xFE));
    fx.app
        .accept_transaction(&foreign_id, &taker_from, &addr20(0xBB))
        .expect("accepted");

    let maker = fx.app.transaction(&maker_id).unwrap();
    let taker = fx.app.transaction(&foreign_id).unwrap();
    let maker_coins = maker.lock().used_coins.clone();
    let taker_coins = taker.lock().used_coins.clone();
    let fee_coins = taker.lock().fee_utxos.clone();

    for coin in &maker_coins {
        assert!(!taker_coins.contains(coin));
        assert!(!fee_coins.contains(coin));
    }
    for coin in &taker_coins {
        assert!(!fee_coins.contains(coin));
    }
}

#[test]
fn cancelled_orders_flush_after_min_age() {
    let fx = fixture(&["BTC", "LTC", "BLOCK"]);
    let id = create_order(&fx);
    fx.app
        .cancel_transaction(&id, crossbridge_core::order::CancelReason::UserRequest)
        .expect("cancelled");

    // Young cancelled orders are kept for the history surface.
    assert!(fx.app.flush_cancelled_orders(60).is_empty());
    assert!(fx.app.transaction(&id).is_some());

    let ptr = fx.app.transaction(&id).unwrap();
    ptr.lock().txtime_us -= 120 * 1_000_000;
    let flushed = fx.app.flush_cancelled_orders(60);
    assert_eq!(flushed, vec![id]);
    assert!(fx.app.transaction(&id).is_none());
}

#[test]
fn foreign_orders_drop_with_their_wallets() {
    let fx = fixture(&["BTC", "LTC", "BLOCK"]);
    let local_id = create_order(&fx);
    let foreign_id = foreign_order(&fx, 13);

    fx.app.remove_connector("LTC");
    fx.app.clear_non_local_orders();

    // The foreign order leaves the book, local orders stay.
    assert!(fx.app.transaction(&foreign_id).is_none());
    assert!(fx.app.transaction(&local_id).is_some());
}

#[test]
fn cancelled_order_releases_reservations() {
    let fx = fixture(&["BTC", "LTC", "BLOCK"]);
    let id = create_order(&fx);

    fx.app
        .cancel_transaction(&id, crossbridge_core::order::CancelReason::UserRequest)
        .expect("cancelled");

    let ptr = fx.app.transaction(&id).unwrap();
    assert_eq!(ptr.lock().state, State::Cancelled);
    assert!(fx.app.utxos().locked_utxos("BTC").is_empty());

    // The terminal order retires to history on the next sweep.
    let session = fx.app.session();
    session.check_finished_transactions(&fx.app);
    assert!(fx.app.transactions().is_empty());
    assert!(fx.app.history().contains_key(&id));
}
