//! End-to-end exchange of real wire bytes between three coordinators: a
//! maker, a service node and a taker. Covers announcement relay, duplicate
//! suppression, acceptance matching and the hold notifications.

mod common;

use common::{addr20, fixture_with_directory, snode, MockDirectory};
use crossbridge_core::order::State;

const CURRENCIES: [&str; 3] = ["BTC", "LTC", "BLOCK"];

#[test]
fn announcement_acceptance_and_hold() {
    let directory = MockDirectory::new(vec![snode(1, &CURRENCIES)]);
    let hub = directory.nodes.lock()[0].address();

    let maker = fixture_with_directory(&CURRENCIES, directory.clone());
    let relay = fixture_with_directory(&CURRENCIES, directory.clone());
    let taker = fixture_with_directory(&CURRENCIES, directory.clone());

    // The relay node runs the advertised service node.
    *relay.directory.active.lock() = Some(directory.nodes.lock()[0].clone());

    // Maker announces.
    let maker_addr = addr20(0xAA);
    maker.rpcs["BTC"].fund("aa01", 0, 0.51, &maker_addr);
    let id = maker
        .app
        .send_transaction(&maker_addr, "BTC", 50_000_000, &addr20(0xAB), "LTC", 60_000_000)
        .expect("order created");
    assert_eq!(maker.sink.count(), 1);
    let announce = maker.sink.packet_bytes(0);

    // The service node registers the order once, duplicates are dropped.
    relay.app.on_message_received(&hub, &announce);
    relay.app.on_message_received(&hub, &announce);
    assert_eq!(relay.app.exchange().pending_transactions().len(), 1);
    assert_eq!(relay.sink.count(), 1);

    // The open-order relay reaches both traders.
    let open_order = relay.sink.packet_bytes(0);
    maker.app.on_broadcast_received(&open_order);
    taker.app.on_broadcast_received(&open_order);

    let maker_order = maker.app.transaction(&id).unwrap();
    assert_eq!(maker_order.lock().state, State::Pending);
    let taker_order = taker.app.transaction(&id).expect("order listed");
    assert_eq!(taker_order.lock().state, State::Pending);
    assert!(!taker_order.lock().is_local());

    // Taker accepts through its own wallets.
    let taker_from = addr20(0xBA);
    taker.rpcs["LTC"].fund("bb01", 0, 0.7, &taker_from);
    taker.rpcs["BLOCK"].fund("fee1", 0, 0.1, &addr20(0xFE));
    taker.sink.clear();
    taker
        .app
        .accept_transaction(&id, &taker_from, &addr20(0xBB))
        .expect("accepted");
    assert_eq!(taker.sink.count(), 1);
    assert_eq!(taker.sink.peer(0), hub);
    let accept = taker.sink.packet_bytes(0);

    // The service node matches the trade and puts both traders on hold.
    relay.sink.clear();
    relay.app.on_message_received(&hub, &accept);
    assert!(relay.app.exchange().pending_transactions().is_empty());
    assert_eq!(relay.sink.count(), 2);

    // Hold notifications route by trade address; each trader reacts only to
    // its own.
    for n in 0..2 {
        let peer = relay.sink.peer(n);
        let bytes = relay.sink.packet_bytes(n);
        maker.app.on_message_received(&peer, &bytes);
        taker.app.on_message_received(&peer, &bytes);
    }
    assert_eq!(maker_order.lock().state, State::Hold);
    assert_eq!(taker_order.lock().state, State::Hold);
}

#[test]
fn foreign_orders_for_missing_wallets_are_not_listed() {
    let directory = MockDirectory::new(vec![snode(1, &CURRENCIES)]);
    let hub = directory.nodes.lock()[0].address();

    let maker = fixture_with_directory(&CURRENCIES, directory.clone());
    let relay = fixture_with_directory(&CURRENCIES, directory.clone());
    *relay.directory.active.lock() = Some(directory.nodes.lock()[0].clone());

    // A trader with no matching wallets ignores the relayed order.
    let observer = fixture_with_directory(&["BLOCK"], directory.clone());

    let maker_addr = addr20(0xAA);
    maker.rpcs["BTC"].fund("aa01", 0, 0.51, &maker_addr);
    let id = maker
        .app
        .send_transaction(&maker_addr, "BTC", 50_000_000, &addr20(0xAB), "LTC", 60_000_000)
        .unwrap();

    relay.app.on_message_received(&hub, &maker.sink.packet_bytes(0));
    observer
        .app
        .on_broadcast_received(&relay.sink.packet_bytes(0));
    assert!(observer.app.transaction(&id).is_none());
}
