//! End-to-end scenarios against the core `Exchange`, one per the concrete
//! walkthroughs: a crossing limit order, the opening cross, a market order's
//! cancelled remainder, a too-late cancel, a quote replace, and a rejected
//! market-state transition.

use std::sync::Arc;

use exchange_core::events::test_support::RecordingSink;
use exchange_core::price::Price;
use exchange_core::registry::{Exchange, MarketState};
use exchange_core::tradable::Side;

#[test]
fn crossing_limit_order() {
    let ex = Exchange::new();
    ex.create_product("IBM").unwrap();
    ex.set_market_state(MarketState::Preopen).unwrap();

    let sink = Arc::new(RecordingSink::default());
    ex.subscribe_current_market("IBM", "watcher", sink.clone()).unwrap();
    ex.subscribe_last_sale("IBM", "watcher", sink.clone()).unwrap();
    ex.subscribe_message("IBM", "A", sink.clone()).unwrap();
    ex.subscribe_message("IBM", "B", sink.clone()).unwrap();

    ex.submit_quote(
        "A",
        "IBM",
        Price::limit(1000),
        100,
        Price::limit(1010),
        100,
    )
    .unwrap();
    ex.set_market_state(MarketState::Open).unwrap();

    ex.submit_order("B", "IBM", Price::limit(1010), 60, Side::Buy).unwrap();

    let messages = sink.messages.lock().unwrap();
    let a_fill = messages.iter().find(|m| m.user == "A").unwrap();
    let b_fill = messages.iter().find(|m| m.user == "B").unwrap();
    assert_eq!(a_fill.price, Price::limit(1010));
    assert_eq!(a_fill.volume, 60);
    assert_eq!(a_fill.details, "leaving 40");
    assert_eq!(b_fill.details, "leaving 0");
    drop(messages);

    let (buy, sell) = ex.get_book_depth("IBM").unwrap();
    assert_eq!(buy, vec!["$10.00 x 100".to_string()]);
    assert_eq!(sell, vec!["$10.10 x 40".to_string()]);

    let last_sales = sink.last_sales.lock().unwrap();
    assert_eq!(last_sales.last().unwrap().price, Price::limit(1010));
    assert_eq!(last_sales.last().unwrap().volume, 60);
}

#[test]
fn opening_cross_clears_crossed_orders_best_price_first() {
    let ex = Exchange::new();
    ex.create_product("ABC").unwrap();
    ex.set_market_state(MarketState::Preopen).unwrap();

    ex.submit_order("U1", "ABC", Price::limit(500), 500, Side::Buy).unwrap();
    ex.submit_order("U2", "ABC", Price::limit(505), 200, Side::Buy).unwrap();
    ex.submit_order("U3", "ABC", Price::limit(495), 300, Side::Sell).unwrap();
    ex.submit_order("U4", "ABC", Price::limit(500), 400, Side::Sell).unwrap();

    ex.set_market_state(MarketState::Open).unwrap();

    let (buy, sell) = ex.get_book_depth("ABC").unwrap();
    assert_eq!(buy, vec!["<Empty>".to_string()]);
    assert_eq!(sell, vec!["<Empty>".to_string()]);
}

#[test]
fn market_order_cancels_unfilled_remainder() {
    let ex = Exchange::new();
    ex.create_product("GOOG").unwrap();
    ex.set_market_state(MarketState::Preopen).unwrap();
    ex.submit_order("U1", "GOOG", Price::limit(80000), 50, Side::Sell).unwrap();
    ex.set_market_state(MarketState::Open).unwrap();

    let sink = Arc::new(RecordingSink::default());
    ex.subscribe_message("GOOG", "U2", sink.clone()).unwrap();

    ex.submit_order("U2", "GOOG", Price::market(), 200, Side::Buy).unwrap();

    let messages = sink.messages.lock().unwrap();
    let cancel = messages.iter().find(|m| m.details == "Cancelled").unwrap();
    assert_eq!(cancel.volume, 150);

    let (buy, sell) = ex.get_book_depth("GOOG").unwrap();
    assert_eq!(buy, vec!["<Empty>".to_string()]);
    assert_eq!(sell, vec!["<Empty>".to_string()]);
}

#[test]
fn cancel_after_full_fill_reports_too_late() {
    let ex = Exchange::new();
    ex.create_product("XYZ").unwrap();
    ex.set_market_state(MarketState::Preopen).unwrap();
    ex.set_market_state(MarketState::Open).unwrap();

    let id = ex.submit_order("U1", "XYZ", Price::limit(1000), 10, Side::Sell).unwrap();
    ex.submit_order("U2", "XYZ", Price::limit(1000), 10, Side::Buy).unwrap();

    let sink = Arc::new(RecordingSink::default());
    ex.subscribe_message("XYZ", "U1", sink.clone()).unwrap();

    ex.submit_order_cancel("XYZ", id).unwrap();

    let messages = sink.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].details, "Too Late to Cancel");
}

#[test]
fn quote_replace_is_atomic_and_silent() {
    let ex = Exchange::new();
    ex.create_product("XYZ").unwrap();
    ex.set_market_state(MarketState::Preopen).unwrap();
    ex.set_market_state(MarketState::Open).unwrap();

    let sink = Arc::new(RecordingSink::default());
    ex.subscribe_message("XYZ", "U1", sink.clone()).unwrap();

    ex.submit_quote("U1", "XYZ", Price::limit(1000), 100, Price::limit(1010), 100)
        .unwrap();
    ex.submit_quote("U1", "XYZ", Price::limit(1002), 100, Price::limit(1012), 100)
        .unwrap();

    assert!(sink.messages.lock().unwrap().is_empty());
    let (buy, sell) = ex.get_book_depth("XYZ").unwrap();
    assert_eq!(buy, vec!["$10.02 x 100".to_string()]);
    assert_eq!(sell, vec!["$10.12 x 100".to_string()]);
}

#[test]
fn bad_transition_from_closed_to_open_is_rejected() {
    let ex = Exchange::new();
    let err = ex.set_market_state(MarketState::Open).unwrap_err();
    assert!(matches!(
        err,
        exchange_core::errors::ExchangeError::InvalidMarketStateTransition { .. }
    ));
    assert_eq!(ex.get_market_state(), MarketState::Closed);
}

#[test]
fn subscribe_then_unsubscribe_restores_table() {
    let ex = Exchange::new();
    ex.create_product("ABC").unwrap();
    let sink = Arc::new(RecordingSink::default());
    ex.subscribe_current_market("ABC", "u1", sink.clone()).unwrap();
    ex.unsubscribe_current_market("ABC", "u1").unwrap();
    // a second subscribe should succeed again, proving the table was cleared
    ex.subscribe_current_market("ABC", "u1", sink).unwrap();
}

#[test]
fn submit_then_cancel_with_no_crossing_leaves_book_empty() {
    let ex = Exchange::new();
    ex.create_product("ABC").unwrap();
    ex.set_market_state(MarketState::Preopen).unwrap();

    let sink = Arc::new(RecordingSink::default());
    ex.subscribe_message("ABC", "u1", sink.clone()).unwrap();

    let id = ex.submit_order("u1", "ABC", Price::limit(1000), 10, Side::Buy).unwrap();
    ex.submit_order_cancel("ABC", id).unwrap();

    let (buy, sell) = ex.get_book_depth("ABC").unwrap();
    assert_eq!(buy, vec!["<Empty>".to_string()]);
    assert_eq!(sell, vec!["<Empty>".to_string()]);
    assert_eq!(sink.messages.lock().unwrap().len(), 1);
}

#[test]
fn market_order_rejected_in_preopen_and_quote_with_sell_le_buy_rejected() {
    let ex = Exchange::new();
    ex.create_product("ABC").unwrap();
    ex.set_market_state(MarketState::Preopen).unwrap();

    assert!(ex.submit_order("u1", "ABC", Price::market(), 10, Side::Buy).is_err());
    assert!(ex
        .submit_quote("u1", "ABC", Price::limit(1010), 10, Price::limit(1000), 10)
        .is_err());
}
