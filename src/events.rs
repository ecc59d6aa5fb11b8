//! The event fan-out substrate: four independent publishers (current-market,
//! last-sale, ticker, message) each keeping their own per-product subscriber
//! table, bundled together as an [`EventBus`].
//!
//! Subscriber dispatch happens after the publisher's own lock is released —
//! the subscriber set is snapshotted under lock, then each sink is invoked
//! outside it, so a sink that calls back into the exchange never reenters
//! while a publisher lock is held.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::book::Fill;
use crate::errors::{ExchangeError, ExchangeResult};
use crate::price::Price;

/// Callback surface for a subscriber. Default methods are no-ops so a sink
/// only has to implement the streams it cares about.
pub trait EventSink: Send + Sync {
    fn on_current_market(&self, _snap: &CurrentMarket) {}
    fn on_last_sale(&self, _sale: &LastSale) {}
    fn on_ticker(&self, _tick: &Ticker) {}
    fn on_message(&self, _msg: &Fill) {}
    fn on_market_state(&self, _state: &str) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct CurrentMarket {
    pub product: String,
    pub buy_price: Price,
    pub buy_volume: u64,
    pub sell_price: Price,
    pub sell_volume: u64,
}

impl CurrentMarket {
    /// `$buy ⊕ buy_volume ⊕ $sell ⊕ sell_volume` — duplicate-suppression key.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.buy_price, self.buy_volume, self.sell_price, self.sell_volume
        )
    }
}

impl fmt::Display for CurrentMarket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}@{} x {}@{}",
            self.product, self.buy_volume, self.buy_price, self.sell_volume, self.sell_price
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastSale {
    pub product: String,
    pub price: Price,
    pub volume: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ticker {
    pub product: String,
    pub price: Price,
    pub arrow: char,
}

fn arrow_for(new: &Price, last: Option<&Price>) -> char {
    match last {
        None => ' ',
        Some(last) => {
            if new.gt(last) {
                '\u{2191}'
            } else if new.lt(last) {
                '\u{2193}'
            } else {
                '='
            }
        }
    }
}

/// A product-keyed `user → sink` table shared by the four publishers; owns
/// the subscribe/unsubscribe error semantics common to all of them.
struct TopicTable {
    topics: Mutex<HashMap<String, HashMap<String, Arc<dyn EventSink>>>>,
}

impl TopicTable {
    fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn subscribe(&self, topic: &str, user: &str, sink: Arc<dyn EventSink>) -> ExchangeResult<()> {
        let mut topics = self.topics.lock().expect("topic table poisoned");
        let entry = topics.entry(topic.to_string()).or_default();
        if entry.contains_key(user) {
            return Err(ExchangeError::AlreadySubscribed {
                user: user.to_string(),
                topic: topic.to_string(),
            });
        }
        entry.insert(user.to_string(), sink);
        Ok(())
    }

    fn unsubscribe(&self, topic: &str, user: &str) -> ExchangeResult<()> {
        let mut topics = self.topics.lock().expect("topic table poisoned");
        let Some(entry) = topics.get_mut(topic) else {
            return Err(ExchangeError::InvalidStock(topic.to_string()));
        };
        if entry.remove(user).is_none() {
            return Err(ExchangeError::NotSubscribed {
                user: user.to_string(),
                topic: topic.to_string(),
            });
        }
        Ok(())
    }

    fn snapshot(&self, topic: &str) -> Vec<Arc<dyn EventSink>> {
        let topics = self.topics.lock().expect("topic table poisoned");
        topics
            .get(topic)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn snapshot_one(&self, topic: &str, user: &str) -> Option<Arc<dyn EventSink>> {
        let topics = self.topics.lock().expect("topic table poisoned");
        topics.get(topic)?.get(user).cloned()
    }

    /// Every distinct user subscribed to any topic, for broadcast messages.
    fn all_subscribers(&self) -> Vec<Arc<dyn EventSink>> {
        let topics = self.topics.lock().expect("topic table poisoned");
        let mut merged: HashMap<&str, Arc<dyn EventSink>> = HashMap::new();
        for table in topics.values() {
            for (user, sink) in table {
                merged.entry(user.as_str()).or_insert_with(|| sink.clone());
            }
        }
        merged.into_values().collect()
    }
}

/// Invokes `f` against `sink`, catching and logging a panic so one broken
/// subscriber cannot prevent the others in the same fan-out from receiving.
fn dispatch(sink: &Arc<dyn EventSink>, f: impl FnOnce(&dyn EventSink)) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| f(sink.as_ref())));
    if result.is_err() {
        warn!("subscriber callback panicked; event dropped for that subscriber");
    }
}

pub struct CurrentMarketPublisher {
    table: TopicTable,
}

impl CurrentMarketPublisher {
    fn new() -> Self {
        Self { table: TopicTable::new() }
    }

    pub fn subscribe(&self, product: &str, user: &str, sink: Arc<dyn EventSink>) -> ExchangeResult<()> {
        self.table.subscribe(product, user, sink)
    }

    pub fn unsubscribe(&self, product: &str, user: &str) -> ExchangeResult<()> {
        self.table.unsubscribe(product, user)
    }

    /// MARKET prices are coerced to $0.00 before a subscriber ever sees them.
    pub fn publish(&self, mut snap: CurrentMarket) {
        if snap.buy_price.is_market() {
            snap.buy_price = Price::limit(0);
        }
        if snap.sell_price.is_market() {
            snap.sell_price = Price::limit(0);
        }
        for sink in self.table.snapshot(&snap.product) {
            dispatch(&sink, |s| s.on_current_market(&snap));
        }
    }
}

pub struct LastSalePublisher {
    table: TopicTable,
}

impl LastSalePublisher {
    fn new() -> Self {
        Self { table: TopicTable::new() }
    }

    pub fn subscribe(&self, product: &str, user: &str, sink: Arc<dyn EventSink>) -> ExchangeResult<()> {
        self.table.subscribe(product, user, sink)
    }

    pub fn unsubscribe(&self, product: &str, user: &str) -> ExchangeResult<()> {
        self.table.unsubscribe(product, user)
    }

    pub fn publish(&self, sale: LastSale) {
        for sink in self.table.snapshot(&sale.product) {
            dispatch(&sink, |s| s.on_last_sale(&sale));
        }
    }
}

pub struct TickerPublisher {
    table: TopicTable,
    last_known: Mutex<HashMap<String, Price>>,
}

impl TickerPublisher {
    fn new() -> Self {
        Self {
            table: TopicTable::new(),
            last_known: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, product: &str, user: &str, sink: Arc<dyn EventSink>) -> ExchangeResult<()> {
        self.table.subscribe(product, user, sink)
    }

    pub fn unsubscribe(&self, product: &str, user: &str) -> ExchangeResult<()> {
        self.table.unsubscribe(product, user)
    }

    pub fn publish(&self, product: &str, price: Price) {
        let arrow = {
            let mut last_known = self.last_known.lock().expect("ticker state poisoned");
            let arrow = arrow_for(&price, last_known.get(product));
            last_known.insert(product.to_string(), price.clone());
            arrow
        };
        let tick = Ticker {
            product: product.to_string(),
            price,
            arrow,
        };
        for sink in self.table.snapshot(product) {
            dispatch(&sink, |s| s.on_ticker(&tick));
        }
    }
}

pub struct MessagePublisher {
    table: TopicTable,
}

impl MessagePublisher {
    fn new() -> Self {
        Self { table: TopicTable::new() }
    }

    pub fn subscribe(&self, product: &str, user: &str, sink: Arc<dyn EventSink>) -> ExchangeResult<()> {
        self.table.subscribe(product, user, sink)
    }

    pub fn unsubscribe(&self, product: &str, user: &str) -> ExchangeResult<()> {
        self.table.unsubscribe(product, user)
    }

    /// Delivered only to the one user named on the message, and only if that
    /// user is subscribed to the message topic for `msg.product`.
    pub fn publish(&self, msg: Fill) {
        if let Some(sink) = self.table.snapshot_one(&msg.product, &msg.user) {
            dispatch(&sink, |s| s.on_message(&msg));
        }
    }

    fn broadcast_market_state(&self, state: &str) {
        for sink in self.table.all_subscribers() {
            dispatch(&sink, |s| s.on_market_state(state));
        }
    }
}

/// Bundles the four publishers and owns their composition rule: a last-sale
/// publish always triggers a ticker publish at the same price first.
pub struct EventBus {
    pub current_market: CurrentMarketPublisher,
    pub last_sale: LastSalePublisher,
    pub ticker: TickerPublisher,
    pub message: MessagePublisher,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            current_market: CurrentMarketPublisher::new(),
            last_sale: LastSalePublisher::new(),
            ticker: TickerPublisher::new(),
            message: MessagePublisher::new(),
        }
    }

    pub fn publish_current_market(&self, snap: CurrentMarket) {
        self.current_market.publish(snap);
    }

    pub fn publish_last_sale(&self, sale: LastSale) {
        self.ticker.publish(&sale.product, sale.price.clone());
        self.last_sale.publish(sale);
    }

    pub fn publish_message(&self, msg: Fill) {
        self.message.publish(msg);
    }

    pub fn publish_market_state(&self, state: &str) {
        self.message.broadcast_market_state(state);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A recording [`EventSink`] for tests, exposed outside `#[cfg(test)]` so
/// integration tests in `tests/` can subscribe it too.
pub mod test_support {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records every event delivered to it, for assertion in tests.
    #[derive(Default)]
    pub struct RecordingSink {
        pub current_markets: StdMutex<Vec<CurrentMarket>>,
        pub last_sales: StdMutex<Vec<LastSale>>,
        pub tickers: StdMutex<Vec<Ticker>>,
        pub messages: StdMutex<Vec<Fill>>,
        pub market_states: StdMutex<Vec<String>>,
    }

    impl EventSink for RecordingSink {
        fn on_current_market(&self, snap: &CurrentMarket) {
            self.current_markets.lock().unwrap().push(snap.clone());
        }
        fn on_last_sale(&self, sale: &LastSale) {
            self.last_sales.lock().unwrap().push(sale.clone());
        }
        fn on_ticker(&self, tick: &Ticker) {
            self.tickers.lock().unwrap().push(tick.clone());
        }
        fn on_message(&self, msg: &Fill) {
            self.messages.lock().unwrap().push(msg.clone());
        }
        fn on_market_state(&self, state: &str) {
            self.market_states.lock().unwrap().push(state.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use super::*;

    #[test]
    fn double_subscribe_fails() {
        let bus = EventBus::new();
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
        bus.current_market.subscribe("ABC", "u1", sink.clone()).unwrap();
        let err = bus.current_market.subscribe("ABC", "u1", sink).unwrap_err();
        assert!(matches!(err, ExchangeError::AlreadySubscribed { .. }));
    }

    #[test]
    fn unsubscribe_unknown_user_fails() {
        let bus = EventBus::new();
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
        bus.current_market.subscribe("ABC", "u1", sink).unwrap();
        let err = bus.current_market.unsubscribe("ABC", "u2").unwrap_err();
        assert!(matches!(err, ExchangeError::NotSubscribed { .. }));
    }

    #[test]
    fn unsubscribe_unknown_topic_fails() {
        let bus = EventBus::new();
        let err = bus.current_market.unsubscribe("ZZZ", "u1").unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidStock(_)));
    }

    #[test]
    fn subscribe_then_unsubscribe_restores_table() {
        let bus = EventBus::new();
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());
        bus.message.subscribe("ABC", "u1", sink).unwrap();
        bus.message.unsubscribe("ABC", "u1").unwrap();
        assert!(bus.message.table.snapshot_one("ABC", "u1").is_none());
    }

    #[test]
    fn last_sale_triggers_ticker_with_same_price() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink::default());
        bus.last_sale.subscribe("ABC", "u1", sink.clone()).unwrap();
        bus.ticker.subscribe("ABC", "u1", sink.clone()).unwrap();

        bus.publish_last_sale(LastSale {
            product: "ABC".into(),
            price: Price::limit(1000),
            volume: 10,
        });

        assert_eq!(sink.last_sales.lock().unwrap().len(), 1);
        let ticks = sink.tickers.lock().unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].arrow, ' ');
        assert_eq!(ticks[0].price, Price::limit(1000));
    }

    #[test]
    fn ticker_arrow_reflects_price_movement() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink::default());
        bus.ticker.subscribe("ABC", "u1", sink.clone()).unwrap();

        bus.ticker.publish("ABC", Price::limit(1000));
        bus.ticker.publish("ABC", Price::limit(1100));
        bus.ticker.publish("ABC", Price::limit(1000));
        bus.ticker.publish("ABC", Price::limit(1000));

        let ticks = sink.tickers.lock().unwrap();
        assert_eq!(ticks[0].arrow, ' ');
        assert_eq!(ticks[1].arrow, '\u{2191}');
        assert_eq!(ticks[2].arrow, '\u{2193}');
        assert_eq!(ticks[3].arrow, '=');
    }

    #[test]
    fn current_market_coerces_market_price_to_zero() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink::default());
        bus.current_market.subscribe("ABC", "u1", sink.clone()).unwrap();

        bus.publish_current_market(CurrentMarket {
            product: "ABC".into(),
            buy_price: Price::market(),
            buy_volume: 0,
            sell_price: Price::limit(1010),
            sell_volume: 5,
        });

        let snaps = sink.current_markets.lock().unwrap();
        assert_eq!(snaps[0].buy_price, Price::limit(0));
    }

    #[test]
    fn message_delivered_only_to_named_user() {
        let bus = EventBus::new();
        let sink1 = Arc::new(RecordingSink::default());
        let sink2 = Arc::new(RecordingSink::default());
        bus.message.subscribe("ABC", "u1", sink1.clone()).unwrap();
        bus.message.subscribe("ABC", "u2", sink2.clone()).unwrap();

        bus.publish_message(Fill {
            user: "u1".into(),
            product: "ABC".into(),
            price: Price::limit(1000),
            volume: 5,
            details: "leaving 0".into(),
            side: crate::tradable::Side::Buy,
            id: 1,
        });

        assert_eq!(sink1.messages.lock().unwrap().len(), 1);
        assert!(sink2.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn market_state_broadcasts_to_every_distinct_subscriber() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink::default());
        bus.message.subscribe("ABC", "u1", sink.clone()).unwrap();
        bus.message.subscribe("XYZ", "u1", sink.clone()).unwrap();

        bus.publish_market_state("OPEN");

        assert_eq!(sink.market_states.lock().unwrap().len(), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_others() {
        struct Panicker;
        impl EventSink for Panicker {
            fn on_market_state(&self, _state: &str) {
                panic!("boom");
            }
        }
        let bus = EventBus::new();
        let panicker: Arc<dyn EventSink> = Arc::new(Panicker);
        let recorder = Arc::new(RecordingSink::default());
        bus.message.subscribe("ABC", "bad", panicker).unwrap();
        bus.message.subscribe("ABC", "good", recorder.clone()).unwrap();

        bus.publish_market_state("CLOSED");

        assert_eq!(recorder.market_states.lock().unwrap().len(), 1);
    }
}
