//! One product's book: couples its BUY/SELL [`BookSide`]s, enforces quote
//! replacement, runs the opening cross, and derives current-market.
//!
//! The book side never holds a back-reference to its product book. Instead
//! [`BookSide::try_trade`] takes a `fallback_price` in and hands archived
//! entries back out, so the archiving and too-late-to-cancel diagnosis stay
//! here, one level up, as plain ownership rather than a cyclic pointer.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::book::{BookSide, Fill};
use crate::errors::{ExchangeError, ExchangeResult};
use crate::events::{CurrentMarket, EventBus, LastSale};
use crate::price::Price;
use crate::tradable::{next_id, Quote, Side, TradableEntry};

/// Whether the enclosing market is open for crossing (`Open`) or only
/// accepting passive resting entries (`Preopen`). A product book never needs
/// to know about `Closed` — the registry refuses to route to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingPhase {
    Preopen,
    Open,
}

struct ProductBookInner {
    buy: BookSide,
    sell: BookSide,
    /// Users with an active quote on this product.
    quoting_users: std::collections::HashSet<String>,
    /// Fully-traded or fully-cancelled entries, keyed by their final price in
    /// cents (MARKET archives under `i64::MIN`, which is otherwise unused).
    old_entries: HashMap<i64, Vec<TradableEntry>>,
    last_fingerprint: Option<String>,
    /// The most recent last-sale price, used as the MARKET-vs-MARKET fallback
    /// price during the opening cross (§4.3); `$0.00` until the first trade.
    last_sale_price: Price,
}

impl ProductBookInner {
    fn new() -> Self {
        Self {
            buy: BookSide::new(Side::Buy),
            sell: BookSide::new(Side::Sell),
            quoting_users: std::collections::HashSet::new(),
            old_entries: HashMap::new(),
            last_fingerprint: None,
            last_sale_price: Price::limit(0),
        }
    }

    fn archive_key(entry: &TradableEntry) -> i64 {
        entry.price().cents().unwrap_or(i64::MIN)
    }

    fn archive(&mut self, entries: Vec<TradableEntry>) {
        for entry in entries {
            let key = Self::archive_key(&entry);
            self.old_entries.entry(key).or_default().push(entry);
        }
    }

    fn archive_one(&mut self, entry: TradableEntry) {
        self.archive(vec![entry]);
    }

    fn current_market_snapshot(&self, product: &str) -> CurrentMarket {
        let (buy_price, buy_volume) = self
            .buy
            .top_price_and_volume()
            .unwrap_or((Price::limit(0), 0));
        let (sell_price, sell_volume) = self
            .sell
            .top_price_and_volume()
            .unwrap_or((Price::limit(0), 0));
        CurrentMarket {
            product: product.to_string(),
            buy_price,
            buy_volume,
            sell_price,
            sell_volume,
        }
    }
}

/// One product's book, guarded by a single mutex covering both sides — the
/// registry-level + per-product two-tier lock scheme this engine uses in
/// place of a separate per-side lock (see the concurrency write-up in
/// the design notes).
pub struct ProductBook {
    symbol: String,
    inner: Mutex<ProductBookInner>,
}

impl ProductBook {
    pub fn new(symbol: String) -> Self {
        Self {
            symbol,
            inner: Mutex::new(ProductBookInner::new()),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    fn refresh_current_market(&self, inner: &mut ProductBookInner, bus: &EventBus) {
        let snap = inner.current_market_snapshot(&self.symbol);
        let fingerprint = snap.fingerprint();
        if inner.last_fingerprint.as_deref() != Some(fingerprint.as_str()) {
            inner.last_fingerprint = Some(fingerprint);
            bus.publish_current_market(snap);
        }
    }

    fn publish_fills(&self, bus: &EventBus, fills: &[Fill]) {
        for fill in fills {
            bus.publish_message(fill.clone());
        }
    }

    /// The price of the first fill in the merged stream, used as the
    /// last-sale price for a continuous-trading cross.
    fn first_fill_price(fills: &[Fill]) -> Option<Price> {
        fills.first().map(|f| f.price.clone())
    }

    pub fn add_order(
        &self,
        bus: &EventBus,
        phase: TradingPhase,
        mut entry: TradableEntry,
    ) -> ExchangeResult<u64> {
        let id = entry.id();
        let mut inner = self.inner.lock().expect("product book poisoned");

        if phase == TradingPhase::Preopen {
            match entry.side() {
                Side::Buy => inner.buy.add_to_book(entry),
                Side::Sell => inner.sell.add_to_book(entry),
            }
            self.refresh_current_market(&mut inner, bus);
            return Ok(id);
        }

        let fallback = inner.last_sale_price.clone();
        let opposite = match entry.side() {
            Side::Buy => &mut inner.sell,
            Side::Sell => &mut inner.buy,
        };
        let (fills, archived) = opposite.try_trade(&mut entry, &self.symbol, &fallback);
        let had_fills = !fills.is_empty();
        inner.archive(archived);

        if had_fills {
            self.refresh_current_market(&mut inner, bus);
            if let Some(price) = Self::first_fill_price(&fills) {
                inner.last_sale_price = price.clone();
                let traded = entry.original_volume() - entry.remaining_volume();
                bus.publish_last_sale(LastSale {
                    product: self.symbol.clone(),
                    price,
                    volume: traded,
                });
            }
            self.publish_fills(bus, &fills);
        }

        if entry.remaining_volume() > 0 {
            if entry.price().is_market() {
                let remainder = entry.remaining_volume();
                entry
                    .set_cancelled(remainder)
                    .expect("cancelling the full remainder never overflows");
                let cancel = Fill {
                    user: entry.user().to_string(),
                    product: self.symbol.clone(),
                    price: entry.price(),
                    volume: remainder,
                    details: "Cancelled".to_string(),
                    side: entry.side(),
                    id: entry.id(),
                };
                inner.archive_one(entry);
                bus.publish_message(cancel);
            } else {
                match entry.side() {
                    Side::Buy => inner.buy.add_to_book(entry),
                    Side::Sell => inner.sell.add_to_book(entry),
                }
            }
        } else {
            inner.archive_one(entry);
        }

        Ok(id)
    }

    /// Installs a two-sided quote, first silently tearing down any existing
    /// quote from the same user (the open-question path: the replacement is
    /// atomic and silent, no cancel messages for the outgoing sides — see
    /// the error-handling design notes).
    pub fn add_quote(&self, bus: &EventBus, phase: TradingPhase, quote: Quote) -> ExchangeResult<(u64, u64)> {
        let buy_id = quote.buy.id();
        let sell_id = quote.sell.id();
        {
            let mut inner = self.inner.lock().expect("product book poisoned");
            if inner.quoting_users.contains(quote.buy.user()) {
                let user = quote.buy.user().to_string();
                if let Some((entry, _)) = inner.buy.cancel_quote_by_user(&user, &self.symbol) {
                    inner.archive_one(entry);
                }
                if let Some((entry, _)) = inner.sell.cancel_quote_by_user(&user, &self.symbol) {
                    inner.archive_one(entry);
                }
            }
            inner.quoting_users.insert(quote.buy.user().to_string());
        }

        self.add_order(bus, phase, quote.buy)?;
        self.add_order(bus, phase, quote.sell)?;

        let mut inner = self.inner.lock().expect("product book poisoned");
        self.refresh_current_market(&mut inner, bus);
        Ok((buy_id, sell_id))
    }

    /// Runs the opening auction: repeatedly drains the BUY top queue against
    /// SELL while the two tops can still cross, publishing current-market and
    /// a pass-wise last-sale (min fill price, max fill volume in that pass)
    /// after every pass.
    pub fn open_market(&self, bus: &EventBus) {
        let mut inner = self.inner.lock().expect("product book poisoned");
        loop {
            let (Some(buy_top), Some(sell_top)) = (inner.buy.top_price(), inner.sell.top_price()) else {
                break;
            };
            let crosses = buy_top.is_market()
                || sell_top.is_market()
                || buy_top.ge(&sell_top);
            if !crosses {
                break;
            }

            let aggressors = inner.buy.drain_top_queue();
            if aggressors.is_empty() {
                break;
            }
            debug!(product = %self.symbol, count = aggressors.len(), "opening cross pass");

            let mut pass_fills: Vec<Fill> = Vec::new();
            for mut aggressor in aggressors {
                let fallback = inner.last_sale_price.clone();
                let (fills, archived) = inner.sell.try_trade(&mut aggressor, &self.symbol, &fallback);
                inner.archive(archived);
                pass_fills.extend(fills);
                if aggressor.remaining_volume() > 0 {
                    inner.buy.add_to_book(aggressor);
                } else {
                    inner.archive_one(aggressor);
                }
            }

            if pass_fills.is_empty() {
                break;
            }

            self.refresh_current_market(&mut inner, bus);

            let min_price = pass_fills
                .iter()
                .filter_map(|f| f.price.cents())
                .min()
                .map(Price::limit)
                .unwrap_or_else(|| Price::limit(0));
            inner.last_sale_price = min_price.clone();
            let max_volume = pass_fills.iter().map(|f| f.volume).max().unwrap_or(0);
            bus.publish_last_sale(LastSale {
                product: self.symbol.clone(),
                price: min_price,
                volume: max_volume,
            });
            self.publish_fills(bus, &pass_fills);
        }
    }

    /// Cancels every resting entry on both sides and refreshes current-market.
    pub fn close_market(&self, bus: &EventBus) {
        let mut inner = self.inner.lock().expect("product book poisoned");
        let buy_cancels = inner.buy.cancel_all(&self.symbol);
        let sell_cancels = inner.sell.cancel_all(&self.symbol);
        inner.quoting_users.clear();
        for (entry, fill) in buy_cancels.into_iter().chain(sell_cancels) {
            inner.archive_one(entry);
            bus.publish_message(fill);
        }
        self.refresh_current_market(&mut inner, bus);
    }

    pub fn cancel_order(&self, bus: &EventBus, id: u64) -> ExchangeResult<()> {
        let mut inner = self.inner.lock().expect("product book poisoned");
        if let Some((entry, fill)) = inner.buy.cancel_by_id(id, &self.symbol) {
            inner.archive_one(entry);
            bus.publish_message(fill);
            self.refresh_current_market(&mut inner, bus);
            return Ok(());
        }
        if let Some((entry, fill)) = inner.sell.cancel_by_id(id, &self.symbol) {
            inner.archive_one(entry);
            bus.publish_message(fill);
            self.refresh_current_market(&mut inner, bus);
            return Ok(());
        }
        self.check_too_late_to_cancel(&mut inner, bus, id)
    }

    pub fn cancel_quote(&self, bus: &EventBus, user: &str) -> ExchangeResult<()> {
        let mut inner = self.inner.lock().expect("product book poisoned");
        let mut cancelled = false;
        if let Some((entry, fill)) = inner.buy.cancel_quote_by_user(user, &self.symbol) {
            inner.archive_one(entry);
            bus.publish_message(fill);
            cancelled = true;
        }
        if let Some((entry, fill)) = inner.sell.cancel_quote_by_user(user, &self.symbol) {
            inner.archive_one(entry);
            bus.publish_message(fill);
            cancelled = true;
        }
        inner.quoting_users.remove(user);
        if cancelled {
            self.refresh_current_market(&mut inner, bus);
        }
        Ok(())
    }

    /// Searches the old-entries archive for `id`; a match publishes a cancel
    /// with details `"Too Late to Cancel"`, a miss fails with `OrderNotFound`.
    fn check_too_late_to_cancel(
        &self,
        inner: &mut ProductBookInner,
        bus: &EventBus,
        id: u64,
    ) -> ExchangeResult<()> {
        for entries in inner.old_entries.values() {
            if let Some(entry) = entries.iter().find(|e| e.id() == id) {
                let fill = Fill {
                    user: entry.user().to_string(),
                    product: self.symbol.clone(),
                    price: entry.price(),
                    volume: 0,
                    details: "Too Late to Cancel".to_string(),
                    side: entry.side(),
                    id: entry.id(),
                };
                bus.publish_message(fill);
                return Ok(());
            }
        }
        Err(ExchangeError::OrderNotFound(id))
    }

    pub fn depth(&self) -> (Vec<String>, Vec<String>) {
        let inner = self.inner.lock().expect("product book poisoned");
        (inner.buy.depth(), inner.sell.depth())
    }

    pub fn orders_with_remaining(&self, user: &str) -> Vec<TradableEntry> {
        let inner = self.inner.lock().expect("product book poisoned");
        let mut out = inner.buy.orders_with_remaining(user);
        out.extend(inner.sell.orders_with_remaining(user));
        out
    }

    pub fn next_order_id(&self, user: &str, price: &Price) -> u64 {
        next_id(user, &self.symbol, price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::RecordingSink;
    use std::sync::Arc;

    fn order(id: u64, user: &str, side: Side, price: Price, volume: u64) -> TradableEntry {
        TradableEntry::new_order(id, user.to_string(), "ABC".into(), side, price, volume).unwrap()
    }

    #[test]
    fn crossing_limit_in_open_produces_fills_and_current_market() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink::default());
        bus.current_market.subscribe("ABC", "u", sink.clone()).unwrap();
        bus.message.subscribe("ABC", "A", sink.clone()).unwrap();
        bus.message.subscribe("ABC", "B", sink.clone()).unwrap();

        let book = ProductBook::new("ABC".into());
        book.add_order(
            &bus,
            TradingPhase::Open,
            order(1, "A", Side::Sell, Price::limit(1010), 100),
        )
        .unwrap();
        book.add_order(
            &bus,
            TradingPhase::Open,
            order(2, "B", Side::Buy, Price::limit(1010), 60),
        )
        .unwrap();

        let messages = sink.messages.lock().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.price == Price::limit(1010)));

        let (buy_depth, sell_depth) = book.depth();
        assert_eq!(buy_depth, vec!["<Empty>".to_string()]);
        assert_eq!(sell_depth, vec!["$10.10 x 40".to_string()]);
    }

    #[test]
    fn market_order_in_open_cancels_unfilled_remainder() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink::default());
        bus.message.subscribe("ABC", "U1", sink.clone()).unwrap();
        bus.message.subscribe("ABC", "U2", sink.clone()).unwrap();

        let book = ProductBook::new("ABC".into());
        book.add_order(
            &bus,
            TradingPhase::Open,
            order(1, "U1", Side::Sell, Price::limit(80000), 50),
        )
        .unwrap();
        book.add_order(
            &bus,
            TradingPhase::Open,
            order(2, "U2", Side::Buy, Price::market(), 200),
        )
        .unwrap();

        let messages = sink.messages.lock().unwrap();
        let cancel = messages.iter().find(|m| m.details == "Cancelled").unwrap();
        assert_eq!(cancel.volume, 150);
        let (buy_depth, sell_depth) = book.depth();
        assert_eq!(buy_depth, vec!["<Empty>".to_string()]);
        assert_eq!(sell_depth, vec!["<Empty>".to_string()]);
    }

    #[test]
    fn too_late_to_cancel_after_full_fill() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink::default());
        bus.message.subscribe("ABC", "U1", sink.clone()).unwrap();
        bus.message.subscribe("ABC", "U2", sink.clone()).unwrap();

        let book = ProductBook::new("ABC".into());
        book.add_order(
            &bus,
            TradingPhase::Open,
            order(1, "U1", Side::Sell, Price::limit(1000), 10),
        )
        .unwrap();
        book.add_order(
            &bus,
            TradingPhase::Open,
            order(2, "U2", Side::Buy, Price::limit(1000), 10),
        )
        .unwrap();

        book.cancel_order(&bus, 1).unwrap();

        let messages = sink.messages.lock().unwrap();
        assert!(messages.iter().any(|m| m.details == "Too Late to Cancel"));
    }

    #[test]
    fn cancel_of_unknown_id_fails() {
        let bus = EventBus::new();
        let book = ProductBook::new("ABC".into());
        let err = book.cancel_order(&bus, 999).unwrap_err();
        assert!(matches!(err, ExchangeError::OrderNotFound(999)));
    }

    #[test]
    fn quote_replace_removes_prior_sides_silently() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink::default());
        bus.message.subscribe("ABC", "U1", sink.clone()).unwrap();

        let book = ProductBook::new("ABC".into());
        let q1 = Quote::new(
            "U1".into(),
            "ABC".into(),
            1,
            Price::limit(1000),
            100,
            2,
            Price::limit(1010),
            100,
        )
        .unwrap();
        book.add_quote(&bus, TradingPhase::Open, q1).unwrap();

        let q2 = Quote::new(
            "U1".into(),
            "ABC".into(),
            3,
            Price::limit(1002),
            100,
            4,
            Price::limit(1012),
            100,
        )
        .unwrap();
        book.add_quote(&bus, TradingPhase::Open, q2).unwrap();

        assert!(sink.messages.lock().unwrap().is_empty());
        let (buy_depth, sell_depth) = book.depth();
        assert_eq!(buy_depth, vec!["$10.02 x 100".to_string()]);
        assert_eq!(sell_depth, vec!["$10.12 x 100".to_string()]);
    }

    #[test]
    fn close_market_empties_both_sides() {
        let bus = EventBus::new();
        let book = ProductBook::new("ABC".into());
        book.add_order(
            &bus,
            TradingPhase::Preopen,
            order(1, "U1", Side::Buy, Price::limit(1000), 10),
        )
        .unwrap();
        book.add_order(
            &bus,
            TradingPhase::Preopen,
            order(2, "U2", Side::Sell, Price::limit(1010), 10),
        )
        .unwrap();

        book.close_market(&bus);

        let (buy_depth, sell_depth) = book.depth();
        assert_eq!(buy_depth, vec!["<Empty>".to_string()]);
        assert_eq!(sell_depth, vec!["<Empty>".to_string()]);
    }

    #[test]
    fn opening_cross_clears_marketable_overlap() {
        let bus = EventBus::new();
        let sink = Arc::new(RecordingSink::default());
        bus.last_sale.subscribe("ABC", "u", sink.clone()).unwrap();

        let book = ProductBook::new("ABC".into());
        book.add_order(&bus, TradingPhase::Preopen, order(1, "U1", Side::Buy, Price::limit(500), 500))
            .unwrap();
        book.add_order(&bus, TradingPhase::Preopen, order(2, "U2", Side::Buy, Price::limit(505), 200))
            .unwrap();
        book.add_order(&bus, TradingPhase::Preopen, order(3, "U3", Side::Sell, Price::limit(495), 300))
            .unwrap();
        book.add_order(&bus, TradingPhase::Preopen, order(4, "U4", Side::Sell, Price::limit(500), 400))
            .unwrap();

        book.open_market(&bus);

        let (buy_depth, sell_depth) = book.depth();
        assert_eq!(buy_depth, vec!["<Empty>".to_string()]);
        assert_eq!(sell_depth, vec!["<Empty>".to_string()]);
        assert!(!sink.last_sales.lock().unwrap().is_empty());
    }
}
