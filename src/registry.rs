//! The product registry and market-state machine: the top-level `Exchange`
//! facade every command surface (CLI, HTTP/WS adapter) goes through.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{info, instrument};

use crate::errors::{ExchangeError, ExchangeResult};
use crate::events::{EventBus, EventSink};
use crate::price::Price;
use crate::product::{ProductBook, TradingPhase};
use crate::tradable::{Quote, Side, TradableEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketState {
    Closed,
    Preopen,
    Open,
}

impl MarketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketState::Closed => "CLOSED",
            MarketState::Preopen => "PREOPEN",
            MarketState::Open => "OPEN",
        }
    }

    /// The single legal transition out of each state: `CLOSED → PREOPEN →
    /// OPEN → CLOSED`. Any other requested transition is rejected.
    fn can_transition_to(self, next: MarketState) -> bool {
        matches!(
            (self, next),
            (MarketState::Closed, MarketState::Preopen)
                | (MarketState::Preopen, MarketState::Open)
                | (MarketState::Open, MarketState::Closed)
        )
    }
}

impl std::fmt::Display for MarketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct RegistryInner {
    state: MarketState,
    products: HashMap<String, Arc<ProductBook>>,
}

/// Process-wide facade: the product registry, the market-state machine, and
/// the event bus, threaded through every public operation as one explicit
/// value rather than as scoped statics.
pub struct Exchange {
    inner: Mutex<RegistryInner>,
    bus: EventBus,
}

impl Exchange {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                state: MarketState::Closed,
                products: HashMap::new(),
            }),
            bus: EventBus::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Legal in any market state.
    pub fn create_product(&self, symbol: &str) -> ExchangeResult<()> {
        if symbol.is_empty() {
            return Err(ExchangeError::InvalidData("product symbol must not be empty".into()));
        }
        let mut inner = self.inner.lock().expect("registry poisoned");
        if inner.products.contains_key(symbol) {
            return Err(ExchangeError::ProductAlreadyExists(symbol.to_string()));
        }
        inner
            .products
            .insert(symbol.to_string(), Arc::new(ProductBook::new(symbol.to_string())));
        info!(symbol, "product created");
        Ok(())
    }

    pub fn get_products(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry poisoned");
        let mut symbols: Vec<String> = inner.products.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn get_market_state(&self) -> MarketState {
        self.inner.lock().expect("registry poisoned").state
    }

    fn product(&self, inner: &RegistryInner, symbol: &str) -> ExchangeResult<Arc<ProductBook>> {
        inner
            .products
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::NoSuchProduct(symbol.to_string()))
    }

    #[instrument(skip(self))]
    pub fn set_market_state(&self, next: MarketState) -> ExchangeResult<()> {
        let books: Vec<Arc<ProductBook>> = {
            let mut inner = self.inner.lock().expect("registry poisoned");
            if !inner.state.can_transition_to(next) {
                return Err(ExchangeError::InvalidMarketStateTransition {
                    from: inner.state.as_str().to_string(),
                    to: next.as_str().to_string(),
                });
            }
            inner.state = next;
            inner.products.values().cloned().collect()
        };

        match next {
            MarketState::Open => {
                for book in &books {
                    book.open_market(&self.bus);
                }
            }
            MarketState::Closed => {
                for book in &books {
                    book.close_market(&self.bus);
                }
            }
            MarketState::Preopen => {}
        }

        self.bus.publish_market_state(next.as_str());
        info!(state = next.as_str(), "market state transitioned");
        Ok(())
    }

    fn require_state(&self, allowed: &[MarketState]) -> ExchangeResult<(MarketState, std::sync::MutexGuard<'_, RegistryInner>)> {
        let inner = self.inner.lock().expect("registry poisoned");
        if !allowed.contains(&inner.state) {
            return Err(ExchangeError::InvalidMarketState {
                state: inner.state.as_str().to_string(),
                reason: "operation not permitted in this state".to_string(),
            });
        }
        let state = inner.state;
        Ok((state, inner))
    }

    pub fn submit_order(
        &self,
        user: &str,
        product: &str,
        price: Price,
        volume: u64,
        side: Side,
    ) -> ExchangeResult<u64> {
        if price.is_market() {
            let (_, guard) = self.require_state(&[MarketState::Open])?;
            drop(guard);
        } else {
            let (_, guard) = self.require_state(&[MarketState::Preopen, MarketState::Open])?;
            drop(guard);
        }

        let inner = self.inner.lock().expect("registry poisoned");
        let state = inner.state;
        let book = self.product(&inner, product)?;
        drop(inner);

        let id = book.next_order_id(user, &price);
        let entry = TradableEntry::new_order(id, user.to_string(), product.to_string(), side, price, volume)?;
        let phase = if state == MarketState::Open {
            TradingPhase::Open
        } else {
            TradingPhase::Preopen
        };
        book.add_order(&self.bus, phase, entry)
    }

    pub fn submit_order_cancel(&self, product: &str, id: u64) -> ExchangeResult<()> {
        let (_, inner) = self.require_state(&[MarketState::Preopen, MarketState::Open])?;
        let book = self.product(&inner, product)?;
        drop(inner);
        book.cancel_order(&self.bus, id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn submit_quote(
        &self,
        user: &str,
        product: &str,
        buy_price: Price,
        buy_volume: u64,
        sell_price: Price,
        sell_volume: u64,
    ) -> ExchangeResult<(u64, u64)> {
        let (state, inner) = self.require_state(&[MarketState::Preopen, MarketState::Open])?;
        let book = self.product(&inner, product)?;
        drop(inner);

        let buy_id = book.next_order_id(user, &buy_price);
        let sell_id = book.next_order_id(user, &sell_price);
        let quote = Quote::new(
            user.to_string(),
            product.to_string(),
            buy_id,
            buy_price,
            buy_volume,
            sell_id,
            sell_price,
            sell_volume,
        )?;
        let phase = if state == MarketState::Open {
            TradingPhase::Open
        } else {
            TradingPhase::Preopen
        };
        book.add_quote(&self.bus, phase, quote)
    }

    pub fn submit_quote_cancel(&self, product: &str, user: &str) -> ExchangeResult<()> {
        let (_, inner) = self.require_state(&[MarketState::Preopen, MarketState::Open])?;
        let book = self.product(&inner, product)?;
        drop(inner);
        book.cancel_quote(&self.bus, user)
    }

    pub fn get_book_depth(&self, product: &str) -> ExchangeResult<(Vec<String>, Vec<String>)> {
        let inner = self.inner.lock().expect("registry poisoned");
        let book = self.product(&inner, product)?;
        drop(inner);
        Ok(book.depth())
    }

    pub fn get_orders_with_remaining_qty(&self, product: &str, user: &str) -> ExchangeResult<Vec<TradableEntry>> {
        let inner = self.inner.lock().expect("registry poisoned");
        let book = self.product(&inner, product)?;
        drop(inner);
        Ok(book.orders_with_remaining(user))
    }

    pub fn subscribe_current_market(&self, product: &str, user: &str, sink: Arc<dyn EventSink>) -> ExchangeResult<()> {
        self.bus.current_market.subscribe(product, user, sink)
    }

    pub fn unsubscribe_current_market(&self, product: &str, user: &str) -> ExchangeResult<()> {
        self.bus.current_market.unsubscribe(product, user)
    }

    pub fn subscribe_last_sale(&self, product: &str, user: &str, sink: Arc<dyn EventSink>) -> ExchangeResult<()> {
        self.bus.last_sale.subscribe(product, user, sink)
    }

    pub fn unsubscribe_last_sale(&self, product: &str, user: &str) -> ExchangeResult<()> {
        self.bus.last_sale.unsubscribe(product, user)
    }

    pub fn subscribe_ticker(&self, product: &str, user: &str, sink: Arc<dyn EventSink>) -> ExchangeResult<()> {
        self.bus.ticker.subscribe(product, user, sink)
    }

    pub fn unsubscribe_ticker(&self, product: &str, user: &str) -> ExchangeResult<()> {
        self.bus.ticker.unsubscribe(product, user)
    }

    pub fn subscribe_message(&self, product: &str, user: &str, sink: Arc<dyn EventSink>) -> ExchangeResult<()> {
        self.bus.message.subscribe(product, user, sink)
    }

    pub fn unsubscribe_message(&self, product: &str, user: &str) -> ExchangeResult<()> {
        self.bus.message.unsubscribe(product, user)
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_transition_is_rejected() {
        let ex = Exchange::new();
        let err = ex.set_market_state(MarketState::Open).unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidMarketStateTransition { .. }));
        assert_eq!(ex.get_market_state(), MarketState::Closed);
    }

    #[test]
    fn legal_transition_chain_succeeds() {
        let ex = Exchange::new();
        ex.set_market_state(MarketState::Preopen).unwrap();
        ex.set_market_state(MarketState::Open).unwrap();
        ex.set_market_state(MarketState::Closed).unwrap();
        assert_eq!(ex.get_market_state(), MarketState::Closed);
    }

    #[test]
    fn market_order_rejected_in_preopen() {
        let ex = Exchange::new();
        ex.create_product("ABC").unwrap();
        ex.set_market_state(MarketState::Preopen).unwrap();
        let err = ex
            .submit_order("u1", "ABC", Price::market(), 10, Side::Buy)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidMarketState { .. }));
    }

    #[test]
    fn create_product_rejects_duplicate() {
        let ex = Exchange::new();
        ex.create_product("ABC").unwrap();
        let err = ex.create_product("ABC").unwrap_err();
        assert!(matches!(err, ExchangeError::ProductAlreadyExists(_)));
    }

    #[test]
    fn order_against_unknown_product_fails() {
        let ex = Exchange::new();
        ex.set_market_state(MarketState::Preopen).unwrap();
        let err = ex
            .submit_order("u1", "ZZZ", Price::limit(100), 10, Side::Buy)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::NoSuchProduct(_)));
    }

    #[test]
    fn quote_rejects_sell_not_exceeding_buy() {
        let ex = Exchange::new();
        ex.create_product("ABC").unwrap();
        ex.set_market_state(MarketState::Preopen).unwrap();
        let err = ex
            .submit_quote("u1", "ABC", Price::limit(1000), 10, Price::limit(1000), 10)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::DataValidation(_)));
    }

    #[test]
    fn closing_the_market_cancels_resting_orders() {
        let ex = Exchange::new();
        ex.create_product("ABC").unwrap();
        ex.set_market_state(MarketState::Preopen).unwrap();
        ex.submit_order("u1", "ABC", Price::limit(1000), 10, Side::Buy).unwrap();
        ex.set_market_state(MarketState::Open).unwrap();
        ex.set_market_state(MarketState::Closed).unwrap();

        let (buy_depth, sell_depth) = ex.get_book_depth("ABC").unwrap();
        assert_eq!(buy_depth, vec!["<Empty>".to_string()]);
        assert_eq!(sell_depth, vec!["<Empty>".to_string()]);
    }

    #[test]
    fn get_products_is_sorted() {
        let ex = Exchange::new();
        ex.create_product("ZZZ").unwrap();
        ex.create_product("AAA").unwrap();
        assert_eq!(ex.get_products(), vec!["AAA".to_string(), "ZZZ".to_string()]);
    }
}
