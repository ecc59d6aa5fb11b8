//! The tradable entry: a single resting or aggressing side of an order or
//! quote. Matching only ever cares about its tag (to decide cancel-by-id vs.
//! cancel-by-user) and its volume/price fields, so `Order` and `QuoteSide`
//! are a single type distinguished by [`Kind`], per the polymorphism design
//! note — not a trait hierarchy.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

use crate::errors::{ExchangeError, ExchangeResult};
use crate::price::Price;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Order,
    QuoteSide,
}

static SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Synthesizes a process-unique id from `user ⊕ product ⊕ price ⊕ sequence`.
/// The monotonic sequence guarantees uniqueness even if the hash collides.
pub fn next_id(user: &str, product: &str, price: &Price) -> u64 {
    let seq = SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed);
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    user.hash(&mut hasher);
    product.hash(&mut hasher);
    price.hash(&mut hasher);
    seq.hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug, Clone)]
pub struct TradableEntry {
    id: u64,
    user: String,
    product: String,
    side: Side,
    price: Price,
    kind: Kind,
    original_volume: u64,
    remaining_volume: u64,
    cancelled_volume: u64,
}

impl TradableEntry {
    fn new(
        id: u64,
        user: String,
        product: String,
        side: Side,
        price: Price,
        kind: Kind,
        volume: u64,
    ) -> ExchangeResult<Self> {
        if volume == 0 {
            return Err(ExchangeError::InvalidData(
                "original volume must be > 0".into(),
            ));
        }
        Ok(Self {
            id,
            user,
            product,
            side,
            price,
            kind,
            original_volume: volume,
            remaining_volume: volume,
            cancelled_volume: 0,
        })
    }

    pub fn new_order(
        id: u64,
        user: String,
        product: String,
        side: Side,
        price: Price,
        volume: u64,
    ) -> ExchangeResult<Self> {
        Self::new(id, user, product, side, price, Kind::Order, volume)
    }

    pub fn new_quote_side(
        id: u64,
        user: String,
        product: String,
        side: Side,
        price: Price,
        volume: u64,
    ) -> ExchangeResult<Self> {
        Self::new(id, user, product, side, price, Kind::QuoteSide, volume)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn price(&self) -> Price {
        self.price.clone()
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_quote_side(&self) -> bool {
        matches!(self.kind, Kind::QuoteSide)
    }

    pub fn original_volume(&self) -> u64 {
        self.original_volume
    }

    pub fn remaining_volume(&self) -> u64 {
        self.remaining_volume
    }

    pub fn cancelled_volume(&self) -> u64 {
        self.cancelled_volume
    }

    pub fn traded_volume(&self) -> u64 {
        self.original_volume - self.remaining_volume - self.cancelled_volume
    }

    pub fn set_remaining(&mut self, v: u64) -> ExchangeResult<()> {
        if v + self.cancelled_volume > self.original_volume {
            return Err(ExchangeError::InvalidData(format!(
                "remaining {v} + cancelled {} exceeds original {}",
                self.cancelled_volume, self.original_volume
            )));
        }
        self.remaining_volume = v;
        Ok(())
    }

    /// `v` is the volume being newly cancelled now (additive call site).
    /// Reduces `remaining_volume` by the same amount so the §3 invariant
    /// holds without the caller doing arithmetic.
    pub fn set_cancelled(&mut self, v: u64) -> ExchangeResult<()> {
        let new_cancelled = self.cancelled_volume + v;
        if new_cancelled > self.original_volume || v > self.remaining_volume {
            return Err(ExchangeError::InvalidData(format!(
                "cancelling {v} is inconsistent with remaining {} / cancelled {} / original {}",
                self.remaining_volume, self.cancelled_volume, self.original_volume
            )));
        }
        self.cancelled_volume = new_cancelled;
        self.remaining_volume -= v;
        Ok(())
    }

    /// Reduces remaining volume by a traded quantity, routed through
    /// [`Self::set_remaining`] so the invariant check is never bypassed.
    pub fn reduce_remaining_by_trade(&mut self, qty: u64) -> ExchangeResult<()> {
        let new_remaining = self.remaining_volume.checked_sub(qty).ok_or_else(|| {
            ExchangeError::InvalidData(format!(
                "cannot trade {qty}, only {} remaining",
                self.remaining_volume
            ))
        })?;
        self.set_remaining(new_remaining)
    }
}

/// A two-sided liquidity posting: a BUY quote-side and a SELL quote-side
/// sharing the same user and product, constructed atomically so neither side
/// can exist without the other passing validation.
pub struct Quote {
    pub buy: TradableEntry,
    pub sell: TradableEntry,
}

impl Quote {
    pub fn new(
        user: String,
        product: String,
        buy_id: u64,
        buy_price: Price,
        buy_volume: u64,
        sell_id: u64,
        sell_price: Price,
        sell_volume: u64,
    ) -> ExchangeResult<Self> {
        if buy_price.is_market() || sell_price.is_market() {
            return Err(ExchangeError::DataValidation(
                "quotes must use limit prices".into(),
            ));
        }
        let zero = Price::limit(0);
        if !buy_price.gt(&zero) || !sell_price.gt(&zero) {
            return Err(ExchangeError::DataValidation(
                "both quote prices must be > $0.00".into(),
            ));
        }
        if !sell_price.gt(&buy_price) {
            return Err(ExchangeError::DataValidation(
                "sell price must exceed buy price".into(),
            ));
        }
        if buy_volume == 0 || sell_volume == 0 {
            return Err(ExchangeError::DataValidation(
                "both quote volumes must be > 0".into(),
            ));
        }
        let buy = TradableEntry::new_quote_side(
            buy_id,
            user.clone(),
            product.clone(),
            Side::Buy,
            buy_price,
            buy_volume,
        )?;
        let sell = TradableEntry::new_quote_side(
            sell_id, user, product, Side::Sell, sell_price, sell_volume,
        )?;
        Ok(Self { buy, sell })
    }
}
