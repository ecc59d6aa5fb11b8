//! One side (BUY or SELL) of one product's book: a price-keyed FIFO queue
//! plus the price-time matcher that consumes it on behalf of an aggressor.
//!
//! MARKET-priced resting entries (legal only while PREOPEN) live in a
//! separate queue rather than as a map key, since MARKET has no numeric
//! position to sort by — it is simply always the best price on whichever
//! side holds it.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, trace};

use crate::price::Price;
use crate::tradable::{Side, TradableEntry};

/// A fill or cancel/market receipt handed up to the product book for
/// publication. `details` is the human-readable remainder note.
#[derive(Debug, Clone)]
pub struct Fill {
    pub user: String,
    pub product: String,
    pub price: Price,
    pub volume: u64,
    pub details: String,
    pub side: Side,
    pub id: u64,
}

impl Fill {
    pub fn price_cents(&self) -> i64 {
        self.price.cents().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PriceTag {
    Market,
    Cents(i64),
}

impl From<&Price> for PriceTag {
    fn from(p: &Price) -> Self {
        match p.cents() {
            Some(c) => PriceTag::Cents(c),
            None => PriceTag::Market,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FillKey {
    user: String,
    id: u64,
    price: PriceTag,
}

/// Accumulates fills keyed by `(user, id, price)`, merging volume-wise and
/// adopting the latest `details` when the same key recurs — the fill-merge
/// rule that lets one counterparty's repeated fills across a matching run
/// collapse into a single outgoing message.
struct FillAccumulator {
    order: Vec<FillKey>,
    map: HashMap<FillKey, Fill>,
}

impl FillAccumulator {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            map: HashMap::new(),
        }
    }

    fn record(&mut self, fill: Fill) {
        let key = FillKey {
            user: fill.user.clone(),
            id: fill.id,
            price: PriceTag::from(&fill.price),
        };
        match self.map.get_mut(&key) {
            Some(existing) => {
                existing.volume += fill.volume;
                existing.details = fill.details;
            }
            None => {
                self.order.push(key.clone());
                self.map.insert(key, fill);
            }
        }
    }

    fn into_vec(mut self) -> Vec<Fill> {
        self.order
            .into_iter()
            .filter_map(|k| self.map.remove(&k))
            .collect()
    }
}

pub struct BookSide {
    side: Side,
    levels: BTreeMap<i64, VecDeque<TradableEntry>>,
    market_queue: VecDeque<TradableEntry>,
}

impl BookSide {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            levels: BTreeMap::new(),
            market_queue: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty() && self.market_queue.is_empty()
    }

    /// Appends to the queue at `entry.price()`, creating an empty queue if
    /// absent. No trading is performed here.
    pub fn add_to_book(&mut self, entry: TradableEntry) {
        match entry.price().cents() {
            Some(cents) => self.levels.entry(cents).or_default().push_back(entry),
            None => self.market_queue.push_back(entry),
        }
    }

    /// The best price on this side, or `None` if empty. MARKET outranks
    /// every LIMIT price when resting entries are present at it.
    pub fn top_price(&self) -> Option<Price> {
        if !self.market_queue.is_empty() {
            return Some(Price::market());
        }
        match self.side {
            Side::Buy => self.levels.keys().next_back().copied().map(Price::limit),
            Side::Sell => self.levels.keys().next().copied().map(Price::limit),
        }
    }

    /// The best price paired with the total remaining volume resting there.
    pub fn top_price_and_volume(&self) -> Option<(Price, u64)> {
        let top = self.top_price()?;
        let queue = self.queue_for(&top);
        let volume = queue.iter().map(|e| e.remaining_volume()).sum();
        Some((top, volume))
    }

    fn queue_for(&self, price: &Price) -> &VecDeque<TradableEntry> {
        match price.cents() {
            Some(cents) => self.levels.get(&cents).expect("price key vanished"),
            None => &self.market_queue,
        }
    }

    fn queue_for_mut(&mut self, price: &Price) -> &mut VecDeque<TradableEntry> {
        match price.cents() {
            Some(cents) => self.levels.get_mut(&cents).expect("price key vanished"),
            None => &mut self.market_queue,
        }
    }

    fn prune(&mut self, price: &Price) {
        if let Some(cents) = price.cents() {
            if self.levels.get(&cents).is_some_and(VecDeque::is_empty) {
                self.levels.remove(&cents);
            }
        }
    }

    /// Removes and returns every entry resting at the current top price,
    /// pruning the level. Used by the opening cross, which needs to take
    /// each BUY-top entry out to use as its own aggressor against SELL.
    pub fn drain_top_queue(&mut self) -> Vec<TradableEntry> {
        let Some(top) = self.top_price() else {
            return Vec::new();
        };
        match top.cents() {
            Some(cents) => self.levels.remove(&cents).map(Vec::from).unwrap_or_default(),
            None => std::mem::take(&mut self.market_queue).into(),
        }
    }

    /// `true` when the aggressor can trade against `opposite_top` at all.
    fn is_marketable(aggressor: &TradableEntry, opposite_top: &Price) -> bool {
        if aggressor.price().is_market() || opposite_top.is_market() {
            return true;
        }
        match aggressor.side() {
            Side::Buy => aggressor.price().ge(opposite_top),
            Side::Sell => aggressor.price().le(opposite_top),
        }
    }

    /// The price a fill is reported at: the resting price unless it is
    /// MARKET, in which case the aggressor's (limit) price is used; if both
    /// are MARKET (only possible during the opening cross) the caller's
    /// fallback — the last known sale price, defaulting to $0.00 — applies.
    fn effective_price(resting_price: &Price, aggressor_price: &Price, fallback: &Price) -> Price {
        if !resting_price.is_market() {
            return resting_price.clone();
        }
        if !aggressor_price.is_market() {
            return aggressor_price.clone();
        }
        fallback.clone()
    }

    /// Runs the price-time matching algorithm: while the aggressor has
    /// remaining volume and the opposite top is marketable, consumes the
    /// FIFO queue at that top price, emitting merged fills and returning the
    /// resting entries that were fully consumed (for the caller to archive).
    /// The aggressor itself is mutated in place; the caller archives it too
    /// if it ends with zero remaining volume.
    pub fn try_trade(
        &mut self,
        aggressor: &mut TradableEntry,
        product: &str,
        fallback_price: &Price,
    ) -> (Vec<Fill>, Vec<TradableEntry>) {
        let mut acc = FillAccumulator::new();
        let mut archived = Vec::new();

        'outer: loop {
            if aggressor.remaining_volume() == 0 {
                break;
            }
            let Some(top) = self.top_price() else {
                break;
            };
            if !Self::is_marketable(aggressor, &top) {
                break;
            }
            debug!(
                aggressor_id = aggressor.id(),
                opposite_top = %top,
                "matching aggressor against opposite top"
            );

            loop {
                if aggressor.remaining_volume() == 0 {
                    break 'outer;
                }
                let queue = self.queue_for_mut(&top);
                let Some(resting) = queue.front() else {
                    break;
                };
                let resting_price = resting.price();
                let effective = Self::effective_price(&resting_price, &aggressor.price(), fallback_price);
                let resting_remaining = resting.remaining_volume();
                let agg_remaining = aggressor.remaining_volume();

                if agg_remaining >= resting_remaining {
                    let mut resting_owned = queue.pop_front().expect("checked front above");
                    let trade_qty = resting_remaining;
                    resting_owned
                        .reduce_remaining_by_trade(trade_qty)
                        .expect("trade qty bounded by resting remaining");
                    aggressor
                        .reduce_remaining_by_trade(trade_qty)
                        .expect("trade qty bounded by aggressor remaining");

                    trace!(resting_id = resting_owned.id(), trade_qty, "resting fully consumed");
                    acc.record(Fill {
                        user: resting_owned.user().to_string(),
                        product: product.to_string(),
                        price: effective.clone(),
                        volume: trade_qty,
                        details: format!("leaving {}", resting_owned.remaining_volume()),
                        side: resting_owned.side(),
                        id: resting_owned.id(),
                    });
                    acc.record(Fill {
                        user: aggressor.user().to_string(),
                        product: product.to_string(),
                        price: effective,
                        volume: trade_qty,
                        details: format!("leaving {}", aggressor.remaining_volume()),
                        side: aggressor.side(),
                        id: aggressor.id(),
                    });
                    archived.push(resting_owned);
                    // The queue may now be empty (an exact 1:1 fill); prune
                    // immediately rather than relying solely on the
                    // post-loop prune below, which an aggressor-exhausted
                    // `break 'outer` at the top of this loop would bypass.
                    self.prune(&top);
                } else {
                    let trade_qty = agg_remaining;
                    {
                        let resting_mut = queue.front_mut().expect("checked front above");
                        resting_mut
                            .reduce_remaining_by_trade(trade_qty)
                            .expect("trade qty bounded by aggressor remaining");
                    }
                    aggressor
                        .reduce_remaining_by_trade(trade_qty)
                        .expect("trade qty equals aggressor remaining");

                    let resting_ref = queue.front().expect("still resting after partial fill");
                    trace!(resting_id = resting_ref.id(), trade_qty, "aggressor fully consumed");
                    acc.record(Fill {
                        user: resting_ref.user().to_string(),
                        product: product.to_string(),
                        price: effective.clone(),
                        volume: trade_qty,
                        details: format!("leaving {}", resting_ref.remaining_volume()),
                        side: resting_ref.side(),
                        id: resting_ref.id(),
                    });
                    acc.record(Fill {
                        user: aggressor.user().to_string(),
                        product: product.to_string(),
                        price: effective,
                        volume: trade_qty,
                        details: format!("leaving {}", aggressor.remaining_volume()),
                        side: aggressor.side(),
                        id: aggressor.id(),
                    });
                    break 'outer;
                }
            }
            self.prune(&top);
        }

        (acc.into_vec(), archived)
    }

    fn cancel_entry_as(entry: &mut TradableEntry, product: &str, details: String) -> Fill {
        let vol = entry.remaining_volume();
        entry
            .set_cancelled(vol)
            .expect("cancelling the full remaining volume never overflows");
        Fill {
            user: entry.user().to_string(),
            product: product.to_string(),
            price: entry.price(),
            volume: vol,
            details,
            side: entry.side(),
            id: entry.id(),
        }
    }

    /// Scans all prices for a non-quote entry with matching id. `None` if no
    /// match — the caller then checks the product book's old-entries archive.
    pub fn cancel_by_id(&mut self, id: u64, product: &str) -> Option<(TradableEntry, Fill)> {
        if let Some(pos) = self
            .market_queue
            .iter()
            .position(|e| !e.is_quote_side() && e.id() == id)
        {
            let mut entry = self.market_queue.remove(pos).expect("position just found");
            let details = format!("{} Order Cancelled", entry.side());
            let fill = Self::cancel_entry_as(&mut entry, product, details);
            return Some((entry, fill));
        }

        let mut prune_key = None;
        let mut result = None;
        for (&price, queue) in self.levels.iter_mut() {
            if let Some(pos) = queue.iter().position(|e| !e.is_quote_side() && e.id() == id) {
                let mut entry = queue.remove(pos).expect("position just found");
                let details = format!("{} Order Cancelled", entry.side());
                let fill = Self::cancel_entry_as(&mut entry, product, details);
                result = Some((entry, fill));
                if queue.is_empty() {
                    prune_key = Some(price);
                }
                break;
            }
        }
        if let Some(price) = prune_key {
            self.levels.remove(&price);
        }
        result
    }

    /// Removes the first (at most one) quote-side belonging to `user`.
    /// Silent no-op if none is found.
    pub fn cancel_quote_by_user(&mut self, user: &str, product: &str) -> Option<(TradableEntry, Fill)> {
        if let Some(pos) = self
            .market_queue
            .iter()
            .position(|e| e.is_quote_side() && e.user() == user)
        {
            let mut entry = self.market_queue.remove(pos).expect("position just found");
            let details = format!("Quote {}-Side Cancelled", self.side);
            let fill = Self::cancel_entry_as(&mut entry, product, details);
            return Some((entry, fill));
        }

        let mut prune_key = None;
        let mut result = None;
        for (&price, queue) in self.levels.iter_mut() {
            if let Some(pos) = queue.iter().position(|e| e.is_quote_side() && e.user() == user) {
                let mut entry = queue.remove(pos).expect("position just found");
                let details = format!("Quote {}-Side Cancelled", self.side);
                let fill = Self::cancel_entry_as(&mut entry, product, details);
                result = Some((entry, fill));
                if queue.is_empty() {
                    prune_key = Some(price);
                }
                break;
            }
        }
        if let Some(price) = prune_key {
            self.levels.remove(&price);
        }
        result
    }

    /// Cancels every entry in the side: quote-sides by user, orders by id.
    /// Collects victims first, then applies — the two-phase pattern used
    /// throughout to avoid mutating a collection while iterating it.
    pub fn cancel_all(&mut self, product: &str) -> Vec<(TradableEntry, Fill)> {
        let victims: Vec<(bool, String, u64)> = self
            .market_queue
            .iter()
            .chain(self.levels.values().flatten())
            .map(|e| (e.is_quote_side(), e.user().to_string(), e.id()))
            .collect();

        let mut out = Vec::with_capacity(victims.len());
        for (is_quote, user, id) in victims {
            let cancelled = if is_quote {
                self.cancel_quote_by_user(&user, product)
            } else {
                self.cancel_by_id(id, product)
            };
            if let Some(pair) = cancelled {
                out.push(pair);
            }
        }
        out
    }

    /// Sorted-by-price depth lines, `"<price> x <sum-remaining>"`; a single
    /// `"<Empty>"` line if the side has no resting volume.
    pub fn depth(&self) -> Vec<String> {
        if self.is_empty() {
            return vec!["<Empty>".to_string()];
        }
        let mut lines = Vec::new();
        if !self.market_queue.is_empty() {
            let sum: u64 = self.market_queue.iter().map(|e| e.remaining_volume()).sum();
            lines.push(format!("{} x {}", Price::market(), sum));
        }
        let keys: Vec<i64> = match self.side {
            Side::Buy => self.levels.keys().rev().copied().collect(),
            Side::Sell => self.levels.keys().copied().collect(),
        };
        for k in keys {
            let sum: u64 = self.levels[&k].iter().map(|e| e.remaining_volume()).sum();
            lines.push(format!("{} x {}", Price::limit(k), sum));
        }
        lines
    }

    /// All non-zero-remaining entries belonging to `user`, in the side's
    /// natural price order (MARKET first, then best-to-worst).
    pub fn orders_with_remaining(&self, user: &str) -> Vec<TradableEntry> {
        let mut out = Vec::new();
        for e in &self.market_queue {
            if e.user() == user && e.remaining_volume() > 0 {
                out.push(e.clone());
            }
        }
        let keys: Vec<i64> = match self.side {
            Side::Buy => self.levels.keys().rev().copied().collect(),
            Side::Sell => self.levels.keys().copied().collect(),
        };
        for k in keys {
            for e in &self.levels[&k] {
                if e.user() == user && e.remaining_volume() > 0 {
                    out.push(e.clone());
                }
            }
        }
        out
    }
}
