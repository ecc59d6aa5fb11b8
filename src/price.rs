//! Interned, cent-precision price value with a distinguished MARKET sentinel.
//!
//! Two [`Price::limit`] calls with the same cent value return the same
//! interned [`Arc<i64>`], so book-side price keys and fill-merge keys can
//! compare cheaply. [`Price::market`] is never ordered against a limit price
//! — every comparison that would need to rank MARKET numerically returns
//! `false` or `None` instead of guessing.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};

use crate::errors::{ExchangeError, ExchangeResult};

fn interner() -> &'static Mutex<HashMap<i64, Arc<i64>>> {
    static POOL: OnceLock<Mutex<HashMap<i64, Arc<i64>>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

#[derive(Debug, Clone)]
pub enum Price {
    Limit(Arc<i64>),
    Market,
}

impl Price {
    /// Returns the interned LIMIT instance for `cents`. Negative values are
    /// legal — they arise from subtraction.
    pub fn limit(cents: i64) -> Price {
        let mut pool = interner().lock().expect("price interner poisoned");
        let arc = pool.entry(cents).or_insert_with(|| Arc::new(cents)).clone();
        Price::Limit(arc)
    }

    /// Returns the process-wide MARKET sentinel.
    pub fn market() -> Price {
        Price::Market
    }

    pub fn is_market(&self) -> bool {
        matches!(self, Price::Market)
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, Price::Limit(c) if **c < 0)
    }

    pub fn cents(&self) -> Option<i64> {
        match self {
            Price::Limit(c) => Some(**c),
            Price::Market => None,
        }
    }

    pub fn add(&self, other: &Price) -> ExchangeResult<Price> {
        match (self, other) {
            (Price::Limit(a), Price::Limit(b)) => Ok(Price::limit(**a + **b)),
            _ => Err(ExchangeError::InvalidPriceOperation(
                "cannot add a MARKET price".into(),
            )),
        }
    }

    pub fn sub(&self, other: &Price) -> ExchangeResult<Price> {
        match (self, other) {
            (Price::Limit(a), Price::Limit(b)) => Ok(Price::limit(**a - **b)),
            _ => Err(ExchangeError::InvalidPriceOperation(
                "cannot subtract a MARKET price".into(),
            )),
        }
    }

    pub fn mul(&self, factor: i32) -> ExchangeResult<Price> {
        match self {
            Price::Limit(a) => Ok(Price::limit(**a * i64::from(factor))),
            Price::Market => Err(ExchangeError::InvalidPriceOperation(
                "cannot multiply a MARKET price".into(),
            )),
        }
    }

    /// Total order among LIMIT values only; `None` whenever either side is MARKET.
    pub fn compare_to(&self, other: &Price) -> Option<Ordering> {
        match (self, other) {
            (Price::Limit(a), Price::Limit(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn lt(&self, other: &Price) -> bool {
        self.compare_to(other) == Some(Ordering::Less)
    }

    pub fn le(&self, other: &Price) -> bool {
        matches!(self.compare_to(other), Some(Ordering::Less) | Some(Ordering::Equal))
    }

    pub fn gt(&self, other: &Price) -> bool {
        self.compare_to(other) == Some(Ordering::Greater)
    }

    pub fn ge(&self, other: &Price) -> bool {
        matches!(self.compare_to(other), Some(Ordering::Greater) | Some(Ordering::Equal))
    }
}

impl PartialEq for Price {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Price::Market, Price::Market) => true,
            (Price::Limit(a), Price::Limit(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Price {}

impl Hash for Price {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Price::Market => 0u8.hash(state),
            Price::Limit(c) => {
                1u8.hash(state);
                c.hash(state);
            }
        }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Price::Market => write!(f, "MKT"),
            Price::Limit(c) => {
                let cents = **c;
                let abs = cents.unsigned_abs();
                let dollars = abs / 100;
                let rem = abs % 100;
                if cents < 0 {
                    write!(f, "$-{dollars}.{rem:02}")
                } else {
                    write!(f, "${dollars}.{rem:02}")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_prices_with_same_cents_are_interned() {
        let a = Price::limit(1099);
        let b = Price::limit(1099);
        match (&a, &b) {
            (Price::Limit(x), Price::Limit(y)) => assert!(Arc::ptr_eq(x, y)),
            _ => panic!("expected limit prices"),
        }
        assert_eq!(a, b);
    }

    #[test]
    fn market_is_never_ordered_against_limit() {
        let m = Price::market();
        let l = Price::limit(100);
        assert!(!m.lt(&l));
        assert!(!m.gt(&l));
        assert!(!l.lt(&m));
        assert!(!l.gt(&m));
        assert_eq!(m.compare_to(&l), None);
    }

    #[test]
    fn arithmetic_fails_on_market() {
        let m = Price::market();
        let l = Price::limit(100);
        assert!(m.add(&l).is_err());
        assert!(l.add(&m).is_err());
        assert!(m.mul(2).is_err());
    }

    #[test]
    fn display_formats_cents_as_currency() {
        assert_eq!(Price::market().to_string(), "MKT");
        assert_eq!(Price::limit(1005).to_string(), "$10.05");
        assert_eq!(Price::limit(0).to_string(), "$0.00");
        assert_eq!(Price::limit(-150).to_string(), "$-1.50");
    }

    #[test]
    fn negative_limit_prices_are_legal() {
        let p = Price::limit(-25);
        assert!(p.is_negative());
        assert!(!Price::limit(25).is_negative());
    }

    #[test]
    fn total_order_among_limits() {
        let a = Price::limit(100);
        let b = Price::limit(200);
        assert!(a.lt(&b));
        assert!(b.gt(&a));
        assert!(a.le(&a));
        assert!(a.ge(&a));
    }
}
