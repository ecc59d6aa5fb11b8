use thiserror::Error;

/// Exhaustive error taxonomy for every public operation on the exchange.
///
/// Every variant maps to exactly one precondition violation described by the
/// component it belongs to; callers pattern-match rather than inspect strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("invalid price operation: {0}")]
    InvalidPriceOperation(String),

    #[error("data validation failed: {0}")]
    DataValidation(String),

    #[error("operation not permitted in market state {state}: {reason}")]
    InvalidMarketState { state: String, reason: String },

    #[error("invalid market state transition from {from} to {to}")]
    InvalidMarketStateTransition { from: String, to: String },

    #[error("no such product: {0}")]
    NoSuchProduct(String),

    #[error("product already exists: {0}")]
    ProductAlreadyExists(String),

    #[error("order not found: {0}")]
    OrderNotFound(u64),

    #[error("invalid stock/topic: {0}")]
    InvalidStock(String),

    #[error("user {user} is already subscribed to {topic}")]
    AlreadySubscribed { user: String, topic: String },

    #[error("user {user} is not subscribed to {topic}")]
    NotSubscribed { user: String, topic: String },

    #[error("user not connected: {0}")]
    UserNotConnected(String),

    #[error("invalid connection id: {0}")]
    InvalidConnectionId(String),

    #[error("user already connected: {0}")]
    AlreadyConnected(String),
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
