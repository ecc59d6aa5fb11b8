//! HTTP + WebSocket adapter over the core `Exchange`. Sketched per §6: the
//! wire format, connection IDs, and session bookkeeping are adapter
//! concerns, not part of the matching engine itself.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, warn};
use uuid::Uuid;

use crate::book::Fill;
use crate::errors::ExchangeError;
use crate::events::{CurrentMarket, EventSink, LastSale, Ticker};
use crate::price::Price;
use crate::registry::{Exchange, MarketState};
use crate::tradable::{Side, TradableEntry};

use super::session::ConnectionTable;

#[derive(Clone)]
pub struct AppState {
    pub exchange: Arc<Exchange>,
    pub connections: Arc<ConnectionTable>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            exchange: Arc::new(Exchange::new()),
            connections: Arc::new(ConnectionTable::new()),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

type ApiErr = (StatusCode, Json<serde_json::Value>);

fn err_response(status: StatusCode, msg: impl std::fmt::Display) -> ApiErr {
    (status, Json(json!({ "error": msg.to_string() })))
}

impl From<ExchangeError> for ApiErr {
    fn from(e: ExchangeError) -> Self {
        let status = match e {
            ExchangeError::NoSuchProduct(_)
            | ExchangeError::OrderNotFound(_)
            | ExchangeError::InvalidStock(_) => StatusCode::NOT_FOUND,
            ExchangeError::ProductAlreadyExists(_)
            | ExchangeError::AlreadyConnected(_)
            | ExchangeError::AlreadySubscribed { .. } => StatusCode::CONFLICT,
            ExchangeError::UserNotConnected(_) | ExchangeError::InvalidConnectionId(_) => {
                StatusCode::UNAUTHORIZED
            }
            _ => StatusCode::BAD_REQUEST,
        };
        err_response(status, e)
    }
}

fn parse_price(raw: &str) -> Result<Price, ApiErr> {
    if raw.eq_ignore_ascii_case("market") {
        return Ok(Price::market());
    }
    let dollars: f64 = raw
        .parse()
        .map_err(|_| err_response(StatusCode::BAD_REQUEST, "invalid price"))?;
    Ok(Price::limit((dollars * 100.0).round() as i64))
}

#[derive(Deserialize)]
pub struct ConnectRequest {
    user: String,
}

#[derive(Serialize)]
pub struct ConnectResponse {
    connection_id: String,
}

#[derive(Deserialize)]
pub struct DisconnectRequest {
    user: String,
    connection_id: String,
}

#[derive(Deserialize)]
pub struct CreateProductRequest {
    symbol: String,
}

#[derive(Deserialize)]
pub struct MarketStateRequest {
    state: String,
}

#[derive(Serialize)]
pub struct MarketStateResponse {
    state: String,
}

#[derive(Deserialize)]
pub struct NewOrderRequest {
    user: String,
    side: Side,
    price: String,
    volume: u64,
}

#[derive(Serialize)]
pub struct OrderAck {
    order_id: u64,
}

#[derive(Deserialize)]
pub struct NewQuoteRequest {
    user: String,
    buy_price: String,
    buy_volume: u64,
    sell_price: String,
    sell_volume: u64,
}

#[derive(Serialize)]
pub struct QuoteAck {
    buy_id: u64,
    sell_id: u64,
}

#[derive(Deserialize)]
pub struct CancelOrderQuery {
    id: u64,
}

#[derive(Deserialize)]
pub struct CancelQuoteQuery {
    user: String,
}

#[derive(Serialize)]
pub struct DepthResponse {
    buy: Vec<String>,
    sell: Vec<String>,
}

#[derive(Serialize)]
pub struct OrderView {
    id: u64,
    side: Side,
    price: String,
    original_volume: u64,
    remaining_volume: u64,
}

impl From<&TradableEntry> for OrderView {
    fn from(e: &TradableEntry) -> Self {
        Self {
            id: e.id(),
            side: e.side(),
            price: e.price().to_string(),
            original_volume: e.original_volume(),
            remaining_volume: e.remaining_volume(),
        }
    }
}

pub async fn connect(
    State(state): State<AppState>,
    Json(req): Json<ConnectRequest>,
) -> Result<Json<ConnectResponse>, ApiErr> {
    let connection_id = state.connections.connect(&req.user)?;
    Ok(Json(ConnectResponse {
        connection_id: connection_id.to_string(),
    }))
}

pub async fn disconnect(
    State(state): State<AppState>,
    Json(req): Json<DisconnectRequest>,
) -> Result<impl IntoResponse, ApiErr> {
    let connection_id = parse_uuid(&req.connection_id)?;
    state.connections.disconnect(&req.user, connection_id)?;
    Ok(StatusCode::OK)
}

pub async fn create_product(
    State(state): State<AppState>,
    Json(req): Json<CreateProductRequest>,
) -> Result<impl IntoResponse, ApiErr> {
    state.exchange.create_product(&req.symbol)?;
    Ok(StatusCode::CREATED)
}

pub async fn list_products(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.exchange.get_products())
}

pub async fn get_market_state(State(state): State<AppState>) -> Json<MarketStateResponse> {
    Json(MarketStateResponse {
        state: state.exchange.get_market_state().as_str().to_string(),
    })
}

pub async fn set_market_state(
    State(state): State<AppState>,
    Json(req): Json<MarketStateRequest>,
) -> Result<impl IntoResponse, ApiErr> {
    let next = match req.state.as_str() {
        "CLOSED" => MarketState::Closed,
        "PREOPEN" => MarketState::Preopen,
        "OPEN" => MarketState::Open,
        _ => return Err(err_response(StatusCode::BAD_REQUEST, "unknown market state")),
    };
    state.exchange.set_market_state(next)?;
    Ok(StatusCode::OK)
}

pub async fn submit_order(
    State(state): State<AppState>,
    Path(product): Path<String>,
    Json(req): Json<NewOrderRequest>,
) -> Result<Json<OrderAck>, ApiErr> {
    let price = parse_price(&req.price)?;
    let order_id = state
        .exchange
        .submit_order(&req.user, &product, price, req.volume, req.side)?;
    Ok(Json(OrderAck { order_id }))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    Path(product): Path<String>,
    Query(q): Query<CancelOrderQuery>,
) -> Result<impl IntoResponse, ApiErr> {
    state.exchange.submit_order_cancel(&product, q.id)?;
    Ok(StatusCode::OK)
}

pub async fn submit_quote(
    State(state): State<AppState>,
    Path(product): Path<String>,
    Json(req): Json<NewQuoteRequest>,
) -> Result<Json<QuoteAck>, ApiErr> {
    let buy_price = parse_price(&req.buy_price)?;
    let sell_price = parse_price(&req.sell_price)?;
    let (buy_id, sell_id) = state.exchange.submit_quote(
        &req.user,
        &product,
        buy_price,
        req.buy_volume,
        sell_price,
        req.sell_volume,
    )?;
    Ok(Json(QuoteAck { buy_id, sell_id }))
}

pub async fn cancel_quote(
    State(state): State<AppState>,
    Path(product): Path<String>,
    Query(q): Query<CancelQuoteQuery>,
) -> Result<impl IntoResponse, ApiErr> {
    state.exchange.submit_quote_cancel(&product, &q.user)?;
    Ok(StatusCode::OK)
}

pub async fn get_depth(
    State(state): State<AppState>,
    Path(product): Path<String>,
) -> Result<Json<DepthResponse>, ApiErr> {
    let (buy, sell) = state.exchange.get_book_depth(&product)?;
    Ok(Json(DepthResponse { buy, sell }))
}

pub async fn get_orders(
    State(state): State<AppState>,
    Path((product, user)): Path<(String, String)>,
) -> Result<Json<Vec<OrderView>>, ApiErr> {
    let orders = state.exchange.get_orders_with_remaining_qty(&product, &user)?;
    Ok(Json(orders.iter().map(OrderView::from).collect()))
}

/// Wire-tagged envelope for everything streamed over the websocket.
#[derive(Serialize)]
#[serde(tag = "type", content = "data")]
enum WsFrame {
    CurrentMarket {
        product: String,
        buy_price: String,
        buy_volume: u64,
        sell_price: String,
        sell_volume: u64,
    },
    LastSale {
        product: String,
        price: String,
        volume: u64,
    },
    Ticker {
        product: String,
        price: String,
        arrow: String,
    },
    Message {
        user: String,
        product: String,
        price: String,
        volume: u64,
        details: String,
        side: Side,
        id: u64,
    },
    MarketState {
        state: String,
    },
}

impl From<&CurrentMarket> for WsFrame {
    fn from(s: &CurrentMarket) -> Self {
        WsFrame::CurrentMarket {
            product: s.product.clone(),
            buy_price: s.buy_price.to_string(),
            buy_volume: s.buy_volume,
            sell_price: s.sell_price.to_string(),
            sell_volume: s.sell_volume,
        }
    }
}

impl From<&LastSale> for WsFrame {
    fn from(s: &LastSale) -> Self {
        WsFrame::LastSale {
            product: s.product.clone(),
            price: s.price.to_string(),
            volume: s.volume,
        }
    }
}

impl From<&Ticker> for WsFrame {
    fn from(t: &Ticker) -> Self {
        WsFrame::Ticker {
            product: t.product.clone(),
            price: t.price.to_string(),
            arrow: t.arrow.to_string(),
        }
    }
}

impl From<&Fill> for WsFrame {
    fn from(m: &Fill) -> Self {
        WsFrame::Message {
            user: m.user.clone(),
            product: m.product.clone(),
            price: m.price.to_string(),
            volume: m.volume,
            details: m.details.clone(),
            side: m.side,
            id: m.id,
        }
    }
}

/// Forwards every event it receives onto an unbounded channel drained by the
/// websocket task. `send` never blocks — the sink constraint in §5 — and a
/// client that has disconnected simply drops frames on the floor.
struct WsSink {
    tx: mpsc::UnboundedSender<WsFrame>,
}

impl EventSink for WsSink {
    fn on_current_market(&self, snap: &CurrentMarket) {
        let _ = self.tx.send(snap.into());
    }
    fn on_last_sale(&self, sale: &LastSale) {
        let _ = self.tx.send(sale.into());
    }
    fn on_ticker(&self, tick: &Ticker) {
        let _ = self.tx.send(tick.into());
    }
    fn on_message(&self, msg: &Fill) {
        let _ = self.tx.send(msg.into());
    }
    fn on_market_state(&self, state: &str) {
        let _ = self.tx.send(WsFrame::MarketState { state: state.to_string() });
    }
}

#[derive(Deserialize)]
pub struct WsSubscribeQuery {
    user: String,
    product: String,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(q): Query<WsSubscribeQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, q.user, q.product))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, user: String, product: String) {
    let (tx, mut rx) = mpsc::unbounded_channel::<WsFrame>();
    let sink: Arc<dyn EventSink> = Arc::new(WsSink { tx });

    if let Err(e) = state
        .exchange
        .subscribe_current_market(&product, &user, sink.clone())
        .and_then(|_| state.exchange.subscribe_last_sale(&product, &user, sink.clone()))
        .and_then(|_| state.exchange.subscribe_ticker(&product, &user, sink.clone()))
        .and_then(|_| state.exchange.subscribe_message(&product, &user, sink))
    {
        warn!(error = %e, "subscribe failed, closing socket");
        return;
    }

    loop {
        tokio::select! {
            Some(frame) = rx.recv() => {
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if let Err(e) = socket.send(Message::Text(text.into())).await {
                    error!(error = ?e, "websocket send failed");
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => continue,
                    _ => break,
                }
            }
        }
    }

    let _ = state.exchange.unsubscribe_current_market(&product, &user);
    let _ = state.exchange.unsubscribe_last_sale(&product, &user);
    let _ = state.exchange.unsubscribe_ticker(&product, &user);
    let _ = state.exchange.unsubscribe_message(&product, &user);
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/products", post(create_product).get(list_products))
        .route("/market-state", get(get_market_state).post(set_market_state))
        .route("/products/{product}/orders", post(submit_order).delete(cancel_order))
        .route("/products/{product}/quotes", post(submit_quote).delete(cancel_quote))
        .route("/products/{product}/depth", get(get_depth))
        .route("/products/{product}/orders/{user}", get(get_orders))
        .route("/ws", get(ws_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false).level(tracing::Level::TRACE))
                .on_response(DefaultOnResponse::new().level(tracing::Level::TRACE)),
        )
        .with_state(state)
}

fn parse_uuid(raw: &str) -> Result<Uuid, ApiErr> {
    Uuid::from_str(raw).map_err(|_| err_response(StatusCode::BAD_REQUEST, "invalid connection id"))
}
