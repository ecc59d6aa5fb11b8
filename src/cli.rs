//! A demo CLI that drives the `Exchange` directly, in-process, with no
//! transport involved — useful for scripting a scenario end-to-end without
//! standing up the HTTP adapter.

use clap::{Subcommand, builder::PossibleValuesParser};

use crate::price::Price;
use crate::registry::{Exchange, MarketState};
use crate::tradable::Side;

#[derive(Subcommand)]
pub enum Commands {
    /// Register a new product.
    CreateProduct { symbol: String },
    /// Move the market to the next lifecycle state.
    SetState {
        #[arg(value_parser = PossibleValuesParser::new(["CLOSED", "PREOPEN", "OPEN"]))]
        state: String,
    },
    /// Submit a limit or market order. Price is a dollar amount or "market".
    Order {
        product: String,
        user: String,
        #[arg(value_parser = PossibleValuesParser::new(["buy", "sell"]))]
        side: String,
        price: String,
        volume: u64,
    },
    /// Submit a two-sided quote.
    Quote {
        product: String,
        user: String,
        buy_price: String,
        buy_volume: u64,
        sell_price: String,
        sell_volume: u64,
    },
    /// Cancel a resting order by id.
    Cancel { product: String, id: u64 },
    /// Print the current book depth for a product.
    Depth { product: String },
}

fn parse_side(s: &str) -> Side {
    match s {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        _ => unreachable!("clap restricts to buy|sell"),
    }
}

fn parse_state(s: &str) -> MarketState {
    match s {
        "CLOSED" => MarketState::Closed,
        "PREOPEN" => MarketState::Preopen,
        "OPEN" => MarketState::Open,
        _ => unreachable!("clap restricts to CLOSED|PREOPEN|OPEN"),
    }
}

fn parse_price(raw: &str) -> anyhow::Result<Price> {
    if raw.eq_ignore_ascii_case("market") {
        return Ok(Price::market());
    }
    let dollars: f64 = raw.parse()?;
    Ok(Price::limit((dollars * 100.0).round() as i64))
}

pub fn run(command: Commands, exchange: &Exchange) -> anyhow::Result<()> {
    match command {
        Commands::CreateProduct { symbol } => {
            exchange.create_product(&symbol)?;
            println!("created product {symbol}");
        }
        Commands::SetState { state } => {
            exchange.set_market_state(parse_state(&state))?;
            println!("market state is now {}", exchange.get_market_state());
        }
        Commands::Order {
            product,
            user,
            side,
            price,
            volume,
        } => {
            let id = exchange.submit_order(&user, &product, parse_price(&price)?, volume, parse_side(&side))?;
            println!("order {id} accepted");
        }
        Commands::Quote {
            product,
            user,
            buy_price,
            buy_volume,
            sell_price,
            sell_volume,
        } => {
            let (buy_id, sell_id) = exchange.submit_quote(
                &user,
                &product,
                parse_price(&buy_price)?,
                buy_volume,
                parse_price(&sell_price)?,
                sell_volume,
            )?;
            println!("quote accepted: buy={buy_id} sell={sell_id}");
        }
        Commands::Cancel { product, id } => {
            exchange.submit_order_cancel(&product, id)?;
            println!("cancel {id} accepted");
        }
        Commands::Depth { product } => {
            let (buy, sell) = exchange.get_book_depth(&product)?;
            println!("BUY:");
            for line in buy {
                println!("  {line}");
            }
            println!("SELL:");
            for line in sell {
                println!("  {line}");
            }
        }
    }
    Ok(())
}
