//! Mock data sources behind the routes and channels.
//!
//! `market` simulates prices for the `bars`, `quotes` and `orderbook` routes;
//! `brokerage` keeps an in-memory order ledger for the `orders` and
//! `positions` routes and the `executions` channel.

pub mod brokerage;
pub mod market;

pub use brokerage::{
    AccountRequest, Execution, LedgerEvent, MockLedger, Order, OrderTicket, OrdersFeed, Position,
    PositionsFeed, PositionsUpdate, Side, forward_executions, simulate_activity,
};
pub use market::{
    Bar, BarsFeed, BarsRequest, BarsSource, BarsUpdate, MarketSimulator, OrderBook, OrderBookFeed,
    OrderBookRequest, Quote, QuotesFeed, QuotesRequest, Resolution, announce_market_status,
};

#[cfg(test)]
mod tests;
