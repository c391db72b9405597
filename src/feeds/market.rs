//! Simulated market data
//!
//! `MarketSimulator` keeps one seeded random walk per symbol and derives bars,
//! quotes and order-book snapshots from it. The same seed always produces the
//! same sequence, which keeps tests deterministic.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::broker::{Emitter, FeedProducer, Topic, WeakBroker};
use crate::poller::PollSource;
use crate::utils::error::ProducerError;

pub const DEFAULT_BOOK_DEPTH: usize = 10;
pub const MAX_BOOK_DEPTH: usize = 50;

/// Bar width. Serialized as the string clients send: `1`, `5`, `15`, `60`
/// (minutes) or `D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1")]
    OneMinute,
    #[serde(rename = "5")]
    FiveMinutes,
    #[serde(rename = "15")]
    FifteenMinutes,
    #[serde(rename = "60")]
    OneHour,
    #[serde(rename = "D")]
    OneDay,
}

impl Resolution {
    pub const ALL: [Resolution; 5] = [
        Resolution::OneMinute,
        Resolution::FiveMinutes,
        Resolution::FifteenMinutes,
        Resolution::OneHour,
        Resolution::OneDay,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::OneMinute => "1",
            Resolution::FiveMinutes => "5",
            Resolution::FifteenMinutes => "15",
            Resolution::OneHour => "60",
            Resolution::OneDay => "D",
        }
    }

    pub fn seconds(self) -> i64 {
        match self {
            Resolution::OneMinute => 60,
            Resolution::FiveMinutes => 300,
            Resolution::FifteenMinutes => 900,
            Resolution::OneHour => 3_600,
            Resolution::OneDay => 86_400,
        }
    }

    /// Start of the bucket containing `timestamp_ms`, in milliseconds.
    pub fn bucket_start(self, timestamp_ms: i64) -> i64 {
        let width = self.seconds() * 1000;
        timestamp_ms - timestamp_ms.rem_euclid(width)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = ProducerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resolution::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| ProducerError::InvalidRequest(format!("unsupported resolution '{s}'")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarsRequest {
    pub symbol: String,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotesRequest {
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookRequest {
    pub symbol: String,
    #[serde(default)]
    pub depth: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Values pushed on the `bars` route: one history snapshot when the topic
/// starts, then single bars from the poller.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BarsUpdate {
    Snapshot { bars: Vec<Bar> },
    Bar { bar: Bar },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: i64,
}

struct SimState {
    rng: ChaCha8Rng,
    prices: HashMap<String, f64>,
}

impl SimState {
    fn price(&mut self, symbol: &str) -> f64 {
        if let Some(price) = self.prices.get(symbol) {
            return *price;
        }
        let price = round_cents(self.rng.gen_range(50.0..500.0));
        self.prices.insert(symbol.to_string(), price);
        price
    }

    fn step(&mut self, symbol: &str) -> f64 {
        let current = self.price(symbol);
        let change: f64 = self.rng.gen_range(-0.005..0.005);
        let next = round_cents((current * (1.0 + change)).max(0.01));
        self.prices.insert(symbol.to_string(), next);
        next
    }

    fn bar(&mut self, symbol: &str, time: i64) -> Bar {
        let open = self.price(symbol);
        let close = self.step(symbol);
        let wick: f64 = self.rng.gen_range(0.0..0.002);
        Bar {
            time,
            open,
            high: round_cents(open.max(close) * (1.0 + wick)),
            low: round_cents(open.min(close) * (1.0 - wick)),
            close,
            volume: self.rng.gen_range(100..10_000),
        }
    }
}

pub struct MarketSimulator {
    state: Mutex<SimState>,
}

impl MarketSimulator {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(SimState {
                rng: ChaCha8Rng::seed_from_u64(seed),
                prices: HashMap::new(),
            }),
        }
    }

    /// Last simulated price for `symbol`.
    pub fn price(&self, symbol: &str) -> Result<f64, ProducerError> {
        check_symbol(symbol)?;
        Ok(self.lock().price(symbol))
    }

    /// Advance the walk and return the bar for the current bucket.
    pub fn bar(&self, symbol: &str, resolution: Resolution) -> Result<Bar, ProducerError> {
        check_symbol(symbol)?;
        let time = resolution.bucket_start(Utc::now().timestamp_millis());
        Ok(self.lock().bar(symbol, time))
    }

    /// `count` consecutive bars ending with the current bucket, oldest first.
    pub fn history(
        &self,
        symbol: &str,
        resolution: Resolution,
        count: usize,
    ) -> Result<Vec<Bar>, ProducerError> {
        check_symbol(symbol)?;
        let width = resolution.seconds() * 1000;
        let newest = resolution.bucket_start(Utc::now().timestamp_millis());
        let oldest = newest - width * count.saturating_sub(1) as i64;

        let mut state = self.lock();
        Ok((0..count)
            .map(|i| state.bar(symbol, oldest + width * i as i64))
            .collect())
    }

    pub fn quote(&self, symbol: &str) -> Result<Quote, ProducerError> {
        check_symbol(symbol)?;
        let mut state = self.lock();
        let last = state.step(symbol);
        let half_spread = round_cents((last * 0.0005).max(0.01));
        Ok(Quote {
            symbol: symbol.to_string(),
            bid: round_cents(last - half_spread),
            ask: round_cents(last + half_spread),
            last,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    /// Book with `depth` levels per side around the current price. Bids are
    /// best (highest) first, asks best (lowest) first.
    pub fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, ProducerError> {
        check_symbol(symbol)?;
        check_depth(depth)?;

        let mut state = self.lock();
        let mid = state.step(symbol);
        let tick = round_cents((mid * 0.0005).max(0.01));
        let mut level = |offset: f64| BookLevel {
            price: round_cents(mid + offset),
            size: state.rng.gen_range(1..500) * 10,
        };
        let bids = (1..=depth).map(|i| level(-(i as f64) * tick)).collect();
        let asks = (1..=depth).map(|i| level(i as f64 * tick)).collect();

        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids,
            asks,
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn check_symbol(symbol: &str) -> Result<(), ProducerError> {
    let valid = !symbol.is_empty()
        && symbol.len() <= 12
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ProducerError::InvalidRequest(format!("invalid symbol '{symbol}'")))
    }
}

fn check_depth(depth: usize) -> Result<(), ProducerError> {
    if depth == 0 || depth > MAX_BOOK_DEPTH {
        return Err(ProducerError::InvalidRequest(format!(
            "depth must be between 1 and {MAX_BOOK_DEPTH}"
        )));
    }
    Ok(())
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `bars` producer: sends the recent history once, then stays idle while the
/// poller pushes new bars for subscribed topics.
pub struct BarsFeed {
    simulator: Arc<MarketSimulator>,
    history: usize,
}

impl BarsFeed {
    pub fn new(simulator: Arc<MarketSimulator>, history: usize) -> Self {
        Self { simulator, history }
    }
}

impl FeedProducer for BarsFeed {
    type Request = BarsRequest;
    type Value = BarsUpdate;

    fn validate(&self, request: &BarsRequest) -> Result<(), ProducerError> {
        check_symbol(&request.symbol)
    }

    fn create_topic(
        &self,
        topic: Topic,
        request: BarsRequest,
        emit: Emitter<BarsUpdate>,
    ) -> BoxFuture<'static, Result<(), ProducerError>> {
        let simulator = self.simulator.clone();
        let history = self.history;
        async move {
            let bars = simulator.history(&request.symbol, request.resolution, history)?;
            debug!(%topic, bars = bars.len(), "sending bar history");
            emit.emit(BarsUpdate::Snapshot { bars });
            futures::future::pending::<()>().await;
            Ok(())
        }
        .boxed()
    }
}

/// Poll source the bars poller uses for new bars.
pub struct BarsSource {
    simulator: Arc<MarketSimulator>,
}

impl BarsSource {
    pub fn new(simulator: Arc<MarketSimulator>) -> Self {
        Self { simulator }
    }
}

impl PollSource for BarsSource {
    type Request = BarsRequest;
    type Value = BarsUpdate;

    fn route(&self) -> &str {
        "bars"
    }

    fn poll(&self, request: &BarsRequest) -> Result<BarsUpdate, ProducerError> {
        let bar = self.simulator.bar(&request.symbol, request.resolution)?;
        Ok(BarsUpdate::Bar { bar })
    }
}

/// `quotes` producer: one quote per interval.
pub struct QuotesFeed {
    simulator: Arc<MarketSimulator>,
    interval: Duration,
}

impl QuotesFeed {
    pub fn new(simulator: Arc<MarketSimulator>, interval: Duration) -> Self {
        Self {
            simulator,
            interval,
        }
    }
}

impl FeedProducer for QuotesFeed {
    type Request = QuotesRequest;
    type Value = Quote;

    fn validate(&self, request: &QuotesRequest) -> Result<(), ProducerError> {
        check_symbol(&request.symbol)
    }

    fn create_topic(
        &self,
        _topic: Topic,
        request: QuotesRequest,
        emit: Emitter<Quote>,
    ) -> BoxFuture<'static, Result<(), ProducerError>> {
        let simulator = self.simulator.clone();
        let interval = self.interval;
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !emit.emit(simulator.quote(&request.symbol)?) {
                    return Ok(());
                }
            }
        }
        .boxed()
    }
}

/// `orderbook` producer: a fresh book snapshot per interval.
pub struct OrderBookFeed {
    simulator: Arc<MarketSimulator>,
    interval: Duration,
}

impl OrderBookFeed {
    pub fn new(simulator: Arc<MarketSimulator>, interval: Duration) -> Self {
        Self {
            simulator,
            interval,
        }
    }
}

impl FeedProducer for OrderBookFeed {
    type Request = OrderBookRequest;
    type Value = OrderBook;

    fn validate(&self, request: &OrderBookRequest) -> Result<(), ProducerError> {
        check_symbol(&request.symbol)?;
        check_depth(request.depth.unwrap_or(DEFAULT_BOOK_DEPTH))
    }

    fn create_topic(
        &self,
        _topic: Topic,
        request: OrderBookRequest,
        emit: Emitter<OrderBook>,
    ) -> BoxFuture<'static, Result<(), ProducerError>> {
        let simulator = self.simulator.clone();
        let interval = self.interval;
        let depth = request.depth.unwrap_or(DEFAULT_BOOK_DEPTH);
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let book = simulator.order_book(&request.symbol, depth)?;
                if !emit.emit(book) {
                    return Ok(());
                }
            }
        }
        .boxed()
    }
}

/// Payload of the periodic `market_status` broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct MarketStatus {
    pub status: &'static str,
    pub symbols: usize,
    pub server_time: i64,
}

/// Broadcast the market status on the `market_status` channel every
/// `interval` until the broker is gone.
pub async fn announce_market_status(
    broker: WeakBroker,
    simulator: Arc<MarketSimulator>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(broker) = broker.upgrade() else {
            return;
        };
        let status = MarketStatus {
            status: "open",
            symbols: simulator.lock().prices.len(),
            server_time: Utc::now().timestamp_millis(),
        };
        if let Err(e) = broker.broadcast("market_status", None, status) {
            warn!(error = %e, "market status broadcast failed");
        }
    }
}
