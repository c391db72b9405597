//! Mock brokerage
//!
//! `MockLedger` keeps the most recent orders and the net positions of each
//! account in memory. Orders
//! fill immediately at their limit price; every fill publishes one
//! `LedgerEvent::Order` followed by one `LedgerEvent::Position` on a
//! broadcast channel. A receiver that falls behind loses the events it
//! missed, so delivery to the feeds is at most once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Emitter, FeedProducer, Topic, WeakBroker};
use crate::feeds::market::MarketSimulator;
use crate::utils::error::ProducerError;

/// Orders kept per account by default; older fills are forgotten.
pub const DEFAULT_ORDER_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Filled,
}

/// An order as submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub price: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// Net position; `quantity` is negative when short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub account_id: String,
    pub symbol: String,
    pub quantity: i64,
    pub average_price: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub order: Order,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    Order(Order),
    Position(Position),
}

impl LedgerEvent {
    pub fn account_id(&self) -> &str {
        match self {
            LedgerEvent::Order(order) => &order.account_id,
            LedgerEvent::Position(position) => &position.account_id,
        }
    }
}

#[derive(Default)]
struct LedgerState {
    orders: HashMap<String, VecDeque<Order>>,
    positions: HashMap<(String, String), Position>,
}

pub struct MockLedger {
    state: Mutex<LedgerState>,
    events: broadcast::Sender<LedgerEvent>,
    order_history: usize,
}

impl MockLedger {
    /// `capacity` bounds how far a slow event receiver may fall behind.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(LedgerState::default()),
            events,
            order_history: DEFAULT_ORDER_HISTORY,
        }
    }

    /// Keep at most `limit` orders per account.
    pub fn with_order_history(mut self, limit: usize) -> Self {
        self.order_history = limit;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Fill `ticket` in full and update the account's position.
    pub fn place_order(&self, ticket: OrderTicket) -> Result<Execution, ProducerError> {
        if ticket.account_id.is_empty() {
            return Err(ProducerError::InvalidRequest("account_id is required".into()));
        }
        if ticket.symbol.is_empty() {
            return Err(ProducerError::InvalidRequest("symbol is required".into()));
        }
        if ticket.quantity == 0 {
            return Err(ProducerError::InvalidRequest("quantity must be positive".into()));
        }
        if !(ticket.price.is_finite() && ticket.price > 0.0) {
            return Err(ProducerError::InvalidRequest("price must be positive".into()));
        }

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4().to_string(),
            account_id: ticket.account_id,
            symbol: ticket.symbol,
            side: ticket.side,
            quantity: ticket.quantity,
            price: ticket.price,
            status: OrderStatus::Filled,
            created_at: now,
        };

        let position = {
            let mut state = self.lock();
            let recent = state.orders.entry(order.account_id.clone()).or_default();
            recent.push_back(order.clone());
            while recent.len() > self.order_history {
                recent.pop_front();
            }

            let key = (order.account_id.clone(), order.symbol.clone());
            let position = state.positions.entry(key).or_insert_with(|| Position {
                account_id: order.account_id.clone(),
                symbol: order.symbol.clone(),
                quantity: 0,
                average_price: 0.0,
                updated_at: now,
            });
            apply_fill(position, &order);
            position.updated_at = now;
            position.clone()
        };

        debug!(order = %order.id, account = %order.account_id, symbol = %order.symbol, "order filled");
        // no receivers is not an error for the ledger
        let _ = self.events.send(LedgerEvent::Order(order.clone()));
        let _ = self.events.send(LedgerEvent::Position(position.clone()));
        Ok(Execution { order, position })
    }

    /// Most recent orders of `account_id`, oldest first.
    pub fn orders(&self, account_id: &str) -> Vec<Order> {
        self.lock()
            .orders
            .get(account_id)
            .map(|recent| recent.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Open positions of `account_id`, sorted by symbol.
    pub fn positions(&self, account_id: &str) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .lock()
            .positions
            .values()
            .filter(|p| p.account_id == account_id && p.quantity != 0)
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Average price moves only when a fill adds to the position; reducing keeps
/// it, and crossing through flat restarts it at the fill price.
fn apply_fill(position: &mut Position, order: &Order) {
    let signed = match order.side {
        Side::Buy => order.quantity as i64,
        Side::Sell => -(order.quantity as i64),
    };
    let before = position.quantity;
    let after = before + signed;

    if before == 0 || before.signum() == signed.signum() {
        let cost = position.average_price * before.abs() as f64 + order.price * signed.abs() as f64;
        position.average_price = cost / after.abs() as f64;
    } else if after == 0 {
        position.average_price = 0.0;
    } else if after.signum() != before.signum() {
        position.average_price = order.price;
    }
    position.quantity = after;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRequest {
    pub account_id: String,
}

impl AccountRequest {
    fn check(&self) -> Result<(), ProducerError> {
        if self.account_id.trim().is_empty() {
            return Err(ProducerError::InvalidRequest("account_id is required".into()));
        }
        Ok(())
    }
}

/// `orders` producer: every fill for the account as it happens.
pub struct OrdersFeed {
    ledger: Arc<MockLedger>,
}

impl OrdersFeed {
    pub fn new(ledger: Arc<MockLedger>) -> Self {
        Self { ledger }
    }
}

impl FeedProducer for OrdersFeed {
    type Request = AccountRequest;
    type Value = Order;

    fn validate(&self, request: &AccountRequest) -> Result<(), ProducerError> {
        request.check()
    }

    fn create_topic(
        &self,
        topic: Topic,
        request: AccountRequest,
        emit: Emitter<Order>,
    ) -> BoxFuture<'static, Result<(), ProducerError>> {
        let events = self.ledger.subscribe();
        async move {
            follow_account(topic, events, &request.account_id, |event| match event {
                LedgerEvent::Order(order) => emit.emit(order),
                LedgerEvent::Position(_) => true,
            })
            .await
        }
        .boxed()
    }
}

/// Values pushed on the `positions` route.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PositionsUpdate {
    Snapshot { positions: Vec<Position> },
    Position { position: Position },
}

/// `positions` producer: the account's open positions, then every change.
pub struct PositionsFeed {
    ledger: Arc<MockLedger>,
}

impl PositionsFeed {
    pub fn new(ledger: Arc<MockLedger>) -> Self {
        Self { ledger }
    }
}

impl FeedProducer for PositionsFeed {
    type Request = AccountRequest;
    type Value = PositionsUpdate;

    fn validate(&self, request: &AccountRequest) -> Result<(), ProducerError> {
        request.check()
    }

    fn create_topic(
        &self,
        topic: Topic,
        request: AccountRequest,
        emit: Emitter<PositionsUpdate>,
    ) -> BoxFuture<'static, Result<(), ProducerError>> {
        let ledger = self.ledger.clone();
        // subscribe before reading the snapshot so no change falls in between
        let events = ledger.subscribe();
        async move {
            let positions = ledger.positions(&request.account_id);
            if !emit.emit(PositionsUpdate::Snapshot { positions }) {
                return Ok(());
            }
            follow_account(topic, events, &request.account_id, |event| match event {
                LedgerEvent::Position(position) => emit.emit(PositionsUpdate::Position { position }),
                LedgerEvent::Order(_) => true,
            })
            .await
        }
        .boxed()
    }
}

/// Feed ledger events for `account_id` to `forward` until it returns `false`
/// or the ledger goes away.
async fn follow_account(
    topic: Topic,
    mut events: broadcast::Receiver<LedgerEvent>,
    account_id: &str,
    mut forward: impl FnMut(LedgerEvent) -> bool,
) -> Result<(), ProducerError> {
    loop {
        match events.recv().await {
            Ok(event) if event.account_id() == account_id => {
                if !forward(event) {
                    return Ok(());
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                warn!(%topic, missed, "ledger events skipped for slow producer");
            }
            Err(RecvError::Closed) => return Err(ProducerError::Closed),
        }
    }
}

/// Broadcast every fill on the `executions` channel, scoped by symbol.
pub async fn forward_executions(broker: WeakBroker, mut events: broadcast::Receiver<LedgerEvent>) {
    loop {
        let order = match events.recv().await {
            Ok(LedgerEvent::Order(order)) => order,
            Ok(LedgerEvent::Position(_)) => continue,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "executions forwarder fell behind");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        let Some(broker) = broker.upgrade() else {
            return;
        };
        if let Err(e) = broker.broadcast("executions", Some(order.symbol.as_str()), &order) {
            warn!(order = %order.id, error = %e, "execution broadcast failed");
        }
    }
}

/// Demo order flow: one random order for a random account and symbol per
/// interval, priced at the simulator's current price.
pub async fn simulate_activity(
    ledger: Arc<MockLedger>,
    simulator: Arc<MarketSimulator>,
    accounts: Vec<String>,
    symbols: Vec<String>,
    interval: Duration,
    seed: u64,
) {
    if accounts.is_empty() || symbols.is_empty() {
        return;
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut ticker = tokio::time::interval(interval);
    info!(accounts = accounts.len(), symbols = symbols.len(), "simulated order flow started");

    loop {
        ticker.tick().await;
        let (Some(account), Some(symbol)) = (accounts.choose(&mut rng), symbols.choose(&mut rng))
        else {
            return;
        };
        let price = match simulator.price(symbol) {
            Ok(price) => price,
            Err(e) => {
                warn!(%symbol, error = %e, "no price for simulated order");
                continue;
            }
        };
        let ticket = OrderTicket {
            account_id: account.clone(),
            symbol: symbol.clone(),
            side: if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell },
            quantity: rng.gen_range(1..=10) * 10,
            price,
        };
        if let Err(e) = ledger.place_order(ticket) {
            warn!(error = %e, "simulated order rejected");
        }
    }
}
