use super::*;
use crate::broker::{Broker, RouteDispatch};
use crate::client::PeerInfo;
use crate::config::Settings;
use crate::utils::error::{EngineError, ProducerError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tungstenite::protocol::Message as WsMessage;

async fn next_json(rx: &mut mpsc::Receiver<WsMessage>) -> serde_json::Value {
    let msg = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("queue closed");
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

fn connected(broker: &Broker) -> (String, mpsc::Receiver<WsMessage>) {
    let (id, mut rx) = broker.connect(PeerInfo::default()).unwrap();
    rx.try_recv().unwrap();
    (id, rx)
}

fn ticket(account: &str, symbol: &str, side: Side, quantity: u64, price: f64) -> OrderTicket {
    OrderTicket {
        account_id: account.to_string(),
        symbol: symbol.to_string(),
        side,
        quantity,
        price,
    }
}

// --- market simulator -------------------------------------------------------

#[test]
fn test_resolutions_parse_and_serialize() {
    for (text, seconds) in [("1", 60), ("5", 300), ("15", 900), ("60", 3600), ("D", 86400)] {
        let resolution: Resolution = text.parse().unwrap();
        assert_eq!(resolution.seconds(), seconds);
        assert_eq!(serde_json::to_value(resolution).unwrap(), json!(text));
    }
    assert!(matches!(
        "2".parse::<Resolution>(),
        Err(ProducerError::InvalidRequest(_))
    ));
    assert!(serde_json::from_value::<BarsRequest>(json!({"symbol": "AAPL", "resolution": "W"})).is_err());
}

#[test]
fn test_bucket_start_aligns_to_resolution() {
    let five = Resolution::FiveMinutes;
    assert_eq!(five.bucket_start(0), 0);
    assert_eq!(five.bucket_start(299_999), 0);
    assert_eq!(five.bucket_start(300_000), 300_000);
}

#[test]
fn test_same_seed_gives_same_prices() {
    let a = MarketSimulator::new(7);
    let b = MarketSimulator::new(7);
    let left: Vec<f64> = (0..5).map(|_| a.quote("AAPL").unwrap().last).collect();
    let right: Vec<f64> = (0..5).map(|_| b.quote("AAPL").unwrap().last).collect();
    assert_eq!(left, right);
}

#[test]
fn test_history_is_consecutive_and_consistent() {
    let sim = MarketSimulator::new(1);
    let bars = sim.history("MSFT", Resolution::OneMinute, 20).unwrap();
    assert_eq!(bars.len(), 20);
    for pair in bars.windows(2) {
        assert_eq!(pair[1].time - pair[0].time, 60_000);
        assert_eq!(pair[1].open, pair[0].close);
    }
    for bar in &bars {
        assert!(bar.low <= bar.open.min(bar.close));
        assert!(bar.high >= bar.open.max(bar.close));
        assert_eq!(bar.time % 60_000, 0);
    }
}

#[test]
fn test_order_book_is_sorted_and_bounded() {
    let sim = MarketSimulator::new(3);
    let book = sim.order_book("TSLA", 5).unwrap();
    assert_eq!(book.bids.len(), 5);
    assert_eq!(book.asks.len(), 5);
    assert!(book.bids[0].price < book.asks[0].price);
    assert!(book.bids.windows(2).all(|w| w[0].price > w[1].price));
    assert!(book.asks.windows(2).all(|w| w[0].price < w[1].price));

    assert!(sim.order_book("TSLA", 0).is_err());
    assert!(sim.order_book("TSLA", 51).is_err());
}

#[test]
fn test_invalid_symbol_is_rejected() {
    let sim = MarketSimulator::new(3);
    assert!(matches!(sim.quote(""), Err(ProducerError::InvalidRequest(_))));
    assert!(sim.price("NOT A SYMBOL").is_err());
}

// --- market routes --------------------------------------------------------

#[tokio::test]
async fn test_bars_route_sends_history_snapshot() {
    let broker = Broker::new(&Settings::default());
    let sim = Arc::new(MarketSimulator::new(11));
    let route = broker.register_route("bars", BarsFeed::new(sim, 10)).unwrap();
    let (id, mut rx) = connected(&broker);

    let response = route
        .subscribe_json(&id, json!({"symbol": "AAPL", "resolution": "5"}))
        .unwrap();
    assert_eq!(response.topic, r#"bars:{"resolution":"5","symbol":"AAPL"}"#);

    let frame = next_json(&mut rx).await;
    assert_eq!(frame["type"], "bars.update");
    assert_eq!(frame["payload"]["data"]["kind"], "snapshot");
    assert_eq!(frame["payload"]["data"]["bars"].as_array().unwrap().len(), 10);
}

#[tokio::test]
async fn test_bars_route_rejects_unknown_resolution() {
    let broker = Broker::new(&Settings::default());
    let sim = Arc::new(MarketSimulator::new(11));
    let route = broker.register_route("bars", BarsFeed::new(sim, 10)).unwrap();
    let (id, _rx) = connected(&broker);

    let result = route.subscribe_json(&id, json!({"symbol": "AAPL", "resolution": "2"}));
    assert!(matches!(result, Err(EngineError::InvalidPayload { .. })));
    assert_eq!(route.tracker().started(), 0);
}

#[tokio::test]
async fn test_bars_source_polls_single_bar() {
    let sim = Arc::new(MarketSimulator::new(5));
    let source = BarsSource::new(sim);
    let request = BarsRequest {
        symbol: "AAPL".to_string(),
        resolution: Resolution::OneMinute,
    };
    let value = serde_json::to_value(crate::poller::PollSource::poll(&source, &request).unwrap()).unwrap();
    assert_eq!(value["kind"], "bar");
    assert!(value["bar"]["close"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn test_quotes_route_streams_until_unsubscribed() {
    let broker = Broker::new(&Settings::default());
    let sim = Arc::new(MarketSimulator::new(2));
    let route = broker
        .register_route("quotes", QuotesFeed::new(sim, Duration::from_millis(5)))
        .unwrap();
    let (id, mut rx) = connected(&broker);

    route.subscribe_json(&id, json!({"symbol": "MSFT"})).unwrap();
    for _ in 0..3 {
        let frame = next_json(&mut rx).await;
        assert_eq!(frame["type"], "quotes.update");
        let quote = &frame["payload"]["data"];
        assert_eq!(quote["symbol"], "MSFT");
        assert!(quote["bid"].as_f64().unwrap() < quote["ask"].as_f64().unwrap());
    }

    route.unsubscribe_json(&id, json!({"symbol": "MSFT"})).unwrap();
    assert!(route.tracker().topics().is_empty());
}

#[tokio::test]
async fn test_invalid_requests_are_refused_before_subscribing() {
    let broker = Broker::new(&Settings::default());
    let sim = Arc::new(MarketSimulator::new(2));
    let quotes = broker
        .register_route("quotes", QuotesFeed::new(sim.clone(), Duration::from_millis(5)))
        .unwrap();
    let books = broker
        .register_route("orderbook", OrderBookFeed::new(sim, Duration::from_millis(5)))
        .unwrap();
    let positions = broker
        .register_route("positions", PositionsFeed::new(Arc::new(MockLedger::new(16))))
        .unwrap();
    let (id, mut rx) = connected(&broker);

    let bad_symbol = quotes.subscribe_json(&id, json!({"symbol": "$$$"}));
    assert!(matches!(
        bad_symbol,
        Err(EngineError::Rejected { source: ProducerError::InvalidRequest(_), .. })
    ));
    let bad_depth = books.subscribe_json(&id, json!({"symbol": "AAPL", "depth": 0}));
    assert!(matches!(bad_depth, Err(EngineError::Rejected { .. })));
    let no_account = positions.subscribe_json(&id, json!({"account_id": " "}));
    assert!(matches!(no_account, Err(EngineError::Rejected { .. })));

    let topic = quotes.topic_for(&QuotesRequest { symbol: "$$$".to_string() }).unwrap();
    assert_eq!(broker.subscriber_count(&topic), 0);
    assert!(quotes.tracker().topics().is_empty());
    assert!(books.tracker().topics().is_empty());
    assert!(positions.tracker().topics().is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_orderbook_route_uses_requested_depth() {
    let broker = Broker::new(&Settings::default());
    let sim = Arc::new(MarketSimulator::new(2));
    let route = broker
        .register_route("orderbook", OrderBookFeed::new(sim, Duration::from_millis(5)))
        .unwrap();
    let (id, mut rx) = connected(&broker);

    let response = route
        .subscribe_json(&id, json!({"symbol": "AAPL", "depth": 3}))
        .unwrap();
    assert_eq!(response.topic, r#"orderbook:{"depth":3,"symbol":"AAPL"}"#);
    let frame = next_json(&mut rx).await;
    assert_eq!(frame["payload"]["data"]["bids"].as_array().unwrap().len(), 3);

    let response = route.subscribe_json(&id, json!({"symbol": "AAPL"})).unwrap();
    assert_eq!(response.topic, r#"orderbook:{"depth":"","symbol":"AAPL"}"#);
}

// --- ledger -----------------------------------------------------------------

#[tokio::test]
async fn test_place_order_emits_one_order_and_one_position_event() {
    let ledger = MockLedger::new(16);
    let mut events = ledger.subscribe();

    let execution = ledger
        .place_order(ticket("acc-1", "AAPL", Side::Buy, 10, 100.0))
        .unwrap();

    assert_eq!(events.try_recv().unwrap(), LedgerEvent::Order(execution.order.clone()));
    assert_eq!(
        events.try_recv().unwrap(),
        LedgerEvent::Position(execution.position.clone())
    );
    assert!(events.try_recv().is_err());
    assert_eq!(ledger.orders("acc-1"), vec![execution.order]);
}

#[test]
fn test_position_average_price() {
    let ledger = MockLedger::new(16);
    ledger.place_order(ticket("a", "AAPL", Side::Buy, 10, 100.0)).unwrap();
    let add = ledger.place_order(ticket("a", "AAPL", Side::Buy, 10, 110.0)).unwrap();
    assert_eq!(add.position.quantity, 20);
    assert!((add.position.average_price - 105.0).abs() < 1e-9);

    let reduce = ledger.place_order(ticket("a", "AAPL", Side::Sell, 5, 120.0)).unwrap();
    assert_eq!(reduce.position.quantity, 15);
    assert!((reduce.position.average_price - 105.0).abs() < 1e-9);

    let flip = ledger.place_order(ticket("a", "AAPL", Side::Sell, 20, 90.0)).unwrap();
    assert_eq!(flip.position.quantity, -5);
    assert!((flip.position.average_price - 90.0).abs() < 1e-9);

    ledger.place_order(ticket("a", "AAPL", Side::Buy, 5, 95.0)).unwrap();
    assert!(ledger.positions("a").is_empty());
}

#[test]
fn test_order_history_keeps_only_recent_fills() {
    let ledger = MockLedger::new(16).with_order_history(3);
    let fills: Vec<Order> = (1..=5)
        .map(|n| {
            ledger
                .place_order(ticket("a", "AAPL", Side::Buy, n, 100.0))
                .unwrap()
                .order
        })
        .collect();
    ledger.place_order(ticket("b", "AAPL", Side::Buy, 1, 100.0)).unwrap();

    assert_eq!(ledger.orders("a"), fills[2..].to_vec());
    assert_eq!(ledger.orders("b").len(), 1);
    // positions still account for every fill
    assert_eq!(ledger.positions("a")[0].quantity, 15);
}

#[test]
fn test_invalid_orders_are_rejected() {
    let ledger = MockLedger::new(16);
    assert!(ledger.place_order(ticket("", "AAPL", Side::Buy, 1, 1.0)).is_err());
    assert!(ledger.place_order(ticket("a", "AAPL", Side::Buy, 0, 1.0)).is_err());
    assert!(ledger.place_order(ticket("a", "AAPL", Side::Buy, 1, -1.0)).is_err());
    assert!(ledger.orders("a").is_empty());
}

#[tokio::test]
async fn test_positions_route_snapshot_then_updates() {
    let broker = Broker::new(&Settings::default());
    let ledger = Arc::new(MockLedger::new(16));
    ledger.place_order(ticket("acc-1", "MSFT", Side::Buy, 5, 300.0)).unwrap();
    let route = broker
        .register_route("positions", PositionsFeed::new(ledger.clone()))
        .unwrap();
    let (id, mut rx) = connected(&broker);

    route.subscribe_json(&id, json!({"account_id": "acc-1"})).unwrap();
    let snapshot = next_json(&mut rx).await;
    assert_eq!(snapshot["payload"]["data"]["kind"], "snapshot");
    assert_eq!(snapshot["payload"]["data"]["positions"][0]["symbol"], "MSFT");

    ledger.place_order(ticket("other", "MSFT", Side::Buy, 1, 300.0)).unwrap();
    ledger.place_order(ticket("acc-1", "AAPL", Side::Sell, 2, 150.0)).unwrap();
    let update = next_json(&mut rx).await;
    assert_eq!(update["payload"]["data"]["kind"], "position");
    assert_eq!(update["payload"]["data"]["position"]["symbol"], "AAPL");
    assert_eq!(update["payload"]["data"]["position"]["quantity"], -2);
}

#[tokio::test]
async fn test_orders_route_filters_by_account() {
    let broker = Broker::new(&Settings::default());
    let ledger = Arc::new(MockLedger::new(16));
    let route = broker
        .register_route("orders", OrdersFeed::new(ledger.clone()))
        .unwrap();
    let (id, mut rx) = connected(&broker);

    route.subscribe_json(&id, json!({"account_id": "acc-2"})).unwrap();
    ledger.place_order(ticket("acc-1", "AAPL", Side::Buy, 1, 10.0)).unwrap();
    let mine = ledger.place_order(ticket("acc-2", "TSLA", Side::Sell, 3, 20.0)).unwrap();

    let frame = next_json(&mut rx).await;
    assert_eq!(frame["type"], "orders.update");
    assert_eq!(frame["payload"]["data"]["id"], mine.order.id);
    assert_eq!(frame["payload"]["data"]["side"], "sell");
}

#[tokio::test]
async fn test_executions_are_broadcast_by_symbol() {
    let settings = Settings::default();
    let broker = Broker::new(&settings);
    let ledger = Arc::new(MockLedger::new(16));
    let forwarder = tokio::spawn(forward_executions(broker.downgrade(), ledger.subscribe()));

    let (id, mut rx) = connected(&broker);
    let token = broker
        .login(&settings.auth.username, &settings.auth.password)
        .unwrap();
    broker.authenticate(&id, &token).unwrap();
    broker.subscribe_channel(&id, "executions", Some("AAPL")).unwrap();

    ledger.place_order(ticket("acc-1", "MSFT", Side::Buy, 1, 10.0)).unwrap();
    ledger.place_order(ticket("acc-1", "AAPL", Side::Buy, 2, 10.0)).unwrap();

    let frame = next_json(&mut rx).await;
    assert_eq!(frame["type"], "executions");
    assert_eq!(frame["channel"], "executions");
    assert_eq!(frame["payload"]["symbol"], "AAPL");
    assert_eq!(frame["payload"]["data"]["quantity"], 2);
    forwarder.abort();
}

#[tokio::test]
async fn test_simulated_activity_places_orders() {
    let ledger = Arc::new(MockLedger::new(64));
    let sim = Arc::new(MarketSimulator::new(9));
    let mut events = ledger.subscribe();
    let task = tokio::spawn(simulate_activity(
        ledger.clone(),
        sim,
        vec!["demo".to_string()],
        vec!["AAPL".to_string()],
        Duration::from_millis(5),
        42,
    ));

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, LedgerEvent::Order(ref order) if order.account_id == "demo"));
    task.abort();
}
