use super::engine::Broker;
use super::hub::TopicHub;
use super::lifecycle::{EmitSink, Emitter, Ensure, ProducerFuture, ProducerTracker, Release};
use super::message::{Envelope, ResponseStatus, SubscriptionResponse};
use super::route::{FeedProducer, RouteDispatch};
use super::topic::{Topic, canonical_json};
use crate::client::{ConnectionId, Outbound, PeerInfo};
use crate::config::Settings;
use crate::utils::error::{EngineError, ProducerError};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BarParams {
    symbol: String,
    resolution: String,
}

fn bars(symbol: &str, resolution: &str) -> BarParams {
    BarParams {
        symbol: symbol.to_string(),
        resolution: resolution.to_string(),
    }
}

/// Records what the tracker does to producers of the test route.
#[derive(Clone, Default)]
struct Recorder {
    created: Arc<AtomicUsize>,
    removed: Arc<AtomicUsize>,
    emitters: Arc<Mutex<Vec<Emitter<u64>>>>,
}

impl Recorder {
    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    fn emitter(&self, index: usize) -> Emitter<u64> {
        self.emitters.lock().unwrap()[index].clone()
    }
}

struct RecordingFeed {
    recorder: Recorder,
}

impl FeedProducer for RecordingFeed {
    type Request = BarParams;
    type Value = u64;

    fn validate(&self, request: &BarParams) -> Result<(), ProducerError> {
        if request.symbol.is_empty() {
            return Err(ProducerError::InvalidRequest("symbol is required".to_string()));
        }
        Ok(())
    }

    fn create_topic(
        &self,
        _topic: Topic,
        _request: BarParams,
        emit: Emitter<u64>,
    ) -> BoxFuture<'static, Result<(), ProducerError>> {
        self.recorder.created.fetch_add(1, Ordering::SeqCst);
        self.recorder.emitters.lock().unwrap().push(emit);
        futures::future::pending().boxed()
    }

    fn remove_topic(&self, _topic: &Topic) {
        self.recorder.removed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Emits its first value before handing back the producer body.
struct EagerFeed {
    recorder: Recorder,
}

impl FeedProducer for EagerFeed {
    type Request = BarParams;
    type Value = u64;

    fn create_topic(
        &self,
        _topic: Topic,
        _request: BarParams,
        emit: Emitter<u64>,
    ) -> BoxFuture<'static, Result<(), ProducerError>> {
        self.recorder.created.fetch_add(1, Ordering::SeqCst);
        emit.emit(1);
        futures::future::pending().boxed()
    }

    fn remove_topic(&self, _topic: &Topic) {
        self.recorder.removed.fetch_add(1, Ordering::SeqCst);
    }
}

fn broker_with_recorder(settings: &Settings) -> (Broker, Arc<super::RouteHandler<RecordingFeed>>, Recorder) {
    let broker = Broker::new(settings);
    let recorder = Recorder::default();
    let route = broker
        .register_route(
            "bars",
            RecordingFeed {
                recorder: recorder.clone(),
            },
        )
        .unwrap();
    (broker, route, recorder)
}

fn connect(broker: &Broker) -> (ConnectionId, mpsc::Receiver<WsMessage>) {
    let (id, mut rx) = broker.connect(PeerInfo::default()).unwrap();
    // discard the welcome frame
    let welcome = rx.try_recv().expect("welcome frame");
    assert!(welcome.to_text().unwrap().contains("\"welcome\""));
    (id, rx)
}

fn next_json(rx: &mut mpsc::Receiver<WsMessage>) -> serde_json::Value {
    let msg = rx.try_recv().expect("expected a queued frame");
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

fn recording_tracker() -> (ProducerTracker<u64>, Arc<Mutex<Vec<(Topic, u64)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink: EmitSink<u64> = {
        let seen = seen.clone();
        Arc::new(move |topic: &Topic, value: u64| {
            seen.lock().unwrap().push((topic.clone(), value));
        })
    };
    (ProducerTracker::new("bars", sink), seen)
}

fn idle() -> ProducerFuture {
    futures::future::pending().boxed()
}

async fn settle(mut done: impl FnMut() -> bool) {
    for _ in 0..50 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

// --- topic keys -----------------------------------------------------------

#[test]
fn test_topic_is_order_independent() {
    let a = Topic::new("bars", &json!({"symbol": "AAPL", "resolution": "1"})).unwrap();
    let b = Topic::new("bars", &json!({"resolution": "1", "symbol": "AAPL"})).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_str(), r#"bars:{"resolution":"1","symbol":"AAPL"}"#);
    assert_eq!(a.feed_type(), "bars");
}

#[test]
fn test_topic_from_struct_matches_json_object() {
    let from_struct = Topic::new("bars", &bars("AAPL", "1")).unwrap();
    let from_json = Topic::new("bars", &json!({"resolution": "1", "symbol": "AAPL"})).unwrap();
    assert_eq!(from_struct, from_json);
}

#[test]
fn test_canonical_json_renders_null_as_empty_string() {
    #[derive(Serialize)]
    struct Depth {
        symbol: String,
        depth: Option<u32>,
    }
    let topic = Topic::new(
        "orderbook",
        &Depth {
            symbol: "AAPL".to_string(),
            depth: None,
        },
    )
    .unwrap();
    assert_eq!(topic.as_str(), r#"orderbook:{"depth":"","symbol":"AAPL"}"#);
}

#[test]
fn test_canonical_json_sorts_nested_objects() {
    let value = json!({
        "b": {"z": 1, "a": [ {"y": true, "x": null} ]},
        "a": "q\"uote"
    });
    assert_eq!(
        canonical_json(&value),
        r#"{"a":"q\"uote","b":{"a":[{"x":"","y":true}],"z":1}}"#
    );
}

#[test]
fn test_distinct_parameters_give_distinct_topics() {
    let one = Topic::new("bars", &bars("AAPL", "1")).unwrap();
    let five = Topic::new("bars", &bars("AAPL", "5")).unwrap();
    let quotes = Topic::new("quotes", &bars("AAPL", "1")).unwrap();
    assert_ne!(one, five);
    assert_ne!(one, quotes);
}

#[test]
fn test_unsupported_parameters_fail_canonicalization() {
    let mut params = BTreeMap::new();
    params.insert((1, 2), "tuple keys are not JSON");
    let result = Topic::new("bars", &params);
    assert!(matches!(result, Err(EngineError::Canonicalize { .. })));
}

// --- envelopes ------------------------------------------------------------

#[test]
fn test_subscribe_response_wire_shape() {
    let topic = Topic::new("bars", &bars("AAPL", "1")).unwrap();
    let envelope = Envelope::new(
        "bars.subscribe.response",
        "bars",
        SubscriptionResponse::subscribed(&topic),
    );
    let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

    assert_eq!(value["type"], "bars.subscribe.response");
    assert_eq!(value["channel"], "bars");
    assert!(value["timestamp"].as_i64().unwrap() > 0);
    assert!(value.get("request_id").is_none());
    assert_eq!(
        value["payload"],
        json!({
            "status": "ok",
            "topic": "bars:{\"resolution\":\"1\",\"symbol\":\"AAPL\"}",
            "message": "Subscribed"
        })
    );
}

#[test]
fn test_update_envelope_carries_topic_and_data() {
    let topic = Topic::new("bars", &bars("AAPL", "1")).unwrap();
    let envelope = Envelope::update("bars", &topic, 42).with_request_id(Some("r1".into()));
    let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
    assert_eq!(value["type"], "bars.update");
    assert_eq!(value["request_id"], "r1");
    assert_eq!(value["payload"]["topic"], topic.as_str());
    assert_eq!(value["payload"]["data"], 42);
}

// --- hub ------------------------------------------------------------------

#[test]
fn test_hub_counts_repeat_subscriptions() {
    let mut hub = TopicHub::new();
    let (outbound, _rx) = Outbound::channel(4);
    let id = "conn-1".to_string();
    let topic = Topic::new("bars", &bars("AAPL", "1")).unwrap();

    assert_eq!(hub.subscribe(&topic, &id), None);
    hub.attach(id.clone(), outbound);
    assert_eq!(hub.subscribe(&topic, &id), Some(1));
    assert_eq!(hub.subscribe(&topic, &id), Some(2));
    assert_eq!(hub.subscriber_count(&topic), 1);

    assert!(hub.unsubscribe(&topic, &id));
    assert!(hub.has_subscribers(&topic));
    assert_eq!(hub.detach(&id), vec![(topic.clone(), 1)]);
    assert!(!hub.has_subscribers(&topic));
    assert!(!hub.unsubscribe(&topic, &id));
}

#[test]
fn test_hub_deliver_sorts_outcomes() {
    let mut hub = TopicHub::new();
    let topic = Topic::new("bars", &bars("AAPL", "1")).unwrap();
    let (ok, mut rx_ok) = Outbound::channel(4);
    let (full, _rx_full) = Outbound::channel(1);
    let (closed, rx_closed) = Outbound::channel(4);
    for (id, outbound) in [("ok", ok), ("full", full.clone()), ("closed", closed)] {
        hub.attach(id.to_string(), outbound);
        hub.subscribe(&topic, &id.to_string());
    }
    full.try_send(WsMessage::text("filler")).unwrap();
    drop(rx_closed);

    let delivery = hub.deliver(&topic, &WsMessage::text("tick"));
    assert_eq!(delivery.delivered, 1);
    assert_eq!(delivery.dropped, 1);
    assert_eq!(delivery.closed, vec!["closed".to_string()]);
    assert_eq!(rx_ok.try_recv().unwrap().to_text().unwrap(), "tick");
}

// --- producer tracker -----------------------------------------------------

#[tokio::test]
async fn test_tracker_starts_one_producer_per_topic() {
    let (tracker, _seen) = recording_tracker();
    let calls = Arc::new(AtomicUsize::new(0));
    let aapl = Topic::new("bars", &bars("AAPL", "1")).unwrap();
    let msft = Topic::new("bars", &bars("MSFT", "1")).unwrap();

    for topic in [&aapl, &aapl, &msft, &aapl, &msft] {
        let calls = calls.clone();
        tracker.ensure(topic, move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            idle()
        });
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(tracker.started(), 2);
    assert_eq!(tracker.refcount(&aapl), Some(3));
    assert_eq!(tracker.refcount(&msft), Some(2));
    tracker.shutdown();
    assert!(tracker.topics().is_empty());
}

#[tokio::test]
async fn test_tracker_refcount_teardown_and_fresh_restart() {
    let (tracker, _seen) = recording_tracker();
    let topic = Topic::new("bars", &bars("AAPL", "1")).unwrap();

    assert_eq!(tracker.ensure(&topic, |_, _| idle()), Ensure::Started(1));
    assert_eq!(tracker.ensure(&topic, |_, _| idle()), Ensure::Joined(2));
    assert_eq!(tracker.ensure(&topic, |_, _| idle()), Ensure::Joined(3));

    assert_eq!(tracker.release(&topic), Release::Retained(2));
    assert_eq!(tracker.release(&topic), Release::Retained(1));
    assert!(tracker.is_running(&topic));
    assert_eq!(tracker.release(&topic), Release::Stopped);
    assert!(!tracker.is_running(&topic));
    assert_eq!(tracker.refcount(&topic), None);
    assert_eq!(tracker.release(&topic), Release::Untracked);

    assert_eq!(tracker.ensure(&topic, |_, _| idle()), Ensure::Started(1));
    assert_eq!(tracker.started(), 2);
}

#[tokio::test]
async fn test_released_emitter_drops_late_values() {
    let (tracker, seen) = recording_tracker();
    let topic = Topic::new("bars", &bars("AAPL", "1")).unwrap();
    let slot: Arc<Mutex<Option<Emitter<u64>>>> = Arc::new(Mutex::new(None));

    let captured = slot.clone();
    tracker.ensure(&topic, move |_, emit| {
        *captured.lock().unwrap() = Some(emit);
        idle()
    });
    let emitter = slot.lock().unwrap().take().unwrap();

    assert!(emitter.emit(1));
    assert_eq!(tracker.release(&topic), Release::Stopped);
    assert!(!emitter.is_live());
    assert!(!emitter.emit(2));

    assert_eq!(seen.lock().unwrap().clone(), vec![(topic.clone(), 1)]);
    assert_eq!(tracker.refcount(&topic), None);
}

#[tokio::test]
async fn test_release_cancels_the_producer_task() {
    struct DropFlag(Arc<AtomicUsize>);
    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let (tracker, _seen) = recording_tracker();
    let topic = Topic::new("bars", &bars("AAPL", "1")).unwrap();
    let dropped = Arc::new(AtomicUsize::new(0));

    let flag = DropFlag(dropped.clone());
    tracker.ensure(&topic, move |_, _| {
        async move {
            let _flag = flag;
            futures::future::pending::<()>().await;
            Ok(())
        }
        .boxed()
    });
    tokio::task::yield_now().await;
    assert_eq!(dropped.load(Ordering::SeqCst), 0);

    tracker.release(&topic);
    settle(|| dropped.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_failed_producer_is_torn_down_then_restarted() {
    let (tracker, _seen) = recording_tracker();
    let topic = Topic::new("bars", &bars("AAPL", "1")).unwrap();
    let stops = Arc::new(AtomicUsize::new(0));
    let tracker = {
        let stops = stops.clone();
        tracker.with_stop_hook(Arc::new(move |_: &Topic| {
            stops.fetch_add(1, Ordering::SeqCst);
        }))
    };

    let outcome = tracker.ensure(&topic, |_, _| {
        async { Err(ProducerError::Unavailable("feed down".to_string())) }.boxed()
    });
    assert_eq!(outcome, Ensure::Started(1));

    settle(|| !tracker.is_running(&topic)).await;
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    // the subscriber's reference survives the failure
    assert_eq!(tracker.refcount(&topic), Some(1));

    assert_eq!(tracker.ensure(&topic, |_, _| idle()), Ensure::Started(2));
    assert_eq!(tracker.started(), 2);
    assert!(tracker.is_running(&topic));
}

#[tokio::test]
async fn test_panicking_producer_is_contained() {
    let (tracker, _seen) = recording_tracker();
    let topic = Topic::new("bars", &bars("AAPL", "1")).unwrap();

    tracker.ensure(&topic, |_, _| {
        async {
            if true {
                panic!("producer bug");
            }
            Ok(())
        }
        .boxed()
    });

    settle(|| !tracker.is_running(&topic)).await;
    assert_eq!(tracker.release(&topic), Release::Stopped);
    assert_eq!(tracker.refcount(&topic), None);
}

#[tokio::test]
async fn test_release_from_inside_the_factory_stops_the_new_producer() {
    let (tracker, seen) = recording_tracker();
    let stops = Arc::new(AtomicUsize::new(0));
    let tracker = {
        let stops = stops.clone();
        Arc::new(tracker.with_stop_hook(Arc::new(move |_: &Topic| {
            stops.fetch_add(1, Ordering::SeqCst);
        })))
    };
    let topic = Topic::new("bars", &bars("AAPL", "1")).unwrap();

    let inner = tracker.clone();
    let outcome = tracker.ensure(&topic, move |topic, emit| {
        assert_eq!(inner.release(&topic), Release::Stopped);
        assert!(emit.emit(7));
        idle()
    });

    assert_eq!(outcome, Ensure::Started(1));
    assert_eq!(tracker.refcount(&topic), None);
    assert!(!tracker.is_running(&topic));
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert_eq!(seen.lock().unwrap().len(), 1);

    // the topic starts cleanly afterwards
    assert_eq!(tracker.ensure(&topic, |_, _| idle()), Ensure::Started(1));
    assert!(tracker.is_running(&topic));
}

#[tokio::test]
async fn test_panic_while_building_the_producer_is_contained() {
    let (tracker, _seen) = recording_tracker();
    let topic = Topic::new("bars", &bars("AAPL", "1")).unwrap();

    let outcome = tracker.ensure(&topic, |_, _| panic!("factory bug"));
    assert_eq!(outcome, Ensure::Started(1));
    assert!(!tracker.is_running(&topic));
    assert_eq!(tracker.refcount(&topic), Some(1));

    assert_eq!(tracker.ensure(&topic, |_, _| idle()), Ensure::Started(2));
    assert!(tracker.is_running(&topic));
}

// --- routes through the broker ----------------------------------------------

#[tokio::test]
async fn test_eager_producer_reaches_its_first_subscriber() {
    let broker = Broker::new(&Settings::default());
    let recorder = Recorder::default();
    let route = broker
        .register_route("bars", EagerFeed { recorder: recorder.clone() })
        .unwrap();
    let (id, mut rx) = connect(&broker);

    route.subscribe(&id, bars("AAPL", "1")).unwrap();

    let update = next_json(&mut rx);
    assert_eq!(update["type"], "bars.update");
    assert_eq!(update["payload"]["data"], 1);
    let topic = route.topic_for(&bars("AAPL", "1")).unwrap();
    assert!(route.tracker().is_running(&topic));
}

#[tokio::test]
async fn test_eager_producer_with_closed_subscriber_does_not_deadlock() {
    let broker = Broker::new(&Settings::default());
    let recorder = Recorder::default();
    let route = broker
        .register_route("bars", EagerFeed { recorder: recorder.clone() })
        .unwrap();
    let (id, rx) = connect(&broker);
    drop(rx);

    // the first emit finds the queue closed and disconnects the subscriber
    let response = route.subscribe(&id, bars("AAPL", "1")).unwrap();
    assert!(response.is_ok());

    let topic = route.topic_for(&bars("AAPL", "1")).unwrap();
    assert!(!broker.is_connected(&id));
    assert_eq!(broker.subscriber_count(&topic), 0);
    assert_eq!(route.tracker().refcount(&topic), None);
    assert!(!route.tracker().is_running(&topic));
    assert_eq!(recorder.created(), 1);
    assert_eq!(recorder.removed(), 1);
}

#[tokio::test]
async fn test_rejected_request_leaves_no_subscription() {
    let (broker, route, recorder) = broker_with_recorder(&Settings::default());
    let (id, mut rx) = connect(&broker);

    let result = route.subscribe_json(&id, json!({"symbol": "", "resolution": "1"}));
    assert!(matches!(result, Err(EngineError::Rejected { .. })));

    let topic = route.topic_for(&bars("", "1")).unwrap();
    assert_eq!(broker.subscriber_count(&topic), 0);
    assert_eq!(route.tracker().refcount(&topic), None);
    assert_eq!(recorder.created(), 0);
    assert!(rx.try_recv().is_err());
}


#[tokio::test]
async fn test_subscribe_replies_with_canonical_topic() {
    let (broker, route, recorder) = broker_with_recorder(&Settings::default());
    let (id, _rx) = connect(&broker);

    let response = route
        .subscribe_json(&id, json!({"symbol": "AAPL", "resolution": "1"}))
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);
    assert_eq!(response.message, "Subscribed");
    assert_eq!(response.topic, r#"bars:{"resolution":"1","symbol":"AAPL"}"#);
    assert_eq!(recorder.created(), 1);

    let response = route
        .unsubscribe_json(&id, json!({"resolution": "1", "symbol": "AAPL"}))
        .unwrap();
    assert!(response.is_ok());
    assert_eq!(response.message, "Unsubscribed");
    assert_eq!(response.topic, r#"bars:{"resolution":"1","symbol":"AAPL"}"#);
    assert_eq!(recorder.removed(), 1);
}

#[tokio::test]
async fn test_two_connections_share_one_producer() {
    let (broker, route, recorder) = broker_with_recorder(&Settings::default());
    let (a, _rx_a) = connect(&broker);
    let (b, _rx_b) = connect(&broker);

    route.subscribe(&a, bars("AAPL", "1")).unwrap();
    route.subscribe(&b, bars("AAPL", "1")).unwrap();
    route.subscribe(&b, bars("MSFT", "1")).unwrap();

    assert_eq!(recorder.created(), 2);
    let topic = route.topic_for(&bars("AAPL", "1")).unwrap();
    assert_eq!(route.tracker().refcount(&topic), Some(2));
    assert_eq!(broker.subscriber_count(&topic), 2);
}

#[tokio::test]
async fn test_last_unsubscribe_stops_producer() {
    let (broker, route, recorder) = broker_with_recorder(&Settings::default());
    let conns: Vec<_> = (0..3).map(|_| connect(&broker)).collect();
    let topic = route.topic_for(&bars("AAPL", "1")).unwrap();

    for (id, _) in &conns {
        route.subscribe(id, bars("AAPL", "1")).unwrap();
    }
    for (id, _) in &conns[..2] {
        route.unsubscribe(id, bars("AAPL", "1")).unwrap();
        assert!(route.tracker().is_running(&topic));
    }
    assert_eq!(recorder.removed(), 0);

    route.unsubscribe(&conns[2].0, bars("AAPL", "1")).unwrap();
    assert!(!route.tracker().is_running(&topic));
    assert_eq!(recorder.removed(), 1);
    assert!(!broker.has_subscribers(&topic));

    route.subscribe(&conns[0].0, bars("AAPL", "1")).unwrap();
    assert_eq!(recorder.created(), 2);
}

#[tokio::test]
async fn test_unsubscribe_without_subscription_keeps_others() {
    let (broker, route, recorder) = broker_with_recorder(&Settings::default());
    let (a, _rx_a) = connect(&broker);
    let (b, _rx_b) = connect(&broker);
    let topic = route.topic_for(&bars("AAPL", "1")).unwrap();

    route.subscribe(&a, bars("AAPL", "1")).unwrap();
    let response = route.unsubscribe(&b, bars("AAPL", "1")).unwrap();

    assert!(response.is_ok());
    assert!(route.tracker().is_running(&topic));
    assert_eq!(recorder.removed(), 0);
}

#[tokio::test]
async fn test_update_fans_out_to_every_subscriber() {
    let (broker, route, recorder) = broker_with_recorder(&Settings::default());
    let (a, mut rx_a) = connect(&broker);
    let (b, mut rx_b) = connect(&broker);
    let (c, mut rx_c) = connect(&broker);

    route.subscribe(&a, bars("AAPL", "1")).unwrap();
    route.subscribe(&b, bars("AAPL", "1")).unwrap();
    route.subscribe(&c, bars("MSFT", "1")).unwrap();

    assert!(recorder.emitter(0).emit(42));

    for rx in [&mut rx_a, &mut rx_b] {
        let frame = next_json(rx);
        assert_eq!(frame["type"], "bars.update");
        assert_eq!(frame["payload"]["data"], 42);
        assert_eq!(
            frame["payload"]["topic"],
            r#"bars:{"resolution":"1","symbol":"AAPL"}"#
        );
    }
    assert!(rx_c.try_recv().is_err());
}

#[tokio::test]
async fn test_updates_keep_emission_order() {
    let (broker, route, recorder) = broker_with_recorder(&Settings::default());
    let (a, mut rx) = connect(&broker);
    route.subscribe(&a, bars("AAPL", "1")).unwrap();

    for value in 1..=5 {
        recorder.emitter(0).emit(value);
    }
    let received: Vec<u64> = (0..5)
        .map(|_| next_json(&mut rx)["payload"]["data"].as_u64().unwrap())
        .collect();
    assert_eq!(received, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_slow_subscriber_does_not_block_others() {
    let mut settings = Settings::default();
    settings.engine.outbound_buffer = 2;
    let (broker, route, _recorder) = broker_with_recorder(&settings);
    // `slow` never drains: its welcome frame already takes one slot
    let (slow, _rx_slow) = broker.connect(PeerInfo::default()).unwrap();
    let (fast, mut rx_fast) = connect(&broker);
    let topic = route.topic_for(&bars("AAPL", "1")).unwrap();

    route.subscribe(&slow, bars("AAPL", "1")).unwrap();
    route.subscribe(&fast, bars("AAPL", "1")).unwrap();

    assert_eq!(route.update(&topic, 1).delivered, 2);
    next_json(&mut rx_fast);

    let second = route.update(&topic, 2);
    assert_eq!(second.delivered, 1);
    assert_eq!(second.dropped, 1);
    assert_eq!(next_json(&mut rx_fast)["payload"]["data"], 2);
    assert!(broker.is_connected(&slow));
}

#[tokio::test]
async fn test_closed_subscriber_is_disconnected_during_fan_out() {
    let (broker, route, recorder) = broker_with_recorder(&Settings::default());
    let (a, rx_a) = connect(&broker);
    let (b, mut rx_b) = connect(&broker);
    let topic = route.topic_for(&bars("AAPL", "1")).unwrap();

    route.subscribe(&a, bars("AAPL", "1")).unwrap();
    route.subscribe(&b, bars("AAPL", "1")).unwrap();
    drop(rx_a);

    let delivery = route.update(&topic, 7);
    assert_eq!(delivery.closed, vec![a.clone()]);
    assert_eq!(next_json(&mut rx_b)["payload"]["data"], 7);

    assert!(!broker.is_connected(&a));
    assert_eq!(route.tracker().refcount(&topic), Some(1));
    assert_eq!(broker.topic_subscribers(&topic), vec![b]);
    assert_eq!(recorder.removed(), 0);
}

#[tokio::test]
async fn test_disconnect_cleans_topics_and_channels() {
    let (broker, route, recorder) = broker_with_recorder(&Settings::default());
    let (id, _rx) = connect(&broker);
    let topic = route.topic_for(&bars("AAPL", "1")).unwrap();

    route.subscribe(&id, bars("AAPL", "1")).unwrap();
    broker.subscribe_channel(&id, "news", None).unwrap();
    assert!(broker.channel_subscribers("news", None).contains(&id));

    assert!(broker.disconnect(&id));
    assert!(!broker.channel_subscribers("news", None).contains(&id));
    assert!(!broker.has_subscribers(&topic));
    assert!(!route.tracker().is_running(&topic));
    assert_eq!(recorder.removed(), 1);
    assert!(broker.connection(&id).is_none());

    // a second disconnect finds nothing to do
    assert!(!broker.disconnect(&id));
}

#[tokio::test]
async fn test_repeat_subscribe_is_fully_released_on_disconnect() {
    let (broker, route, recorder) = broker_with_recorder(&Settings::default());
    let (id, _rx) = connect(&broker);
    let topic = route.topic_for(&bars("AAPL", "1")).unwrap();

    route.subscribe(&id, bars("AAPL", "1")).unwrap();
    let again = route.subscribe(&id, bars("AAPL", "1")).unwrap();
    assert!(again.is_ok());
    assert_eq!(recorder.created(), 1);
    assert_eq!(route.tracker().refcount(&topic), Some(2));
    assert_eq!(broker.subscriber_count(&topic), 1);

    broker.disconnect(&id);
    assert_eq!(route.tracker().refcount(&topic), None);
    assert_eq!(recorder.removed(), 1);
}

#[tokio::test]
async fn test_invalid_payload_is_reported() {
    let (broker, route, recorder) = broker_with_recorder(&Settings::default());
    let (id, _rx) = connect(&broker);

    let result = route.subscribe_json(&id, json!({"symbol": "AAPL"}));
    assert!(matches!(result, Err(EngineError::InvalidPayload { .. })));
    assert_eq!(recorder.created(), 0);
}

#[tokio::test]
async fn test_subscribe_from_unknown_connection_fails() {
    let (_broker, route, recorder) = broker_with_recorder(&Settings::default());
    let result = route.subscribe(&"ghost".to_string(), bars("AAPL", "1"));
    assert!(matches!(result, Err(EngineError::UnknownConnection(_))));
    assert_eq!(recorder.created(), 0);
}

#[tokio::test]
async fn test_connection_limit() {
    let mut settings = Settings::default();
    settings.engine.max_connections = 1;
    let broker = Broker::new(&settings);

    let (first, _rx) = broker.connect(PeerInfo::default()).unwrap();
    assert!(matches!(
        broker.connect(PeerInfo::default()),
        Err(EngineError::ConnectionLimit(1))
    ));
    broker.disconnect(&first);
    assert!(broker.connect(PeerInfo::default()).is_ok());
}

#[tokio::test]
async fn test_duplicate_route_is_rejected() {
    let (broker, _route, recorder) = broker_with_recorder(&Settings::default());
    let again = broker.register_route("bars", RecordingFeed { recorder });
    assert!(matches!(again, Err(EngineError::DuplicateRoute(_))));
    assert_eq!(broker.route_names(), vec!["bars".to_string()]);
}

#[tokio::test]
async fn test_authenticate_marks_connection() {
    let settings = Settings::default();
    let broker = Broker::new(&settings);
    let (id, _rx) = connect(&broker);

    assert!(broker.authenticate(&id, "not-a-token").is_err());
    assert!(!broker.connection(&id).unwrap().authenticated);

    let token = broker
        .login(&settings.auth.username, &settings.auth.password)
        .unwrap();
    let user = broker.authenticate(&id, &token).unwrap();
    assert_eq!(user, settings.auth.username);

    let snapshot = broker.connection(&id).unwrap();
    assert!(snapshot.authenticated);
    assert_eq!(snapshot.user.as_deref(), Some("admin"));
    assert!(broker.subscribe_channel(&id, "executions", None).is_ok());
}

#[tokio::test]
async fn test_channel_broadcast_through_broker() {
    let broker = Broker::new(&Settings::default());
    let (a, mut rx_a) = connect(&broker);
    let (b, rx_b) = connect(&broker);

    broker.subscribe_channel(&a, "news", None).unwrap();
    broker.subscribe_channel(&b, "news", None).unwrap();
    drop(rx_b);

    let report = broker.broadcast("news", None, json!({"headline": "hi"})).unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(next_json(&mut rx_a)["payload"]["data"]["headline"], "hi");
    assert!(!broker.is_connected(&b));
    assert_eq!(broker.channel_subscribers("news", None), vec![a]);
}

#[tokio::test]
async fn test_stats_and_shutdown() {
    let (broker, route, recorder) = broker_with_recorder(&Settings::default());
    let (id, _rx) = connect(&broker);
    route.subscribe(&id, bars("AAPL", "1")).unwrap();
    route.subscribe(&id, bars("AAPL", "5")).unwrap();

    let stats = broker.stats();
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.topics, 2);
    assert_eq!(stats.routes.len(), 1);
    assert_eq!(stats.routes[0].active_topics, 2);
    assert_eq!(stats.routes[0].producers_started, 2);

    broker.shutdown();
    assert_eq!(recorder.removed(), 2);
    assert!(route.tracker().topics().is_empty());
}
