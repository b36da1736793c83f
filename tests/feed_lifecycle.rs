//! Connection lifecycle, message handling and subscriber behaviour of the
//! weight feed, driven through the in-process transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use weightfeed::{
    BrokerConfig, ConnectionState, FeedConfig, MemoryTransport, Subscription, WeightFeed,
};

const TOPIC: &str = "weight-sensor-FCAI/data";

fn setup() -> (WeightFeed, MemoryTransport) {
    let transport = MemoryTransport::new();
    let feed = WeightFeed::new(
        BrokerConfig::default(),
        FeedConfig::default(),
        Arc::new(transport.clone()),
    );
    (feed, transport)
}

/// Let spawned tasks drain their queues without reaching any reconnect timer
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn recorder() -> Arc<Mutex<Vec<(&'static str, f64)>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn record(
    feed: &WeightFeed,
    log: &Arc<Mutex<Vec<(&'static str, f64)>>>,
    name: &'static str,
) -> Subscription {
    let log = Arc::clone(log);
    feed.on_weight_update(move |grams| log.lock().unwrap().push((name, grams)))
}

async fn connected_feed() -> (WeightFeed, MemoryTransport) {
    let (feed, transport) = setup();
    feed.connect();
    transport.latest().unwrap().connect();
    settle().await;
    assert!(feed.is_connected());
    (feed, transport)
}

#[tokio::test(start_paused = true)]
async fn test_connect_message_close_scenario() {
    let (feed, transport) = setup();
    assert_eq!(feed.connection_state(), ConnectionState::Disconnected);

    feed.connect();
    assert!(feed.is_connecting());

    let broker = transport.latest().unwrap();
    assert_eq!(broker.client_id(), feed.client_id());
    broker.connect();
    settle().await;

    assert!(feed.is_connected());
    assert_eq!(transport.subscriptions(), vec![TOPIC.to_string()]);

    broker.publish(TOPIC, &br#"{"weight": 842}"#[..]);
    settle().await;
    assert_eq!(feed.last_weight(), Some(842.0));

    broker.close();
    settle().await;
    assert_eq!(feed.connection_state(), ConnectionState::Disconnected);
    assert!(feed.reconnect_scheduled());
    assert_eq!(feed.connection_attempts(), 1);

    // Fixed 5s policy
    tokio::time::sleep(Duration::from_millis(4900)).await;
    assert_eq!(transport.open_attempts(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.open_attempts(), 2);
    assert!(feed.is_connecting());
}

#[tokio::test(start_paused = true)]
async fn test_valid_payloads_update_reading_and_fire_in_order() {
    let (feed, transport) = connected_feed().await;
    let broker = transport.latest().unwrap();
    let log = recorder();
    let _a = record(&feed, &log, "a");
    let _b = record(&feed, &log, "b");
    let _c = record(&feed, &log, "c");

    for payload in [
        &br#"{"weight": 12.5}"#[..],
        &br#"{"weight": 300, "unit": "g"}"#[..],
        &br#"{"weight": -4}"#[..],
    ] {
        broker.publish(TOPIC, payload);
    }
    settle().await;

    assert_eq!(feed.last_weight(), Some(-4.0));
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            ("a", 12.5),
            ("b", 12.5),
            ("c", 12.5),
            ("a", 300.0),
            ("b", 300.0),
            ("c", 300.0),
            ("a", -4.0),
            ("b", -4.0),
            ("c", -4.0),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payloads_change_nothing() {
    let (feed, transport) = connected_feed().await;
    let broker = transport.latest().unwrap();
    broker.publish(TOPIC, &br#"{"weight": 100}"#[..]);
    settle().await;

    let log = recorder();
    let _sub = record(&feed, &log, "a");
    let before = feed.last_reading();

    for payload in [
        &b"garbage"[..],
        &b""[..],
        &b"[100]"[..],
        &b"42"[..],
        &br#"{"weight": "100"}"#[..],
        &br#"{"weight": null}"#[..],
        &br#"{"weight": [1]}"#[..],
        &br#"{"grams": 5}"#[..],
        &b"\xff\xfe\x00"[..],
    ] {
        broker.publish(TOPIC, payload);
    }
    settle().await;

    assert_eq!(feed.last_reading(), before);
    assert!(log.lock().unwrap().is_empty());
    assert!(feed.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_two_callbacks_first_unsubscribes_itself() {
    let (feed, transport) = connected_feed().await;
    let broker = transport.latest().unwrap();
    let log = recorder();

    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let slot_in_cb = Arc::clone(&slot);
    let log_first = Arc::clone(&log);
    let first = feed.on_weight_update(move |grams| {
        log_first.lock().unwrap().push(("first", grams));
        if let Some(sub) = slot_in_cb.lock().unwrap().as_ref() {
            sub.unsubscribe();
        }
    });
    *slot.lock().unwrap() = Some(first);
    let _second = record(&feed, &log, "second");

    broker.publish(TOPIC, &br#"{"weight": 10}"#[..]);
    settle().await;
    broker.publish(TOPIC, &br#"{"weight": 20}"#[..]);
    settle().await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![("first", 10.0), ("second", 10.0), ("second", 20.0)]
    );
    assert_eq!(feed.subscriber_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_immediate_unsubscribe_never_fires() {
    let (feed, transport) = connected_feed().await;
    let log = recorder();

    let sub = record(&feed, &log, "gone");
    assert!(sub.unsubscribe());
    assert!(!sub.unsubscribe());

    let broker = transport.latest().unwrap();
    for i in 0..5 {
        broker.publish(TOPIC, format!(r#"{{"weight": {}}}"#, i));
    }
    settle().await;

    assert_eq!(feed.last_weight(), Some(4.0));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_stop_after_max_attempts() {
    let (feed, transport) = setup();
    transport.set_fail_open(true);

    feed.connect();
    tokio::time::sleep(Duration::from_secs(60)).await;

    // Initial attempt plus five scheduled retries
    assert_eq!(transport.open_attempts(), 6);
    assert_eq!(feed.connection_attempts(), 5);
    assert!(!feed.reconnect_scheduled());
    assert_eq!(feed.connection_state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.open_attempts(), 6);

    // Explicit reset brings the feed back
    transport.set_fail_open(false);
    feed.reset_connection_attempts();
    feed.connect();
    transport.latest().unwrap().connect();
    settle().await;
    assert!(feed.is_connected());
    assert_eq!(transport.open_attempts(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_successful_connect_resets_counter() {
    let (feed, transport) = connected_feed().await;

    transport.latest().unwrap().close();
    settle().await;
    assert_eq!(feed.connection_attempts(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.open_attempts(), 2);
    transport.latest().unwrap().connect();
    settle().await;
    assert!(feed.is_connected());
    assert_eq!(feed.connection_attempts(), 0);

    transport.latest().unwrap().close();
    settle().await;
    assert_eq!(feed.connection_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_failure_keeps_connection() {
    let (feed, transport) = setup();
    transport.set_fail_subscribe(true);

    feed.connect();
    let broker = transport.latest().unwrap();
    broker.connect();
    broker.reject_subscription(TOPIC);
    settle().await;

    assert!(feed.is_connected());
    assert!(transport.subscriptions().is_empty());
    assert!(!feed.reconnect_scheduled());
}

#[tokio::test(start_paused = true)]
async fn test_broker_disconnect_then_close() {
    let (feed, transport) = connected_feed().await;
    let broker = transport.latest().unwrap();

    broker.disconnect();
    settle().await;
    assert_eq!(feed.connection_state(), ConnectionState::Disconnected);
    assert!(!feed.reconnect_scheduled());

    broker.close();
    settle().await;
    assert!(feed.reconnect_scheduled());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_tears_down_and_cancels_reconnect() {
    let (feed, transport) = connected_feed().await;
    let log = recorder();
    let _sub = record(&feed, &log, "a");

    feed.disconnect().await;
    assert_eq!(feed.connection_state(), ConnectionState::Disconnected);
    assert_eq!(transport.closed_sessions(), 1);

    // Stale session events are dropped
    let stale = transport.latest().unwrap();
    stale.publish(TOPIC, &br#"{"weight": 1}"#[..]);
    stale.close();
    settle().await;
    assert!(log.lock().unwrap().is_empty());
    assert!(!feed.reconnect_scheduled());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.open_attempts(), 1);

    // A later connect starts a fresh session
    feed.connect();
    assert_eq!(transport.open_attempts(), 2);
    transport.latest().unwrap().connect();
    settle().await;
    assert!(feed.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_connect_after_link_error_closes_old_session() {
    let (feed, transport) = connected_feed().await;
    let old = transport.latest().unwrap();

    old.error("connection reset");
    settle().await;
    assert_eq!(feed.connection_state(), ConnectionState::Disconnected);
    assert!(old.is_open());

    feed.connect();
    settle().await;
    assert_eq!(transport.open_attempts(), 2);
    assert_eq!(transport.closed_sessions(), 1);
    assert!(!old.is_open());

    // Late traffic on the old link goes nowhere
    let log = recorder();
    let _sub = record(&feed, &log, "a");
    assert!(!old.publish(TOPIC, &br#"{"weight": 9}"#[..]));
    settle().await;
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(feed.last_weight(), None);

    transport.latest().unwrap().connect();
    settle().await;
    assert!(feed.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_backoff_cancels_timer() {
    let (feed, transport) = connected_feed().await;

    transport.latest().unwrap().close();
    settle().await;
    assert!(feed.reconnect_scheduled());

    feed.disconnect().await;
    assert!(!feed.reconnect_scheduled());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.open_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_clones_share_state() {
    let (feed, transport) = connected_feed().await;
    let other = feed.clone();
    let log = recorder();
    let _sub = record(&other, &log, "clone");

    transport
        .latest()
        .unwrap()
        .publish(TOPIC, &br#"{"weight": 55}"#[..]);
    settle().await;

    assert!(other.is_connected());
    assert_eq!(other.last_weight(), Some(55.0));
    assert_eq!(feed.subscriber_count(), 1);
    assert_eq!(*log.lock().unwrap(), vec![("clone", 55.0)]);
}

#[tokio::test(start_paused = true)]
async fn test_watch_state_observes_transitions() {
    let (feed, transport) = setup();
    let mut states = feed.watch_state();

    feed.connect();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connecting);

    transport.latest().unwrap().connect();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_reading_returns_next_reading() {
    let (feed, transport) = connected_feed().await;
    let broker = transport.latest().unwrap();

    let waiter = {
        let feed = feed.clone();
        tokio::spawn(async move { feed.wait_for_reading(Duration::from_secs(2)).await })
    };
    settle().await;
    broker.publish(TOPIC, &br#"{"weight": 640}"#[..]);

    let reading = waiter.await.unwrap().unwrap();
    assert_eq!(reading.grams, 640.0);
}
