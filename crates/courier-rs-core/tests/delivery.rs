//! Subscriber delivery loop integration tests.

use courier_rs_config::{ConfigError, CourierConfig, QueueConfig};
use courier_rs_core::{Dispatcher, FetchOutcome, MaxWait, Session, SessionManager};
use courier_rs_protocol::{Event, Mode, fields, kinds};
use courier_rs_store::{MemoryStore, SharedStore};
use courier_rs_test_utils::{RecordingAdapter, fast_config};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn node(config: CourierConfig) -> (Arc<SessionManager>, Dispatcher) {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
    let manager = SessionManager::new(config, store).expect("manager");
    let dispatcher = Dispatcher::new(Arc::clone(&manager));
    (manager, dispatcher)
}

async fn join(manager: &SessionManager, id: Option<&str>, mode: Mode) -> Arc<Session> {
    let mut request = Event::new(kinds::JOIN_LISTEN);
    if let Some(id) = id {
        request.set_field(fields::ID, id);
    }
    let session = manager.create_session(&request).await.expect("create");
    manager.add_session(Arc::clone(&session));
    session.subscriber().start();
    session.negotiate_mode(Some(mode)).await.expect("mode");
    session
}

#[tokio::test(start_paused = true)]
async fn stream_session_receives_multicast_with_subscription_id() {
    let (manager, dispatcher) = node(fast_config("node-a"));
    let session = join(&manager, Some("s1"), Mode::Stream).await;
    session
        .subscriber()
        .add_subscription("/chat", None)
        .await
        .expect("subscribe");

    let delivered = dispatcher
        .multicast(&Event::data("/chat").with_field("text", "hi"))
        .await
        .expect("multicast");
    assert_eq!(delivered, 1);
    assert!(dispatcher.unicast(&Event::abort(), "s1").await.expect("unicast"));

    let mut adapter = RecordingAdapter::new();
    let outcome = session
        .subscriber()
        .fetch_events(
            &mut adapter,
            &Event::new(kinds::JOIN_LISTEN_ACK),
            &session.subscriber().refresh_url("/courier"),
        )
        .await;

    assert_eq!(outcome, FetchOutcome::Closed);
    assert_eq!(
        adapter.event_types(),
        vec![
            kinds::JOIN_LISTEN_ACK.to_string(),
            kinds::DATA.to_string(),
            kinds::ABORT.to_string(),
            kinds::HEARTBEAT.to_string(),
        ]
    );
    let events = adapter.events();
    assert_eq!(events[1].field("text"), Some("hi"));
    assert_eq!(events[1].field(fields::SUBSCRIPTION_ID), Some("/chat"));
    let seqs: Vec<&str> = events[1..]
        .iter()
        .map(|event| event.field_or(fields::SEQ, ""))
        .collect();
    assert_eq!(seqs, vec!["1", "2", "3"]);
    assert!(session.is_stopped());
    assert_eq!(manager.session_count(), 0);
    assert_eq!(adapter.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn stream_heartbeats_while_idle_until_stopped() {
    let (manager, _dispatcher) = node(fast_config("node-a"));
    let session = join(&manager, None, Mode::Stream).await;
    let adapter = RecordingAdapter::new();

    let fetch = {
        let session = Arc::clone(&session);
        let mut adapter = adapter.clone();
        tokio::spawn(async move {
            session
                .subscriber()
                .fetch_events(&mut adapter, &Event::new(kinds::LISTEN_ACK), "/courier")
                .await
        })
    };
    // Warm-up heartbeat, then one per idle read timeout.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    session.stop().await;
    let outcome = fetch.await.expect("join");

    assert_eq!(outcome, FetchOutcome::Closed);
    let types = adapter.event_types();
    assert_eq!(types[0], kinds::LISTEN_ACK);
    assert_eq!(types.len(), 4);
    assert!(types[1..].iter().all(|kind| kind == kinds::HEARTBEAT));
}

#[tokio::test(start_paused = true)]
async fn shutdown_abort_reaches_streaming_client() {
    let (manager, dispatcher) = node(fast_config("node-a"));
    dispatcher.start();
    let session = join(&manager, None, Mode::Stream).await;
    let adapter = RecordingAdapter::new();

    let fetch = {
        let session = Arc::clone(&session);
        let mut adapter = adapter.clone();
        tokio::spawn(async move {
            session
                .subscriber()
                .fetch_events(&mut adapter, &Event::new(kinds::LISTEN_ACK), "/courier")
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    dispatcher.stop().await;
    manager.stop().await;
    let outcome = fetch.await.expect("join");

    assert_eq!(outcome, FetchOutcome::Closed);
    let types = adapter.event_types();
    assert_eq!(types.last().map(String::as_str), Some(kinds::ABORT));
    assert_eq!(adapter.stops(), 1);
    assert!(session.is_stopped());
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn poll_session_gets_heartbeat_and_refresh_hint() {
    let config = fast_config("node-a");
    let (min, max) = (config.poll.wait_min_millis, config.poll.wait_max_millis);
    let (manager, _dispatcher) = node(config);
    let session = join(&manager, Some("s2"), Mode::Poll).await;
    let url = session.subscriber().refresh_url("/courier");

    let mut adapter = RecordingAdapter::new();
    let started = tokio::time::Instant::now();
    let outcome = session
        .subscriber()
        .fetch_events(&mut adapter, &Event::new(kinds::REFRESH_ACK), &url)
        .await;

    assert_eq!(outcome, FetchOutcome::Refreshed);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(
        adapter.event_types(),
        vec![
            kinds::REFRESH_ACK.to_string(),
            kinds::HEARTBEAT.to_string(),
            kinds::REFRESH.to_string(),
        ]
    );
    let refresh = &adapter.events()[2];
    let wait: u64 = refresh.field_or(fields::WAIT, "").parse().expect("wait hint");
    assert!((min..=max).contains(&wait), "wait {wait} outside {min}..={max}");
    assert_eq!(refresh.field(fields::URL), Some("/courier?p_id=s2&p_event=refresh"));
    assert!(!session.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn first_listen_in_pull_mode_refreshes_immediately() {
    let (manager, _dispatcher) = node(fast_config("node-a"));
    let session = join(&manager, None, Mode::Pull).await;

    let mut adapter = RecordingAdapter::new();
    let outcome = session
        .subscriber()
        .fetch_events(&mut adapter, &Event::new(kinds::JOIN_LISTEN_ACK), "/courier")
        .await;

    assert_eq!(outcome, FetchOutcome::Refreshed);
    assert_eq!(
        adapter.event_types(),
        vec![kinds::JOIN_LISTEN_ACK.to_string(), kinds::REFRESH.to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_push_stops_session() {
    let (manager, _dispatcher) = node(fast_config("node-a"));
    let session = join(&manager, None, Mode::Stream).await;

    let mut adapter = RecordingAdapter::failing_on(2);
    let outcome = session
        .subscriber()
        .fetch_events(&mut adapter, &Event::new(kinds::LISTEN_ACK), "/courier")
        .await;

    assert_eq!(outcome, FetchOutcome::Closed);
    assert_eq!(adapter.event_types(), vec![kinds::LISTEN_ACK.to_string()]);
    assert!(session.is_stopped());
    assert!(!manager.has_session(session.id()));
}

#[tokio::test(start_paused = true)]
async fn third_enqueue_on_capacity_two_is_rejected() {
    let config = CourierConfig::builder()
        .queue(QueueConfig {
            size: 2,
            ..QueueConfig::default()
        })
        .node_id("node-a")
        .build();
    let (manager, _dispatcher) = node(config);
    let session = join(&manager, Some("s1"), Mode::Stream).await;
    let queue = session.subscriber().queue();

    assert!(queue.enqueue(&Event::data("/a"), MaxWait::NONE).await.expect("enqueue"));
    assert!(queue.enqueue(&Event::data("/a"), MaxWait::NONE).await.expect("enqueue"));
    assert!(!queue.enqueue(&Event::data("/a"), MaxWait::NONE).await.expect("enqueue"));
    assert_eq!(queue.size().await.expect("size"), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_consumer_is_disconnected() {
    let config = CourierConfig::builder()
        .queue(QueueConfig {
            size: 2,
            ..QueueConfig::default()
        })
        .node_id("node-a")
        .build();
    let (manager, _dispatcher) = node(config);
    let session = join(&manager, None, Mode::Stream).await;
    let subscriber = session.subscriber();

    for _ in 0..2 {
        subscriber.on_event(Event::data("/a")).await.expect("event");
    }
    assert!(!session.is_stopped());
    subscriber.on_event(Event::data("/a")).await.expect("event");

    assert!(session.is_stopped());
    assert!(!subscriber.is_active());
    assert_eq!(manager.session_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_subscriber_is_treated_as_gone() {
    let (manager, _dispatcher) = node(fast_config("node-a"));
    let session = join(&manager, None, Mode::Pull).await;

    tokio::time::advance(Duration::from_secs(46)).await;
    session
        .subscriber()
        .on_event(Event::data("/a"))
        .await
        .expect("event");

    assert!(session.is_stopped());
    assert_eq!(session.subscriber().queue().size().await.expect("size"), 0);
}

#[tokio::test(start_paused = true)]
async fn online_only_events_skip_expired_sessions() {
    let (manager, _dispatcher) = node(fast_config("node-a"));
    let session = join(&manager, Some("s1"), Mode::Stream).await;
    session
        .age(Duration::from_secs(3_600))
        .await
        .expect("age");
    assert!(session.is_expired());

    let subscriber = session.subscriber();
    subscriber
        .on_event(Event::data("/a").with_field(fields::ONLINE_ONLY, "true"))
        .await
        .expect("event");
    assert_eq!(subscriber.queue().size().await.expect("size"), 0);

    subscriber.on_event(Event::data("/a")).await.expect("event");
    assert_eq!(subscriber.queue().size().await.expect("size"), 1);
}

#[tokio::test(start_paused = true)]
async fn safari_clients_are_forced_to_pull() {
    let (manager, _dispatcher) = node(fast_config("node-a"));
    let session = join(&manager, None, Mode::Stream).await;
    session
        .set_user_agent(Some("Mozilla/5.0 (Macintosh) Version/17.0 Safari/605.1.15"))
        .await
        .expect("user agent");

    let mode = session.negotiate_mode(Some(Mode::Stream)).await.expect("mode");
    assert_eq!(mode, Mode::Pull);
    assert_eq!(session.subscriber().mode(), Mode::Pull);
}

#[test]
fn manager_rejects_configs_that_fail_validation() {
    let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());

    let mut inverted = fast_config("node-a");
    inverted.pull.wait_min_millis = inverted.pull.wait_max_millis + 1;
    assert!(matches!(
        SessionManager::new(inverted, Arc::clone(&store)),
        Err(ConfigError::InvalidField { path, .. }) if path == "pull.wait_min_millis"
    ));

    let mut no_aging = fast_config("node-a");
    no_aging.cluster.aging_interval_millis = 0;
    assert!(matches!(
        SessionManager::new(no_aging, store),
        Err(ConfigError::InvalidField { path, .. }) if path == "cluster.aging_interval_millis"
    ));
}
