//! Cross-node routing and aging over one shared store.

use courier_rs_core::{Dispatcher, MaxWait, Session, SessionManager, VisitReport};
use courier_rs_protocol::{Event, Mode, fields, kinds};
use courier_rs_store::{MemoryStore, SharedStore};
use courier_rs_test_utils::{FlakyStore, fast_config};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const TICK: Duration = Duration::from_secs(60);
const LEASE_MILLIS: i64 = 300_000;

struct Node {
    manager: Arc<SessionManager>,
    dispatcher: Dispatcher,
}

fn node(node_id: &str, store: &Arc<dyn SharedStore>) -> Node {
    let manager =
        SessionManager::new(fast_config(node_id), Arc::clone(store)).expect("manager");
    let dispatcher = Dispatcher::new(Arc::clone(&manager));
    Node {
        manager,
        dispatcher,
    }
}

fn shared_store() -> Arc<dyn SharedStore> {
    Arc::new(MemoryStore::new())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn join(manager: &SessionManager, id: Option<&str>) -> Arc<Session> {
    let mut request = Event::new(kinds::JOIN_LISTEN);
    if let Some(id) = id {
        request.set_field(fields::ID, id);
    }
    let session = manager.create_session(&request).await.expect("create");
    manager.add_session(Arc::clone(&session));
    session.subscriber().start();
    session.negotiate_mode(Some(Mode::Stream)).await.expect("mode");
    session
}

async fn drain(session: &Session) -> Vec<Event> {
    session
        .subscriber()
        .queue()
        .dequeue_all(MaxWait::NONE)
        .await
        .expect("drain")
        .unwrap_or_default()
}

#[tokio::test]
async fn multicast_reaches_only_matching_sessions() {
    let store = shared_store();
    let a = node("node-a", &store);
    let both = join(&a.manager, Some("both")).await;
    let news = join(&a.manager, Some("news")).await;
    let sport = join(&a.manager, Some("sport")).await;
    both.subscriber()
        .add_subscription("/chat,/news", Some("mine"))
        .await
        .expect("subscribe");
    news.subscriber()
        .add_subscription("/news", None)
        .await
        .expect("subscribe");
    sport
        .subscriber()
        .add_subscription("/sport", None)
        .await
        .expect("subscribe");

    let published = Event::data("/news").with_field("headline", "rain");
    let delivered = a.dispatcher.multicast(&published).await.expect("multicast");
    assert_eq!(delivered, 2);

    let got = drain(&both).await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].field(fields::SUBSCRIPTION_ID), Some("/chat,/news"));
    assert_eq!(got[0].field(fields::SUBSCRIPTION_LABEL), Some("mine"));
    let got = drain(&news).await;
    assert_eq!(got[0].field(fields::SUBSCRIPTION_ID), Some("/news"));
    assert_eq!(got[0].field(fields::SUBSCRIPTION_LABEL), None);
    assert!(drain(&sport).await.is_empty());
    assert_eq!(published.field(fields::SUBSCRIPTION_ID), None);
}

#[tokio::test]
async fn unsubscribed_sessions_stop_matching() {
    let store = shared_store();
    let a = node("node-a", &store);
    let session = join(&a.manager, None).await;
    let subscriber = session.subscriber();
    subscriber
        .add_subscription("/a,/b", None)
        .await
        .expect("subscribe");
    subscriber
        .add_subscription("/c", None)
        .await
        .expect("subscribe");

    let removed = subscriber.remove_subscription("/a,/b").await.expect("remove");
    assert_eq!(removed.map(|sub| sub.id().to_string()), Some("/a,/b".to_string()));
    assert!(subscriber.remove_subscription("/a,/b").await.expect("remove").is_none());
    assert_eq!(
        a.dispatcher.multicast(&Event::data("/b")).await.expect("multicast"),
        0
    );
    let matched = subscriber.match_event(&Event::data("/c")).await.expect("match");
    assert_eq!(matched.map(|sub| sub.id().to_string()), Some("/c".to_string()));

    subscriber.remove_subscriptions().await.expect("remove all");
    assert!(subscriber.subscriptions().await.expect("list").is_empty());
    assert_eq!(
        a.dispatcher.multicast(&Event::data("/c")).await.expect("multicast"),
        0
    );
}

#[tokio::test]
async fn multicast_from_another_node_lands_in_shared_queue() {
    let store = shared_store();
    let a = node("node-a", &store);
    let b = node("node-b", &store);
    let session = join(&a.manager, Some("s1")).await;
    session
        .subscriber()
        .add_subscription("/chat", None)
        .await
        .expect("subscribe");

    let delivered = b
        .dispatcher
        .multicast(&Event::data("/chat").with_field("text", "from b"))
        .await
        .expect("multicast");
    assert_eq!(delivered, 1);
    assert!(!b.manager.has_session("s1"));

    let got = drain(&session).await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].field("text"), Some("from b"));
    assert_eq!(got[0].field(fields::SUBSCRIPTION_ID), Some("/chat"));
}

#[tokio::test]
async fn multicast_prunes_subject_entries_of_vanished_sessions() {
    let store = shared_store();
    let a = node("node-a", &store);
    let session = join(&a.manager, Some("gone")).await;
    session
        .subscriber()
        .add_subscription("/chat", None)
        .await
        .expect("subscribe");
    a.manager.remove_session("gone");
    store.delete("c:s:gone").await.expect("delete");

    let delivered = a
        .dispatcher
        .multicast(&Event::data("/chat"))
        .await
        .expect("multicast");
    assert_eq!(delivered, 0);
    assert_eq!(store.zscore("c:zs:/chat", "gone").await.expect("zscore"), None);
    assert_eq!(store.hget("c:sj:/chat", "gone").await.expect("hget"), None);
}

#[tokio::test]
async fn paging_visits_every_candidate_and_prunes_mid_walk() {
    let store = shared_store();
    let a = node("node-a", &store);
    let b = node("node-b", &store);
    let mut sessions = Vec::new();
    for id in ["p1", "p2", "p3", "p4", "p5"] {
        let session = join(&a.manager, Some(id)).await;
        session
            .subscriber()
            .add_subscription("/wide", None)
            .await
            .expect("subscribe");
        sessions.push(session);
    }
    a.manager.remove_session("p3");
    store.delete("c:s:p3").await.expect("delete");

    let delivered = b
        .dispatcher
        .multicast(&Event::data("/wide"))
        .await
        .expect("multicast");
    assert_eq!(delivered, 4);
    assert_eq!(store.zscore("c:zs:/wide", "p3").await.expect("zscore"), None);
    for session in sessions.iter().filter(|session| session.id() != "p3") {
        assert_eq!(drain(session).await.len(), 1, "session {}", session.id());
    }

    let report = b.dispatcher.broadcast(&Event::data("/all")).await;
    assert_eq!(
        report,
        VisitReport {
            local: 0,
            remote: 4,
            failed: 0
        }
    );
    assert_eq!(store.zscore("c:all", "p3").await.expect("zscore"), None);
}

#[tokio::test]
async fn multicast_counts_only_queued_copies() {
    let store = shared_store();
    let a = node("node-a", &store);
    let live = join(&a.manager, Some("live")).await;
    let idle = join(&a.manager, Some("idle")).await;
    for session in [&live, &idle] {
        session
            .subscriber()
            .add_subscription("/chat", None)
            .await
            .expect("subscribe");
    }
    idle.stop().await;
    a.manager.add_session(Arc::clone(&idle));

    let delivered = a
        .dispatcher
        .multicast(&Event::data("/chat"))
        .await
        .expect("multicast");
    assert_eq!(delivered, 1);
    assert!(!a.dispatcher.unicast(&Event::data("/chat"), "idle").await.expect("unicast"));
    assert_eq!(drain(&live).await.len(), 1);
}

#[tokio::test]
async fn broadcast_spans_nodes_but_abort_stays_local() {
    let store = shared_store();
    let a = node("node-a", &store);
    let b = node("node-b", &store);
    let on_a = join(&a.manager, Some("on-a")).await;
    let on_b = join(&b.manager, Some("on-b")).await;

    let report = b.dispatcher.broadcast(&Event::data("/all")).await;
    assert_eq!(
        report,
        VisitReport {
            local: 1,
            remote: 1,
            failed: 0
        }
    );
    assert_eq!(drain(&on_a).await.len(), 1);
    assert_eq!(drain(&on_b).await.len(), 1);

    let report = b.dispatcher.broadcast(&Event::abort()).await;
    assert_eq!(report.local, 1);
    assert_eq!(report.remote, 0);
    assert!(drain(&on_a).await.is_empty());
    assert_eq!(
        drain(&on_b).await.first().map(|event| event.is_abort()),
        Some(true)
    );
}

#[tokio::test]
async fn dispatcher_stop_aborts_local_clients() {
    let store = shared_store();
    let a = node("node-a", &store);
    let session = join(&a.manager, None).await;
    a.dispatcher.start();
    assert!(a.dispatcher.is_running());

    a.dispatcher.stop().await;
    assert!(!a.dispatcher.is_running());
    let got = drain(&session).await;
    assert_eq!(got.len(), 1);
    assert!(got[0].is_abort());
}

#[tokio::test]
async fn unicast_to_unknown_session_is_dropped() {
    let store = shared_store();
    let a = node("node-a", &store);
    let session = join(&a.manager, Some("s1")).await;

    assert!(!a.dispatcher.unicast(&Event::data("/x"), "nobody").await.expect("unicast"));
    assert!(a.dispatcher.unicast(&Event::data("/x"), "s1").await.expect("unicast"));
    assert_eq!(drain(&session).await.len(), 1);
}

#[tokio::test]
async fn remote_discovery_failure_only_skips_remote_phase() {
    let flaky = Arc::new(FlakyStore::new());
    let store: Arc<dyn SharedStore> = Arc::clone(&flaky) as Arc<dyn SharedStore>;
    let a = node("node-a", &store);
    let b = node("node-b", &store);
    let local = join(&a.manager, None).await;
    let remote = join(&b.manager, None).await;

    flaky.fail_ranges(true);
    let report = a.dispatcher.broadcast(&Event::data("/all")).await;
    assert_eq!(report.local, 1);
    assert_eq!(report.remote, 0);
    assert_eq!(drain(&local).await.len(), 1);
    assert!(drain(&remote).await.is_empty());

    flaky.fail_ranges(false);
    let report = a.dispatcher.broadcast(&Event::data("/all")).await;
    assert_eq!(report.remote, 1);
}

#[tokio::test]
async fn get_session_rebuilds_and_optionally_registers() {
    let store = shared_store();
    let a = node("node-a", &store);
    let b = node("node-b", &store);
    let original = join(&a.manager, Some("s1")).await;
    original.set_address("10.0.0.7").await.expect("address");

    let proxy = b
        .manager
        .get_session(false, "s1")
        .await
        .expect("get")
        .expect("session");
    assert_eq!(proxy.address(), "10.0.0.7");
    assert_eq!(proxy.subscriber().mode(), Mode::Stream);
    assert!(!b.manager.has_session("s1"));

    let registered = b
        .manager
        .get_session(true, "s1")
        .await
        .expect("get")
        .expect("session");
    assert!(b.manager.has_session("s1"));
    assert!(registered.is_registered());
    assert!(b.manager.get_session(true, "missing").await.expect("get").is_none());
}

#[tokio::test]
async fn durable_session_reattaches_after_stop() {
    let store = shared_store();
    let a = node("node-a", &store);
    let session = join(&a.manager, Some("alice")).await;
    assert!(!session.is_temporary());
    session.set_address("192.168.1.2").await.expect("address");
    session.subscriber().add_subscription("/inbox", None).await.expect("subscribe");
    assert!(session.stop().await);
    assert!(!session.stop().await);

    let again = join(&a.manager, Some("alice")).await;
    assert_eq!(again.address(), "192.168.1.2");
    assert!(!again.is_temporary());
    let subscriptions = again.subscriber().subscriptions().await.expect("list");
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].id(), "/inbox");
}

#[tokio::test]
async fn temporary_session_is_purged_on_stop() {
    let store = shared_store();
    let a = node("node-a", &store);
    let session = join(&a.manager, None).await;
    let id = session.id().to_string();
    assert!(session.is_temporary());
    assert_eq!(id.len(), 10);
    session.subscriber().add_subscription("/t", None).await.expect("subscribe");

    session.stop().await;
    assert!(a.manager.get_session(false, &id).await.expect("get").is_none());
    assert!(!store.exists(&format!("c:sc:{id}")).await.expect("exists"));
    assert!(!store.exists("c:zs:/t").await.expect("exists"));
    assert_eq!(store.zscore("c:all", &id).await.expect("zscore"), None);
}

#[tokio::test]
async fn aging_decrements_and_expires_leases() {
    let store = shared_store();
    let a = node("node-a", &store);
    let session = join(&a.manager, None).await;
    let id = session.id().to_string();
    let start = now_millis();

    a.manager.age_pass_at(start + 60_000, TICK).await;
    let ttl = session.ttl_millis();
    assert!(ttl <= LEASE_MILLIS - 60_000, "ttl {ttl}");
    assert!(ttl > LEASE_MILLIS - 61_000, "ttl {ttl}");
    assert!(a.manager.has_session(&id));

    let report = a.manager.age_pass_at(start + LEASE_MILLIS, TICK).await;
    assert_eq!(report.local, 1);
    assert!(session.is_expired());
    assert!(session.is_stopped());
    assert!(!a.manager.has_session(&id));
    assert!(a.manager.get_session(false, &id).await.expect("get").is_none());
}

#[tokio::test]
async fn keep_alive_restores_full_lease() {
    let store = shared_store();
    let a = node("node-a", &store);
    let session = join(&a.manager, None).await;

    a.manager.age_pass_at(now_millis() + 120_000, TICK).await;
    assert!(session.ttl_millis() <= LEASE_MILLIS - 120_000);
    assert!(session.kick().await.expect("kick"));
    assert_eq!(session.ttl_millis(), LEASE_MILLIS);
}

#[tokio::test]
async fn two_nodes_aging_in_one_interval_decrement_once() {
    let store = shared_store();
    let a = node("node-a", &store);
    let b = node("node-b", &store);
    let session = join(&a.manager, None).await;
    let now = now_millis() + 60_000;

    let (report_a, report_b) = tokio::join!(
        a.manager.age_pass_at(now, TICK),
        b.manager.age_pass_at(now, TICK)
    );
    assert_eq!(report_a.local, 1);
    assert_eq!(report_b.remote, 1);

    let stored: i64 = store
        .hget(&format!("c:s:{}", session.id()), "ttl")
        .await
        .expect("hget")
        .expect("ttl")
        .parse()
        .expect("number");
    assert!(stored > LEASE_MILLIS - 61_000, "ttl {stored}");
    assert!(stored <= LEASE_MILLIS - 60_000, "ttl {stored}");
    assert_eq!(
        store
            .hget(&format!("c:s:{}", session.id()), "aging")
            .await
            .expect("hget"),
        None
    );
}

#[tokio::test]
async fn second_node_in_same_interval_leaves_lease_alone() {
    let store = shared_store();
    let a = node("node-a", &store);
    let b = node("node-b", &store);
    let session = join(&a.manager, Some("s1")).await;
    let key = "c:s:s1";
    let now = now_millis() + 60_000;

    a.manager.age_pass_at(now, TICK).await;
    let ttl = store.hget(key, "ttl").await.expect("hget");
    let aged_at = store.hget(key, "aged_at").await.expect("hget");
    assert!(session.ttl_millis() < LEASE_MILLIS);

    b.manager.age_pass_at(now + 1_000, TICK).await;
    assert_eq!(store.hget(key, "ttl").await.expect("hget"), ttl);
    assert_eq!(store.hget(key, "aged_at").await.expect("hget"), aged_at);

    b.manager.age_pass_at(now + 60_000, TICK).await;
    let stored: i64 = store
        .hget(key, "ttl")
        .await
        .expect("hget")
        .expect("ttl")
        .parse()
        .expect("number");
    assert!(stored <= LEASE_MILLIS - 120_000, "ttl {stored}");
    assert!(stored > LEASE_MILLIS - 121_000, "ttl {stored}");
}

#[tokio::test]
async fn held_aging_lock_skips_until_stale() {
    let store = shared_store();
    let a = node("node-a", &store);
    let session = join(&a.manager, None).await;
    let key = format!("c:s:{}", session.id());
    let locked_at = now_millis();
    store
        .hset(&key, "aging", &format!("node-x@{locked_at}"))
        .await
        .expect("lock");

    a.manager.age_pass_at(locked_at + 30_000, TICK).await;
    assert_eq!(session.ttl_millis(), LEASE_MILLIS);

    a.manager.age_pass_at(locked_at + 90_000, TICK).await;
    assert!(session.ttl_millis() < LEASE_MILLIS);
    assert_eq!(store.hget(&key, "aging").await.expect("hget"), None);
}

#[tokio::test]
async fn expiry_raced_by_two_nodes_stops_once() {
    let store = shared_store();
    let a = node("node-a", &store);
    let b = node("node-b", &store);
    let session = join(&a.manager, None).await;
    let id = session.id().to_string();
    let expired_at = now_millis() + LEASE_MILLIS;

    let report_b = b.manager.age_pass_at(expired_at, TICK).await;
    assert_eq!(report_b.remote, 1);
    assert!(!store.exists(&format!("c:s:{id}")).await.expect("exists"));

    let report_a = a.manager.age_pass_at(expired_at, TICK).await;
    assert_eq!(report_a.local, 1);
    assert!(session.is_stopped());
    assert_eq!(a.manager.session_count(), 0);
    assert!(!session.stop().await);

    let report = b.manager.age_pass_at(expired_at + 60_000, TICK).await;
    assert_eq!(report, VisitReport::default());
}

#[tokio::test(start_paused = true)]
async fn manager_stop_stops_local_sessions() {
    let store = shared_store();
    let a = node("node-a", &store);
    let durable = join(&a.manager, Some("keep")).await;
    let temporary = join(&a.manager, None).await;
    a.manager.start();
    assert!(a.manager.status().contains("2 sessions"));

    a.manager.stop().await;
    assert_eq!(a.manager.session_count(), 0);
    assert!(durable.is_stopped());
    assert!(temporary.is_stopped());
    assert!(store.exists("c:s:keep").await.expect("exists"));
    assert!(
        !store
            .exists(&format!("c:s:{}", temporary.id()))
            .await
            .expect("exists")
    );
}

#[tokio::test(start_paused = true)]
async fn aging_timer_stops_sessions_purged_elsewhere() {
    let store = shared_store();
    let a = node("node-a", &store);
    let session = join(&a.manager, None).await;
    a.manager.start();
    store
        .delete(&format!("c:s:{}", session.id()))
        .await
        .expect("delete");

    tokio::time::sleep(TICK + Duration::from_millis(10)).await;
    assert!(session.is_stopped());
    assert_eq!(a.manager.session_count(), 0);
    a.manager.stop().await;
}
