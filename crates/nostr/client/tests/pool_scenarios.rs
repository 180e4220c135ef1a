//! End-to-end client scenarios over the in-memory relay hub.

use nostr::{Event, Filter, KIND_CLIENT_AUTH, KIND_TEXT_NOTE, RelayUrl};
use nostr_relay_client::{
    AuthSigner, ClientConfig, CountListener, MemoryRelayHub, NostrClient, OutboxStatus,
    RelayListener, RelaySession, RequestListener, Result, SessionConfig,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn relay(name: &str) -> RelayUrl {
    RelayUrl::parse(&format!("wss://{name}.example.com")).expect("valid relay url")
}

fn config() -> ClientConfig {
    ClientConfig {
        relay_set_sample: Duration::from_millis(10),
        reconnect_debounce: Duration::from_millis(10),
        session: SessionConfig::default(),
    }
}

fn setup(auto_open: bool) -> Result<(MemoryRelayHub, Arc<NostrClient>)> {
    let hub = MemoryRelayHub::new();
    hub.set_auto_open(auto_open);
    let client = NostrClient::new(Arc::new(hub.builder()), config())?;
    Ok((hub, client))
}

fn notes_by(author: &str) -> Vec<Filter> {
    vec![
        Filter::new()
            .kinds(vec![KIND_TEXT_NOTE])
            .authors(vec![author.to_string()]),
    ]
}

fn on(relay: &RelayUrl, filters: Vec<Filter>) -> HashMap<RelayUrl, Vec<Filter>> {
    HashMap::from([(relay.clone(), filters)])
}

fn note(id: &str) -> Event {
    Event {
        id: id.to_string(),
        pubkey: "abc".to_string(),
        created_at: 1_700_000_000,
        kind: KIND_TEXT_NOTE,
        tags: vec![],
        content: "hello".to_string(),
        sig: "sig".to_string(),
    }
}

fn auth_reply(challenge: &str) -> Event {
    Event {
        id: format!("auth-{challenge}"),
        kind: KIND_CLIENT_AUTH,
        tags: vec![
            vec!["relay".to_string(), "wss://r1.example.com".to_string()],
            vec!["challenge".to_string(), challenge.to_string()],
        ],
        content: String::new(),
        ..note("unused")
    }
}

/// Lets debounced sweeps and sampled relay-set updates run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(60)).await;
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

struct Signer;

impl AuthSigner for Signer {
    fn sign_auth(&self, _relay: &RelayUrl, challenge: &str) -> Option<Event> {
        Some(auth_reply(challenge))
    }
}

#[derive(Default)]
struct Log(Mutex<Vec<String>>);

impl Log {
    fn push(&self, entry: String) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }
}

impl RequestListener for Log {
    fn on_event(
        &self,
        relay: &RelayUrl,
        event: &Event,
        is_live: bool,
        _filters: Option<&[Filter]>,
    ) {
        self.push(format!("event {relay} {} {is_live}", event.id));
    }

    fn on_eose(&self, relay: &RelayUrl, _filters: Option<&[Filter]>) {
        self.push(format!("eose {relay}"));
    }

    fn on_close(&self, relay: &RelayUrl) {
        self.push(format!("close {relay}"));
    }

    fn on_cannot_connect(&self, relay: &RelayUrl, _message: &str, _filters: Option<&[Filter]>) {
        self.push(format!("cannot_connect {relay}"));
    }
}

impl CountListener for Log {
    fn on_count(&self, relay: &RelayUrl, count: u64, _filters: Option<&[Filter]>) {
        self.push(format!("count {relay} {count}"));
    }
}

impl RelayListener for Log {
    fn on_connected(&self, relay: &RelaySession, _ping_ms: u64, _compressed: bool) {
        self.push(format!("connected {}", relay.url()));
    }

    fn on_event(
        &self,
        relay: &RelaySession,
        subscription_id: &str,
        event: &Event,
        _arrival_secs: u64,
        _after_eose: bool,
    ) {
        self.push(format!("relay_event {} {subscription_id} {}", relay.url(), event.id));
    }
}

#[tokio::test]
async fn test_subscription_while_disconnected_dials_once_then_sends_one_req() -> Result<()> {
    let (hub, client) = setup(false)?;
    let r1 = relay("r1");
    client.connect();

    client.open_req_subscription("sub1", on(&r1, notes_by("abc")), None);
    assert_eq!(hub.connect_count(&r1), 1);
    assert!(hub.sent(&r1).is_empty());

    settle().await;
    assert_eq!(hub.connect_count(&r1), 1);

    assert!(hub.open(&r1));
    settle().await;
    let reqs = hub.sent_of_kind(&r1, "REQ");
    assert_eq!(reqs.len(), 1);
    assert_eq!(
        reqs[0],
        r#"["REQ","sub1",{"authors":["abc"],"kinds":[1]}]"#
    );
    assert_eq!(hub.connect_count(&r1), 1);
    Ok(())
}

#[tokio::test]
async fn test_identical_subscriptions_send_one_req() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    client.connect();

    client.open_req_subscription("sub1", on(&r1, notes_by("abc")), None);
    client.open_req_subscription("sub1", on(&r1, notes_by("abc")), None);
    settle().await;
    assert_eq!(hub.sent_of_kind(&r1, "REQ").len(), 1);

    client.open_req_subscription("sub1", on(&r1, notes_by("def")), None);
    assert_eq!(hub.sent_of_kind(&r1, "REQ").len(), 1, "held until EOSE");
    hub.deliver(&r1, r#"["EOSE","sub1"]"#);
    let reqs = hub.sent_of_kind(&r1, "REQ");
    assert_eq!(reqs.len(), 2);
    assert!(reqs[1].contains("def"));
    Ok(())
}

#[tokio::test]
async fn test_auth_success_resends_everything_once() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    client.set_auth_signer(Some(Arc::new(Signer)));
    client.connect();

    client.open_req_subscription("sub1", on(&r1, notes_by("abc")), None);
    client.query_count("q1", on(&r1, notes_by("abc")), None);
    client.send(&note("e1"), &HashSet::from([r1.clone()]));
    assert_eq!(hub.sent_of_kind(&r1, "REQ").len(), 1);
    assert_eq!(hub.sent_of_kind(&r1, "COUNT").len(), 1);
    assert_eq!(hub.sent_of_kind(&r1, "EVENT").len(), 1);

    hub.deliver(&r1, r#"["AUTH","challenge-1"]"#);
    hub.deliver(&r1, r#"["AUTH","challenge-1"]"#);
    assert_eq!(hub.sent_of_kind(&r1, "AUTH").len(), 1);

    hub.deliver(&r1, r#"["OK","auth-challenge-1",true,""]"#);
    hub.deliver(&r1, r#"["OK","auth-challenge-1",true,""]"#);
    settle().await;
    assert_eq!(hub.sent_of_kind(&r1, "REQ").len(), 2);
    assert_eq!(hub.sent_of_kind(&r1, "COUNT").len(), 2);
    assert_eq!(hub.sent_of_kind(&r1, "EVENT").len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_outbox_entry_survives_auth_required_until_ok_true() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    client.connect();

    client.send(&note("e1"), &HashSet::from([r1.clone()]));
    assert_eq!(hub.sent_of_kind(&r1, "EVENT").len(), 1);

    hub.deliver(&r1, r#"["OK","e1",false,"auth-required: members only"]"#);
    assert_eq!(
        client.active_outbox(&r1).get("e1"),
        Some(&OutboxStatus::NeedsAuth)
    );

    hub.close(&r1, 1000, "bye");
    client.reconnect(true, true);
    assert!(wait_for(|| hub.sent_of_kind(&r1, "EVENT").len() == 2).await);
    assert!(client.active_outbox(&r1).contains_key("e1"));

    hub.deliver(&r1, r#"["OK","e1",true,""]"#);
    assert!(client.active_outbox(&r1).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_inactive_client_sends_nothing_until_reconnect() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");

    client.open_req_subscription("sub1", on(&r1, notes_by("abc")), None);
    client.send(&note("e1"), &HashSet::from([r1.clone()]));
    settle().await;
    assert_eq!(hub.connect_count(&r1), 0);

    client.connect();
    settle().await;
    assert_eq!(hub.connect_count(&r1), 0);

    client.reconnect(true, false);
    assert!(wait_for(|| hub.sent_of_kind(&r1, "REQ").len() == 1).await);
    assert_eq!(hub.sent_of_kind(&r1, "EVENT").len(), 1);

    client.disconnect();
    assert!(!client.is_active());
    assert!(!hub.has_socket(&r1));
    Ok(())
}

#[tokio::test]
async fn test_close_reaches_only_relays_with_the_subscription_open() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    let r2 = relay("r2");
    hub.refuse(&r2);
    let log = Arc::new(Log::default());
    client.connect();

    let filters = HashMap::from([(r1.clone(), notes_by("abc")), (r2.clone(), notes_by("abc"))]);
    let listener: Arc<dyn RequestListener> = log.clone();
    client.open_req_subscription("sub1", filters, Some(listener));
    assert_eq!(hub.sent_of_kind(&r1, "REQ").len(), 1);
    assert_eq!(log.count(&format!("cannot_connect {r2}")), 1);

    client.close("sub1");
    assert_eq!(hub.sent_of_kind(&r1, "CLOSE").len(), 1);
    assert!(hub.sent(&r2).is_empty());
    assert_eq!(log.count(&format!("close {r1}")), 1);

    assert!(wait_for(|| client.pool().available_relays().is_empty()).await);
    assert!(!hub.has_socket(&r1));
    Ok(())
}

#[tokio::test]
async fn test_events_reach_request_and_pool_listeners() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    let log = Arc::new(Log::default());
    let pool_listener: Arc<dyn RelayListener> = log.clone();
    client.subscribe(Arc::clone(&pool_listener));
    assert!(client.is_subscribed(&pool_listener));
    client.connect();

    let listener: Arc<dyn RequestListener> = log.clone();
    client.open_req_subscription("sub1", on(&r1, notes_by("abc")), Some(listener));
    hub.deliver(&r1, &serde_json::json!(["EVENT", "sub1", note("old")]).to_string());
    hub.deliver(&r1, r#"["EOSE","sub1"]"#);
    hub.deliver(&r1, &serde_json::json!(["EVENT", "sub1", note("new")]).to_string());

    assert!(wait_for(|| log.count("event") == 2).await);
    assert_eq!(log.count(&format!("connected {r1}")), 1);
    assert_eq!(log.count(&format!("eose {r1}")), 1);
    assert_eq!(log.count(&format!("event {r1} old false")), 1);
    assert_eq!(log.count(&format!("event {r1} new true")), 1);
    assert_eq!(log.count("relay_event"), 2);

    client.unsubscribe(&pool_listener);
    hub.deliver(&r1, &serde_json::json!(["EVENT", "sub1", note("later")]).to_string());
    assert!(wait_for(|| log.count("event") == 3).await);
    assert_eq!(log.count("relay_event"), 2);
    Ok(())
}

#[tokio::test]
async fn test_count_answer_ends_the_query() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    let log = Arc::new(Log::default());
    client.connect();

    let listener: Arc<dyn CountListener> = log.clone();
    client.query_count("q1", on(&r1, notes_by("abc")), Some(listener));
    assert_eq!(client.active_counts(&r1).len(), 1);

    hub.deliver(&r1, r#"["COUNT","q1",{"count":42}]"#);
    assert_eq!(log.count(&format!("count {r1} 42")), 1);
    assert!(client.active_counts(&r1).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_auth_events_skip_the_outbox() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    client.connect();
    client.open_req_subscription("sub1", on(&r1, notes_by("abc")), None);

    client.send(&auth_reply("c1"), &HashSet::from([r1.clone()]));
    assert_eq!(hub.sent_of_kind(&r1, "AUTH").len(), 1);
    assert!(client.active_outbox(&r1).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_status_and_full_reconnect() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    let mut status = client.relay_status();
    client.connect();

    client.open_req_subscription("sub1", on(&r1, notes_by("abc")), None);
    assert!(
        wait_for(|| status.borrow_and_update().connected.contains(&r1)).await,
        "connected relay published"
    );
    assert_eq!(client.active_requests(&r1).len(), 1);
    assert!(client.relay_stats().get(&r1).is_some_and(|stats| stats.sent_bytes > 0));

    client.reconnect(false, false);
    assert!(wait_for(|| hub.connect_count(&r1) == 2).await);
    assert!(wait_for(|| hub.sent_of_kind(&r1, "REQ").len() == 2).await);
    Ok(())
}

#[tokio::test]
async fn test_acknowledged_event_releases_its_relay() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    client.connect();

    client.send(&note("e1"), &HashSet::from([r1.clone()]));
    assert_eq!(hub.sent_of_kind(&r1, "EVENT").len(), 1);
    assert!(client.pool().contains(&r1));

    hub.deliver(&r1, r#"["OK","e1",true,""]"#);
    assert!(wait_for(|| client.pool().available_relays().is_empty()).await);
    assert!(!hub.has_socket(&r1));
    Ok(())
}

#[tokio::test]
async fn test_rejected_event_releases_its_relay_and_can_be_pruned() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    client.connect();

    client.send(&note("e1"), &HashSet::from([r1.clone()]));
    hub.deliver(&r1, r#"["OK","e1",false,"blocked: banned"]"#);
    assert!(wait_for(|| client.pool().available_relays().is_empty()).await);
    assert_eq!(
        client.active_outbox(&r1).get("e1"),
        Some(&OutboxStatus::Rejected)
    );

    assert_eq!(client.prune_rejected_outbox(), 1);
    assert!(client.active_outbox(&r1).is_empty());
    assert_eq!(client.prune_rejected_outbox(), 0);
    Ok(())
}

#[tokio::test]
async fn test_answered_count_releases_its_relay() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    client.connect();

    client.query_count("q1", on(&r1, notes_by("abc")), None);
    assert_eq!(hub.sent_of_kind(&r1, "COUNT").len(), 1);

    hub.deliver(&r1, r#"["COUNT","q1",{"count":3}]"#);
    assert!(wait_for(|| client.pool().available_relays().is_empty()).await);
    assert!(!hub.has_socket(&r1));
    Ok(())
}

#[tokio::test]
async fn test_refused_count_releases_its_relay() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    client.connect();

    client.query_count("q1", on(&r1, notes_by("abc")), None);
    hub.deliver(&r1, r#"["CLOSED","q1","unsupported: counts are disabled"]"#);
    assert!(wait_for(|| client.pool().available_relays().is_empty()).await);
    assert!(client.active_counts(&r1).is_empty());
    assert!(!hub.has_socket(&r1));
    Ok(())
}

#[tokio::test]
async fn test_send_redials_a_silently_dead_relay() -> Result<()> {
    let (hub, client) = setup(true)?;
    let r1 = relay("r1");
    client.connect();
    client.open_req_subscription("sub1", on(&r1, notes_by("abc")), None);

    client.send(&note("e1"), &HashSet::from([r1.clone()]));
    hub.deliver(&r1, r#"["OK","e1",true,""]"#);
    settle().await;
    assert_eq!(hub.connect_count(&r1), 1);

    assert!(hub.sever(&r1));
    client.send(&note("e2"), &HashSet::from([r1.clone()]));
    assert!(wait_for(|| hub.connect_count(&r1) == 2).await);
    assert!(
        wait_for(|| {
            hub.sent_of_kind(&r1, "EVENT")
                .iter()
                .any(|frame| frame.contains(r#""id":"e2""#))
        })
        .await
    );
    assert_eq!(
        client.active_outbox(&r1).get("e2"),
        Some(&OutboxStatus::Sent)
    );
    Ok(())
}
