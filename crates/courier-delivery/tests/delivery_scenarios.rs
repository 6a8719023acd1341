use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};

use courier_core::{
    DeliveryConfig, DeliveryError, ErrorSeverity, RecordId, Session, SessionContext, SkipReason,
};
use courier_delivery::mock::{MockReply, MockTransport};
use courier_delivery::{AttemptOutcome, AttemptReport, DeliveryClient, TransportError};
use courier_store::{Database, MemorySessionStore, SessionStore, SqliteSessionStore};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> DeliveryConfig {
    DeliveryConfig::new("https://collector.test/sessions", "test-key")
}

fn client(config: DeliveryConfig, mock: &Arc<MockTransport>) -> DeliveryClient {
    DeliveryClient::builder(config)
        .queue_name("scenario-queue")
        .transport(mock.clone())
        .build()
        .unwrap()
}

fn append(store: &dyn SessionStore) -> (RecordId, Session) {
    let session = Session::start(SessionContext::default());
    let id = store.append(&session).unwrap();
    (id, session)
}

fn pending_ids(store: &dyn SessionStore) -> HashSet<RecordId> {
    store.list_pending().unwrap().into_iter().map(|r| r.id).collect()
}

fn drain(reports: &mut broadcast::Receiver<AttemptReport>) -> Vec<AttemptOutcome> {
    let mut outcomes = Vec::new();
    while let Ok(report) = reports.try_recv() {
        outcomes.push(report.outcome);
    }
    outcomes
}

async fn settle(client: &DeliveryClient) {
    tokio::time::timeout(WAIT, client.flush())
        .await
        .expect("queue did not drain")
        .unwrap();
}

#[tokio::test]
async fn accepted_batch_empties_store() {
    let mock = Arc::new(MockTransport::accepting());
    let client = client(config(), &mock);
    let store = Arc::new(MemorySessionStore::new());
    let (_, a) = append(&*store);
    let (_, b) = append(&*store);
    let mut reports = client.subscribe();

    client.deliver_sessions_in_store(store.clone());
    settle(&client).await;

    assert_eq!(store.count().unwrap(), 0);
    assert_eq!(mock.request_count(), 1);
    let body = &mock.bodies()[0];
    let sent: Vec<&str> = body["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    assert_eq!(sent, vec![a.id.to_string(), b.id.to_string()]);
    assert_eq!(drain(&mut reports), vec![AttemptOutcome::Accepted { delivered: 2 }]);
}

#[tokio::test]
async fn transient_failures_retain_records() {
    let mock = Arc::new(MockTransport::new(vec![
        MockReply::status(503),
        MockReply::Error(TransportError::Timeout),
        MockReply::Error(TransportError::Network("connection reset".into())),
        MockReply::status(429),
    ]));
    let client = client(config(), &mock);
    let store = Arc::new(MemorySessionStore::new());
    let (a, _) = append(&*store);
    let (b, _) = append(&*store);
    let mut reports = client.subscribe();

    for _ in 0..4 {
        client.deliver_sessions_in_store(store.clone());
    }
    settle(&client).await;

    assert_eq!(pending_ids(&*store), HashSet::from([a, b]));
    assert_eq!(mock.request_count(), 4);
    let outcomes = drain(&mut reports);
    assert_eq!(outcomes.len(), 4);
    for outcome in &outcomes {
        assert!(
            matches!(outcome, AttemptOutcome::TransientFailure { retained: 2, .. }),
            "{outcome:?}"
        );
    }
    assert_eq!(outcomes[1].error(), Some(&DeliveryError::Timeout));
}

#[tokio::test]
async fn next_trigger_retries_after_transient_failure() {
    let mock = Arc::new(MockTransport::new(vec![MockReply::status(500)]));
    let client = client(config(), &mock);
    let store = Arc::new(MemorySessionStore::new());
    append(&*store);

    client.deliver_sessions_in_store(store.clone());
    settle(&client).await;
    assert_eq!(store.count().unwrap(), 1);

    client.deliver_sessions_in_store(store.clone());
    settle(&client).await;
    assert_eq!(store.count().unwrap(), 0);
    let bodies = mock.bodies();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["sessions"], bodies[1]["sessions"]);
}

#[tokio::test]
async fn rejected_batch_is_retained() {
    let mock = Arc::new(MockTransport::new(vec![
        MockReply::Status(400, "malformed".into()),
        MockReply::status(401),
    ]));
    let client = client(config(), &mock);
    let store = Arc::new(MemorySessionStore::new());
    let (a, _) = append(&*store);
    let mut reports = client.subscribe();

    client.deliver_sessions_in_store(store.clone());
    client.deliver_sessions_in_store(store.clone());
    settle(&client).await;

    assert_eq!(pending_ids(&*store), HashSet::from([a]));
    let outcomes = drain(&mut reports);
    assert_eq!(
        outcomes[0],
        AttemptOutcome::Rejected {
            retained: 1,
            error: DeliveryError::Rejected { status: 400, body: "malformed".into() },
        }
    );
    assert!(matches!(
        &outcomes[1],
        AttemptOutcome::Rejected { error: DeliveryError::Unauthorized(_), .. }
    ));
}

#[tokio::test]
async fn session_appended_mid_flight_survives_acceptance() {
    let gate = Arc::new(Notify::new());
    let mock = Arc::new(MockTransport::new(vec![MockReply::gated(
        gate.clone(),
        MockReply::accepted(),
    )]));
    let client = client(config(), &mock);
    let store = Arc::new(MemorySessionStore::new());
    let (_, a) = append(&*store);

    client.deliver_sessions_in_store(store.clone());
    assert!(mock.wait_for_requests(1, WAIT).await);
    let (b_id, _) = append(&*store);
    gate.notify_one();
    settle(&client).await;

    assert_eq!(pending_ids(&*store), HashSet::from([b_id]));
    let sessions = mock.bodies()[0]["sessions"].as_array().unwrap().clone();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], a.id.to_string());
}

#[tokio::test]
async fn empty_store_performs_no_exchange() {
    let mock = Arc::new(MockTransport::accepting());
    let client = client(config(), &mock);
    let store = Arc::new(MemorySessionStore::new());
    let mut reports = client.subscribe();

    client.deliver_sessions_in_store(store.clone());
    settle(&client).await;

    assert_eq!(mock.request_count(), 0);
    assert_eq!(drain(&mut reports), vec![AttemptOutcome::Empty]);
}

#[tokio::test]
async fn concurrent_triggers_never_overlap() {
    let replies = (0..8)
        .map(|_| MockReply::delayed(Duration::from_millis(15), MockReply::status(503)))
        .collect();
    let mock = Arc::new(MockTransport::new(replies));
    let client = Arc::new(client(config(), &mock));
    let store = Arc::new(MemorySessionStore::new());
    append(&*store);
    append(&*store);

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            let store = store.clone();
            std::thread::spawn(move || {
                client.deliver_sessions_in_store(store.clone());
                client.deliver_sessions_in_store(store);
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    settle(&client).await;

    let mut exchanges = mock.exchanges();
    assert_eq!(exchanges.len(), 8);
    exchanges.sort_by_key(|e| e.started);
    for pair in exchanges.windows(2) {
        assert!(pair[0].finished <= pair[1].started, "exchanges overlapped");
    }
    assert_eq!(store.count().unwrap(), 2);
}

#[tokio::test]
async fn code_bundle_id_change_applies_to_next_attempt() {
    let mock = Arc::new(MockTransport::accepting());
    let client = client(config(), &mock);
    let store = Arc::new(MemorySessionStore::new());

    client.set_code_bundle_id(Some("bundle-1".into()));
    append(&*store);
    client.deliver_sessions_in_store(store.clone());
    settle(&client).await;

    client.set_code_bundle_id(Some("bundle-2".into()));
    append(&*store);
    client.deliver_sessions_in_store(store.clone());
    settle(&client).await;

    client.set_code_bundle_id(None);
    append(&*store);
    client.deliver_sessions_in_store(store.clone());
    settle(&client).await;

    let bodies = mock.bodies();
    assert_eq!(bodies[0]["app"]["codeBundleId"], "bundle-1");
    assert_eq!(bodies[1]["app"]["codeBundleId"], "bundle-2");
    assert!(bodies[2]["app"].get("codeBundleId").is_none());
}

#[tokio::test]
async fn code_bundle_id_is_read_when_the_attempt_builds() {
    let gate = Arc::new(Notify::new());
    let mock = Arc::new(MockTransport::new(vec![
        MockReply::gated(gate.clone(), MockReply::status(503)),
        MockReply::accepted(),
    ]));
    let client = client(config(), &mock);
    let store = Arc::new(MemorySessionStore::new());
    append(&*store);

    client.set_code_bundle_id(Some("old".into()));
    client.deliver_sessions_in_store(store.clone());
    client.deliver_sessions_in_store(store.clone());
    assert!(mock.wait_for_requests(1, WAIT).await);
    // The second attempt is queued but has not built its payload yet.
    client.set_code_bundle_id(Some("new".into()));
    gate.notify_one();
    settle(&client).await;

    let bodies = mock.bodies();
    assert_eq!(bodies[0]["app"]["codeBundleId"], "old");
    assert_eq!(bodies[1]["app"]["codeBundleId"], "new");
}

#[tokio::test]
async fn skipped_configurations_do_not_touch_the_network() {
    let disabled = DeliveryConfig { enabled: false, ..config() };
    let missing_key = DeliveryConfig { api_key: None, ..config() };
    let filtered = DeliveryConfig {
        release_stage: Some("development".into()),
        enabled_release_stages: Some(vec!["production".into()]),
        ..config()
    };

    for (config, expected) in [
        (disabled, SkipReason::Disabled),
        (missing_key, SkipReason::MissingApiKey),
        (filtered, SkipReason::ReleaseStageFiltered { stage: Some("development".into()) }),
    ] {
        let mock = Arc::new(MockTransport::accepting());
        let client = client(config, &mock);
        let store = Arc::new(MemorySessionStore::new());
        append(&*store);
        let mut reports = client.subscribe();

        client.deliver_sessions_in_store(store.clone());
        settle(&client).await;

        assert_eq!(mock.request_count(), 0);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(drain(&mut reports), vec![AttemptOutcome::Skipped(expected)]);
    }
}

#[tokio::test]
async fn store_read_failure_performs_no_exchange() {
    let mock = Arc::new(MockTransport::accepting());
    let client = client(config(), &mock);
    let store = Arc::new(MemorySessionStore::new());
    append(&*store);
    store.fail_reads(true);
    let mut reports = client.subscribe();

    client.deliver_sessions_in_store(store.clone());
    settle(&client).await;

    assert_eq!(mock.request_count(), 0);
    assert!(matches!(
        drain(&mut reports).as_slice(),
        [AttemptOutcome::StoreFailed(DeliveryError::Store(_))]
    ));
    store.fail_reads(false);
    assert_eq!(store.count().unwrap(), 1);
}

#[tokio::test]
async fn failed_delete_keeps_records_for_redelivery() {
    let mock = Arc::new(MockTransport::accepting());
    let client = client(config(), &mock);
    let store = Arc::new(MemorySessionStore::new());
    let (a, _) = append(&*store);
    store.fail_deletes(true);
    let mut reports = client.subscribe();

    client.deliver_sessions_in_store(store.clone());
    settle(&client).await;

    assert_eq!(mock.request_count(), 1);
    assert_eq!(pending_ids(&*store), HashSet::from([a]));
    assert!(matches!(
        drain(&mut reports).as_slice(),
        [AttemptOutcome::StoreFailed(_)]
    ));
}

#[tokio::test]
async fn sqlite_store_end_to_end() {
    let mock = Arc::new(MockTransport::new(vec![MockReply::status(502)]));
    let client = client(config(), &mock);
    let store = Arc::new(SqliteSessionStore::in_memory().unwrap());
    let (a, _) = append(&*store);
    store.record_error(&a, ErrorSeverity::Unhandled).unwrap();

    client.deliver_sessions_in_store(store.clone());
    settle(&client).await;
    assert_eq!(store.count().unwrap(), 1);

    append(&*store);
    client.deliver_sessions_in_store(store.clone());
    settle(&client).await;
    assert_eq!(store.count().unwrap(), 0);

    let bodies = mock.bodies();
    assert_eq!(bodies[0]["sessions"][0]["events"]["unhandled"], 1);
    assert_eq!(bodies[1]["sessions"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn undecodable_row_does_not_block_the_others() {
    let mock = Arc::new(MockTransport::accepting());
    let client = client(config(), &mock);
    let db = Database::in_memory().unwrap();
    let store = Arc::new(SqliteSessionStore::new(db.clone()));
    let (_, a) = append(&*store);
    let (bad, _) = append(&*store);
    let (_, c) = append(&*store);
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE pending_sessions SET started_at = 'garbage' WHERE record_id = ?1",
            [bad.as_str()],
        )?;
        Ok(())
    })
    .unwrap();
    let mut reports = client.subscribe();

    for _ in 0..3 {
        client.deliver_sessions_in_store(store.clone());
    }
    settle(&client).await;

    assert_eq!(
        drain(&mut reports),
        vec![
            AttemptOutcome::Accepted { delivered: 2 },
            AttemptOutcome::Empty,
            AttemptOutcome::Empty,
        ]
    );
    assert_eq!(mock.request_count(), 1);
    let sent: Vec<String> = mock.bodies()[0]["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(sent, vec![a.id.to_string(), c.id.to_string()]);
    assert_eq!(store.count().unwrap(), 0);
    assert_eq!(store.quarantined_count().unwrap(), 1);
}

#[test]
fn deliver_returns_without_waiting_for_the_exchange() {
    let gate = Arc::new(Notify::new());
    let mock = Arc::new(MockTransport::new(vec![MockReply::gated(
        gate.clone(),
        MockReply::accepted(),
    )]));
    let client = client(config(), &mock);
    let store = Arc::new(MemorySessionStore::new());
    append(&*store);

    client.deliver_sessions_in_store(store.clone());
    assert_eq!(store.count().unwrap(), 1);
    gate.notify_one();
    assert!(client.wait_idle(WAIT));
    assert_eq!(store.count().unwrap(), 0);
    client.shutdown();
}
