//! Randomized interleavings of appends, triggers and collector replies,
//! checked against a model of which records must still be pending.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::sync::Notify;

use courier_core::{DeliveryConfig, RecordId, Session, SessionContext};
use courier_delivery::mock::{MockReply, MockTransport};
use courier_delivery::{DeliveryClient, TransportError};
use courier_store::{MemorySessionStore, SessionStore};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
enum Reply {
    Accepted,
    Rejected,
    ServerError,
    Timeout,
}

impl Reply {
    fn accepted(self) -> bool {
        matches!(self, Reply::Accepted)
    }

    fn mock(self) -> MockReply {
        match self {
            Reply::Accepted => MockReply::accepted(),
            Reply::Rejected => MockReply::status(400),
            Reply::ServerError => MockReply::status(503),
            Reply::Timeout => MockReply::Error(TransportError::Timeout),
        }
    }
}

#[derive(Clone, Debug)]
enum Op {
    Append,
    Trigger(Reply),
    /// Trigger, then append while the exchange is in flight.
    TriggerWithAppend(Reply),
}

fn reply() -> impl Strategy<Value = Reply> {
    prop_oneof![
        Just(Reply::Accepted),
        Just(Reply::Rejected),
        Just(Reply::ServerError),
        Just(Reply::Timeout),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Append),
        2 => reply().prop_map(Op::Trigger),
        1 => reply().prop_map(Op::TriggerWithAppend),
    ]
}

fn append(store: &MemorySessionStore) -> RecordId {
    store.append(&Session::start(SessionContext::default())).unwrap()
}

fn pending(store: &MemorySessionStore) -> HashSet<RecordId> {
    store.list_pending().unwrap().into_iter().map(|r| r.id).collect()
}

fn sent_count(mock: &MockTransport, index: usize) -> usize {
    mock.bodies()[index]["sessions"].as_array().unwrap().len()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn store_matches_model(ops in proptest::collection::vec(op(), 1..24)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let mock = Arc::new(MockTransport::accepting());
        let client = DeliveryClient::builder(DeliveryConfig::new("https://collector.test", "key"))
            .queue_name("property-queue")
            .transport(mock.clone())
            .build()
            .unwrap();
        let store = Arc::new(MemorySessionStore::new());
        let mut model: HashSet<RecordId> = HashSet::new();
        let mut exchanges = 0;

        for op in ops {
            match op {
                Op::Append => {
                    model.insert(append(&store));
                }
                Op::Trigger(reply) => {
                    let snapshot = model.clone();
                    if !snapshot.is_empty() {
                        mock.push_reply(reply.mock());
                    }
                    client.deliver_sessions_in_store(store.clone());
                    prop_assert!(client.wait_idle(WAIT));

                    if !snapshot.is_empty() {
                        prop_assert_eq!(sent_count(&mock, exchanges), snapshot.len());
                        exchanges += 1;
                        if reply.accepted() {
                            model.clear();
                        }
                    }
                }
                Op::TriggerWithAppend(reply) => {
                    if model.is_empty() {
                        // No exchange would start, so there is nothing to race.
                        model.insert(append(&store));
                        continue;
                    }
                    let snapshot = model.clone();
                    let gate = Arc::new(Notify::new());
                    mock.push_reply(MockReply::gated(gate.clone(), reply.mock()));
                    client.deliver_sessions_in_store(store.clone());
                    prop_assert!(rt.block_on(mock.wait_for_requests(exchanges + 1, WAIT)));

                    let late = append(&store);
                    gate.notify_one();
                    prop_assert!(client.wait_idle(WAIT));

                    prop_assert_eq!(sent_count(&mock, exchanges), snapshot.len());
                    exchanges += 1;
                    if reply.accepted() {
                        model.clear();
                    }
                    model.insert(late);
                }
            }
            prop_assert_eq!(pending(&store), model.clone());
        }

        prop_assert_eq!(mock.request_count(), exchanges);
        client.shutdown();
    }
}
