use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::transport::{HttpTransport, Request, Response, TransportError};

/// Pre-programmed reply for deterministic tests without a collector.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Respond with this status. Non-2xx become `TransportError::Http`.
    Status(u16, String),
    /// Fail the exchange itself.
    Error(TransportError),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
    /// Park until the notify fires, then resolve the inner reply.
    WaitFor(Arc<Notify>, Box<MockReply>),
}

impl MockReply {
    pub fn accepted() -> Self {
        Self::Status(202, String::new())
    }

    pub fn status(code: u16) -> Self {
        Self::Status(code, String::new())
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    pub fn gated(gate: Arc<Notify>, inner: MockReply) -> Self {
        Self::WaitFor(gate, Box::new(inner))
    }
}

/// Start and end of one exchange as seen by the transport.
#[derive(Clone, Copy, Debug)]
pub struct Exchange {
    pub started: Instant,
    pub finished: Instant,
}

/// Transport that answers from a script and records what it was sent.
/// Once the script runs out every request is accepted.
pub struct MockTransport {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<Request>>,
    exchanges: Mutex<Vec<Exchange>>,
}

impl MockTransport {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            exchanges: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::new(Vec::new())
    }

    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.exchanges.lock().clone()
    }

    /// Request bodies parsed as JSON, in send order.
    pub fn bodies(&self) -> Vec<serde_json::Value> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| serde_json::from_slice(&r.body).ok())
            .collect()
    }

    /// Poll until at least `n` requests have arrived.
    pub async fn wait_for_requests(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.request_count() < n {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        true
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(&self, req: Request) -> Result<Response, TransportError> {
        let started = Instant::now();
        self.requests.lock().push(req);
        let mut reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(MockReply::accepted);

        let result = loop {
            match reply {
                MockReply::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    reply = *inner;
                }
                MockReply::WaitFor(gate, inner) => {
                    gate.notified().await;
                    reply = *inner;
                }
                MockReply::Status(status, body) if (200..300).contains(&status) => {
                    break Ok(Response {
                        status,
                        body: Bytes::from(body),
                    });
                }
                MockReply::Status(status, body) => break Err(TransportError::Http { status, body }),
                MockReply::Error(err) => break Err(err),
            }
        };

        self.exchanges.lock().push(Exchange {
            started,
            finished: Instant::now(),
        });
        result
    }
}
