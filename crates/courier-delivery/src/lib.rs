//! # courier-delivery
//!
//! The delivery engine: drains a [`SessionStore`](courier_store::SessionStore),
//! sends everything pending to the collector as one payload, and deletes
//! exactly the records the collector accepted.
//!
//! ```no_run
//! use std::sync::Arc;
//! use courier_core::DeliveryConfig;
//! use courier_delivery::DeliveryClient;
//! use courier_store::SqliteSessionStore;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteSessionStore::open(std::path::Path::new("sessions.db"))?);
//! let client = DeliveryClient::new(
//!     DeliveryConfig::new("https://sessions.example.com", "api-key"),
//!     "courier-delivery",
//! )?;
//! client.deliver_sessions_in_store(store);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod mock;
pub mod outcome;
pub mod payload;
pub mod queue;
pub mod transport;

pub use client::{ClientError, DeliveryClient, DeliveryClientBuilder, DEFAULT_QUEUE_NAME};
pub use outcome::{AttemptOutcome, AttemptReport};
pub use payload::{DeliveryBatch, PayloadBuilder};
pub use queue::DeliveryQueue;
pub use transport::{HttpTransport, ReqwestTransport, Request, Response, TransportError};
