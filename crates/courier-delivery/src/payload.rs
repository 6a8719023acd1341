//! Serialization of pending sessions into one collector request.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use courier_core::{
    AppInfo, DeliveryConfig, DeliveryError, DeviceInfo, NotifierInfo, RecordId, SessionContext,
    SessionId, SessionRecord, SessionUser,
};

use crate::transport::Request;

pub const PAYLOAD_VERSION: &str = "1.0";
pub const HEADER_API_KEY: &str = "X-Api-Key";
pub const HEADER_PAYLOAD_VERSION: &str = "X-Payload-Version";
pub const HEADER_SENT_AT: &str = "X-Sent-At";

/// RFC 3339 UTC with millisecond precision, `Z` suffix.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Serialize)]
struct Payload<'a> {
    notifier: &'a NotifierInfo,
    app: AppSection<'a>,
    device: DeviceInfo,
    sessions: Vec<SessionEntry<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppSection<'a> {
    #[serde(flatten)]
    info: AppInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    release_stage: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_bundle_id: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionEntry<'a> {
    id: SessionId,
    started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a SessionUser>,
    events: EventCounts,
}

#[derive(Serialize)]
struct EventCounts {
    handled: u32,
    unhandled: u32,
}

/// The record ids of one attempt together with their serialized body.
///
/// `ids` is fixed when the batch is built: it is exactly the set deleted on
/// acceptance, whatever is appended to the store afterwards.
#[derive(Clone, Debug)]
pub struct DeliveryBatch {
    ids: HashSet<RecordId>,
    body: Bytes,
    code_bundle_id: Option<Arc<str>>,
}

impl DeliveryBatch {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &HashSet<RecordId> {
        &self.ids
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn code_bundle_id(&self) -> Option<&str> {
        self.code_bundle_id.as_deref()
    }
}

pub struct PayloadBuilder<'a> {
    config: &'a DeliveryConfig,
}

impl<'a> PayloadBuilder<'a> {
    pub fn new(config: &'a DeliveryConfig) -> Self {
        Self { config }
    }

    /// Serialize `records` in order. The code bundle id is read here, so a
    /// value set before this call is what the collector sees.
    ///
    /// App and device fields come from the first record's start-time
    /// context; configuration fills whatever that snapshot left unset.
    pub fn build(&self, records: Vec<SessionRecord>) -> Result<DeliveryBatch, DeliveryError> {
        let code_bundle_id = self.config.code_bundle_id.get();

        let mut app = self.config.app.clone();
        let mut device = self.config.device.clone();
        let mut release_stage = self.config.release_stage.as_deref();
        if let Some(context) = records.first().map(|r| &r.session.context) {
            apply_context(context, &mut app, &mut device);
            release_stage = context.release_stage.as_deref().or(release_stage);
        }

        let sessions = records
            .iter()
            .map(|record| {
                let session = &record.session;
                SessionEntry {
                    id: session.id,
                    started_at: format_timestamp(&session.started_at),
                    user: session.user.as_ref().filter(|u| !u.is_empty()),
                    events: EventCounts {
                        handled: session.handled_count,
                        unhandled: session.unhandled_count,
                    },
                }
            })
            .collect();

        let payload = Payload {
            notifier: &self.config.notifier,
            app: AppSection {
                info: app,
                release_stage,
                code_bundle_id: code_bundle_id.as_deref(),
            },
            device,
            sessions,
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| DeliveryError::InvalidPayload(e.to_string()))?;

        let ids = records.into_iter().map(|r| r.id).collect();
        Ok(DeliveryBatch {
            ids,
            body: Bytes::from(body),
            code_bundle_id,
        })
    }

    /// The POST carrying `batch`, with auth and versioning headers.
    pub fn request(&self, batch: &DeliveryBatch, sent_at: DateTime<Utc>) -> Request {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .map(|k| k.expose().to_string())
            .unwrap_or_default();

        Request::post(self.config.endpoint.clone(), batch.body.clone())
            .with_header("Content-Type", "application/json")
            .with_header(HEADER_API_KEY, api_key)
            .with_header(HEADER_PAYLOAD_VERSION, PAYLOAD_VERSION)
            .with_header(HEADER_SENT_AT, format_timestamp(&sent_at))
            .with_timeout(self.config.request_timeout)
    }
}

fn apply_context(context: &SessionContext, app: &mut AppInfo, device: &mut DeviceInfo) {
    fn overlay(target: &mut Option<String>, snapshot: &Option<String>) {
        if let Some(value) = snapshot {
            *target = Some(value.clone());
        }
    }
    overlay(&mut app.version, &context.app_version);
    overlay(&mut app.bundle_version, &context.app_build);
    overlay(&mut device.os_name, &context.os_name);
    overlay(&mut device.os_version, &context.os_version);
}
