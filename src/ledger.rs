//! Resource ledger: per-request lifecycle records for a single page load.
//!
//! Every sub-resource the page fetches gets a [`ResourceRecord`] keyed by the
//! engine's request identifier. Records are created by a start event and only
//! ever grow afterwards; the complete ledger becomes the `resources` field of
//! the final [`LoadOutput`](crate::output::LoadOutput).

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Opaque request identifier assigned by the engine
pub type RequestId = String;

/// Lifecycle stage of a resource request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Request has been issued
    #[serde(rename = "start")]
    Start,
    /// Response headers or a body chunk arrived
    #[serde(rename = "response-intermediate")]
    ResponseIntermediate,
    /// Response finished
    #[serde(rename = "response-end")]
    ResponseEnd,
}

/// A single response header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Data carried by a request start event
#[derive(Debug, Clone)]
pub struct RequestStart {
    pub id: RequestId,
    pub method: String,
    pub url: String,
    pub time: DateTime<Utc>,
    /// Set by the engine for the top-level document request
    pub is_navigation: bool,
}

/// Data carried by a response progress event. `None` fields leave the record
/// untouched when merged.
#[derive(Debug, Clone)]
pub struct ResponseProgress {
    pub id: RequestId,
    pub stage: Stage,
    pub time: DateTime<Utc>,
    pub body_size: Option<u64>,
    pub content_type: Option<String>,
    pub headers: Option<Vec<HeaderEntry>>,
    pub status: Option<u16>,
}

impl ResponseProgress {
    /// A progress event with no payload beyond its stage and timestamp
    pub fn bare(id: impl Into<RequestId>, stage: Stage, time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            stage,
            time,
            body_size: None,
            content_type: None,
            headers: None,
            status: None,
        }
    }
}

/// One in-flight or completed sub-resource request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    /// Carried as the ledger key in serialized form
    #[serde(skip)]
    pub id: RequestId,
    pub method: String,
    pub url: String,
    pub request_time: String,
    pub stage: Stage,
    pub error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub timed_out: bool,
    pub body_size: u64,
    pub content_type: String,
    pub headers: Vec<HeaderEntry>,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_intermediate_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_end_time: Option<String>,
}

impl ResourceRecord {
    fn from_start(start: &RequestStart) -> Self {
        Self {
            id: start.id.clone(),
            method: start.method.clone(),
            url: sanitize_url(&start.url),
            request_time: timestamp(start.time),
            stage: Stage::Start,
            error: false,
            error_code: None,
            timed_out: false,
            body_size: 0,
            content_type: String::new(),
            headers: Vec::new(),
            status: 0,
            response_intermediate_time: None,
            response_end_time: None,
        }
    }

    fn merge(&mut self, progress: &ResponseProgress) {
        self.stage = progress.stage;
        if let Some(size) = progress.body_size {
            self.body_size = size;
        }
        if let Some(ct) = &progress.content_type {
            self.content_type = ct.clone();
        }
        if let Some(headers) = &progress.headers {
            self.headers = headers.clone();
        }
        if let Some(status) = progress.status {
            self.status = status;
        }
        let stamp = timestamp(progress.time);
        match progress.stage {
            Stage::ResponseIntermediate => self.response_intermediate_time = Some(stamp),
            Stage::ResponseEnd => self.response_end_time = Some(stamp),
            Stage::Start => {}
        }
    }

    /// Whether the request is still waiting on the network
    pub fn is_pending(&self) -> bool {
        self.stage != Stage::ResponseEnd && !self.error && !self.timed_out
    }
}

/// Format a timestamp the way it appears in the output record
pub fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Strip the payload of an inline `data:` URL, keeping only scheme and type.
///
/// `data:image/png;base64,iVBOR...` becomes `data:image/png`. Other URLs are
/// returned unchanged.
pub fn sanitize_url(url: &str) -> String {
    let is_data = url
        .get(..5)
        .map(|scheme| scheme.eq_ignore_ascii_case("data:"))
        .unwrap_or(false);
    if !is_data {
        return url.to_string();
    }
    match url.find(';').or_else(|| url.find(',')) {
        Some(pos) => url[..pos].to_string(),
        None => url.to_string(),
    }
}

/// All resource records observed during one page load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceLedger {
    records: BTreeMap<RequestId, ResourceRecord>,
    main_request: Option<RequestId>,
    first_request: Option<RequestId>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new request. Returns `false` when the id was already seen.
    pub fn on_request_start(&mut self, start: &RequestStart) -> bool {
        if self.records.contains_key(&start.id) {
            warn!("Ignoring duplicate start for request {}", start.id);
            return false;
        }
        if self.first_request.is_none() {
            self.first_request = Some(start.id.clone());
        }
        if start.is_navigation && self.main_request.is_none() {
            self.main_request = Some(start.id.clone());
        }
        let record = ResourceRecord::from_start(start);
        debug!("Request {} started: {} {}", record.id, record.method, record.url);
        self.records.insert(start.id.clone(), record);
        true
    }

    /// Merge a response stage into an existing record. Returns `false` for an
    /// unknown id.
    pub fn on_request_progress(&mut self, progress: &ResponseProgress) -> bool {
        match self.records.get_mut(&progress.id) {
            Some(record) => {
                record.merge(progress);
                true
            }
            None => {
                debug!("Progress for unknown request {}", progress.id);
                false
            }
        }
    }

    /// Flag a request as failed. Returns `false` for an unknown id.
    pub fn on_request_error(&mut self, id: &str, error_code: &str) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.error = true;
                record.error_code = Some(error_code.to_string());
                true
            }
            None => {
                debug!("Error for unknown request {}", id);
                false
            }
        }
    }

    /// Flag a request as timed out. Returns `false` for an unknown id.
    pub fn on_request_timeout(&mut self, id: &str) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                record.timed_out = true;
                true
            }
            None => {
                debug!("Timeout for unknown request {}", id);
                false
            }
        }
    }

    /// Flag a request as timed out only if it is still pending
    pub fn expire(&mut self, id: &str) -> bool {
        match self.records.get(id) {
            Some(record) if record.is_pending() => self.on_request_timeout(id),
            _ => false,
        }
    }

    /// Id of the top-level document request, falling back to the first
    /// request observed when the engine never flagged one.
    pub fn main_request_id(&self) -> Option<&str> {
        self.main_request.as_deref().or(self.first_request.as_deref())
    }

    /// Record of the top-level document request
    pub fn main_request(&self) -> Option<&ResourceRecord> {
        self.main_request_id().and_then(|id| self.records.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&ResourceRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of requests still waiting on the network
    pub fn in_flight(&self) -> usize {
        self.records.values().filter(|r| r.is_pending()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.records.values()
    }
}

impl Serialize for ResourceLedger {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.records.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ResourceLedger {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut records = BTreeMap::<RequestId, ResourceRecord>::deserialize(deserializer)?;
        for (id, record) in records.iter_mut() {
            record.id = id.clone();
        }
        Ok(Self { records, main_request: None, first_request: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn start(id: &str, url: &str) -> RequestStart {
        RequestStart {
            id: id.to_string(),
            method: "GET".to_string(),
            url: url.to_string(),
            time: at(0),
            is_navigation: false,
        }
    }

    #[test]
    fn sanitize_strips_data_payload() {
        assert_eq!(sanitize_url("data:image/png;base64,iVBORw0KGgo="), "data:image/png");
        assert_eq!(sanitize_url("DATA:text/plain;charset=utf-8,hello"), "DATA:text/plain");
        assert_eq!(sanitize_url("data:,hello%20world"), "data:");
        assert_eq!(sanitize_url("https://example.com/a;b,c"), "https://example.com/a;b,c");
        assert_eq!(sanitize_url("dat"), "dat");
    }

    #[test]
    fn start_creates_record_with_defaults() {
        let mut ledger = ResourceLedger::new();
        assert!(ledger.on_request_start(&start("1", "https://example.com/")));
        let rec = ledger.get("1").unwrap();
        assert_eq!(rec.stage, Stage::Start);
        assert_eq!(rec.method, "GET");
        assert!(!rec.error && !rec.timed_out);
        assert_eq!(rec.request_time, "2023-11-14T22:13:20.000Z");
    }

    #[test]
    fn duplicate_start_is_ignored() {
        let mut ledger = ResourceLedger::new();
        ledger.on_request_start(&start("1", "https://example.com/"));
        ledger.on_request_progress(&ResponseProgress::bare("1", Stage::ResponseEnd, at(10)));
        assert!(!ledger.on_request_start(&start("1", "https://other.example/")));
        let rec = ledger.get("1").unwrap();
        assert_eq!(rec.url, "https://example.com/");
        assert_eq!(rec.stage, Stage::ResponseEnd);
    }

    #[test]
    fn progress_merges_without_removing_fields() {
        let mut ledger = ResourceLedger::new();
        ledger.on_request_start(&start("7", "https://example.com/app.js"));
        ledger.on_request_progress(&ResponseProgress {
            id: "7".into(),
            stage: Stage::ResponseIntermediate,
            time: at(20),
            body_size: Some(512),
            content_type: Some("application/javascript".into()),
            headers: Some(vec![HeaderEntry::new("Content-Type", "application/javascript")]),
            status: Some(200),
        });
        ledger.on_request_progress(&ResponseProgress {
            body_size: Some(2048),
            ..ResponseProgress::bare("7", Stage::ResponseEnd, at(40))
        });

        let rec = ledger.get("7").unwrap();
        assert_eq!(rec.stage, Stage::ResponseEnd);
        assert_eq!(rec.status, 200);
        assert_eq!(rec.content_type, "application/javascript");
        assert_eq!(rec.headers.len(), 1);
        assert_eq!(rec.body_size, 2048);
        assert!(rec.response_intermediate_time.is_some());
        assert!(rec.response_end_time.is_some());
    }

    #[test]
    fn unknown_ids_are_guarded() {
        let mut ledger = ResourceLedger::new();
        assert!(!ledger.on_request_progress(&ResponseProgress::bare("x", Stage::ResponseEnd, at(0))));
        assert!(!ledger.on_request_error("x", "net::ERR_FAILED"));
        assert!(!ledger.on_request_timeout("x"));
        assert!(!ledger.expire("x"));
        assert!(ledger.is_empty());
    }

    #[test]
    fn error_and_timeout_flags() {
        let mut ledger = ResourceLedger::new();
        ledger.on_request_start(&start("a", "https://example.com/"));
        ledger.on_request_start(&start("b", "https://example.com/slow"));
        assert!(ledger.on_request_error("a", "net::ERR_PROXY_CONNECTION_FAILED"));
        assert!(ledger.on_request_timeout("b"));
        assert_eq!(ledger.get("a").unwrap().error_code.as_deref(), Some("net::ERR_PROXY_CONNECTION_FAILED"));
        assert!(ledger.get("b").unwrap().timed_out);
        assert_eq!(ledger.in_flight(), 0);
    }

    #[test]
    fn expire_only_touches_pending_requests() {
        let mut ledger = ResourceLedger::new();
        ledger.on_request_start(&start("done", "https://example.com/"));
        ledger.on_request_start(&start("slow", "https://example.com/slow"));
        ledger.on_request_progress(&ResponseProgress::bare("done", Stage::ResponseEnd, at(5)));
        assert!(!ledger.expire("done"));
        assert!(ledger.expire("slow"));
        assert!(!ledger.get("done").unwrap().timed_out);
    }

    #[test]
    fn main_request_prefers_navigation_flag() {
        let mut ledger = ResourceLedger::new();
        ledger.on_request_start(&start("sw", "https://example.com/sw.js"));
        ledger.on_request_start(&RequestStart { is_navigation: true, ..start("doc", "https://example.com/") });
        assert_eq!(ledger.main_request_id(), Some("doc"));

        let mut fallback = ResourceLedger::new();
        fallback.on_request_start(&start("1", "https://example.com/"));
        fallback.on_request_start(&start("2", "https://example.com/x.css"));
        assert_eq!(fallback.main_request_id(), Some("1"));
    }

    #[test]
    fn merge_is_independent_of_interleaving() {
        let events_a = vec![
            ResponseProgress { status: Some(200), ..ResponseProgress::bare("a", Stage::ResponseIntermediate, at(1)) },
            ResponseProgress { body_size: Some(10), ..ResponseProgress::bare("a", Stage::ResponseEnd, at(3)) },
        ];
        let events_b = vec![
            ResponseProgress { status: Some(404), ..ResponseProgress::bare("b", Stage::ResponseIntermediate, at(2)) },
            ResponseProgress { body_size: Some(99), ..ResponseProgress::bare("b", Stage::ResponseEnd, at(4)) },
        ];

        let mut sequential = ResourceLedger::new();
        let mut interleaved = ResourceLedger::new();
        for ledger in [&mut sequential, &mut interleaved] {
            ledger.on_request_start(&start("a", "https://example.com/a"));
            ledger.on_request_start(&start("b", "https://example.com/b"));
        }
        for ev in events_a.iter().chain(events_b.iter()) {
            sequential.on_request_progress(ev);
        }
        for (ea, eb) in events_a.iter().zip(events_b.iter()) {
            interleaved.on_request_progress(eb);
            interleaved.on_request_progress(ea);
        }

        assert_eq!(sequential.get("a"), interleaved.get("a"));
        assert_eq!(sequential.get("b"), interleaved.get("b"));
    }
}
