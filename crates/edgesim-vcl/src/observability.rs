use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use edgesim_rt::json::{self as rt_json, JsonValue};

use crate::header::Header;

pub const REQUEST_ID_HEADER: &str = "X-Request-Id";
pub const REQUEST_ID_FALLBACK_HEADER: &str = "X-Correlation-Id";

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PanicDetails {
    pub kind: &'static str,
    pub message: String,
}

pub fn classify_panic_payload(payload: &(dyn Any + Send)) -> PanicDetails {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return PanicDetails {
            kind: "panic_static_str",
            message: (*message).to_string(),
        };
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return PanicDetails {
            kind: "panic_string",
            message: message.clone(),
        };
    }
    PanicDetails {
        kind: "panic_non_string",
        message: "panic".to_string(),
    }
}

pub fn format_panic_message(details: &PanicDetails) -> String {
    if details.message.is_empty() {
        format!("panic_kind={}", details.kind)
    } else {
        format!("panic_kind={} {}", details.kind, details.message)
    }
}

/// Caller-supplied request id, or a fresh one.
pub fn resolve_request_id(header: &Header) -> String {
    [REQUEST_ID_HEADER, REQUEST_ID_FALLBACK_HEADER]
        .iter()
        .find_map(|name| header.get_raw(name).and_then(|raw| sanitize_request_id(&raw)))
        .unwrap_or_else(next_request_id)
}

/// One served request, as the access log sees it.
#[derive(Clone, Debug)]
pub struct RequestRecord<'a> {
    pub request_id: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub status: u16,
    pub duration: Duration,
    pub cached: bool,
    pub backend: Option<&'a str>,
    pub response_bytes: usize,
}

impl RequestRecord<'_> {
    fn to_json(&self, event_key: &str, event: &str) -> JsonValue {
        let mut obj = BTreeMap::new();
        obj.insert(
            "backend".to_string(),
            self.backend
                .map(JsonValue::string)
                .unwrap_or(JsonValue::Null),
        );
        obj.insert("cached".to_string(), JsonValue::Bool(self.cached));
        obj.insert(
            "duration_ms".to_string(),
            JsonValue::Number(self.duration.as_secs_f64() * 1000.0),
        );
        obj.insert(event_key.to_string(), JsonValue::string(event));
        obj.insert("method".to_string(), JsonValue::string(self.method));
        obj.insert("path".to_string(), JsonValue::string(self.path));
        obj.insert("request_id".to_string(), JsonValue::string(self.request_id));
        obj.insert(
            "response_bytes".to_string(),
            JsonValue::Number(self.response_bytes as f64),
        );
        obj.insert("status".to_string(), JsonValue::Number(f64::from(self.status)));
        JsonValue::Object(obj)
    }
}

pub fn emit_request_log(record: &RequestRecord<'_>) {
    if structured_request_logging_enabled() {
        eprintln!("{}", rt_json::encode(&record.to_json("event", "http.request")));
    } else {
        edgesim_rt::log::info(&format!(
            "{} {} -> {} ({:.1}ms{})",
            record.method,
            record.path,
            record.status,
            record.duration.as_secs_f64() * 1000.0,
            if record.cached { ", cached" } else { "" }
        ));
    }
    if metrics_hook_enabled() {
        eprintln!(
            "metrics: {}",
            rt_json::encode(&record.to_json("metric", "edge.request"))
        );
    }
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || value.len() > 128 {
        return None;
    }
    value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':' | '/' | '@'))
        .then(|| value.to_string())
}

fn next_request_id() -> String {
    let next = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    format!("req-{next:016x}")
}

fn structured_request_logging_enabled() -> bool {
    std::env::var("EDGESIM_REQUEST_LOG").is_ok_and(|raw| {
        matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "structured" | "json"
        )
    })
}

fn metrics_hook_enabled() -> bool {
    std::env::var("EDGESIM_METRICS_HOOK").is_ok_and(|raw| raw.trim().eq_ignore_ascii_case("stderr"))
}
