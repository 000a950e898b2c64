//! Payload decoding and event extraction.
//!
//! Turns a decompressed request body plus the matching [`Source`] into
//! zero or more [`CapturedEvent`]s. The payload shape is unknown ahead
//! of time: source rules supply path hints, and well-known field names
//! cover the rest.

use crate::events::{CapturedEvent, EventMetadata};
use crate::json_path;
use crate::sources::Source;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::debug;

/// Keys probed for a batch array, in order.
const BATCH_KEYS: &[&str] = &["batch", "events", "data", "items", "records", "hits", "b"];

/// Keys probed for the event name, in order.
const NAME_KEYS: &[&str] = &[
    "event",
    "eventName",
    "event_name",
    "name",
    "action",
    "code",
    "en",
    "e",
    "a",
    "type",
    "t",
];

/// Keys probed for the event timestamp, in order.
const TIMESTAMP_KEYS: &[&str] = &[
    "timestamp",
    "time",
    "ts",
    "sentAt",
    "sent_at",
    "created_at",
    "client_ts",
    "client_timestamp",
];

const USER_ID_KEYS: &[&str] = &["userId", "user_id", "uid"];
const ANONYMOUS_ID_KEYS: &[&str] = &["anonymousId", "anonymous_id", "anonId"];

/// Keys probed for a properties container, in order.
const PROPERTY_KEYS: &[&str] = &[
    "properties",
    "props",
    "event_data",
    "data",
    "payload",
    "params",
    "attributes",
];

/// Decode raw body bytes into a JSON value.
///
/// JSON is tried first; failing that, the body is parsed as
/// `application/x-www-form-urlencoded` (repeated keys become arrays).
/// Returns `None` when neither works.
pub fn decode_payload(data: &[u8]) -> Option<Value> {
    if let Ok(value) = serde_json::from_slice::<Value>(data) {
        return Some(value);
    }

    let text = std::str::from_utf8(data).ok()?;
    let mut map = Map::new();
    for (key, value) in url::form_urlencoded::parse(text.as_bytes()) {
        match map.get_mut(key.as_ref()) {
            Some(Value::Array(values)) => values.push(Value::String(value.into_owned())),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value.into_owned())]);
            }
            None => {
                map.insert(key.into_owned(), Value::String(value.into_owned()));
            }
        }
    }

    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

/// Extract all events from a decoded payload for a matched source.
pub fn extract_events(payload: &Value, source: &Source, request_url: &str) -> Vec<CapturedEvent> {
    let captured_at = Utc::now();

    let raw_events: Vec<&Value> = match locate_batch(payload, source) {
        Some(batch) => batch.iter().collect(),
        None => vec![payload],
    };

    raw_events
        .into_iter()
        .map(|raw| assemble_event(raw, payload, source, request_url, captured_at))
        .collect()
}

/// Decode and extract in one step. Any failure yields an empty list;
/// extraction must never affect the proxied request.
pub fn parse_payload(data: &[u8], source: &Source, request_url: &str) -> Vec<CapturedEvent> {
    match decode_payload(data) {
        Some(payload) => extract_events(&payload, source, request_url),
        None => {
            debug!(url = %request_url, bytes = data.len(), "Body is neither JSON nor form-encoded");
            Vec::new()
        }
    }
}

/// Find the array of events within a payload, if there is one.
fn locate_batch<'a>(payload: &'a Value, source: &Source) -> Option<&'a Vec<Value>> {
    if let Some(path) = source.batch_path.as_deref() {
        if let Some(Value::Array(batch)) = json_path::resolve(payload, path) {
            return Some(batch);
        }
    }

    if let Value::Object(obj) = payload {
        for key in BATCH_KEYS {
            if let Some(Value::Array(batch)) = obj.get(*key) {
                return Some(batch);
            }
        }
    }

    match payload {
        Value::Array(batch) => Some(batch),
        _ => None,
    }
}

fn assemble_event(
    raw: &Value,
    payload: &Value,
    source: &Source,
    request_url: &str,
    captured_at: DateTime<Utc>,
) -> CapturedEvent {
    let (event_name, consumed_name_key) = extract_event_name(raw, source);
    let timestamp = extract_timestamp(raw, source).unwrap_or(captured_at);
    let user_id = extract_id(raw, payload, source.user_id_path(), USER_ID_KEYS);
    let anonymous_id = extract_id(raw, payload, None, ANONYMOUS_ID_KEYS);
    let properties = extract_properties(raw, source, consumed_name_key);
    let context = extract_context(raw, payload);

    CapturedEvent {
        id: CapturedEvent::new_id(),
        timestamp,
        event: event_name,
        properties,
        context,
        user_id,
        anonymous_id,
        event_type: "track".to_string(),
        source_id: source.id.clone(),
        source_name: source.name.clone(),
        raw_payload: raw.clone(),
        metadata: EventMetadata {
            url: request_url.to_string(),
            captured_at,
        },
    }
}

/// Event name plus the probe key that produced it (needed for the
/// properties exclusion set).
fn extract_event_name(event: &Value, source: &Source) -> (String, Option<&'static str>) {
    if let Some(path) = source.event_name_path() {
        if let Some(name) = json_path::resolve_str(event, path) {
            return (name.to_string(), None);
        }
    }

    if let Value::Object(obj) = event {
        for key in NAME_KEYS {
            if let Some(Value::String(name)) = obj.get(*key) {
                if !name.is_empty() {
                    return (name.clone(), Some(*key));
                }
            }
        }
    }

    ("unknown".to_string(), None)
}

fn extract_timestamp(event: &Value, source: &Source) -> Option<DateTime<Utc>> {
    if let Some(path) = source.timestamp_path() {
        if let Some(value) = json_path::resolve(event, path) {
            if let Some(ts) = normalize_timestamp(value) {
                return Some(ts);
            }
        }
    }

    let obj = event.as_object()?;
    for key in TIMESTAMP_KEYS {
        if let Some(value) = obj.get(*key) {
            if let Some(ts) = normalize_timestamp(value) {
                return Some(ts);
            }
        }
    }
    None
}

/// Normalize a timestamp value.
///
/// ISO-8601 strings pass through; numbers below 10^10 are Unix seconds,
/// above are milliseconds; other strings get a generic parse attempt.
pub fn normalize_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            if let Ok(ts) = DateTime::parse_from_rfc2822(s) {
                return Some(ts.with_timezone(&Utc));
            }
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            // Epoch encoded as a string
            s.parse::<f64>().ok().and_then(epoch_to_datetime)
        }
        Value::Number(n) => n.as_f64().and_then(epoch_to_datetime),
        _ => None,
    }
}

fn epoch_to_datetime(epoch: f64) -> Option<DateTime<Utc>> {
    if !epoch.is_finite() || epoch < 0.0 {
        return None;
    }
    let millis = if epoch < 1e10 {
        epoch * 1000.0
    } else {
        epoch
    };
    Utc.timestamp_millis_opt(millis as i64).single()
}

fn extract_id(
    event: &Value,
    payload: &Value,
    mapped_path: Option<&str>,
    keys: &[&str],
) -> Option<String> {
    if let Some(path) = mapped_path {
        if let Some(id) = json_path::resolve_str(event, path) {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }

    for scope in [event, payload] {
        if let Value::Object(obj) = scope {
            for key in keys {
                if let Some(Value::String(id)) = obj.get(*key) {
                    if !id.is_empty() {
                        return Some(id.clone());
                    }
                }
            }
        }
    }
    None
}

fn extract_properties(
    event: &Value,
    source: &Source,
    consumed_name_key: Option<&str>,
) -> Map<String, Value> {
    if let Some(path) = source.property_container() {
        if let Some(Value::Object(props)) = json_path::resolve(event, path) {
            return props.clone();
        }
    }

    let obj = match event.as_object() {
        Some(obj) => obj,
        None => return Map::new(),
    };

    for key in PROPERTY_KEYS {
        if let Some(Value::Object(props)) = obj.get(*key) {
            return props.clone();
        }
    }

    // No container: use the event's own keys minus known metadata
    obj.iter()
        .filter(|(key, _)| {
            let key = key.as_str();
            key != "id"
                && key != "context"
                && !TIMESTAMP_KEYS.contains(&key)
                && !USER_ID_KEYS.contains(&key)
                && Some(key) != consumed_name_key
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn extract_context(event: &Value, payload: &Value) -> Option<Map<String, Value>> {
    for scope in [event, payload] {
        if let Some(Value::Object(ctx)) = scope.get("context") {
            return Some(ctx.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{default_sources, Source, SourceStats};
    use serde_json::json;

    fn source_by_id(id: &str) -> Source {
        default_sources()
            .into_iter()
            .find(|s| s.id == id)
            .unwrap_or_else(|| panic!("no seed source {id}"))
    }

    fn plain_source(domain: &str) -> Source {
        Source {
            id: "test".into(),
            name: "Test".into(),
            enabled: true,
            domain: domain.into(),
            url_pattern: None,
            field_mappings: None,
            event_name_path: None,
            batch_path: None,
            stats: SourceStats::default(),
        }
    }

    #[test]
    fn test_decode_json() {
        let payload = decode_payload(br#"{"event":"Login"}"#).unwrap();
        assert_eq!(payload["event"], "Login");
    }

    #[test]
    fn test_decode_form_urlencoded() {
        let payload = decode_payload(b"event=Signup&userId=u2&tag=a&tag=b").unwrap();
        assert_eq!(payload["event"], "Signup");
        assert_eq!(payload["userId"], "u2");
        assert_eq!(payload["tag"], json!(["a", "b"]));
    }

    #[test]
    fn test_decode_garbage_yields_none() {
        assert!(decode_payload(&[0xff, 0xfe, 0x00]).is_none());
        assert!(decode_payload(b"").is_none());
    }

    #[test]
    fn test_segment_batch() {
        let source = source_by_id("segment");
        let body = br#"{"batch":[{"event":"Viewed","userId":"u1"},{"event":"Clicked","userId":"u1"}],"sentAt":"2024-01-01T00:00:00Z"}"#;

        let events = parse_payload(body, &source, "https://api.segment.io/v1/batch");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "Viewed");
        assert_eq!(events[1].event, "Clicked");
        assert_eq!(events[0].user_id.as_deref(), Some("u1"));
        assert_eq!(events[0].source_id, "segment");
        assert_eq!(events[1].source_id, "segment");
    }

    #[test]
    fn test_google_analytics_measurement_protocol() {
        let source = source_by_id("google-analytics-mp");
        let body = br#"{"client_id":"c","events":[{"name":"page_view","params":{"page":"/x"}}]}"#;

        let events = parse_payload(
            body,
            &source,
            "https://www.google-analytics.com/mp/collect?measurement_id=G-1",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "page_view");
        assert_eq!(events[0].properties["page"], "/x");
        assert_eq!(events[0].source_id, "google-analytics-mp");
    }

    #[test]
    fn test_mixpanel_single_event() {
        let source = source_by_id("mixpanel");
        let body = br#"{"event":"Login","properties":{"ok":true}}"#;

        let events = parse_payload(body, &source, "https://api.mixpanel.com/track");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "Login");
        assert_eq!(events[0].properties["ok"], true);
    }

    #[test]
    fn test_form_encoded_event() {
        let source = plain_source("example.com");
        let events = parse_payload(
            b"event=Signup&userId=u2",
            &source,
            "https://example.com/track",
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "Signup");
        assert_eq!(events[0].user_id.as_deref(), Some("u2"));
    }

    #[test]
    fn test_batch_path_preserves_order() {
        let mut source = plain_source("example.com");
        source.batch_path = Some("events".into());

        let payload = json!({"events": [{"name": "a"}, {"name": "b"}, {"name": "c"}]});
        let events = extract_events(&payload, &source, "https://example.com/events");

        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_payload_array_is_a_batch() {
        let source = plain_source("example.com");
        let payload = json!([{"event": "one"}, {"event": "two"}]);
        let events = extract_events(&payload, &source, "https://example.com/track");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "one");
    }

    #[test]
    fn test_no_batch_treats_payload_as_single_event() {
        let source = plain_source("example.com");
        let payload = json!({"action": "click", "target": "button"});
        let events = extract_events(&payload, &source, "https://example.com/track");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "click");
        assert_eq!(events[0].properties["target"], "button");
        // The consumed name alias is excluded from properties
        assert!(events[0].properties.get("action").is_none());
    }

    #[test]
    fn test_inferred_properties_keep_anonymous_id() {
        let source = plain_source("example.com");
        let payload = json!({
            "event": "x",
            "anonymousId": "a1",
            "userId": "u1",
            "color": "red"
        });
        let events = extract_events(&payload, &source, "https://example.com/track");

        // Only the consumed name, id/context, timestamp and user-id
        // aliases are excluded; anonymousId stays in properties
        assert_eq!(events[0].properties["anonymousId"], "a1");
        assert_eq!(events[0].properties["color"], "red");
        assert!(events[0].properties.get("userId").is_none());
        assert!(events[0].properties.get("event").is_none());
        assert_eq!(events[0].anonymous_id.as_deref(), Some("a1"));
    }

    #[test]
    fn test_event_name_falls_back_to_unknown() {
        let source = plain_source("example.com");
        let payload = json!({"value": 42});
        let events = extract_events(&payload, &source, "https://example.com/collect");
        assert_eq!(events[0].event, "unknown");
    }

    #[test]
    fn test_field_mapping_event_name() {
        let mut source = plain_source("example.com");
        source.field_mappings = Some(
            [("event_name".to_string(), "meta.kind".to_string())]
                .into_iter()
                .collect(),
        );

        let payload = json!({"meta": {"kind": "purchase"}, "event": "ignored"});
        let events = extract_events(&payload, &source, "https://example.com/collect");
        assert_eq!(events[0].event, "purchase");
    }

    #[test]
    fn test_property_container_mapping() {
        let mut source = plain_source("example.com");
        source.field_mappings = Some(
            [("property_container".to_string(), "detail.fields".to_string())]
                .into_iter()
                .collect(),
        );

        let payload = json!({"event": "x", "detail": {"fields": {"plan": "pro"}}});
        let events = extract_events(&payload, &source, "https://example.com/collect");
        assert_eq!(events[0].properties["plan"], "pro");
    }

    #[test]
    fn test_user_ids_fall_back_to_outer_payload() {
        let mut source = plain_source("example.com");
        source.batch_path = Some("events".into());

        let payload = json!({
            "userId": "outer-user",
            "anonymousId": "outer-anon",
            "events": [{"name": "inner"}]
        });
        let events = extract_events(&payload, &source, "https://example.com/events");
        assert_eq!(events[0].user_id.as_deref(), Some("outer-user"));
        assert_eq!(events[0].anonymous_id.as_deref(), Some("outer-anon"));
    }

    #[test]
    fn test_context_from_event_then_outer() {
        let mut source = plain_source("example.com");
        source.batch_path = Some("batch".into());

        let payload = json!({
            "context": {"library": "outer"},
            "batch": [
                {"event": "a", "context": {"library": "inner"}},
                {"event": "b"}
            ]
        });
        let events = extract_events(&payload, &source, "https://example.com/v1/batch");
        assert_eq!(events[0].context.as_ref().unwrap()["library"], "inner");
        assert_eq!(events[1].context.as_ref().unwrap()["library"], "outer");
    }

    #[test]
    fn test_timestamp_seconds_and_millis_agree() {
        let seconds = normalize_timestamp(&json!(1_700_000_000)).unwrap();
        let millis = normalize_timestamp(&json!(1_700_000_000_000i64)).unwrap();
        assert_eq!(seconds, millis);
        assert_eq!(seconds.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_timestamp_iso8601_passthrough() {
        let ts = normalize_timestamp(&json!("2024-01-01T00:00:00Z")).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_timestamp_epoch_string() {
        let ts = normalize_timestamp(&json!("1700000000")).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_timestamp_unparsable_yields_none() {
        assert!(normalize_timestamp(&json!("not a date")).is_none());
        assert!(normalize_timestamp(&json!(true)).is_none());
        assert!(normalize_timestamp(&json!(-5)).is_none());
    }

    #[test]
    fn test_event_timestamp_uses_payload_value() {
        let source = plain_source("example.com");
        let payload = json!({"event": "x", "timestamp": "2024-06-01T12:00:00Z"});
        let events = extract_events(&payload, &source, "https://example.com/track");
        assert_eq!(
            events[0].timestamp.to_rfc3339(),
            "2024-06-01T12:00:00+00:00"
        );
    }

    #[test]
    fn test_metadata_carries_request_url() {
        let source = plain_source("example.com");
        let url = "https://example.com/track?v=1";
        let events = extract_events(&json!({"event": "x"}), &source, url);
        assert_eq!(events[0].metadata.url, url);
    }

    #[test]
    fn test_raw_payload_is_the_event_object() {
        let source = source_by_id("segment");
        let body = br#"{"batch":[{"event":"Viewed"}]}"#;
        let events = parse_payload(body, &source, "https://api.segment.io/v1/batch");
        assert_eq!(events[0].raw_payload, json!({"event": "Viewed"}));
    }
}
