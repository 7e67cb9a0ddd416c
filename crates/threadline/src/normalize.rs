//! Row normalization: raw dataset JSON into [`Thread`] and [`Message`] records.
//!
//! Source rows are loosely shaped. `messages` may be missing, a JSON array,
//! or a JSON-encoded string of one, and each message names its sender,
//! recipients, date and body under several alternative fields. Everything
//! here is pure so it can be tested without a network or a store.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use threadline_core::keys::{canonical_json, message_key, thread_key};
use threadline_core::models::{Message, Thread, MAX_PARTICIPANTS};

const SENDER_FIELDS: &[&str] = &["sender", "from", "from_email", "fromName", "from_name"];
const RECIPIENT_FIELDS: &[&str] = &["to", "cc", "bcc", "recipients"];
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "date", "sent_at", "sentAt", "datetime"];
const BODY_FIELDS: &[&str] = &["body", "text", "content", "message", "raw"];

/// Why a row produced no records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("row is not a JSON object")]
    NotAnObject,
    #[error("row has no thread_id")]
    MissingThreadId,
}

/// One address-list entry: a flat string or a `{name, email}` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressEntry {
    Text(String),
    Pair {
        name: Option<String>,
        email: Option<String>,
    },
}

/// The shapes an address field takes in source messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressField {
    Text(String),
    Pair {
        name: Option<String>,
        email: Option<String>,
    },
    List(Vec<AddressEntry>),
}

impl AddressEntry {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(obj) => Some(AddressEntry::Pair {
                name: obj.get("name").and_then(scalar_string),
                email: obj.get("email").and_then(scalar_string),
            }),
            other => scalar_string(other).map(AddressEntry::Text),
        }
    }

    fn render(&self) -> Option<String> {
        match self {
            AddressEntry::Text(s) => non_empty(s),
            AddressEntry::Pair { name, email } => render_pair(name.as_deref(), email.as_deref()),
        }
    }
}

impl AddressField {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Array(items) => Some(AddressField::List(
                items.iter().filter_map(AddressEntry::from_value).collect(),
            )),
            Value::Object(obj) => Some(AddressField::Pair {
                name: obj.get("name").and_then(scalar_string),
                email: obj.get("email").and_then(scalar_string),
            }),
            other => scalar_string(other).map(AddressField::Text),
        }
    }

    /// Rendered, trimmed, non-empty addresses in source order.
    pub fn addresses(&self) -> Vec<String> {
        match self {
            AddressField::Text(s) => non_empty(s).into_iter().collect(),
            AddressField::Pair { name, email } => {
                render_pair(name.as_deref(), email.as_deref()).into_iter().collect()
            }
            AddressField::List(entries) => entries.iter().filter_map(AddressEntry::render).collect(),
        }
    }
}

/// Render a pair as `"name email"`, skipping whichever part is missing.
fn render_pair(name: Option<&str>, email: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [name, email]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn non_empty(s: &str) -> Option<String> {
    let t = s.trim();
    (!t.is_empty()).then(|| t.to_string())
}

/// Strings pass through; numbers and booleans are rendered. Anything else is `None`.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn scalar_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

/// Normalize the `messages` cell into a list of message objects.
///
/// Non-object entries are dropped before ordinals are assigned. A string
/// that does not decode to an array yields no messages.
pub fn parse_messages(value: Option<&Value>) -> Vec<Map<String, Value>> {
    let objects = |items: Vec<Value>| -> Vec<Map<String, Value>> {
        items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(obj) => Some(obj),
                _ => None,
            })
            .collect()
    };

    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => objects(items.clone()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => objects(items),
            Ok(_) => {
                warn!("messages string does not decode to an array; treating as empty");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "messages string is not valid JSON; treating as empty");
                Vec::new()
            }
        },
        Some(_) => {
            warn!("messages field has an unexpected type; treating as empty");
            Vec::new()
        }
    }
}

/// First non-empty flat sender field, else `from` as a `{name, email}` pair.
pub fn extract_sender(msg: &Map<String, Value>) -> Option<String> {
    let direct = SENDER_FIELDS
        .iter()
        .filter_map(|f| msg.get(*f).and_then(scalar_string))
        .find_map(|s| non_empty(&s));
    if direct.is_some() {
        return direct;
    }
    match msg.get("from").and_then(AddressField::from_value) {
        Some(field @ AddressField::Pair { .. }) => field.addresses().into_iter().next(),
        _ => None,
    }
}

/// Union of `to`, `cc`, `bcc` and `recipients`, deduplicated in first-seen order.
pub fn extract_recipients(msg: &Map<String, Value>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for field in RECIPIENT_FIELDS {
        let Some(parsed) = msg.get(*field).and_then(AddressField::from_value) else {
            continue;
        };
        for addr in parsed.addresses() {
            if !out.contains(&addr) {
                out.push(addr);
            }
        }
    }
    out
}

/// Returns the parsed timestamp (if any format matches) and the raw value.
pub fn extract_timestamp(msg: &Map<String, Value>) -> (Option<DateTime<Utc>>, Option<String>) {
    let raw = TIMESTAMP_FIELDS
        .iter()
        .find_map(|f| msg.get(*f).and_then(scalar_string));
    match raw {
        Some(raw) => (parse_timestamp(&raw), Some(raw)),
        None => (None, None),
    }
}

/// Parse RFC 3339, RFC 2822, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS`
/// (both as UTC) or a bare `YYYY-MM-DD`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn extract_body(msg: &Map<String, Value>) -> String {
    BODY_FIELDS
        .iter()
        .find_map(|f| msg.get(*f).and_then(scalar_string))
        .unwrap_or_default()
}

/// Records produced from one dataset row.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub thread: Thread,
    pub messages: Vec<Message>,
}

/// Turn one dataset row into a thread and its ordered messages.
pub fn normalize_row(
    row: &Value,
    store_raw: bool,
    now: DateTime<Utc>,
) -> Result<NormalizedRow, RowError> {
    let obj = row.as_object().ok_or(RowError::NotAnObject)?;

    let thread_id = obj
        .get("thread_id")
        .and_then(scalar_string)
        .and_then(|s| non_empty(&s))
        .ok_or(RowError::MissingThreadId)?;
    let source_file = obj
        .get("source_file")
        .and_then(scalar_string)
        .unwrap_or_default();
    let thread_subject = obj.get("subject").and_then(scalar_string);
    let message_count = obj.get("message_count").and_then(scalar_number);

    let tkey = thread_key(&source_file, &thread_id);
    let raw_messages = parse_messages(obj.get("messages"));

    let mut participants: Vec<String> = Vec::new();
    let mut messages = Vec::with_capacity(raw_messages.len());

    for (i, msg) in raw_messages.into_iter().enumerate() {
        let sender = extract_sender(&msg);
        let recipients = extract_recipients(&msg);
        let (timestamp, timestamp_raw) = extract_timestamp(&msg);
        let body = extract_body(&msg);
        let subject = msg
            .get("subject")
            .and_then(scalar_string)
            .or_else(|| thread_subject.clone());

        for p in sender.iter().chain(recipients.iter()) {
            if participants.len() < MAX_PARTICIPANTS && !participants.contains(p) {
                participants.push(p.clone());
            }
        }

        let canonical = canonical_json(&Value::Object(msg));
        messages.push(Message {
            thread_key: tkey.clone(),
            message_key: message_key(&tkey, i, &canonical),
            order_index: i as i64,
            sender,
            recipients,
            timestamp,
            timestamp_raw,
            subject,
            body,
            raw: store_raw.then_some(canonical),
            updated_at: now,
            chunked_at: None,
            chunk_count: None,
        });
    }

    Ok(NormalizedRow {
        thread: Thread {
            thread_key: tkey,
            thread_id,
            source_file,
            subject: thread_subject,
            message_count,
            participants,
            updated_at: now,
        },
        messages,
    })
}
