//! The event document model.
//!
//! An [`Event`] is built by the caller (or a fault handler), then moves
//! through the capture pipeline by value: the hub stamps identity and
//! time, the scope merges session context into the serialized document,
//! and the transport ships the final JSON. Known occurrence kinds are a
//! tagged [`Payload`]; anything else rides in the free-form attribute
//! bag and is merged at the top level of the document.

use std::fmt;

use serde::Serialize;
use serde_json::{json, Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use faultline_backtrace::StackFrame;

/// The JSON object an event serializes into.
pub type Document = Map<String, Value>;

/// Severity of an event or breadcrumb, ordered weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a captured event.
///
/// Renders as the collector expects: exactly 32 lowercase hex
/// characters, no dashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> EventId {
        EventId(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> EventId {
        EventId::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl Serialize for EventId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0.simple())
    }
}

/// What kind of occurrence an event reports.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A plain message.
    Message(String),
    /// An application error, caught or fatal.
    Exception(Exception),
    /// A fatal signal delivered to the process.
    Signal(SignalInfo),
}

#[derive(Debug, Clone)]
pub struct Exception {
    /// Error type name.
    pub ty: String,
    /// Human-readable error description.
    pub value: String,
    /// Whether the application caught the error itself.
    pub handled: bool,
    pub stacktrace: Option<Vec<StackFrame>>,
}

#[derive(Debug, Clone)]
pub struct SignalInfo {
    /// Signal name, e.g. `SIGSEGV`.
    pub name: String,
    pub stacktrace: Option<Vec<StackFrame>>,
}

/// An event document under assembly.
#[derive(Debug, Clone)]
pub struct Event {
    pub payload: Payload,
    /// Explicit severity. When absent the scope's level fills in during
    /// the merge.
    pub level: Option<Level>,
    /// Origin marker, e.g. `signals_handler`.
    pub logger: Option<String>,
    /// Additional top-level fields. Typed fields win on key collision.
    pub attributes: Map<String, Value>,
}

impl Event {
    fn new(payload: Payload) -> Event {
        Event {
            payload,
            level: None,
            logger: None,
            attributes: Map::new(),
        }
    }

    pub fn message<M: Into<String>>(message: M) -> Event {
        Event::new(Payload::Message(message.into()))
    }

    pub fn exception(exception: Exception) -> Event {
        Event::new(Payload::Exception(exception))
    }

    pub fn signal(signal: SignalInfo) -> Event {
        Event::new(Payload::Signal(signal))
    }

    /// The message text, when this is a message event. Drives dedup and
    /// the breadcrumb derived from the event.
    pub(crate) fn message_text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Message(message) => Some(message),
            _ => None,
        }
    }

    /// Serialize into the top-level document. Starts from the attribute
    /// bag, then writes the typed fields over it.
    pub fn into_document(self) -> Document {
        let mut doc = self.attributes;
        match self.payload {
            Payload::Message(message) => {
                doc.insert("message".into(), json!(message));
            }
            Payload::Exception(exception) => {
                let mut interface = Map::new();
                interface.insert("type".into(), json!(exception.ty));
                interface.insert("value".into(), json!(exception.value));
                interface.insert("handled".into(), json!(exception.handled));
                if let Some(frames) = exception.stacktrace {
                    interface.insert("stacktrace".into(), json!({ "frames": frames }));
                }
                doc.insert("exception".into(), Value::Object(interface));
            }
            Payload::Signal(signal) => {
                let mut interface = Map::new();
                interface.insert("type".into(), json!(signal.name));
                if let Some(frames) = signal.stacktrace {
                    interface.insert("stacktrace".into(), json!({ "frames": frames }));
                }
                doc.insert("exception".into(), Value::Object(interface));
            }
        }
        if let Some(level) = self.level {
            doc.insert("level".into(), json!(level));
        }
        if let Some(logger) = self.logger {
            doc.insert("logger".into(), json!(logger));
        }
        doc
    }
}

/// A trail entry recorded on the scope and attached to every event.
#[derive(Debug, Clone, Serialize)]
pub struct Breadcrumb {
    /// Recording time; stamped by the hub when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(serialize_with = "serialize_opt_timestamp")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(rename = "type")]
    pub ty: String,
    pub level: Level,
    /// Always rewritten to the level's string form when recorded
    /// through the hub.
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Default for Breadcrumb {
    fn default() -> Breadcrumb {
        Breadcrumb {
            timestamp: None,
            ty: "default".into(),
            level: Level::Info,
            category: String::new(),
            message: None,
            data: None,
        }
    }
}

impl Breadcrumb {
    /// The trail entry an event leaves behind: its message (if any) and
    /// its level, everything else default.
    pub(crate) fn from_event(event: &Event) -> Breadcrumb {
        Breadcrumb {
            message: event.message_text().map(str::to_owned),
            level: event.level.unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Format a timestamp the way the collector expects: UTC, RFC 3339,
/// second precision.
pub(crate) fn format_timestamp(ts: OffsetDateTime) -> String {
    let ts = ts.replace_nanosecond(0).unwrap_or(ts);
    ts.format(&Rfc3339).unwrap_or_default()
}

fn serialize_opt_timestamp<S: serde::Serializer>(
    ts: &Option<OffsetDateTime>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match ts {
        Some(ts) => serializer.serialize_str(&format_timestamp(*ts)),
        None => serializer.serialize_none(),
    }
}
