//! The pipeline tying everything together: events in, deliveries out.

use std::sync::Mutex;

use rand::Rng;
use serde_json::{json, Map, Value};
use time::OffsetDateTime;
use tracing::debug;

use faultline_backtrace::StackCapturer;

use crate::dedup::Dedup;
use crate::dsn::Dsn;
use crate::event::{format_timestamp, Breadcrumb, Event, EventId, Exception, Level, SignalInfo};
use crate::scope::Scope;
use crate::transport::Transport;
use crate::Options;

// Frames the capture plumbing itself contributes, hidden from reports.
const EXCEPTION_SKIP_FRONT: usize = 6;
const EXCEPTION_SKIP_BACK: usize = 2;
const SIGNAL_SKIP_FRONT: usize = 3;
const SIGNAL_SKIP_BACK: usize = 2;

/// Coordinates scope, dedup, sampling and delivery for one reporting
/// destination.
///
/// Every field sits behind its own lock and the hub's locks are never
/// nested within each other. The transport handle is the only lock
/// held across a call out (enqueueing takes the transport's internal
/// queue lock), and the transport never reaches back into the hub, so
/// the ordering stays acyclic and callers on any thread cannot
/// deadlock.
pub struct Hub {
    capturer: StackCapturer,
    attach_source: bool,
    sample_rate: u8,
    scope: Mutex<Scope>,
    dedup: Mutex<Dedup>,
    transport: Mutex<Option<Transport>>,
    last_event_id: Mutex<Option<EventId>>,
}

impl Hub {
    /// A hub delivering over HTTP to the endpoint's collector.
    pub fn new(options: &Options, dsn: &Dsn) -> Hub {
        Hub::with_transport(options, Transport::new(dsn))
    }

    /// A hub delivering through a caller-supplied transport.
    pub fn with_transport(options: &Options, transport: Transport) -> Hub {
        let mut scope = Scope::new();
        scope.set_max_breadcrumbs(options.max_breadcrumbs);
        let hub = Hub {
            capturer: StackCapturer::new(),
            attach_source: options.attach_source,
            sample_rate: options.sample_rate,
            scope: Mutex::new(scope),
            dedup: Mutex::new(Dedup::new()),
            transport: Mutex::new(Some(transport)),
            last_event_id: Mutex::new(None),
        };
        if let Some(release) = &options.release {
            hub.set_tag("release", release);
        }
        if let Some(environment) = &options.environment {
            hub.set_tag("environment", environment);
        }
        hub
    }

    /// Run an event through the full pipeline: dedup, stamping, scope
    /// merge, sampling, delivery, breadcrumb trail.
    ///
    /// Returns `None` when the event was suppressed as a duplicate; a
    /// suppressed event leaves no trace, not even in the last-event-id.
    /// A sampled-out event is not delivered but still yields its id and
    /// a breadcrumb.
    pub fn capture_event(&self, event: Event) -> Option<EventId> {
        let now = OffsetDateTime::now_utc();
        if let Some(message) = event.message_text() {
            if !self.dedup.lock().unwrap().should_send(message, now) {
                debug!("suppressing a message seen too often");
                return None;
            }
        }

        let id = EventId::new();
        let crumb = Breadcrumb::from_event(&event);
        let mut doc = event.into_document();
        doc.insert("event_id".to_owned(), json!(id));
        doc.insert("timestamp".to_owned(), json!(format_timestamp(now)));
        doc.insert("platform".to_owned(), json!("other"));
        self.scope.lock().unwrap().apply_to_event(&mut doc);
        let body = Value::Object(doc).to_string();

        if self.sampled_in() {
            if let Some(transport) = self.transport.lock().unwrap().as_ref() {
                transport.send(body);
            }
        } else {
            debug!("event sampled out");
        }

        self.add_breadcrumb(crumb);
        *self.last_event_id.lock().unwrap() = Some(id);
        Some(id)
    }

    /// Report an error condition with an attached stack trace. The
    /// `context` map lands as top-level fields of the event document.
    pub fn capture_exception(
        &self,
        ty: &str,
        value: &str,
        handled: bool,
        context: Map<String, Value>,
    ) -> Option<EventId> {
        let frames =
            self.capturer
                .capture(EXCEPTION_SKIP_FRONT, EXCEPTION_SKIP_BACK, self.attach_source);
        let mut event = Event::exception(Exception {
            ty: ty.to_owned(),
            value: value.to_owned(),
            handled,
            stacktrace: Some(frames),
        });
        event.attributes = context;
        self.capture_event(event)
    }

    /// Report a caught error value, typed by its Rust type name.
    pub fn capture_error<E>(&self, error: &E) -> Option<EventId>
    where
        E: std::error::Error + ?Sized,
    {
        self.capture_exception(
            std::any::type_name::<E>(),
            &error.to_string(),
            true,
            Map::new(),
        )
    }

    /// Record a breadcrumb on the scope, stamping the time when the
    /// caller did not. The category is always rewritten to the level's
    /// name.
    pub fn add_breadcrumb(&self, mut crumb: Breadcrumb) {
        if crumb.timestamp.is_none() {
            crumb.timestamp = Some(OffsetDateTime::now_utc());
        }
        crumb.category = crumb.level.as_str().to_owned();
        self.scope.lock().unwrap().add_breadcrumb(crumb);
    }

    /// Set a scope tag. The key `"release"` is routed to the scope's
    /// release field instead of the tag map.
    pub fn set_tag(&self, key: &str, value: &str) {
        let mut scope = self.scope.lock().unwrap();
        if key == "release" {
            scope.set_release(value);
        } else {
            scope.set_tag(key, value);
        }
    }

    pub fn set_extra(&self, key: &str, value: &str) {
        self.scope.lock().unwrap().set_extra(key, value);
    }

    /// Id of the most recently captured event, if any.
    pub fn last_event_id(&self) -> Option<EventId> {
        *self.last_event_id.lock().unwrap()
    }

    /// Route a log line: error and above becomes a full event at that
    /// level, lower levels just leave a breadcrumb. Returns the event
    /// id when an event was sent.
    pub fn log(&self, message: &str, level: Level) -> Option<EventId> {
        if level >= Level::Error {
            let mut event = Event::message(message);
            event.level = Some(level);
            self.capture_event(event)
        } else {
            self.add_breadcrumb(Breadcrumb {
                category: "log".to_owned(),
                level,
                message: Some(message.to_owned()),
                ..Default::default()
            });
            None
        }
    }

    /// Entry point for the installed signal handler: report the signal
    /// with a trace, then flush and close the transport.
    pub(crate) fn handle_signal(&self, name: &str) {
        let frames = self
            .capturer
            .capture(SIGNAL_SKIP_FRONT, SIGNAL_SKIP_BACK, self.attach_source);
        let mut event = Event::signal(SignalInfo {
            name: name.to_owned(),
            stacktrace: Some(frames),
        });
        event.logger = Some("signals_handler".to_owned());
        self.capture_event(event);
        self.shutdown();
    }

    /// Entry point for the panic hook: report the panic as an unhandled
    /// exception, then flush so the report survives the process.
    pub(crate) fn handle_panic(&self, message: &str) {
        let mut context = Map::new();
        context.insert("logger".to_owned(), json!("termination_handler"));
        self.capture_exception("panic", message, false, context);
        self.shutdown();
    }

    /// Stop the transport, delivering everything still queued. Capture
    /// calls afterwards keep recording breadcrumbs and ids, but nothing
    /// further leaves the process.
    pub fn shutdown(&self) {
        if let Some(transport) = self.transport.lock().unwrap().take() {
            transport.stop();
        }
    }

    fn sampled_in(&self) -> bool {
        rand::thread_rng().gen_range(0..100) < self.sample_rate
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::transport::testing::{MockLog, MockSender};
    use crate::transport::Transport;

    fn test_hub(options: &Options) -> (Hub, Arc<MockLog>) {
        let log = Arc::new(MockLog::default());
        let sender = Box::new(MockSender(Arc::clone(&log)));
        let dsn: Dsn = "https://key@collector.example.com/42".parse().unwrap();
        let transport = Transport::with_sender(&dsn, sender);
        (Hub::with_transport(options, transport), log)
    }

    fn bodies(log: &MockLog) -> Vec<Value> {
        log.requests()
            .iter()
            .map(|r| serde_json::from_str(&r.body).unwrap())
            .collect()
    }

    #[test]
    fn test_message_pipeline_stamps_and_delivers() {
        let (hub, log) = test_hub(&Options::default());
        let id = hub.capture_event(Event::message("boom")).unwrap();
        let second = hub.capture_event(Event::message("later")).unwrap();
        assert_eq!(hub.last_event_id(), Some(second));
        hub.shutdown();

        let bodies = bodies(&log);
        assert_eq!(bodies.len(), 2);
        let first = &bodies[0];
        assert_eq!(first["message"], "boom");
        assert_eq!(first["event_id"], id.to_string());
        assert_eq!(first["platform"], "other");
        assert_eq!(first["level"], "info");
        assert!(first["timestamp"].as_str().unwrap().ends_with('Z'));
        assert!(first.get("breadcrumbs").is_none());

        // The second event sees the first one's breadcrumb.
        let trail = bodies[1]["breadcrumbs"]["values"].as_array().unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0]["message"], "boom");
        assert_eq!(trail[0]["category"], "info");
    }

    #[test]
    fn test_duplicate_suppression_leaves_no_trace() {
        let (hub, log) = test_hub(&Options::default());
        hub.capture_event(Event::message("again")).unwrap();
        hub.capture_event(Event::message("again")).unwrap();
        let third = hub.capture_event(Event::message("again")).unwrap();
        assert_eq!(hub.capture_event(Event::message("again")), None);
        // The suppressed attempt must not move the last-event-id.
        assert_eq!(hub.last_event_id(), Some(third));

        // Nor leave a breadcrumb behind: the next event sees only the
        // three delivered ones.
        hub.capture_event(Event::message("different")).unwrap();
        hub.shutdown();

        let bodies = bodies(&log);
        assert_eq!(bodies.len(), 4);
        let trail = bodies[3]["breadcrumbs"]["values"].as_array().unwrap();
        assert_eq!(trail.len(), 3);
    }

    #[test]
    fn test_sampled_out_events_are_recorded_but_not_sent() {
        let options = Options {
            sample_rate: 0,
            ..Options::default()
        };
        let (hub, log) = test_hub(&options);
        let id = hub.capture_event(Event::message("quiet"));
        assert!(id.is_some());
        assert_eq!(hub.last_event_id(), id);
        assert_eq!(hub.scope.lock().unwrap().breadcrumbs().count(), 1);
        hub.shutdown();
        assert!(log.requests().is_empty());
    }

    #[test]
    fn test_exception_event_shape() {
        let (hub, log) = test_hub(&Options::default());
        let mut context = Map::new();
        context.insert("logger".to_owned(), json!("checkout"));
        hub.capture_exception("std::io::Error", "file not found", true, context)
            .unwrap();
        hub.shutdown();

        let body = &bodies(&log)[0];
        assert_eq!(body["exception"]["type"], "std::io::Error");
        assert_eq!(body["exception"]["value"], "file not found");
        assert_eq!(body["exception"]["handled"], true);
        assert_eq!(body["logger"], "checkout");
        assert!(body["exception"]["stacktrace"]["frames"].is_array());
    }

    #[test]
    fn test_capture_error_uses_type_name_and_display() {
        let (hub, log) = test_hub(&Options::default());
        let error = "not a number".parse::<i32>().unwrap_err();
        hub.capture_error(&error).unwrap();
        hub.shutdown();

        let body = &bodies(&log)[0];
        assert_eq!(
            body["exception"]["type"],
            std::any::type_name::<std::num::ParseIntError>()
        );
        assert_eq!(body["exception"]["value"], error.to_string());
        assert_eq!(body["exception"]["handled"], true);
    }

    #[test]
    fn test_signal_event_shape_and_flush() {
        let (hub, log) = test_hub(&Options::default());
        hub.handle_signal("SIGSEGV");

        // handle_signal drains and closes the transport, so the report
        // is already observable.
        let body = &bodies(&log)[0];
        assert_eq!(body["exception"]["type"], "SIGSEGV");
        assert!(body["exception"].get("value").is_none());
        assert!(body["exception"].get("handled").is_none());
        assert_eq!(body["logger"], "signals_handler");
        assert!(body["exception"]["stacktrace"]["frames"].is_array());

        // Later captures still record locally but deliver nothing.
        assert!(hub.capture_event(Event::message("after")).is_some());
        assert_eq!(log.requests().len(), 1);
    }

    #[test]
    fn test_panic_event_shape() {
        let (hub, log) = test_hub(&Options::default());
        hub.handle_panic("index out of bounds");

        let body = &bodies(&log)[0];
        assert_eq!(body["exception"]["type"], "panic");
        assert_eq!(body["exception"]["value"], "index out of bounds");
        assert_eq!(body["exception"]["handled"], false);
        assert_eq!(body["logger"], "termination_handler");
    }

    #[test]
    fn test_log_routes_by_severity() {
        let (hub, log) = test_hub(&Options::default());
        assert_eq!(hub.log("just noting", Level::Warning), None);
        let id = hub.log("it broke", Level::Error);
        assert!(id.is_some());
        hub.shutdown();

        let bodies = bodies(&log);
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["message"], "it broke");
        assert_eq!(bodies[0]["level"], "error");
        // The warning became a breadcrumb on the error event, with its
        // category rewritten from "log" to the level name.
        let trail = bodies[0]["breadcrumbs"]["values"].as_array().unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0]["message"], "just noting");
        assert_eq!(trail[0]["category"], "warning");
        assert_eq!(trail[0]["level"], "warning");
    }

    #[test]
    fn test_release_is_special_cased_and_environment_is_a_tag() {
        let options = Options {
            release: Some("app@1.2.3".to_owned()),
            environment: Some("staging".to_owned()),
            ..Options::default()
        };
        let (hub, log) = test_hub(&options);
        hub.capture_event(Event::message("boom")).unwrap();
        hub.shutdown();

        let body = &bodies(&log)[0];
        assert_eq!(body["release"], "app@1.2.3");
        assert_eq!(body["tags"]["environment"], "staging");
        assert!(body["tags"].get("release").is_none());
    }

    #[test]
    fn test_breadcrumb_timestamps() {
        let (hub, _log) = test_hub(&Options::default());
        hub.add_breadcrumb(Breadcrumb::default());
        let stamped = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        hub.add_breadcrumb(Breadcrumb {
            timestamp: Some(stamped),
            ..Default::default()
        });

        let scope = hub.scope.lock().unwrap();
        let crumbs: Vec<_> = scope.breadcrumbs().collect();
        assert!(crumbs[0].timestamp.is_some());
        assert_eq!(crumbs[1].timestamp, Some(stamped));
    }
}
