//! Process-wide fault interception: the panic hook and fatal-signal
//! handlers that turn a dying process into one last report.

use std::any::Any;
use std::panic;
use std::sync::OnceLock;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::warn;

/// Signals intercepted and reported before the process dies.
const FATAL_SIGNALS: [Signal; 7] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGSEGV,
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
];

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the panic hook and signal handlers, once per process.
/// Subsequent calls are no-ops, so re-running setup never stacks
/// handlers.
pub(crate) fn install() {
    INSTALLED.get_or_init(|| {
        install_panic_hook();
        install_signal_handlers();
    });
}

fn install_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if let Some(hub) = crate::installed() {
            hub.handle_panic(panic_payload_message(info.payload()));
        }
        previous(info);
    }));
}

fn install_signal_handlers() {
    let report = SigAction::new(
        SigHandler::Handler(on_fatal_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in FATAL_SIGNALS {
        // Safety: the handler stays valid for the process lifetime.
        if let Err(err) = unsafe { signal::sigaction(signal, &report) } {
            warn!("could not install a handler for {signal}: {err}");
        }
    }
}

/// Report the signal, flush, and re-raise under the default disposition
/// so the process still dies of its original cause.
///
/// The capture path allocates and takes locks, which signal context
/// does not permit in general; crash-time reporting is best effort and
/// may itself fail silently.
extern "C" fn on_fatal_signal(raw: libc::c_int) {
    let Ok(signal) = Signal::try_from(raw) else {
        return;
    };
    let restore = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = signal::sigaction(signal, &restore);
    }
    if let Some(hub) = crate::installed() {
        hub.handle_signal(signal.as_str());
    }
    let _ = signal::raise(signal);
}

/// Best-effort text of a panic payload. Std panics carry `&str` or
/// `String`; anything else gets a fixed label.
pub(crate) fn panic_payload_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_panic_payload_message() {
        let caught = panic::catch_unwind(|| panic!("plain literal")).unwrap_err();
        assert_eq!(panic_payload_message(caught.as_ref()), "plain literal");

        let caught = panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_payload_message(caught.as_ref()), "formatted 7");

        let caught = panic::catch_unwind(|| panic::panic_any(42_u32)).unwrap_err();
        assert_eq!(panic_payload_message(caught.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_install_twice_is_safe() {
        install();
        install();
        // The chained hook must still let panics unwind normally.
        assert!(panic::catch_unwind(|| panic!("still unwinds")).is_err());
    }
}
