//! Telemetry hook for finished relay calls.
//! By default, no telemetry is emitted unless a sink is installed via `set_telemetry_sink`.

pub mod types;

pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Implement this to receive relay events.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `record` **may** be called from any thread; implementations should avoid panicking.
/// - Called once per request, after the last byte was written.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, log: RelayLog);
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// In tests, gate emission to only the calling test thread to avoid cross-test interference.
#[cfg(test)]
thread_local! {
    static TEST_CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install a global telemetry sink. Returns `false` if a sink is already installed.
///
/// This is a write-once global for the process lifetime (backed by `OnceCell`).
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

/// Emit a record if a sink is installed.
///
/// In tests, emission is suppressed unless enabled via `test_set_capture_enabled`.
#[inline]
pub(crate) fn emit(log: RelayLog) {
    #[cfg(test)]
    {
        if !TEST_CAPTURE.with(|c| c.get()) {
            return;
        }
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record(log);
    }
}

#[cfg(test)]
/// Test-only helper: enable or disable capture for the current test thread.
pub fn test_set_capture_enabled(enabled: bool) {
    TEST_CAPTURE.with(|c| c.set(enabled));
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_is_gated_per_thread() {
        let sink = capture::sink();
        emit(RelayLog::new(RelayMode::Single).model("gate-test-off"));
        assert!(sink.take_tagged("gate-test-off").is_empty());

        test_set_capture_enabled(true);
        emit(RelayLog::new(RelayMode::Single).model("gate-test-on"));
        test_set_capture_enabled(false);
        assert_eq!(sink.take_tagged("gate-test-on").len(), 1);
    }
}
