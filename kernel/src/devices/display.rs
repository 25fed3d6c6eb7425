//! Console output collaborator.
//!
//! `write(1)`/`write(2)` render through whatever sink the display driver
//! registered. Until one exists, console output is discarded; the serial
//! logger already carries kernel diagnostics.

use spinning_top::RwSpinlock;

/// Something that can render console bytes.
pub trait ConsoleSink: Send + Sync {
    fn write_bytes(&self, bytes: &[u8]);
}

static SINK: RwSpinlock<Option<&'static dyn ConsoleSink>> = RwSpinlock::new(None);

/// Install the console sink.
pub fn set_sink(sink: &'static dyn ConsoleSink) {
    *SINK.write() = Some(sink);
}

/// Forward bytes to the registered sink, if any.
pub fn write(bytes: &[u8]) {
    if let Some(sink) = *SINK.read() {
        sink.write_bytes(bytes);
    }
}
