//! Terminal rendering of chat traffic.

use chrono::Local;
use tracing::debug;

use crate::chat::{DispatchSink, Envelope};

/// `[HH:MM:SS] author: body`, or `[HH:MM:SS] *** body` for system notices.
pub fn render(envelope: &Envelope) -> String {
    let time = envelope.created_at.with_timezone(&Local).format("%H:%M:%S");
    if envelope.is_system() {
        format!("[{time}] *** {}", envelope.body)
    } else {
        format!("[{time}] {}: {}", envelope.author, envelope.body)
    }
}

/// Prints messages on stdout and errors on stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl DispatchSink for ConsoleSink {
    fn deliver(&self, envelope: Envelope) {
        println!("{}", render(&envelope));
    }

    fn report_error(&self, message: &str) {
        eprintln!("Error: {message}");
    }

    fn report_status(&self, message: &str) {
        debug!("{message}");
    }
}
