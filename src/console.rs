//! Console sinks for the diagnostic stream.

use std::sync::Mutex;

use crate::outcome::Notification;
use crate::protocols::ConsoleSink;

/// Prints each notification on its own line; errors go to stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdConsole;

impl ConsoleSink for StdConsole {
    fn emit(&self, notification: &Notification) {
        if notification.is_error() {
            eprintln!("{}", notification);
        } else {
            println!("{}", notification);
        }
    }
}

/// Keeps every notification in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingConsole {
    lines: Mutex<Vec<Notification>>,
}

impl RecordingConsole {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Notification>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.entries().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.entries().iter().map(|n| n.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConsoleSink for RecordingConsole {
    fn emit(&self, notification: &Notification) {
        self.entries().push(notification.clone());
    }
}
