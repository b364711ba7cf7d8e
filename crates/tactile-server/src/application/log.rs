//! Client-visible log relay.
//!
//! A client may ask (`RequestLog`) to receive server log lines at or above a
//! verbosity.  [`ClientLogger`] is the handle components use for lines that
//! should reach the client: every line goes to `tracing`, and lines that pass
//! the client's filter are queued as `Log` messages on the server event
//! channel.  The codec is never involved here; the transport encodes queued
//! messages like any other outbound traffic.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tactile_core::protocol::messages::{LogLevel, LogMessage};
use tactile_core::{Message, SERVER_MESSAGE_ID};
use tokio::sync::mpsc;

use super::session::ServerEvent;

/// Cloneable logging handle shared by the session and the device manager.
#[derive(Debug, Clone)]
pub struct ClientLogger {
    level: Arc<AtomicU8>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl ClientLogger {
    /// Creates a logger that forwards nothing until [`set_level`](Self::set_level).
    pub fn new(events: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            level: Arc::new(AtomicU8::new(LogLevel::Off as u8)),
            events,
        }
    }

    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn level(&self) -> LogLevel {
        level_from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Records `message` at `level`.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Off => return,
            LogLevel::Fatal | LogLevel::Error => tracing::error!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Trace => tracing::trace!("{message}"),
        }

        if self.level().allows(level) {
            let log = Message::Log(LogMessage {
                id: SERVER_MESSAGE_ID,
                log_level: level,
                log_message: message,
            });
            // A closed channel means the session is gone; nothing to relay to.
            let _ = self.events.send(ServerEvent::Message(log));
        }
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }
}

fn level_from_u8(raw: u8) -> LogLevel {
    match raw {
        1 => LogLevel::Fatal,
        2 => LogLevel::Error,
        3 => LogLevel::Warn,
        4 => LogLevel::Info,
        5 => LogLevel::Debug,
        6 => LogLevel::Trace,
        _ => LogLevel::Off,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nothing_is_forwarded_by_default() {
        // Arrange
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logger = ClientLogger::new(tx);

        // Act
        logger.error("boom");

        // Assert
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_lines_at_or_above_requested_level_are_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logger = ClientLogger::new(tx);
        logger.set_level(LogLevel::Info);

        logger.warn("warned");
        logger.debug("too chatty");

        match rx.try_recv() {
            Ok(ServerEvent::Message(Message::Log(log))) => {
                assert_eq!(log.id, 0);
                assert_eq!(log.log_level, LogLevel::Warn);
                assert_eq!(log.log_message, "warned");
            }
            other => panic!("expected a Log message, got {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "Debug must be filtered at Info");
    }

    #[test]
    fn test_level_round_trips_through_atomic() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let logger = ClientLogger::new(tx);
        for level in [LogLevel::Off, LogLevel::Fatal, LogLevel::Trace] {
            logger.set_level(level);
            assert_eq!(logger.level(), level);
        }
    }

    #[test]
    fn test_clones_share_the_filter() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logger = ClientLogger::new(tx);
        let clone = logger.clone();

        logger.set_level(LogLevel::Trace);
        clone.debug("from clone");

        assert!(matches!(
            rx.try_recv(),
            Ok(ServerEvent::Message(Message::Log(_)))
        ));
    }
}
