//! Messages, acknowledgments, and exit reasons
//!
//! Exit reasons travel between processes as map-shaped values with a
//! `signal` discriminator, so trapped exits and DOWN notifications look
//! the same to bytecode whether they came from a link, a monitor, or a
//! supervisor shutdown.

use std::time::{Duration, Instant};

use reeve_bytecode::{MonitorRef, Value};

use crate::process::Addr;

/// One mailbox entry.
#[derive(Debug, Clone)]
pub struct Message {
    /// Monotonic message id.
    pub id: u64,
    /// Sending process address (0 for the system).
    pub sender: Addr,
    /// The payload.
    pub value: Value,
    /// Whether the sender asked for an acknowledgment.
    pub needs_ack: bool,
    /// When the message was sent.
    pub sent_at: Instant,
    /// Optional time-to-live; expired messages are swept.
    pub ttl: Option<Duration>,
}

impl Message {
    /// Whether this message's TTL has elapsed.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.sent_at) >= ttl,
            None => false,
        }
    }
}

/// Delivery status recorded in an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    /// Landed in the target mailbox.
    Delivered,
    /// Consumed by a receive.
    Processed,
    /// Refused (dead target, full mailbox under the fail policy).
    Rejected,
    /// Expired before delivery.
    TimedOut,
}

/// Acknowledgment of a message, queued back to the sender.
#[derive(Debug, Clone)]
pub struct Acknowledgment {
    /// Id of the acknowledged message.
    pub message_id: u64,
    /// The process the message was addressed to.
    pub receiver: Addr,
    /// What happened to it.
    pub status: AckStatus,
}

/// Why a process died.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// Clean termination.
    Normal,
    /// Ordered shutdown (supervisor stop).
    Shutdown,
    /// Untrappable kill.
    Kill,
    /// Link or monitor against a dead or nonexistent process.
    InvalidProcess,
    /// Unhandled exception; carries the structured exception value.
    Exception(Value),
    /// Any other reason value passed to EXIT.
    Custom(Value),
}

impl ExitReason {
    /// Whether a trapping process may convert this signal into a message.
    /// Kill is the one untrappable reason.
    pub fn is_trappable(&self) -> bool {
        !matches!(self, ExitReason::Kill)
    }

    /// Whether this reason counts as abnormal for Transient restarts.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, ExitReason::Normal | ExitReason::Shutdown)
    }

    /// The reason as a value, for EXIT/DOWN message shapes.
    pub fn to_value(&self) -> Value {
        match self {
            ExitReason::Normal => Value::symbol("normal"),
            ExitReason::Shutdown => Value::symbol("shutdown"),
            ExitReason::Kill => Value::symbol("kill"),
            ExitReason::InvalidProcess => Value::symbol("invalid_process"),
            ExitReason::Exception(v) => v.clone(),
            ExitReason::Custom(v) => v.clone(),
        }
    }

    /// Parse a reason from the value given to EXIT / EXIT_REMOTE. The
    /// conventional symbols map onto the named variants; anything else is
    /// carried verbatim.
    pub fn from_value(value: Value) -> Self {
        match value.as_name() {
            Some("normal") => ExitReason::Normal,
            Some("shutdown") => ExitReason::Shutdown,
            Some("kill") => ExitReason::Kill,
            Some("invalid_process") => ExitReason::InvalidProcess,
            _ => ExitReason::Custom(value),
        }
    }
}

/// Link kinds recorded in exit-signal messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Bidirectional link.
    Link,
    /// Unidirectional monitor.
    Monitor,
}

impl LinkKind {
    fn as_str(self) -> &'static str {
        match self {
            LinkKind::Link => "Link",
            LinkKind::Monitor => "Monitor",
        }
    }
}

/// The message shape delivered to a trapping process for an exit signal:
/// `{signal: "EXIT", from, reason, link_type}`.
pub fn exit_message(from: Addr, reason: &ExitReason, kind: LinkKind) -> Value {
    Value::map([
        ("signal", Value::str("EXIT")),
        ("from", Value::Uint(from)),
        ("reason", reason.to_value()),
        ("link_type", Value::str(kind.as_str())),
    ])
}

/// The message shape delivered to a watcher when a monitored process
/// dies: `{signal: "DOWN", ref, process, reason}`.
pub fn down_message(monitor: &MonitorRef, reason: &ExitReason) -> Value {
    Value::map([
        ("signal", Value::str("DOWN")),
        ("ref", Value::Uint(monitor.id)),
        ("process", Value::Uint(monitor.watched)),
        ("reason", reason.to_value()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_round_trip() {
        assert_eq!(
            ExitReason::from_value(Value::symbol("normal")),
            ExitReason::Normal
        );
        assert_eq!(
            ExitReason::from_value(Value::str("kill")),
            ExitReason::Kill
        );
        let custom = ExitReason::from_value(Value::Int(7));
        assert_eq!(custom, ExitReason::Custom(Value::Int(7)));
        assert_eq!(custom.to_value(), Value::Int(7));
    }

    #[test]
    fn test_trappability() {
        assert!(ExitReason::Normal.is_trappable());
        assert!(ExitReason::Exception(Value::Null).is_trappable());
        assert!(!ExitReason::Kill.is_trappable());
    }

    #[test]
    fn test_abnormality() {
        assert!(!ExitReason::Normal.is_abnormal());
        assert!(!ExitReason::Shutdown.is_abnormal());
        assert!(ExitReason::Kill.is_abnormal());
        assert!(ExitReason::InvalidProcess.is_abnormal());
    }

    #[test]
    fn test_exit_message_shape() {
        let msg = exit_message(4, &ExitReason::Normal, LinkKind::Link);
        if let Value::Map(map) = msg {
            assert_eq!(map["signal"], Value::str("EXIT"));
            assert_eq!(map["from"], Value::Uint(4));
            assert_eq!(map["reason"], Value::symbol("normal"));
            assert_eq!(map["link_type"], Value::str("Link"));
        } else {
            panic!("expected a map");
        }
    }

    #[test]
    fn test_message_expiry() {
        let now = Instant::now();
        let msg = Message {
            id: 1,
            sender: 0,
            value: Value::Null,
            needs_ack: false,
            sent_at: now,
            ttl: Some(Duration::from_millis(10)),
        };
        assert!(!msg.is_expired(now));
        assert!(msg.is_expired(now + Duration::from_millis(20)));
    }
}
