//! Engine configuration

use std::time::Duration;

/// What SEND does when the target mailbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailboxPolicy {
    /// Park the sender until the mailbox drains.
    #[default]
    Block,
    /// Silently discard the message (counted in stats).
    Drop,
    /// Raise `MailboxOverflow` in the sender.
    Fail,
}

/// Engine and scheduler limits.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum concurrently live processes.
    pub max_processes: usize,
    /// Maximum data stack depth per process.
    pub max_stack_size: usize,
    /// Maximum messages queued in one mailbox.
    pub max_mailbox_size: usize,
    /// Base reduction budget per scheduler slice (scaled by priority).
    pub max_reductions_per_slice: u64,
    /// Maximum event-loop iterations per `run()` call.
    pub iteration_limit: usize,
    /// TTL stamped on every delivered message.
    pub default_message_ttl: Duration,
    /// Timeout used by RECEIVE_WITH_TIMEOUT when the operand is null.
    pub default_receive_timeout: Duration,
    /// Behavior of SEND against a full mailbox.
    pub mailbox_full_behavior: MailboxPolicy,
    /// Record delivery acknowledgments for senders that request them.
    pub enable_message_acknowledgments: bool,
    /// Move woken receivers through the reactivation queue automatically.
    pub auto_reactivate_processes: bool,
    /// How often expired messages are swept from mailboxes.
    pub message_cleanup_interval: Duration,
    /// Consecutive idle engine ticks before a deadlock scan runs.
    pub deadlock_scan_after_idle_ticks: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_processes: 100,
            max_stack_size: 1000,
            max_mailbox_size: 100,
            max_reductions_per_slice: 4000,
            iteration_limit: 10_000,
            default_message_ttl: Duration::from_secs(30),
            default_receive_timeout: Duration::from_secs(5),
            mailbox_full_behavior: MailboxPolicy::Block,
            enable_message_acknowledgments: false,
            auto_reactivate_processes: true,
            message_cleanup_interval: Duration::from_secs(5),
            deadlock_scan_after_idle_ticks: 64,
        }
    }
}

impl VmConfig {
    /// A configuration sized for unit tests: tiny queues, short timeouts.
    pub fn small() -> Self {
        Self {
            max_processes: 16,
            max_stack_size: 64,
            max_mailbox_size: 8,
            max_reductions_per_slice: 256,
            iteration_limit: 2000,
            default_message_ttl: Duration::from_secs(5),
            default_receive_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }
}
