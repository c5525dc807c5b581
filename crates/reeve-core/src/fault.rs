//! Fault handler
//!
//! Owns a bounded channel of pending exit work and a delivery thread.
//! Process deaths are claimed exactly once (`Process::claim_exit`), then
//! fanned out: exit signals queue to linked processes, DOWN messages go
//! straight to watchers' mailboxes, the supervisor registry is consulted,
//! and the registered name is dropped. Signal delivery converts trappable
//! reasons into mailbox messages for trapping targets and recursively
//! kills everyone else, which is what makes linked groups die together.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::message::{down_message, exit_message, ExitReason, LinkKind};
use crate::process::{Addr, Process, ProcessState};
use crate::shared::{EngineStats, VmShared};

/// Channel capacity for pending fault events.
const FAULT_QUEUE_CAPACITY: usize = 256;

/// An exit signal in flight.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    /// The process that died (or sent EXIT_REMOTE).
    pub from: Addr,
    /// Why.
    pub reason: ExitReason,
    /// How the target is related to the sender.
    pub kind: LinkKind,
}

#[derive(Debug)]
enum FaultEvent {
    /// Fan out a death that has already been claimed and marked.
    FanOut { addr: Addr },
    /// Deliver one exit signal to one target.
    Signal { target: Addr, signal: ExitSignal },
}

/// Asynchronous exit-signal fan-out.
pub struct FaultHandler {
    shared: Arc<VmShared>,
    tx: Sender<FaultEvent>,
    rx: Mutex<Option<Receiver<FaultEvent>>>,
    in_flight: AtomicUsize,
    shutdown: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl FaultHandler {
    /// Create a handler over the shared state. Call [`start`] to spin up
    /// the delivery thread.
    ///
    /// [`start`]: FaultHandler::start
    pub fn new(shared: Arc<VmShared>) -> Arc<Self> {
        let (tx, rx) = channel::bounded(FAULT_QUEUE_CAPACITY);
        Arc::new(Self {
            shared,
            tx,
            rx: Mutex::new(Some(rx)),
            in_flight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Start the delivery thread. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        let handler = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("reeve-fault".to_string())
            .spawn(move || handler.run_loop(rx))
            .expect("failed to spawn fault handler thread");
        *self.handle.lock() = Some(handle);
    }

    /// Stop the delivery thread, waiting briefly for it to drain.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let start = Instant::now();
            let timeout = Duration::from_secs(2);
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    return;
                }
                if start.elapsed() > timeout {
                    drop(handle);
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    /// Whether no fault work is queued or executing.
    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
    }

    fn run_loop(&self, rx: Receiver<FaultEvent>) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            match rx.recv_timeout(Duration::from_millis(20)) {
                Ok(event) => {
                    self.process_event(event);
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                }
                Err(channel::RecvTimeoutError::Timeout) => continue,
                Err(channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn process_event(&self, event: FaultEvent) {
        match event {
            FaultEvent::FanOut { addr } => {
                if let Some(proc) = self.shared.get(addr) {
                    self.fan_out(&proc);
                }
            }
            FaultEvent::Signal { target, signal } => self.deliver_signal(target, signal),
        }
    }

    fn enqueue(&self, event: FaultEvent) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) | Err(TrySendError::Disconnected(event)) => {
                // Queue unavailable: deliver inline rather than lose the
                // signal.
                self.process_event(event);
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Claim and mark a death. Returns false when the process was already
    /// handled (the entry point is idempotent on dead processes).
    fn mark_dead(&self, proc: &Arc<Process>, reason: ExitReason) -> bool {
        if !proc.claim_exit() {
            return false;
        }
        proc.set_exit_reason(reason);
        proc.set_state(ProcessState::Dead);
        self.shared.scheduler.mark_dead(proc.addr());
        true
    }

    /// Report a death from the dispatch loop. The process is marked dead
    /// immediately; fan-out happens on the delivery thread.
    pub fn notify_exit(&self, proc: &Arc<Process>, reason: ExitReason) {
        if self.mark_dead(proc, reason) {
            log::debug!("process {} exited", proc.addr());
            self.enqueue(FaultEvent::FanOut { addr: proc.addr() });
        }
    }

    /// Kill and fan out synchronously. Used by the delivery thread for
    /// untrapped signals and by supervisor shutdown.
    pub fn handle_exit(&self, proc: &Arc<Process>, reason: ExitReason) {
        if self.mark_dead(proc, reason) {
            self.fan_out(proc);
        }
    }

    /// Queue an exit signal from `from` to `to` without the sender dying
    /// (EXIT_REMOTE).
    pub fn exit_process(&self, from: Addr, to: Addr, reason: ExitReason) {
        self.enqueue(FaultEvent::Signal {
            target: to,
            signal: ExitSignal {
                from,
                reason,
                kind: LinkKind::Link,
            },
        });
    }

    fn fan_out(&self, proc: &Arc<Process>) {
        let addr = proc.addr();
        let reason = proc.exit_reason().unwrap_or(ExitReason::Normal);

        // Abandon anything this process was still trying to send.
        let abandoned = {
            let mut sends = proc.blocked_sends();
            let n = sends.len();
            sends.clear();
            n
        };
        for _ in 0..abandoned {
            EngineStats::bump(&self.shared.stats.dropped);
        }

        let (linked, watchers) = self.shared.links.cleanup(addr);

        for target in linked {
            self.enqueue(FaultEvent::Signal {
                target,
                signal: ExitSignal {
                    from: addr,
                    reason: reason.clone(),
                    kind: LinkKind::Link,
                },
            });
        }

        // DOWN messages are delivered immediately, at most once per ref;
        // cleanup already removed the refs from both indices.
        for reference in watchers {
            if let Some(watcher) = self.shared.get(reference.watcher) {
                let value = down_message(&reference, &reason);
                let message = self.shared.make_message(addr, value, false);
                self.shared.try_deliver(&watcher, message);
            }
        }

        self.shared
            .supervisors
            .handle_child_exit(self, &self.shared, addr, &reason);

        if let Some(name) = proc.registered_name() {
            self.shared.names.unregister(&name);
            proc.set_registered_name(None);
        }
    }

    fn deliver_signal(&self, target: Addr, signal: ExitSignal) {
        let Some(proc) = self.shared.get(target) else {
            return;
        };
        if !proc.is_alive() {
            return;
        }
        if self.shared.links.traps_exit(target) && signal.reason.is_trappable() {
            let value = exit_message(signal.from, &signal.reason, signal.kind);
            let message = self.shared.make_message(signal.from, value, false);
            self.shared.try_deliver(&proc, message);
            EngineStats::bump(&self.shared.stats.trapped_exits);
        } else {
            self.handle_exit(&proc, signal.reason);
        }
    }
}

impl Drop for FaultHandler {
    fn drop(&mut self) {
        self.stop();
    }
}
