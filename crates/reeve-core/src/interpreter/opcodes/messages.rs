//! Message opcode handlers: send, receive, selective receive, timers.
//!
//! Receives rewind the counter before parking so the opcode re-runs and
//! re-checks the mailbox on wake. Timed variants park with the timeout
//! token: expiry skips the re-armed receive and pushes `(null, false)`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reeve_bytecode::{Instruction, Lambda, Opcode, Value};

use crate::config::MailboxPolicy;
use crate::interpreter::Executor;
use crate::message::{AckStatus, Acknowledgment, Message};
use crate::process::{BlockedSend, ExecState, Process, WaitPredicate};
use crate::shared::{DeliverOutcome, EngineStats};
use crate::{VmError, VmResult};

impl Executor {
    pub(in crate::interpreter) fn exec_message_ops(
        &self,
        proc: &Arc<Process>,
        exec: &mut ExecState,
        instr: &Instruction,
    ) -> VmResult<()> {
        let op = instr.opcode;
        match op {
            Opcode::Send => {
                let target = self.pop_target(exec, op)?;
                let value = self.pop(exec, op)?;
                self.send_to(proc, target, value)?;
            }
            Opcode::SendAfter => {
                let seconds = seconds_operand(&instr.operand, None)?;
                let target = self.pop_target(exec, op)?;
                let value = self.pop(exec, op)?;
                let shared = self.shared();
                let message = shared.make_message(
                    proc.addr(),
                    value,
                    shared.config.enable_message_acknowledgments,
                );
                EngineStats::bump(&shared.stats.sent);
                let id = shared.next_timer_id();
                let fire_at = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
                shared.timers.schedule(id, fire_at, target, message);
                self.push(exec, Value::Uint(id))?;
            }
            Opcode::Receive => match proc.mailbox().shift() {
                Some(message) => {
                    self.ack_processed(proc, &message);
                    self.push(exec, message.value)?;
                }
                None => {
                    exec.ip -= 1;
                    self.shared().scheduler.wait_for_message(
                        proc,
                        WaitPredicate::Any,
                        None,
                        false,
                    );
                }
            },
            Opcode::ReceiveTimeout => {
                let seconds = seconds_operand(
                    &instr.operand,
                    Some(self.shared().config.default_receive_timeout),
                )?;
                match proc.mailbox().shift() {
                    Some(message) => {
                        self.ack_processed(proc, &message);
                        self.push(exec, message.value)?;
                        self.push(exec, Value::Bool(true))?;
                    }
                    None if seconds <= 0.0 => {
                        self.push(exec, Value::Null)?;
                        self.push(exec, Value::Bool(false))?;
                    }
                    None => {
                        exec.ip -= 1;
                        let deadline = Instant::now() + Duration::from_secs_f64(seconds);
                        self.shared().scheduler.wait_for_message(
                            proc,
                            WaitPredicate::Any,
                            Some(deadline),
                            true,
                        );
                    }
                }
            }
            // The matcher travels in the operand so the re-run after a
            // wake sees the same one.
            Opcode::ReceiveSelective => {
                let matcher = matcher_operand(&instr.operand)?;
                match self.scan_mailbox(proc, exec, &matcher)? {
                    Some(value) => self.push(exec, value)?,
                    None => {
                        exec.ip -= 1;
                        self.shared().scheduler.wait_for_message(
                            proc,
                            WaitPredicate::Matcher(matcher),
                            None,
                            false,
                        );
                    }
                }
            }
            // Operand: `[matcher, seconds]`, seconds optional.
            Opcode::ReceiveSelectiveTimeout => {
                let Value::Array(parts) = &instr.operand else {
                    return Err(VmError::TypeMismatch {
                        expected: "[matcher, seconds]".into(),
                        found: instr.operand.type_name().into(),
                    });
                };
                let matcher =
                    matcher_operand(parts.first().unwrap_or(&Value::Null))?;
                let seconds = seconds_operand(
                    parts.get(1).unwrap_or(&Value::Null),
                    Some(self.shared().config.default_receive_timeout),
                )?;
                match self.scan_mailbox(proc, exec, &matcher)? {
                    Some(value) => {
                        self.push(exec, value)?;
                        self.push(exec, Value::Bool(true))?;
                    }
                    None if seconds <= 0.0 => {
                        self.push(exec, Value::Null)?;
                        self.push(exec, Value::Bool(false))?;
                    }
                    None => {
                        exec.ip -= 1;
                        let deadline = Instant::now() + Duration::from_secs_f64(seconds);
                        self.shared().scheduler.wait_for_message(
                            proc,
                            WaitPredicate::Matcher(matcher),
                            Some(deadline),
                            true,
                        );
                    }
                }
            }
            Opcode::Peek => {
                let head = proc
                    .mailbox()
                    .peek()
                    .map(|m| m.value)
                    .unwrap_or(Value::Null);
                self.push(exec, head)?;
            }
            Opcode::MailboxSize => {
                let size = proc.mailbox().len() as u64;
                self.push(exec, Value::Uint(size))?;
            }
            Opcode::CancelTimer => {
                let value = self.pop(exec, op)?;
                let id = value.as_address().ok_or_else(|| VmError::TypeMismatch {
                    expected: "timer ref".into(),
                    found: value.type_name().into(),
                })?;
                let cancelled = self.shared().timers.cancel(id);
                self.push(exec, Value::Bool(cancelled))?;
            }
            other => {
                return Err(VmError::InvalidInstruction(format!(
                    "{:?} is not a message opcode",
                    other
                )))
            }
        }
        Ok(())
    }

    /// SEND body: deliver, or apply the mailbox-full policy.
    fn send_to(&self, proc: &Arc<Process>, target: u64, value: Value) -> VmResult<()> {
        let shared = self.shared();
        EngineStats::bump(&shared.stats.sent);
        let message = shared.make_message(
            proc.addr(),
            value,
            shared.config.enable_message_acknowledgments,
        );
        let Some(receiver) = shared.get(target) else {
            return Err(VmError::InvalidAddress(format!("{}", target)));
        };
        match shared.try_deliver(&receiver, message.clone()) {
            DeliverOutcome::Delivered => Ok(()),
            // A dead receiver rejects the message; the drop was counted.
            DeliverOutcome::Dead => Ok(()),
            DeliverOutcome::Full => match shared.config.mailbox_full_behavior {
                MailboxPolicy::Fail => Err(VmError::MailboxOverflow { target }),
                MailboxPolicy::Drop => {
                    EngineStats::bump(&shared.stats.dropped);
                    Ok(())
                }
                MailboxPolicy::Block => {
                    proc.blocked_sends().push_back(BlockedSend { target, message });
                    proc.wait().deps.insert(target);
                    shared.scheduler.block_on_send(proc);
                    Ok(())
                }
            },
        }
    }

    /// Record a Processed acknowledgment for a consumed message that
    /// asked for one.
    fn ack_processed(&self, proc: &Arc<Process>, message: &Message) {
        if !message.needs_ack || !self.shared().config.enable_message_acknowledgments {
            return;
        }
        if let Some(sender) = self.shared().get(message.sender) {
            sender.mailbox().push_ack(Acknowledgment {
                message_id: message.id,
                receiver: proc.addr(),
                status: AckStatus::Processed,
            });
        }
    }

    /// Scan the mailbox front-to-back, removing and returning the first
    /// message the matcher accepts.
    fn scan_mailbox(
        &self,
        proc: &Arc<Process>,
        exec: &mut ExecState,
        matcher: &Lambda,
    ) -> VmResult<Option<Value>> {
        let mut index = 0;
        while let Some(value) = proc.mailbox().value_at(index) {
            let verdict = self.invoke_lambda_inline(proc, exec, matcher, vec![value])?;
            if verdict.is_truthy() {
                // The fault handler only ever appends, so the index is
                // still valid.
                if let Some(message) = proc.mailbox().remove_at(index) {
                    self.ack_processed(proc, &message);
                    return Ok(Some(message.value));
                }
                return Ok(None);
            }
            index += 1;
        }
        Ok(None)
    }
}

/// A matcher operand: a lambda, or a bare code block wrapped into one.
fn matcher_operand(operand: &Value) -> VmResult<Lambda> {
    match operand {
        Value::Lambda(lambda) => Ok(lambda.as_ref().clone()),
        Value::Instructions(code) => Ok(Lambda::new(code.as_ref().clone(), Vec::new())),
        other => Err(VmError::TypeMismatch {
            expected: "matcher".into(),
            found: other.type_name().into(),
        }),
    }
}

fn seconds_operand(operand: &Value, default: Option<Duration>) -> VmResult<f64> {
    match operand {
        Value::Null => match default {
            Some(d) => Ok(d.as_secs_f64()),
            None => Err(VmError::Value("a delay in seconds is required".into())),
        },
        other => other.as_f64().ok_or_else(|| VmError::TypeMismatch {
            expected: "seconds".into(),
            found: other.type_name().into(),
        }),
    }
}
