//! Scheduler behavior through the engine: priorities, reduction slicing,
//! queue invariants, engine statistics.

use reeve_bytecode::{Instruction, Opcode, Program, Value};
use reeve_core::{Engine, Priority, ProcessState, VmConfig};

fn op(opcode: Opcode) -> Instruction {
    Instruction::op(opcode)
}

fn with(opcode: Opcode, operand: Value) -> Instruction {
    Instruction::with(opcode, operand)
}

#[test]
fn test_higher_priority_runs_first() {
    let engine = Engine::new(VmConfig::small());

    // The collector parks first, then records arrival order.
    let collector = engine
        .spawn(&Program::new(vec![
            op(Opcode::Receive),
            op(Opcode::Receive),
            op(Opcode::Halt),
        ]))
        .unwrap();

    let send_program = |value: i64| {
        Program::new(vec![
            with(Opcode::PushInt, Value::Int(value)),
            with(Opcode::PushUint, Value::Uint(collector)),
            op(Opcode::Send),
            op(Opcode::Halt),
        ])
    };

    // Spawn the low-priority sender first so queue position alone would
    // favor it; priority must win instead.
    engine
        .spawn_with_priority(&send_program(2), Priority::Low)
        .unwrap();
    engine
        .spawn_with_priority(&send_program(1), Priority::Max)
        .unwrap();
    engine.run();

    assert_eq!(
        engine.data_stack(collector),
        Some(vec![Value::Int(1), Value::Int(2)])
    );
}

#[test]
fn test_reduction_slicing_preempts_loops() {
    let mut config = VmConfig::small();
    config.max_reductions_per_slice = 50;
    let engine = Engine::new(config);

    // An infinite loop cannot starve the engine; it is preempted every
    // slice and the loop ends at the iteration cap.
    let spinner = engine
        .spawn(&Program::new(vec![with(Opcode::Jump, Value::Int(0))]))
        .unwrap();
    let iterations = engine.run_for(10);
    assert_eq!(iterations, 10);

    let proc = engine.shared().get(spinner).unwrap();
    assert_eq!(proc.state(), ProcessState::Alive);
    // One slice per iteration, 50 reductions each.
    assert_eq!(proc.reductions(), 500);
    assert_eq!(engine.stats().context_switches, 10);
}

#[test]
fn test_interleaving_across_slices() {
    let mut config = VmConfig::small();
    config.max_reductions_per_slice = 4;
    let engine = Engine::new(config);

    // Two counters at the same priority; neither finishes in one slice,
    // so both must make progress through alternating slices.
    let count_to_twenty = || {
        let mut code = Vec::new();
        for _ in 0..20 {
            code.push(op(Opcode::Nop));
        }
        code.push(with(Opcode::PushInt, Value::Int(1)));
        code.push(op(Opcode::Halt));
        Program::new(code)
    };
    let a = engine.spawn(&count_to_twenty()).unwrap();
    let b = engine.spawn(&count_to_twenty()).unwrap();
    engine.run();

    assert_eq!(engine.data_stack(a), Some(vec![Value::Int(1)]));
    assert_eq!(engine.data_stack(b), Some(vec![Value::Int(1)]));
    // Each needed several slices.
    assert!(engine.stats().context_switches >= 8);
}

#[test]
fn test_dead_processes_leave_all_queues() {
    let engine = Engine::new(VmConfig::small());
    let addrs: Vec<u64> = (0..5)
        .map(|i| {
            engine
                .spawn(&Program::new(vec![
                    with(Opcode::PushInt, Value::Int(i)),
                    op(Opcode::Halt),
                ]))
                .unwrap()
        })
        .collect();
    engine.run();

    for addr in addrs {
        let proc = engine.shared().get(addr).unwrap();
        assert_eq!(proc.state(), ProcessState::Dead);
    }
    assert_eq!(engine.shared().scheduler.runnable_count(), 0);
    assert!(!engine.shared().scheduler.has_pending());
}

#[test]
fn test_message_accounting() {
    let engine = Engine::new(VmConfig::small());
    let receiver = engine
        .spawn(&Program::new(vec![
            op(Opcode::Receive),
            op(Opcode::Receive),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.send(receiver, Value::Int(1));
    engine.send(receiver, Value::Int(2));
    engine.run();

    let stats = engine.stats();
    assert_eq!(stats.sent, 2);
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.expired, 0);
}

#[test]
fn test_send_to_dead_process_counts_dropped() {
    let engine = Engine::new(VmConfig::small());
    let short_lived = engine
        .spawn(&Program::new(vec![op(Opcode::Halt)]))
        .unwrap();
    engine.run();

    assert!(!engine.send(short_lived, Value::Int(1)));
    let stats = engine.stats();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.dropped, 1);
}

#[test]
fn test_run_exits_when_quiescent() {
    let engine = Engine::new(VmConfig::small());
    engine
        .spawn(&Program::new(vec![
            with(Opcode::PushInt, Value::Int(1)),
            op(Opcode::Halt),
        ]))
        .unwrap();
    let iterations = engine.run();
    // Finishes long before the iteration limit.
    assert!(iterations < engine.config().iteration_limit);
}

#[test]
fn test_priority_budget_scaling() {
    assert_eq!(Priority::Low.slice_budget(4000), 1000);
    assert_eq!(Priority::Normal.slice_budget(4000), 4000);
    assert_eq!(Priority::High.slice_budget(4000), 8000);
    assert_eq!(Priority::Max.slice_budget(4000), 16000);
}
