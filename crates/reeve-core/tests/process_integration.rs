//! Process lifecycle end-to-end: spawning, links, monitors, exits,
//! trap-exit, registry queries.

use std::sync::Arc;

use reeve_bytecode::{Instruction, Opcode, Program, Value};
use reeve_core::{Engine, ExitReason, VmConfig};

fn op(opcode: Opcode) -> Instruction {
    Instruction::op(opcode)
}

fn with(opcode: Opcode, operand: Value) -> Instruction {
    Instruction::with(opcode, operand)
}

fn block(instructions: Vec<Instruction>) -> Value {
    Value::Instructions(Arc::new(instructions))
}

fn exception_map(reason: &ExitReason) -> &indexmap::IndexMap<String, Value> {
    match reason {
        ExitReason::Exception(Value::Map(map)) => map,
        other => panic!("expected an exception reason, got {:?}", other),
    }
}

#[test]
fn test_spawn_pushes_child_address() {
    let engine = Engine::new(VmConfig::small());
    let parent = engine
        .spawn(&Program::new(vec![
            with(
                Opcode::PushInstructions,
                block(vec![with(Opcode::PushInt, Value::Int(5)), op(Opcode::Halt)]),
            ),
            op(Opcode::Spawn),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();

    let stack = engine.data_stack(parent).unwrap();
    assert_eq!(stack.len(), 1);
    let child = stack[0].as_address().expect("child address");
    assert_eq!(engine.exit_reason(child), Some(ExitReason::Normal));
    assert_eq!(engine.data_stack(child), Some(vec![Value::Int(5)]));
}

#[test]
fn test_linked_crash_propagates() {
    let engine = Engine::new(VmConfig::small());
    let parent = engine
        .spawn(&Program::new(vec![
            with(
                Opcode::PushInstructions,
                block(vec![
                    with(Opcode::PushString, Value::str("boom")),
                    op(Opcode::Throw),
                ]),
            ),
            op(Opcode::SpawnLinked),
            op(Opcode::Pop),
            op(Opcode::Receive), // parked when the exit signal lands
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();

    // The child died with an exception; the linked parent died with the
    // same reason.
    let parent_reason = engine.exit_reason(parent).expect("parent dead");
    let map = exception_map(&parent_reason);
    assert_eq!(map["message"], Value::str("boom"));

    // Exactly one crash dump: the original crash, not the propagation.
    assert_eq!(engine.shared().crash_store.len(), 1);
}

#[test]
fn test_trap_exit_converts_signal_to_message() {
    let engine = Engine::new(VmConfig::small());
    let parent = engine
        .spawn(&Program::new(vec![
            op(Opcode::TrapExitEnable),
            with(
                Opcode::PushInstructions,
                block(vec![
                    with(Opcode::PushString, Value::str("boom")),
                    op(Opcode::Throw),
                ]),
            ),
            op(Opcode::SpawnLinked),
            op(Opcode::Pop),
            op(Opcode::Receive),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();

    // The parent survived and holds the EXIT message.
    assert_eq!(engine.exit_reason(parent), Some(ExitReason::Normal));
    let stack = engine.data_stack(parent).unwrap();
    let Value::Map(map) = &stack[0] else {
        panic!("expected an EXIT map, got {:?}", stack);
    };
    assert_eq!(map["signal"], Value::str("EXIT"));
    assert_eq!(map["link_type"], Value::str("Link"));
    assert_eq!(engine.stats().trapped_exits, 1);
}

#[test]
fn test_monitor_of_dead_address_posts_down() {
    let engine = Engine::new(VmConfig::small());
    let watcher = engine
        .spawn(&Program::new(vec![
            with(Opcode::PushUint, Value::Uint(9999)),
            op(Opcode::Monitor),
            op(Opcode::Pop), // drop the ref
            op(Opcode::Receive),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();

    let stack = engine.data_stack(watcher).unwrap();
    let Value::Map(map) = &stack[0] else {
        panic!("expected a DOWN map, got {:?}", stack);
    };
    assert_eq!(map["signal"], Value::str("DOWN"));
    assert_eq!(map["process"], Value::Uint(9999));
    assert_eq!(map["reason"], Value::symbol("invalid_process"));
}

#[test]
fn test_spawn_monitored_delivers_down_on_crash() {
    let engine = Engine::new(VmConfig::small());
    let watcher = engine
        .spawn(&Program::new(vec![
            with(
                Opcode::PushInstructions,
                block(vec![
                    with(Opcode::PushString, Value::str("oops")),
                    op(Opcode::Throw),
                ]),
            ),
            op(Opcode::SpawnMonitored),
            op(Opcode::Pop), // ref
            op(Opcode::Pop), // child address
            op(Opcode::Receive),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();

    // Monitors are one-way: the watcher survives and gets a DOWN.
    assert_eq!(engine.exit_reason(watcher), Some(ExitReason::Normal));
    let stack = engine.data_stack(watcher).unwrap();
    let Value::Map(map) = &stack[0] else {
        panic!("expected a DOWN map, got {:?}", stack);
    };
    assert_eq!(map["signal"], Value::str("DOWN"));
    if let Value::Map(reason) = &map["reason"] {
        assert_eq!(reason["message"], Value::str("oops"));
    } else {
        panic!("expected an exception reason map");
    }
}

#[test]
fn test_exit_remote_trapped() {
    let engine = Engine::new(VmConfig::small());
    let target = engine
        .spawn(&Program::new(vec![
            op(Opcode::TrapExitEnable),
            op(Opcode::Receive),
            op(Opcode::Halt),
        ]))
        .unwrap();
    let sender = engine
        .spawn(&Program::new(vec![
            with(Opcode::PushSymbol, Value::str("bye")),
            with(Opcode::PushUint, Value::Uint(target)),
            op(Opcode::ExitRemote),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();

    assert_eq!(engine.exit_reason(target), Some(ExitReason::Normal));
    let stack = engine.data_stack(target).unwrap();
    let Value::Map(map) = &stack[0] else {
        panic!("expected an EXIT map");
    };
    assert_eq!(map["from"], Value::Uint(sender));
    assert_eq!(map["reason"], Value::symbol("bye"));
}

#[test]
fn test_kill_is_untrappable() {
    let engine = Engine::new(VmConfig::small());
    let victim = engine
        .spawn(&Program::new(vec![
            op(Opcode::TrapExitEnable),
            op(Opcode::Receive),
            op(Opcode::Halt),
        ]))
        .unwrap();
    let killer = engine
        .spawn(&Program::new(vec![
            with(Opcode::PushUint, Value::Uint(victim)),
            op(Opcode::Kill),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();

    let _ = killer;
    assert_eq!(engine.exit_reason(victim), Some(ExitReason::Kill));
}

#[test]
fn test_exit_with_reason() {
    let engine = Engine::new(VmConfig::small());
    let proc = engine
        .spawn(&Program::new(vec![
            with(Opcode::PushSymbol, Value::str("shutdown")),
            op(Opcode::Exit),
            with(Opcode::PushInt, Value::Int(1)), // never reached
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();
    assert_eq!(engine.exit_reason(proc), Some(ExitReason::Shutdown));
    assert_eq!(engine.data_stack(proc), Some(vec![]));
}

#[test]
fn test_link_to_dead_process_without_trap_kills() {
    let engine = Engine::new(VmConfig::small());
    let proc = engine
        .spawn(&Program::new(vec![
            with(Opcode::PushUint, Value::Uint(424242)),
            op(Opcode::Link),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();
    assert_eq!(engine.exit_reason(proc), Some(ExitReason::InvalidProcess));
}

#[test]
fn test_link_to_dead_process_with_trap_posts_down() {
    let engine = Engine::new(VmConfig::small());
    let proc = engine
        .spawn(&Program::new(vec![
            op(Opcode::TrapExitEnable),
            with(Opcode::PushUint, Value::Uint(424242)),
            op(Opcode::Link),
            op(Opcode::Receive),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();
    assert_eq!(engine.exit_reason(proc), Some(ExitReason::Normal));
    let stack = engine.data_stack(proc).unwrap();
    let Value::Map(map) = &stack[0] else {
        panic!("expected a DOWN map");
    };
    assert_eq!(map["signal"], Value::str("DOWN"));
    assert_eq!(map["reason"], Value::symbol("invalid_process"));
}

#[test]
fn test_unlink_stops_propagation() {
    let engine = Engine::new(VmConfig::small());
    let parent = engine
        .spawn(&Program::new(vec![
            with(
                Opcode::PushInstructions,
                block(vec![
                    with(Opcode::Sleep, Value::Float(0.02)),
                    with(Opcode::PushString, Value::str("boom")),
                    op(Opcode::Throw),
                ]),
            ),
            op(Opcode::SpawnLinked),
            op(Opcode::Unlink),
            with(Opcode::Sleep, Value::Float(0.08)),
            with(Opcode::PushInt, Value::Int(1)),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();
    // The child crashed while unlinked; the parent finished normally.
    assert_eq!(engine.exit_reason(parent), Some(ExitReason::Normal));
    assert_eq!(engine.data_stack(parent), Some(vec![Value::Int(1)]));
}

#[test]
fn test_registry_opcodes() {
    let engine = Engine::new(VmConfig::small());
    let proc = engine
        .spawn(&Program::new(vec![
            with(Opcode::PushString, Value::str("me")),
            op(Opcode::Register),
            with(Opcode::PushString, Value::str("me")),
            op(Opcode::WhereIs),
            op(Opcode::SelfAddr),
            op(Opcode::Eq),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();
    assert_eq!(
        engine.data_stack(proc),
        Some(vec![Value::Bool(true), Value::Bool(true)])
    );
    // The name is released when the process dies.
    assert_eq!(engine.shared().names.whereis("me"), None);
}

#[test]
fn test_is_alive_and_get_info() {
    let engine = Engine::new(VmConfig::small());
    let proc = engine
        .spawn(&Program::new(vec![
            op(Opcode::SelfAddr),
            op(Opcode::IsAlive),
            op(Opcode::SelfAddr),
            op(Opcode::GetInfo),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();
    let stack = engine.data_stack(proc).unwrap();
    assert_eq!(stack[0], Value::Bool(true));
    let Value::Map(info) = &stack[1] else {
        panic!("expected an info map");
    };
    assert_eq!(info["address"], Value::Uint(proc));
    assert_eq!(info["state"], Value::symbol("alive"));
}

#[test]
fn test_flags() {
    let engine = Engine::new(VmConfig::small());
    let proc = engine
        .spawn(&Program::new(vec![
            with(Opcode::PushString, Value::str("role")),
            with(Opcode::PushSymbol, Value::str("worker")),
            op(Opcode::SetFlag),
            with(Opcode::PushString, Value::str("role")),
            op(Opcode::GetFlag),
            with(Opcode::PushString, Value::str("unset")),
            op(Opcode::GetFlag),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();
    assert_eq!(
        engine.data_stack(proc),
        Some(vec![Value::symbol("worker"), Value::Null])
    );
}

#[test]
fn test_yield_round_robin() {
    let engine = Engine::new(VmConfig::small());
    let a = engine
        .spawn(&Program::new(vec![
            op(Opcode::Yield),
            with(Opcode::PushInt, Value::Int(1)),
            op(Opcode::Halt),
        ]))
        .unwrap();
    let b = engine
        .spawn(&Program::new(vec![
            with(Opcode::PushInt, Value::Int(2)),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();
    assert_eq!(engine.data_stack(a), Some(vec![Value::Int(1)]));
    assert_eq!(engine.data_stack(b), Some(vec![Value::Int(2)]));
}
