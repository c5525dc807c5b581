//! Supervision trees end-to-end: restart strategies, restart windows,
//! supervisor opcodes.

use std::sync::Arc;
use std::time::Duration;

use reeve_bytecode::{Instruction, Opcode, Program, Value};
use reeve_core::{
    ChildSpec, Engine, ExitReason, ShutdownPolicy, Strategy, VmConfig,
};

fn op(opcode: Opcode) -> Instruction {
    Instruction::op(opcode)
}

fn with(opcode: Opcode, operand: Value) -> Instruction {
    Instruction::with(opcode, operand)
}

fn crashing_spec(id: &str) -> ChildSpec {
    let mut spec = ChildSpec::new(
        id,
        Program::new(vec![
            with(Opcode::PushString, Value::str("boom")),
            op(Opcode::Throw),
        ]),
    );
    spec.shutdown = ShutdownPolicy::Brutal;
    spec
}

fn waiting_spec(id: &str) -> ChildSpec {
    let mut spec = ChildSpec::new(
        id,
        Program::new(vec![op(Opcode::Receive), op(Opcode::Halt)]),
    );
    spec.shutdown = ShutdownPolicy::Brutal;
    spec
}

#[test]
fn test_one_for_one_restarts_until_intensity_exceeded() {
    let engine = Engine::new(VmConfig::small());
    let sup = engine
        .start_supervisor(Strategy::OneForOne, 3, Duration::from_secs(5))
        .unwrap();
    let first = engine.start_child(sup, crashing_spec("w1")).unwrap();
    engine.run();

    // Three restarts within the window, then the child stays down and
    // the supervisor survives.
    assert_eq!(engine.shared().supervisors.child_addr(sup, "w1"), None);
    assert!(engine.shared().is_alive(sup));
    // Initial run + three restarts = four crashed incarnations.
    assert_eq!(engine.shared().crash_store.len(), 4);
    assert!(!engine.shared().is_alive(first));
}

#[test]
fn test_supervisor_survives_because_it_traps() {
    let engine = Engine::new(VmConfig::small());
    let sup = engine
        .start_supervisor(Strategy::OneForOne, 3, Duration::from_secs(5))
        .unwrap();
    engine.start_child(sup, waiting_spec("w1")).unwrap();
    let child = engine.shared().supervisors.child_addr(sup, "w1").unwrap();

    // Kill the child from outside; the link signal reaches the
    // supervisor as a trapped message, not a death.
    engine.kill(child);
    engine.run();

    assert!(engine.shared().is_alive(sup));
    // The permanent child was restarted.
    let replacement = engine.shared().supervisors.child_addr(sup, "w1");
    assert!(replacement.is_some());
    assert_ne!(replacement, Some(child));
}

#[test]
fn test_one_for_all_restarts_every_child() {
    let engine = Engine::new(VmConfig::small());
    let sup = engine
        .start_supervisor(Strategy::OneForAll, 5, Duration::from_secs(5))
        .unwrap();
    engine.start_child(sup, waiting_spec("stable")).unwrap();
    engine.start_child(sup, waiting_spec("shaky")).unwrap();
    let stable = engine.shared().supervisors.child_addr(sup, "stable").unwrap();
    let shaky = engine.shared().supervisors.child_addr(sup, "shaky").unwrap();

    engine.kill(shaky);
    engine.run();

    let new_stable = engine.shared().supervisors.child_addr(sup, "stable").unwrap();
    let new_shaky = engine.shared().supervisors.child_addr(sup, "shaky").unwrap();
    assert_ne!(new_stable, stable);
    assert_ne!(new_shaky, shaky);
}

#[test]
fn test_temporary_child_stays_down() {
    let engine = Engine::new(VmConfig::small());
    let sup = engine
        .start_supervisor(Strategy::OneForOne, 3, Duration::from_secs(5))
        .unwrap();
    let mut spec = crashing_spec("tmp");
    spec.restart = reeve_core::RestartPolicy::Temporary;
    engine.start_child(sup, spec).unwrap();
    engine.run();

    assert_eq!(engine.shared().supervisors.child_addr(sup, "tmp"), None);
    assert_eq!(engine.shared().crash_store.len(), 1);
}

#[test]
fn test_start_child_opcode() {
    let engine = Engine::new(VmConfig::small());
    let sup = engine
        .start_supervisor(Strategy::OneForOne, 3, Duration::from_secs(5))
        .unwrap();

    let child_code = Value::Instructions(Arc::new(vec![
        op(Opcode::Receive),
        op(Opcode::Halt),
    ]));
    let spec_map = Value::map([
        ("id", Value::str("dyn")),
        ("instructions", child_code),
        ("restart", Value::symbol("permanent")),
        ("shutdown", Value::symbol("brutal")),
    ]);

    let starter = engine
        .spawn(&Program::new(vec![
            with(Opcode::PushCustom, spec_map),
            with(Opcode::PushUint, Value::Uint(sup)),
            op(Opcode::StartChild),
            with(Opcode::PushUint, Value::Uint(sup)),
            op(Opcode::CountChildren),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();

    let stack = engine.data_stack(starter).unwrap();
    let child = stack[0].as_address().expect("child address");
    assert_eq!(
        engine.shared().supervisors.child_addr(sup, "dyn"),
        Some(child)
    );
    let Value::Map(counts) = &stack[1] else {
        panic!("expected a count map");
    };
    assert_eq!(counts["specs"], Value::Uint(1));
    assert_eq!(counts["active"], Value::Uint(1));
}

#[test]
fn test_stop_and_list_children_opcodes() {
    let engine = Engine::new(VmConfig::small());
    let sup = engine
        .start_supervisor(Strategy::OneForOne, 3, Duration::from_secs(5))
        .unwrap();
    engine.start_child(sup, waiting_spec("w1")).unwrap();

    let admin = engine
        .spawn(&Program::new(vec![
            with(Opcode::PushString, Value::str("w1")),
            with(Opcode::PushUint, Value::Uint(sup)),
            op(Opcode::StopChild),
            with(Opcode::PushUint, Value::Uint(sup)),
            op(Opcode::ListChildren),
            op(Opcode::Halt),
        ]))
        .unwrap();
    engine.run();

    let stack = engine.data_stack(admin).unwrap();
    assert_eq!(stack[0], Value::Bool(true));
    let Value::Array(children) = &stack[1] else {
        panic!("expected a children array");
    };
    assert_eq!(children.len(), 1);
    let Value::Map(entry) = &children[0] else {
        panic!("expected a child map");
    };
    assert_eq!(entry["id"], Value::str("w1"));
    assert_eq!(entry["pid"], Value::Null);
}

#[test]
fn test_stopped_child_exits_with_kill_under_brutal() {
    let engine = Engine::new(VmConfig::small());
    let sup = engine
        .start_supervisor(Strategy::OneForOne, 3, Duration::from_secs(5))
        .unwrap();
    engine.start_child(sup, waiting_spec("w1")).unwrap();
    let child = engine.shared().supervisors.child_addr(sup, "w1").unwrap();

    assert!(engine.stop_child(sup, "w1"));
    assert_eq!(engine.exit_reason(child), Some(ExitReason::Kill));
}

#[test]
fn test_restart_child_replaces_running_child() {
    let engine = Engine::new(VmConfig::small());
    let sup = engine
        .start_supervisor(Strategy::OneForOne, 3, Duration::from_secs(5))
        .unwrap();
    engine.start_child(sup, waiting_spec("w1")).unwrap();
    let child = engine.shared().supervisors.child_addr(sup, "w1").unwrap();

    let replacement = engine.restart_child(sup, "w1").expect("restarted");
    assert_ne!(replacement, child);
    assert!(engine.shared().is_alive(replacement));
    assert!(!engine.shared().is_alive(child));
}
