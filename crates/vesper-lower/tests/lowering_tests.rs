//! End-to-end lowering tests: graphs built from whole bodies, executed on
//! the reference machine.

mod common;

use common::*;
use vesper_ir::{BinaryOp, NodeFactory, Ty, Value};
use vesper_lower::{Machine, Resumption};

// ============================================================================
// Collapse fast path
// ============================================================================

#[test]
fn test_non_suspending_body_collapses_to_body_plus_trap() {
    let mut fac = NodeFactory::new();
    let a = fac.call("a", vec![], Ty::Unit);
    let b = fac.call("b", vec![], Ty::Unit);
    let body = fac.block(Ty::Unit, vec![a, b]);
    let graph = lower(body, &mut fac);
    assert_eq!(graph.state_count(), 2);

    let mut host = ScriptedHost::new();
    let outcome = drive(&graph, &mut host, &[]);
    assert_eq!(outcome, Resumption::Done(Value::Unit));
    assert_eq!(host.log, vec!["a()", "b()"]);
}

#[test]
fn test_collapsed_body_keeps_original_nodes() {
    let mut fac = NodeFactory::new();
    let call = fac.call("f", vec![], Ty::Unit);
    let call_id = call.id;
    let body = fac.block(Ty::Unit, vec![call]);
    let graph = lower(body, &mut fac);
    let entry = &graph.states[graph.entry as usize];
    let found = entry
        .body
        .iter()
        .any(|node| node.id == call_id || contains_id(node, call_id));
    assert!(found);

    fn contains_id(node: &vesper_ir::Node, id: vesper_ir::NodeId) -> bool {
        if node.id == id {
            return true;
        }
        match &node.kind {
            vesper_ir::NodeKind::Block(stmts) => stmts.iter().any(|n| contains_id(n, id)),
            _ => false,
        }
    }
}

// ============================================================================
// Suspension basics
// ============================================================================

#[test]
fn test_single_suspension_delivers_resume_value() {
    let mut fac = NodeFactory::new();
    // x = await(); return x + 1
    let x = fac.fresh_var("x", Ty::Int);
    let call = fac.suspend_call("await_value", vec![], Ty::Int);
    let decl = fac.var_decl(x, Some(call));
    let get = fac.get_var(x);
    let one = fac.int(1);
    let sum = fac.binary(BinaryOp::Add, get, one);
    let ret = fac.ret(sum);
    let body = fac.block(Ty::Unit, vec![decl, ret]);
    let graph = lower(body, &mut fac);

    let mut host = ScriptedHost::new().suspending("await_value");
    let outcome = drive(&graph, &mut host, &[Value::Int(41)]);
    assert_eq!(outcome, Resumption::Done(Value::Int(42)));
}

#[test]
fn test_synchronous_completion_does_not_park() {
    let mut fac = NodeFactory::new();
    let x = fac.fresh_var("x", Ty::Int);
    let call = fac.suspend_call("await_value", vec![], Ty::Int);
    let decl = fac.var_decl(x, Some(call));
    let get = fac.get_var(x);
    let ret = fac.ret(get);
    let body = fac.block(Ty::Unit, vec![decl, ret]);
    let graph = lower(body, &mut fac);

    // the callee completes immediately; the machine must fall through to
    // the continuation without suspending
    let mut host = ScriptedHost::new().returning("await_value", Value::Int(5));
    let outcome = drive(&graph, &mut host, &[]);
    assert_eq!(outcome, Resumption::Done(Value::Int(5)));
}

#[test]
fn test_sequential_suspensions_accumulate() {
    let mut fac = NodeFactory::new();
    // x = first(); y = second(); return x + y
    let x = fac.fresh_var("x", Ty::Int);
    let first = fac.suspend_call("first", vec![], Ty::Int);
    let decl_x = fac.var_decl(x, Some(first));
    let y = fac.fresh_var("y", Ty::Int);
    let second = fac.suspend_call("second", vec![], Ty::Int);
    let decl_y = fac.var_decl(y, Some(second));
    let gx = fac.get_var(x);
    let gy = fac.get_var(y);
    let sum = fac.binary(BinaryOp::Add, gx, gy);
    let ret = fac.ret(sum);
    let body = fac.block(Ty::Unit, vec![decl_x, decl_y, ret]);
    let graph = lower(body, &mut fac);

    let mut host = ScriptedHost::new().suspending("first").suspending("second");
    let outcome = drive(&graph, &mut host, &[Value::Int(1), Value::Int(2)]);
    assert_eq!(outcome, Resumption::Done(Value::Int(3)));
    assert_eq!(host.log, vec!["first()", "second()"]);
}

// ============================================================================
// Branches
// ============================================================================

#[test]
fn test_suspension_in_taken_branch() {
    let mut fac = NodeFactory::new();
    // x = 0; if (pick()) { x = await() } else { x = 1 }; return x
    let x = fac.fresh_var("x", Ty::Int);
    let zero = fac.int(0);
    let decl = fac.var_decl(x, Some(zero));
    let pick = fac.call("pick", vec![], Ty::Bool);
    let call = fac.suspend_call("await_value", vec![], Ty::Int);
    let then_b = fac.set_var(x, call);
    let one = fac.int(1);
    let else_b = fac.set_var(x, one);
    let branch = fac.if_else(Ty::Unit, pick, then_b, else_b);
    let get = fac.get_var(x);
    let ret = fac.ret(get);
    let body = fac.block(Ty::Unit, vec![decl, branch, ret]);
    let graph = lower(body, &mut fac);

    let mut host = ScriptedHost::new()
        .returning("pick", Value::Bool(true))
        .suspending("await_value");
    let outcome = drive(&graph, &mut host, &[Value::Int(10)]);
    assert_eq!(outcome, Resumption::Done(Value::Int(10)));
}

#[test]
fn test_quiet_branch_skips_the_suspension() {
    let mut fac = NodeFactory::new();
    let x = fac.fresh_var("x", Ty::Int);
    let zero = fac.int(0);
    let decl = fac.var_decl(x, Some(zero));
    let pick = fac.call("pick", vec![], Ty::Bool);
    let call = fac.suspend_call("await_value", vec![], Ty::Int);
    let then_b = fac.set_var(x, call);
    let one = fac.int(1);
    let else_b = fac.set_var(x, one);
    let branch = fac.if_else(Ty::Unit, pick, then_b, else_b);
    let get = fac.get_var(x);
    let ret = fac.ret(get);
    let body = fac.block(Ty::Unit, vec![decl, branch, ret]);
    let graph = lower(body, &mut fac);

    let mut host = ScriptedHost::new().returning("pick", Value::Bool(false));
    let outcome = drive(&graph, &mut host, &[]);
    assert_eq!(outcome, Resumption::Done(Value::Int(1)));
    assert_eq!(host.count("await_value"), 0);
}

// ============================================================================
// Faults
// ============================================================================

#[test]
fn test_uncaught_throw_faults_the_machine() {
    let mut fac = NodeFactory::new();
    let pause = fac.suspend_call("pause", vec![], Ty::Unit);
    let msg = fac.str("bad");
    let throw = fac.throw(msg);
    let body = fac.block(Ty::Unit, vec![pause, throw]);
    let graph = lower(body, &mut fac);

    let mut host = ScriptedHost::new().suspending("pause");
    let outcome = drive(&graph, &mut host, &[Value::Unit]);
    assert_eq!(outcome, Resumption::Faulted(Value::Str("bad".into())));
}

#[test]
fn test_resume_with_exception_outside_any_region_faults() {
    let mut fac = NodeFactory::new();
    let pause = fac.suspend_call("pause", vec![], Ty::Unit);
    let body = fac.block(Ty::Unit, vec![pause]);
    let graph = lower(body, &mut fac);

    let mut host = ScriptedHost::new().suspending("pause");
    let mut machine = Machine::new(&graph);
    assert_eq!(machine.start(&mut host), Resumption::Suspended);
    let outcome = machine.resume_with_exception(Value::Str("lost".into()), &mut host);
    assert_eq!(outcome, Resumption::Faulted(Value::Str("lost".into())));
}
