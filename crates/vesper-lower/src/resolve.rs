//! Dispatch resolution
//!
//! Assigns dense integer ids to the states the machine can actually reach,
//! in first-reference order from the entry state, and rewrites every
//! symbolic dispatch target to its id. States the builder allocated but
//! never wired in are dropped. Also the structural checkpoint: every kept
//! state must end in a terminator and every target must exist.

use crate::builder::BuiltMachine;
use crate::error::{LowerError, LowerResult};
use crate::graph::{State, StateGraph};
use rustc_hash::FxHashMap;
use vesper_ir::{DispatchTarget, Node, NodeKind, StateRef};

pub fn resolve(machine: BuiltMachine, var_count: usize) -> LowerResult<StateGraph> {
    let BuiltMachine {
        states,
        trap,
        resume_var,
    } = machine;

    let entry = StateRef::new(0);
    let mut ids: FxHashMap<StateRef, u32> = FxHashMap::default();
    let mut order: Vec<StateRef> = Vec::new();
    let mut queue: Vec<StateRef> = vec![entry];
    ids.insert(entry, 0);
    order.push(entry);

    let mut cursor = 0;
    while cursor < queue.len() {
        let state = queue[cursor];
        cursor += 1;
        let body = states
            .get(state.as_u32() as usize)
            .ok_or(LowerError::DanglingStateRef { state })?;
        let mut refs = Vec::new();
        for node in body {
            collect_targets(node, &mut refs);
        }
        for target in refs {
            if target.as_u32() as usize >= states.len() {
                return Err(LowerError::DanglingStateRef { state: target });
            }
            if !ids.contains_key(&target) {
                let id = order.len() as u32;
                ids.insert(target, id);
                order.push(target);
                queue.push(target);
            }
        }
    }

    let trap_id = *ids
        .get(&trap)
        .ok_or(LowerError::DanglingStateRef { state: trap })?;

    // move kept bodies into id order; untouched slots are the dropped states
    let mut slots: Vec<Option<Vec<Node>>> = states.into_iter().map(Some).collect();
    let mut resolved = Vec::with_capacity(order.len());
    for state in &order {
        let body = slots[state.as_u32() as usize]
            .take()
            .ok_or(LowerError::DanglingStateRef { state: *state })?;
        resolved.push(body);
    }

    for (index, body) in resolved.iter_mut().enumerate() {
        for node in body.iter_mut() {
            rewrite_targets(node, &ids)?;
        }
        let terminated = matches!(
            body.last().map(|n| &n.kind),
            Some(
                NodeKind::Dispatch
                    | NodeKind::Suspend
                    | NodeKind::Return { .. }
                    | NodeKind::Throw { .. }
                    | NodeKind::Unreachable
            )
        );
        if !terminated {
            return Err(LowerError::MissingTerminator { index });
        }
    }

    Ok(StateGraph {
        states: resolved.into_iter().map(|body| State { body }).collect(),
        entry: 0,
        trap: trap_id,
        resume_var,
        resume_slot: None,
        var_count,
        slot_count: 0,
    })
}

fn collect_targets(node: &Node, out: &mut Vec<StateRef>) {
    if let NodeKind::DispatchPoint(DispatchTarget::State(state)) = &node.kind {
        out.push(*state);
    }
    each_child(node, &mut |child| collect_targets(child, out));
}

fn rewrite_targets(node: &mut Node, ids: &FxHashMap<StateRef, u32>) -> LowerResult<()> {
    if let NodeKind::DispatchPoint(target) = &mut node.kind {
        if let DispatchTarget::State(state) = target {
            let id = ids
                .get(state)
                .copied()
                .ok_or(LowerError::UnresolvedDispatch { state: *state })?;
            *target = DispatchTarget::Resolved(id);
        }
        return Ok(());
    }
    let mut result = Ok(());
    each_child_mut(node, &mut |child| {
        if result.is_ok() {
            result = rewrite_targets(child, ids);
        }
    });
    result
}

fn each_child<'n>(node: &'n Node, f: &mut dyn FnMut(&'n Node)) {
    match &node.kind {
        NodeKind::SetVar { value, .. }
        | NodeKind::Return { value }
        | NodeKind::Throw { value }
        | NodeKind::TypeTest { value, .. }
        | NodeKind::SetSlot { value, .. } => f(value),
        NodeKind::VarDecl {
            init: Some(init), ..
        } => f(init),
        NodeKind::Call { args, .. } => args.iter().for_each(f),
        NodeKind::Unary { operand, .. } => f(operand),
        NodeKind::Binary { lhs, rhs, .. } => {
            f(lhs);
            f(rhs);
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            f(cond);
            f(then_branch);
            if let Some(else_branch) = else_branch {
                f(else_branch);
            }
        }
        NodeKind::Block(stmts) | NodeKind::Composite(stmts) => stmts.iter().for_each(f),
        NodeKind::While { cond, body } => {
            f(cond);
            f(body);
        }
        NodeKind::DoWhile { body, cond } => {
            f(body);
            f(cond);
        }
        NodeKind::Try {
            body,
            catches,
            finally,
        } => {
            f(body);
            for catch in catches {
                f(&catch.body);
            }
            if let Some(finally) = finally {
                f(finally);
            }
        }
        NodeKind::SetState { target } | NodeKind::SetExceptionState { target } => f(target),
        _ => {}
    }
}

fn each_child_mut(node: &mut Node, f: &mut dyn FnMut(&mut Node)) {
    match &mut node.kind {
        NodeKind::SetVar { value, .. }
        | NodeKind::Return { value }
        | NodeKind::Throw { value }
        | NodeKind::TypeTest { value, .. }
        | NodeKind::SetSlot { value, .. } => f(value),
        NodeKind::VarDecl {
            init: Some(init), ..
        } => f(init),
        NodeKind::Call { args, .. } => args.iter_mut().for_each(f),
        NodeKind::Unary { operand, .. } => f(operand),
        NodeKind::Binary { lhs, rhs, .. } => {
            f(lhs);
            f(rhs);
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            f(cond);
            f(then_branch);
            if let Some(else_branch) = else_branch {
                f(else_branch);
            }
        }
        NodeKind::Block(stmts) | NodeKind::Composite(stmts) => stmts.iter_mut().for_each(f),
        NodeKind::While { cond, body } => {
            f(cond);
            f(body);
        }
        NodeKind::DoWhile { body, cond } => {
            f(body);
            f(cond);
        }
        NodeKind::Try {
            body,
            catches,
            finally,
        } => {
            f(body);
            for catch in catches {
                f(&mut catch.body);
            }
            if let Some(finally) = finally {
                f(finally);
            }
        }
        NodeKind::SetState { target } | NodeKind::SetExceptionState { target } => f(target),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MachineBuilder;
    use crate::classify::collect_suspendable;
    use vesper_ir::{NodeFactory, Ty};

    fn lower(body: Node, fac: &mut NodeFactory) -> StateGraph {
        let susp = collect_suspendable(&body);
        let machine = MachineBuilder::new(fac, &susp).build(body).unwrap();
        resolve(machine, fac.var_count()).unwrap()
    }

    #[test]
    fn test_entry_is_zero_and_trap_is_referenced() {
        let mut fac = NodeFactory::new();
        let call = fac.call("f", vec![], Ty::Unit);
        let body = fac.block(Ty::Unit, vec![call]);
        let graph = lower(body, &mut fac);
        assert_eq!(graph.entry, 0);
        assert_eq!(graph.trap, 1);
        assert_eq!(graph.states.len(), 2);
    }

    #[test]
    fn test_all_targets_are_resolved() {
        let mut fac = NodeFactory::new();
        let pause = fac.suspend_call("pause", vec![], Ty::Unit);
        let body = fac.block(Ty::Unit, vec![pause]);
        let graph = lower(body, &mut fac);
        fn assert_resolved(node: &Node) {
            if let NodeKind::DispatchPoint(target) = &node.kind {
                assert!(matches!(target, DispatchTarget::Resolved(_)));
            }
            each_child(node, &mut assert_resolved);
        }
        for state in &graph.states {
            for node in &state.body {
                assert_resolved(node);
            }
        }
    }

    #[test]
    fn test_unwired_states_are_dropped() {
        let mut fac = NodeFactory::new();
        // both branches return, so the if's exit state is never referenced
        let cond_call = fac.call("c", vec![], Ty::Bool);
        let pause = fac.suspend_call("pause", vec![], Ty::Int);
        let one = fac.int(1);
        let then_ret = fac.ret(one);
        let then_b = fac.block(Ty::Unit, vec![pause, then_ret]);
        let two = fac.int(2);
        let else_ret = fac.ret(two);
        let else_b = fac.block(Ty::Unit, vec![else_ret]);
        let branch = fac.if_else(Ty::Unit, cond_call, then_b, else_b);
        let body = fac.block(Ty::Unit, vec![branch]);
        let susp = collect_suspendable(&body);
        let machine = MachineBuilder::new(&mut fac, &susp).build(body).unwrap();
        let allocated = machine.states.len();
        let graph = resolve(machine, fac.var_count()).unwrap();
        assert!(graph.states.len() < allocated);
    }
}
