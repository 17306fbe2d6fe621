//! Live-local promotion
//!
//! Locals only read and written inside a single state can stay plain
//! variables; anything touched by two or more states must survive while the
//! machine is parked, so it is moved into a numbered slot. The resume
//! variable is always promoted: its write (the suspension state) and its
//! read (the continuation) are in different states by construction, and the
//! executor needs a stable slot to deliver the resume value into.

use crate::graph::StateGraph;
use rustc_hash::FxHashMap;
use vesper_ir::{Node, NodeFactory, NodeKind, SlotId, VarId};

pub fn promote(mut graph: StateGraph, fac: &mut NodeFactory) -> StateGraph {
    let mut seen_in: FxHashMap<VarId, rustc_hash::FxHashSet<usize>> = FxHashMap::default();
    for (index, state) in graph.states.iter().enumerate() {
        for node in &state.body {
            record_vars(node, index, &mut seen_in);
        }
    }

    let mut promoted: Vec<VarId> = seen_in
        .iter()
        .filter(|(var, states)| states.len() >= 2 || **var == graph.resume_var)
        .map(|(var, _)| *var)
        .collect();
    if !promoted.contains(&graph.resume_var) {
        promoted.push(graph.resume_var);
    }
    promoted.sort();

    let slots: FxHashMap<VarId, SlotId> = promoted
        .iter()
        .enumerate()
        .map(|(index, var)| (*var, SlotId::new(index as u32)))
        .collect();

    for state in &mut graph.states {
        for node in &mut state.body {
            rewrite_vars(node, &slots, fac);
        }
    }

    graph.resume_slot = slots.get(&graph.resume_var).copied();
    graph.slot_count = promoted.len();
    graph
}

fn record_vars(node: &Node, state: usize, seen: &mut FxHashMap<VarId, rustc_hash::FxHashSet<usize>>) {
    match &node.kind {
        NodeKind::GetVar(var) => {
            seen.entry(*var).or_default().insert(state);
        }
        NodeKind::SetVar { var, value } => {
            seen.entry(*var).or_default().insert(state);
            record_vars(value, state, seen);
        }
        NodeKind::VarDecl { var, init, .. } => {
            seen.entry(*var).or_default().insert(state);
            if let Some(init) = init {
                record_vars(init, state, seen);
            }
        }
        NodeKind::Call { args, .. } => {
            for arg in args {
                record_vars(arg, state, seen);
            }
        }
        NodeKind::Unary { operand, .. } => record_vars(operand, state, seen),
        NodeKind::Binary { lhs, rhs, .. } => {
            record_vars(lhs, state, seen);
            record_vars(rhs, state, seen);
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            record_vars(cond, state, seen);
            record_vars(then_branch, state, seen);
            if let Some(else_branch) = else_branch {
                record_vars(else_branch, state, seen);
            }
        }
        NodeKind::Block(stmts) | NodeKind::Composite(stmts) => {
            for stmt in stmts {
                record_vars(stmt, state, seen);
            }
        }
        NodeKind::While { cond, body } => {
            record_vars(cond, state, seen);
            record_vars(body, state, seen);
        }
        NodeKind::DoWhile { body, cond } => {
            record_vars(body, state, seen);
            record_vars(cond, state, seen);
        }
        NodeKind::Return { value }
        | NodeKind::Throw { value }
        | NodeKind::TypeTest { value, .. }
        | NodeKind::SetSlot { value, .. } => record_vars(value, state, seen),
        NodeKind::Try {
            body,
            catches,
            finally,
        } => {
            record_vars(body, state, seen);
            for catch in catches {
                seen.entry(catch.var).or_default().insert(state);
                record_vars(&catch.body, state, seen);
            }
            if let Some(finally) = finally {
                record_vars(finally, state, seen);
            }
        }
        NodeKind::SetState { target } | NodeKind::SetExceptionState { target } => {
            record_vars(target, state, seen)
        }
        _ => {}
    }
}

fn rewrite_vars(node: &mut Node, slots: &FxHashMap<VarId, SlotId>, fac: &mut NodeFactory) {
    // children first so a rewritten parent does not hide them
    match &mut node.kind {
        NodeKind::SetVar { value, .. }
        | NodeKind::Return { value }
        | NodeKind::Throw { value }
        | NodeKind::TypeTest { value, .. }
        | NodeKind::SetSlot { value, .. } => rewrite_vars(value, slots, fac),
        NodeKind::VarDecl {
            init: Some(init), ..
        } => rewrite_vars(init, slots, fac),
        NodeKind::Call { args, .. } => {
            for arg in args {
                rewrite_vars(arg, slots, fac);
            }
        }
        NodeKind::Unary { operand, .. } => rewrite_vars(operand, slots, fac),
        NodeKind::Binary { lhs, rhs, .. } => {
            rewrite_vars(lhs, slots, fac);
            rewrite_vars(rhs, slots, fac);
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            rewrite_vars(cond, slots, fac);
            rewrite_vars(then_branch, slots, fac);
            if let Some(else_branch) = else_branch {
                rewrite_vars(else_branch, slots, fac);
            }
        }
        NodeKind::Block(stmts) | NodeKind::Composite(stmts) => {
            for stmt in stmts {
                rewrite_vars(stmt, slots, fac);
            }
        }
        NodeKind::While { cond, body } => {
            rewrite_vars(cond, slots, fac);
            rewrite_vars(body, slots, fac);
        }
        NodeKind::DoWhile { body, cond } => {
            rewrite_vars(body, slots, fac);
            rewrite_vars(cond, slots, fac);
        }
        NodeKind::Try {
            body,
            catches,
            finally,
        } => {
            rewrite_vars(body, slots, fac);
            for catch in catches {
                rewrite_vars(&mut catch.body, slots, fac);
            }
            if let Some(finally) = finally {
                rewrite_vars(finally, slots, fac);
            }
        }
        NodeKind::SetState { target } | NodeKind::SetExceptionState { target } => {
            rewrite_vars(target, slots, fac)
        }
        _ => {}
    }
    let replacement = match &mut node.kind {
        NodeKind::GetVar(var) => slots.get(var).map(|slot| NodeKind::GetSlot(*slot)),
        NodeKind::SetVar { var, value } => slots.get(var).map(|slot| NodeKind::SetSlot {
            slot: *slot,
            value: std::mem::replace(value, Box::new(fac.unit())),
        }),
        NodeKind::VarDecl { var, init, .. } => slots.get(var).map(|slot| {
            let value = match init.take() {
                Some(init) => init,
                None => Box::new(fac.unit()),
            };
            NodeKind::SetSlot { slot: *slot, value }
        }),
        // a promoted catch binding is declared via VarDecl in the catch
        // state, handled above
        _ => None,
    };
    if let Some(kind) = replacement {
        node.kind = kind;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MachineBuilder;
    use crate::classify::collect_suspendable;
    use crate::resolve::resolve;
    use vesper_ir::Ty;

    fn lower(body: Node, fac: &mut NodeFactory) -> StateGraph {
        let susp = collect_suspendable(&body);
        let machine = MachineBuilder::new(fac, &susp).build(body).unwrap();
        let graph = resolve(machine, fac.var_count()).unwrap();
        promote(graph, fac)
    }

    #[test]
    fn test_resume_var_is_always_promoted() {
        let mut fac = NodeFactory::new();
        let pause = fac.suspend_call("pause", vec![], Ty::Unit);
        let body = fac.block(Ty::Unit, vec![pause]);
        let graph = lower(body, &mut fac);
        assert!(graph.resume_slot.is_some());
        assert!(graph.slot_count >= 1);
    }

    #[test]
    fn test_single_state_locals_stay_plain() {
        let mut fac = NodeFactory::new();
        // a local used entirely before the suspension stays a variable
        let x = fac.fresh_var("x", Ty::Int);
        let one = fac.int(1);
        let decl = fac.var_decl(x, Some(one));
        let get = fac.get_var(x);
        let use_x = fac.call("use", vec![get], Ty::Unit);
        let pause = fac.suspend_call("pause", vec![], Ty::Unit);
        let body = fac.block(Ty::Unit, vec![decl, use_x, pause]);
        let graph = lower(body, &mut fac);
        let mut saw_plain_decl = false;
        for state in &graph.states {
            for node in &state.body {
                if matches!(node.kind, NodeKind::VarDecl { var, .. } if var == x) {
                    saw_plain_decl = true;
                }
            }
        }
        assert!(saw_plain_decl);
    }

    #[test]
    fn test_cross_state_local_moves_into_a_slot() {
        let mut fac = NodeFactory::new();
        // x is written before the suspension and read after it
        let x = fac.fresh_var("x", Ty::Int);
        let one = fac.int(1);
        let decl = fac.var_decl(x, Some(one));
        let pause = fac.suspend_call("pause", vec![], Ty::Unit);
        let get = fac.get_var(x);
        let ret = fac.ret(get);
        let body = fac.block(Ty::Unit, vec![decl, pause, ret]);
        let graph = lower(body, &mut fac);
        let mut slot_reads = 0;
        for state in &graph.states {
            for node in &state.body {
                count_slot_reads(node, &mut slot_reads);
            }
        }
        assert!(slot_reads >= 1);

        fn count_slot_reads(node: &Node, count: &mut usize) {
            if matches!(node.kind, NodeKind::GetSlot(_)) {
                *count += 1;
            }
            match &node.kind {
                NodeKind::SetVar { value, .. }
                | NodeKind::Return { value }
                | NodeKind::Throw { value }
                | NodeKind::SetSlot { value, .. } => count_slot_reads(value, count),
                NodeKind::VarDecl {
                    init: Some(init), ..
                } => count_slot_reads(init, count),
                NodeKind::If {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    count_slot_reads(cond, count);
                    count_slot_reads(then_branch, count);
                    if let Some(e) = else_branch {
                        count_slot_reads(e, count);
                    }
                }
                NodeKind::Block(stmts) | NodeKind::Composite(stmts) => {
                    for s in stmts {
                        count_slot_reads(s, count);
                    }
                }
                NodeKind::Binary { lhs, rhs, .. } => {
                    count_slot_reads(lhs, count);
                    count_slot_reads(rhs, count);
                }
                NodeKind::SetState { target } | NodeKind::SetExceptionState { target } => {
                    count_slot_reads(target, count)
                }
                _ => {}
            }
        }
    }
}
