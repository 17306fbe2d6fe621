//! Suspension lowering
//!
//! Rewrites function bodies containing suspension calls into flat,
//! resumable state machines. The pipeline is:
//!
//! 1. classify: mark every node whose evaluation may cross a suspension
//!    point ([`classify`])
//! 2. decompose: flatten suspendable expressions so suspension calls sit in
//!    statement position with pure operands ([`decompose`])
//! 3. build: split the body into dispatchable states ([`builder`])
//! 4. resolve: assign dense state ids and check the graph ([`resolve`])
//! 5. promote: move locals that are live across states into persistent
//!    slots ([`promote`])
//!
//! A body with no suspension points skips decomposition entirely and lowers
//! to a two-state graph: its own code and the trap state.
//!
//! [`machine`] holds a reference executor for the resulting graphs.

pub mod builder;
pub mod classify;
pub mod decompose;
pub mod error;
pub mod graph;
pub mod machine;
pub mod promote;
pub mod resolve;

pub use error::{LowerError, LowerResult};
pub use graph::{State, StateGraph};
pub use machine::{eval_direct, Host, HostOutcome, Machine, Resumption};

use builder::MachineBuilder;
use classify::collect_suspendable;
use vesper_ir::{Node, NodeFactory, NodeKind};

/// Lower one function body to a resolved state graph. `fac` must be the
/// factory that built the body; the lowering keeps allocating nodes and
/// variables from it.
pub fn lower_function(body: Node, fac: &mut NodeFactory) -> LowerResult<StateGraph> {
    reject_synthetic(&body)?;
    let susp = collect_suspendable(&body);
    let body = if susp.is_empty() {
        body
    } else {
        decompose::decompose(body, fac, &susp)
    };
    // decomposition allocates fresh nodes, so the marks are re-derived
    let susp = collect_suspendable(&body);
    let machine = MachineBuilder::new(fac, &susp).build(body)?;
    let graph = resolve::resolve(machine, fac.var_count())?;
    Ok(promote::promote(graph, fac))
}

/// Input bodies come from the front end and must not contain the synthetic
/// kinds the lowering introduces.
fn reject_synthetic(node: &Node) -> LowerResult<()> {
    if matches!(
        node.kind,
        NodeKind::DispatchPoint(_)
            | NodeKind::SetState { .. }
            | NodeKind::SetExceptionState { .. }
            | NodeKind::Dispatch
            | NodeKind::Suspend
            | NodeKind::GetPendingException
            | NodeKind::GetSlot(_)
            | NodeKind::SetSlot { .. }
    ) {
        return Err(LowerError::SyntheticInSource { node: node.id });
    }
    match &node.kind {
        NodeKind::SetVar { value, .. }
        | NodeKind::Return { value }
        | NodeKind::Throw { value }
        | NodeKind::TypeTest { value, .. } => reject_synthetic(value),
        NodeKind::VarDecl {
            init: Some(init), ..
        } => reject_synthetic(init),
        NodeKind::Call { args, .. } => {
            for arg in args {
                reject_synthetic(arg)?;
            }
            Ok(())
        }
        NodeKind::Unary { operand, .. } => reject_synthetic(operand),
        NodeKind::Binary { lhs, rhs, .. } => {
            reject_synthetic(lhs)?;
            reject_synthetic(rhs)
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            reject_synthetic(cond)?;
            reject_synthetic(then_branch)?;
            match else_branch {
                Some(else_branch) => reject_synthetic(else_branch),
                None => Ok(()),
            }
        }
        NodeKind::Block(stmts) | NodeKind::Composite(stmts) => {
            for stmt in stmts {
                reject_synthetic(stmt)?;
            }
            Ok(())
        }
        NodeKind::While { cond, body } => {
            reject_synthetic(cond)?;
            reject_synthetic(body)
        }
        NodeKind::DoWhile { body, cond } => {
            reject_synthetic(body)?;
            reject_synthetic(cond)
        }
        NodeKind::Try {
            body,
            catches,
            finally,
        } => {
            reject_synthetic(body)?;
            for catch in catches {
                reject_synthetic(&catch.body)?;
            }
            match finally {
                Some(finally) => reject_synthetic(finally),
                None => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_ir::Ty;

    #[test]
    fn test_quiet_body_lowers_to_two_states() {
        let mut fac = NodeFactory::new();
        let call = fac.call("f", vec![], Ty::Unit);
        let body = fac.block(Ty::Unit, vec![call]);
        let graph = lower_function(body, &mut fac).unwrap();
        assert_eq!(graph.state_count(), 2);
        assert_eq!(graph.entry, 0);
    }

    #[test]
    fn test_synthetic_input_is_rejected() {
        let mut fac = NodeFactory::new();
        let d = fac.dispatch();
        let body = fac.block(Ty::Unit, vec![d]);
        let result = lower_function(body, &mut fac);
        assert!(matches!(
            result,
            Err(LowerError::SyntheticInSource { .. })
        ));
    }

    #[test]
    fn test_suspension_in_expression_lowers() {
        let mut fac = NodeFactory::new();
        let call = fac.suspend_call("await_value", vec![], Ty::Int);
        let one = fac.int(1);
        let sum = fac.binary(vesper_ir::BinaryOp::Add, call, one);
        let ret = fac.ret(sum);
        let body = fac.block(Ty::Unit, vec![ret]);
        let graph = lower_function(body, &mut fac).unwrap();
        assert!(graph.state_count() >= 3);
        assert!(graph.resume_slot.is_some());
    }
}
