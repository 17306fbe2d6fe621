//! State machine construction
//!
//! Walks a decomposed body and rebuilds it as a flat arena of states.
//! Non-suspendable statements are appended verbatim; suspendable control flow
//! is split into states connected by `SetState`/`Dispatch` pairs. Each
//! suspension call becomes the fixed protocol: save the continuation state,
//! make the call, park the machine when the call reports the suspended
//! sentinel, otherwise fall straight through to the continuation.
//!
//! `try` bodies are protected by the exception-state selector; `finally`
//! blocks are built once and entered with a completion-target variable that
//! tells the shared block where to dispatch when it is done, whether the
//! region completed normally, via a caught throw, or via a jump that has to
//! tunnel through it.

use crate::classify::SuspendableSet;
use crate::error::{LowerError, LowerResult};
use rustc_hash::FxHashMap;
use vesper_ir::{CatchClause, Node, NodeFactory, NodeId, NodeKind, StateRef, Ty, VarId};

/// The builder's output: state bodies with symbolic dispatch targets, ready
/// for the dispatch resolver.
#[derive(Debug)]
pub struct BuiltMachine {
    pub states: Vec<Vec<Node>>,
    pub trap: StateRef,
    pub resume_var: VarId,
}

struct StateBuf {
    body: Vec<Node>,
    closed: bool,
}

#[derive(Debug, Clone, Copy)]
struct LoopBounds {
    break_target: StateRef,
    continue_target: StateRef,
    /// Active finally frames when the loop was entered; a jump to this loop
    /// runs every frame pushed after this depth.
    finally_depth: usize,
    /// Exception handler in force at the loop, restored by jumps that leave
    /// inner regions.
    handler: StateRef,
}

#[derive(Debug, Clone, Copy)]
struct FinallyFrame {
    completion_var: VarId,
    body_state: StateRef,
}

struct FinallyPieces {
    body_state: StateRef,
    on_throw: StateRef,
    rethrow: StateRef,
    completion_var: VarId,
    saved_ex: VarId,
}

enum Receiver {
    None,
    Decl(VarId),
    Assign(VarId),
}

pub struct MachineBuilder<'a> {
    fac: &'a mut NodeFactory,
    susp: &'a SuspendableSet,
    states: Vec<StateBuf>,
    current: usize,
    trap: StateRef,
    result_var: VarId,
    pending_result: Option<VarId>,
    return_exit: Option<StateRef>,
    loops: FxHashMap<NodeId, LoopBounds>,
    handlers: Vec<StateRef>,
    frames: Vec<FinallyFrame>,
}

impl<'a> MachineBuilder<'a> {
    pub fn new(fac: &'a mut NodeFactory, susp: &'a SuspendableSet) -> Self {
        let result_var = fac.fresh_var("suspend_result", Ty::Any);
        let mut builder = Self {
            fac,
            susp,
            states: Vec::new(),
            current: 0,
            trap: StateRef::new(0),
            result_var,
            pending_result: None,
            return_exit: None,
            loops: FxHashMap::default(),
            handlers: Vec::new(),
            frames: Vec::new(),
        };
        let entry = builder.alloc_state();
        builder.trap = builder.alloc_state();
        {
            let pend = builder.fac.get_pending_exception();
            let rethrow = builder.fac.throw(pend);
            let trap_idx = builder.trap.as_u32() as usize;
            builder.states[trap_idx].body.push(rethrow);
            builder.states[trap_idx].closed = true;
        }
        builder.enter(entry);
        let dp = builder.fac.dispatch_point(builder.trap);
        let protect = builder.fac.set_exception_state(dp);
        builder.emit(protect);
        builder
    }

    pub fn build(mut self, body: Node) -> LowerResult<BuiltMachine> {
        self.visit(body)?;
        if !self.states[self.current].closed {
            let ret = self.fac.ret_unit();
            self.emit(ret);
        }
        Ok(BuiltMachine {
            states: self.states.into_iter().map(|s| s.body).collect(),
            trap: self.trap,
            resume_var: self.result_var,
        })
    }

    // ===== Arena plumbing =====

    fn alloc_state(&mut self) -> StateRef {
        let id = StateRef::new(self.states.len() as u32);
        self.states.push(StateBuf {
            body: Vec::new(),
            closed: false,
        });
        id
    }

    fn enter(&mut self, state: StateRef) {
        self.current = state.as_u32() as usize;
    }

    /// Append to the current state; terminators close it and anything
    /// emitted after a terminator is unreachable and dropped.
    fn emit(&mut self, node: Node) {
        let buf = &mut self.states[self.current];
        if buf.closed {
            return;
        }
        let terminator = closes_state(&node);
        buf.body.push(node);
        if terminator {
            buf.closed = true;
        }
    }

    /// End the current state with a transfer to `target`.
    fn goto(&mut self, target: StateRef) {
        if self.states[self.current].closed {
            return;
        }
        let dp = self.fac.dispatch_point(target);
        let set = self.fac.set_state(dp);
        self.emit(set);
        let d = self.fac.dispatch();
        self.emit(d);
    }

    /// `{ state = target }`, for use as a branch of a dispatching `if`.
    fn jump_block(&mut self, target: StateRef) -> Node {
        let dp = self.fac.dispatch_point(target);
        let set = self.fac.set_state(dp);
        self.fac.block(Ty::Unit, vec![set])
    }

    fn current_handler(&self) -> StateRef {
        self.handlers.last().copied().unwrap_or(self.trap)
    }

    // ===== Statement dispatch =====

    fn visit(&mut self, node: Node) -> LowerResult<()> {
        if !self.susp.contains(&node) {
            self.emit(node);
            return Ok(());
        }
        let Node { id, ty, kind } = node;
        match kind {
            NodeKind::Block(stmts) | NodeKind::Composite(stmts) => {
                for stmt in stmts {
                    self.visit(stmt)?;
                }
                Ok(())
            }
            NodeKind::VarDecl {
                var,
                var_ty,
                init: Some(init),
            } => {
                if matches!(
                    init.kind,
                    NodeKind::Call {
                        suspending: true,
                        ..
                    }
                ) {
                    self.visit_suspension(*init, Receiver::Decl(var));
                    Ok(())
                } else {
                    self.emit(Node {
                        id,
                        ty,
                        kind: NodeKind::VarDecl {
                            var,
                            var_ty,
                            init: Some(init),
                        },
                    });
                    Ok(())
                }
            }
            NodeKind::SetVar { var, value } => {
                if matches!(
                    value.kind,
                    NodeKind::Call {
                        suspending: true,
                        ..
                    }
                ) {
                    self.visit_suspension(*value, Receiver::Assign(var));
                    Ok(())
                } else {
                    self.emit(Node {
                        id,
                        ty,
                        kind: NodeKind::SetVar { var, value },
                    });
                    Ok(())
                }
            }
            kind @ NodeKind::Call {
                suspending: true, ..
            } => {
                self.visit_suspension(Node { id, ty, kind }, Receiver::None);
                Ok(())
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => self.visit_if(*cond, *then_branch, else_branch.map(|e| *e)),
            NodeKind::While { cond, body } => self.visit_while(id, *cond, *body),
            NodeKind::DoWhile { body, cond } => self.visit_do_while(id, *body, *cond),
            NodeKind::Break { loop_id } => self.visit_jump(loop_id, true),
            NodeKind::Continue { loop_id } => self.visit_jump(loop_id, false),
            NodeKind::Return { value } => {
                self.visit_return(*value);
                Ok(())
            }
            // A throw marked by the finally-region pass still lowers to a
            // plain throw; the exception-state selector routes it through the
            // region machinery at run time.
            NodeKind::Throw { value } => {
                self.emit(Node {
                    id,
                    ty,
                    kind: NodeKind::Throw { value },
                });
                Ok(())
            }
            NodeKind::Try {
                body,
                catches,
                finally,
            } => self.visit_try(*body, catches, finally.map(|f| *f)),
            // Decomposition leaves nothing else suspendable in statement
            // position.
            kind => Err(LowerError::Internal {
                message: format!("suspendable {:?} survived decomposition at {}", kind, id),
            }),
        }
    }

    // ===== Suspension protocol =====

    fn visit_suspension(&mut self, call: Node, receiver: Receiver) {
        let cont = self.alloc_state();
        let dp = self.fac.dispatch_point(cont);
        let save = self.fac.set_state(dp);
        self.emit(save);
        let store = self.fac.set_var(self.result_var, call);
        self.emit(store);
        let observed = self.fac.get_var(self.result_var);
        let sentinel = self.fac.suspended_sentinel();
        let parked = self.fac.eq(observed, sentinel);
        let suspend = self.fac.suspend();
        let park = self.fac.block(Ty::Unit, vec![suspend]);
        let guard = self.fac.if_stmt(parked, park);
        self.emit(guard);
        let d = self.fac.dispatch();
        self.emit(d);
        self.enter(cont);
        match receiver {
            Receiver::None => {}
            Receiver::Decl(var) => {
                let result = self.fac.get_var(self.result_var);
                let decl = self.fac.var_decl(var, Some(result));
                self.emit(decl);
            }
            Receiver::Assign(var) => {
                let result = self.fac.get_var(self.result_var);
                let set = self.fac.set_var(var, result);
                self.emit(set);
            }
        }
    }

    // ===== Branches =====

    fn visit_if(
        &mut self,
        cond: Node,
        then_branch: Node,
        else_branch: Option<Node>,
    ) -> LowerResult<()> {
        let exit = self.alloc_state();
        let then_state = self.alloc_state();
        let else_state = if else_branch.is_some() {
            Some(self.alloc_state())
        } else {
            None
        };
        let then_jump = self.jump_block(then_state);
        let else_jump = self.jump_block(else_state.unwrap_or(exit));
        let branch = self.fac.if_else(Ty::Unit, cond, then_jump, else_jump);
        self.emit(branch);
        let d = self.fac.dispatch();
        self.emit(d);

        self.enter(then_state);
        self.visit(then_branch)?;
        self.goto(exit);
        if let (Some(state), Some(body)) = (else_state, else_branch) {
            self.enter(state);
            self.visit(body)?;
            self.goto(exit);
        }
        self.enter(exit);
        Ok(())
    }

    // ===== Loops =====

    fn visit_while(&mut self, id: NodeId, cond: Node, body: Node) -> LowerResult<()> {
        let head = self.alloc_state();
        let body_state = self.alloc_state();
        let exit = self.alloc_state();
        self.goto(head);

        self.enter(head);
        let enter_jump = self.jump_block(body_state);
        let exit_jump = self.jump_block(exit);
        let test = self.fac.if_else(Ty::Unit, cond, enter_jump, exit_jump);
        self.emit(test);
        let d = self.fac.dispatch();
        self.emit(d);

        self.loops.insert(
            id,
            LoopBounds {
                break_target: exit,
                continue_target: head,
                finally_depth: self.frames.len(),
                handler: self.current_handler(),
            },
        );
        self.enter(body_state);
        self.visit(body)?;
        self.goto(head);
        self.enter(exit);
        Ok(())
    }

    fn visit_do_while(&mut self, id: NodeId, body: Node, cond: Node) -> LowerResult<()> {
        let body_state = self.alloc_state();
        let cond_state = self.alloc_state();
        let exit = self.alloc_state();
        self.goto(body_state);

        // continue re-checks the condition, it does not re-enter the body
        self.loops.insert(
            id,
            LoopBounds {
                break_target: exit,
                continue_target: cond_state,
                finally_depth: self.frames.len(),
                handler: self.current_handler(),
            },
        );
        self.enter(body_state);
        self.visit(body)?;
        self.goto(cond_state);

        self.enter(cond_state);
        let again = self.jump_block(body_state);
        let leave = self.jump_block(exit);
        let test = self.fac.if_else(Ty::Unit, cond, again, leave);
        self.emit(test);
        let d = self.fac.dispatch();
        self.emit(d);
        self.enter(exit);
        Ok(())
    }

    // ===== Jumps, returns, and finally tunneling =====

    fn visit_jump(&mut self, loop_id: NodeId, is_break: bool) -> LowerResult<()> {
        let bounds = self.loops.get(&loop_id).copied().ok_or(if is_break {
            LowerError::UnknownBreakTarget { loop_id }
        } else {
            LowerError::UnknownContinueTarget { loop_id }
        })?;
        let dest = if is_break {
            bounds.break_target
        } else {
            bounds.continue_target
        };
        let frames: Vec<FinallyFrame> = self.frames[bounds.finally_depth..].to_vec();
        if frames.is_empty() {
            if self.current_handler() != bounds.handler {
                let dp = self.fac.dispatch_point(bounds.handler);
                let restore = self.fac.set_exception_state(dp);
                self.emit(restore);
            }
            self.goto(dest);
        } else {
            // the tunneled finallies leave the exception selector pointing at
            // their own region's outer handler; a hop state restores the
            // loop's handler before landing
            let hop = self.alloc_state();
            {
                let dp = self.fac.dispatch_point(bounds.handler);
                let restore = self.fac.set_exception_state(dp);
                let dest_dp = self.fac.dispatch_point(dest);
                let land = self.fac.set_state(dest_dp);
                let d = self.fac.dispatch();
                let hop_idx = hop.as_u32() as usize;
                self.states[hop_idx].body.push(restore);
                self.states[hop_idx].body.push(land);
                self.states[hop_idx].body.push(d);
                self.states[hop_idx].closed = true;
            }
            self.dispatch_through(&frames, hop);
        }
        Ok(())
    }

    fn visit_return(&mut self, value: Node) {
        if self.frames.is_empty() {
            let ret = self.fac.ret(value);
            self.emit(ret);
            return;
        }
        let pending = self.pending_result();
        let store = self.fac.set_var(pending, value);
        self.emit(store);
        let exit = self.return_exit();
        let frames = self.frames.clone();
        self.dispatch_through(&frames, exit);
    }

    /// Chain the given frames (outermost first) so execution runs them
    /// innermost first and lands on `dest`: each frame's completion target is
    /// set to the next hop, then control dispatches into the innermost
    /// finally body.
    fn dispatch_through(&mut self, frames: &[FinallyFrame], dest: StateRef) {
        let mut target = dest;
        for frame in frames {
            let dp = self.fac.dispatch_point(target);
            let set = self.fac.set_var(frame.completion_var, dp);
            self.emit(set);
            target = frame.body_state;
        }
        self.goto(target);
    }

    fn pending_result(&mut self) -> VarId {
        match self.pending_result {
            Some(var) => var,
            None => {
                let var = self.fac.fresh_var("pending_result", Ty::Any);
                self.pending_result = Some(var);
                var
            }
        }
    }

    /// The shared `return pending_result` state used when a return tunnels
    /// through finally blocks.
    fn return_exit(&mut self) -> StateRef {
        if let Some(state) = self.return_exit {
            return state;
        }
        let pending = self.pending_result();
        let state = self.alloc_state();
        let value = self.fac.get_var(pending);
        let ret = self.fac.ret(value);
        let idx = state.as_u32() as usize;
        self.states[idx].body.push(ret);
        self.states[idx].closed = true;
        self.return_exit = Some(state);
        state
    }

    // ===== Exception regions =====

    fn visit_try(
        &mut self,
        body: Node,
        catches: Vec<CatchClause>,
        finally: Option<Node>,
    ) -> LowerResult<()> {
        let outer = self.current_handler();
        let catch_state = self.alloc_state();
        let after = self.alloc_state();
        let fin = if finally.is_some() {
            Some(FinallyPieces {
                body_state: self.alloc_state(),
                on_throw: self.alloc_state(),
                rethrow: self.alloc_state(),
                completion_var: self.fac.fresh_var("completion", Ty::Int),
                saved_ex: self.fac.fresh_var("saved_ex", Ty::Any),
            })
        } else {
            None
        };

        // protected body
        let dp = self.fac.dispatch_point(catch_state);
        let protect = self.fac.set_exception_state(dp);
        self.emit(protect);
        self.handlers.push(catch_state);
        if let Some(f) = &fin {
            self.frames.push(FinallyFrame {
                completion_var: f.completion_var,
                body_state: f.body_state,
            });
        }
        self.visit(body)?;
        self.handlers.pop();
        self.leave_region(&fin, outer, after);

        // catch dispatch: match the pending exception against the clause
        // filters in order, fall through to a rethrow
        self.enter(catch_state);
        let catch_handler = fin.as_ref().map(|f| f.on_throw).unwrap_or(outer);
        let dp = self.fac.dispatch_point(catch_handler);
        let reprotect = self.fac.set_exception_state(dp);
        self.emit(reprotect);
        self.handlers.push(catch_handler);

        let mut clause_states = Vec::with_capacity(catches.len());
        for _ in &catches {
            clause_states.push(self.alloc_state());
        }
        let pend = self.fac.get_pending_exception();
        let rethrow = self.fac.throw(pend);
        let mut chain = self.fac.block(Ty::Unit, vec![rethrow]);
        for (clause, state) in catches.iter().zip(&clause_states).rev() {
            let pend = self.fac.get_pending_exception();
            let test = self.fac.type_test(pend, clause.filter);
            let enter = self.jump_block(*state);
            chain = self.fac.if_else(Ty::Unit, test, enter, chain);
        }
        self.emit(chain);
        let d = self.fac.dispatch();
        self.emit(d);

        for (clause, state) in catches.into_iter().zip(clause_states) {
            self.enter(state);
            let pend = self.fac.get_pending_exception();
            let bind = self.fac.var_decl(clause.var, Some(pend));
            self.emit(bind);
            self.visit(clause.body)?;
            self.leave_region(&fin, outer, after);
        }
        self.handlers.pop();

        // finally pieces: one shared body, entered with the completion
        // target already set
        if let Some(f) = fin {
            self.frames.pop();
            if let Some(fin_body) = finally {
                self.enter(f.body_state);
                let dp = self.fac.dispatch_point(outer);
                let unprotect = self.fac.set_exception_state(dp);
                self.emit(unprotect);
                self.visit(fin_body)?;
                let target = self.fac.get_var(f.completion_var);
                let set = self.fac.set_state(target);
                self.emit(set);
                let d = self.fac.dispatch();
                self.emit(d);
            }

            // exceptional entry: remember the exception, run the shared
            // body, then resume the unwind
            self.enter(f.on_throw);
            let pend = self.fac.get_pending_exception();
            let save = self.fac.set_var(f.saved_ex, pend);
            self.emit(save);
            let dp = self.fac.dispatch_point(f.rethrow);
            let set = self.fac.set_var(f.completion_var, dp);
            self.emit(set);
            self.goto(f.body_state);

            self.enter(f.rethrow);
            let saved = self.fac.get_var(f.saved_ex);
            let rethrow = self.fac.throw(saved);
            self.emit(rethrow);
        }

        self.enter(after);
        Ok(())
    }

    /// Normal completion of a try body or catch clause: route through the
    /// region's finally with `after` as the completion target, or restore the
    /// outer handler and continue directly.
    fn leave_region(&mut self, fin: &Option<FinallyPieces>, outer: StateRef, after: StateRef) {
        if self.states[self.current].closed {
            return;
        }
        match fin {
            Some(f) => {
                let dp = self.fac.dispatch_point(after);
                let set = self.fac.set_var(f.completion_var, dp);
                self.emit(set);
                self.goto(f.body_state);
            }
            None => {
                let dp = self.fac.dispatch_point(outer);
                let restore = self.fac.set_exception_state(dp);
                self.emit(restore);
                self.goto(after);
            }
        }
    }
}

/// Whether emitting this node ends the state. A verbatim block whose last
/// statement diverges closes the state just like a bare terminator.
fn closes_state(node: &Node) -> bool {
    match &node.kind {
        NodeKind::Dispatch
        | NodeKind::Suspend
        | NodeKind::Return { .. }
        | NodeKind::Throw { .. }
        | NodeKind::Unreachable => true,
        NodeKind::Block(stmts) | NodeKind::Composite(stmts) => {
            stmts.last().is_some_and(closes_state)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::collect_suspendable;

    fn build(body: Node, fac: &mut NodeFactory) -> BuiltMachine {
        let susp = collect_suspendable(&body);
        MachineBuilder::new(fac, &susp).build(body).unwrap()
    }

    #[test]
    fn test_quiet_body_stays_in_the_entry_state() {
        let mut fac = NodeFactory::new();
        let call = fac.call("f", vec![], Ty::Unit);
        let body = fac.block(Ty::Unit, vec![call]);
        let machine = build(body, &mut fac);
        // entry + trap only
        assert_eq!(machine.states.len(), 2);
        // entry: protect, verbatim body, implicit return
        let entry = &machine.states[0];
        assert!(matches!(
            entry.first().map(|n| &n.kind),
            Some(NodeKind::SetExceptionState { .. })
        ));
        assert!(matches!(
            entry.last().map(|n| &n.kind),
            Some(NodeKind::Return { .. })
        ));
    }

    #[test]
    fn test_suspension_splits_into_a_continuation_state() {
        let mut fac = NodeFactory::new();
        let x = fac.fresh_var("x", Ty::Int);
        let call = fac.suspend_call("await_value", vec![], Ty::Int);
        let decl = fac.var_decl(x, Some(call));
        let body = fac.block(Ty::Unit, vec![decl]);
        let machine = build(body, &mut fac);
        // entry, trap, continuation
        assert_eq!(machine.states.len(), 3);
        let entry = &machine.states[0];
        // ... SetState(cont), result = call, if parked suspend, dispatch
        assert!(matches!(
            entry.last().map(|n| &n.kind),
            Some(NodeKind::Dispatch)
        ));
        let has_suspend_guard = entry
            .iter()
            .any(|n| matches!(&n.kind, NodeKind::If { .. }));
        assert!(has_suspend_guard);
        let cont = &machine.states[2];
        assert!(matches!(
            cont.first().map(|n| &n.kind),
            Some(NodeKind::VarDecl { .. })
        ));
    }

    #[test]
    fn test_suspendable_loop_splits_head_body_and_exit() {
        let mut fac = NodeFactory::new();
        let cond_call = fac.call("more", vec![], Ty::Bool);
        let pause = fac.suspend_call("pause", vec![], Ty::Unit);
        let body = fac.block(Ty::Unit, vec![pause]);
        let lp = fac.while_loop(cond_call, body);
        let root = fac.block(Ty::Unit, vec![lp]);
        let machine = build(root, &mut fac);
        // entry, trap, head, body, exit, continuation
        assert_eq!(machine.states.len(), 6);
    }

    #[test]
    fn test_return_crossing_a_finally_routes_through_the_shared_exit() {
        let mut fac = NodeFactory::new();
        // try { pause(); return 1 } finally { cleanup() }
        let pause = fac.suspend_call("pause", vec![], Ty::Unit);
        let one = fac.int(1);
        let ret = fac.ret(one);
        let try_body = fac.block(Ty::Unit, vec![pause, ret]);
        let cleanup = fac.call("cleanup", vec![], Ty::Unit);
        let fin = fac.block(Ty::Unit, vec![cleanup]);
        let tr = fac.try_stmt(Ty::Unit, try_body, vec![], Some(fin));
        let root = fac.block(Ty::Unit, vec![tr]);
        let machine = build(root, &mut fac);
        // the return value rides in the pending-result variable; the machine
        // leaves through a shared state returning it
        let has_shared_exit = machine.states.iter().any(|body| {
            matches!(
                body.last().map(|n| &n.kind),
                Some(NodeKind::Return { value }) if matches!(value.kind, NodeKind::GetVar(_))
            )
        });
        assert!(has_shared_exit);
        // no state returns the literal directly, bypassing the finally
        let has_direct_return = machine.states.iter().any(|body| {
            body.iter().any(|n| {
                matches!(
                    &n.kind,
                    NodeKind::Return { value }
                        if matches!(value.kind, NodeKind::Literal(vesper_ir::Value::Int(_)))
                )
            })
        });
        assert!(!has_direct_return);
    }

    #[test]
    fn test_verbatim_tail_return_closes_its_state() {
        let mut fac = NodeFactory::new();
        // if (c()) { pause(); return 1 } else { return 2 }
        let c = fac.call("c", vec![], Ty::Bool);
        let pause = fac.suspend_call("pause", vec![], Ty::Unit);
        let one = fac.int(1);
        let ret1 = fac.ret(one);
        let then_b = fac.block(Ty::Unit, vec![pause, ret1]);
        let two = fac.int(2);
        let ret2 = fac.ret(two);
        let else_b = fac.block(Ty::Unit, vec![ret2]);
        let branch = fac.if_else(Ty::Unit, c, then_b, else_b);
        let root = fac.block(Ty::Unit, vec![branch]);
        let machine = build(root, &mut fac);
        // the quiet else branch is a verbatim block ending in a return; no
        // dead transfer may follow it
        for state in &machine.states {
            for (index, node) in state.iter().enumerate() {
                let returning_block = matches!(
                    &node.kind,
                    NodeKind::Block(stmts) if matches!(
                        stmts.last().map(|n| &n.kind),
                        Some(NodeKind::Return { .. })
                    )
                );
                if returning_block {
                    assert_eq!(index, state.len() - 1);
                }
            }
        }
    }

    #[test]
    fn test_try_with_finally_builds_shared_finally_state() {
        let mut fac = NodeFactory::new();
        let risky = fac.suspend_call("risky", vec![], Ty::Unit);
        let risky_stmt = fac.block(Ty::Unit, vec![risky]);
        let e = fac.fresh_var("e", Ty::Any);
        let handler_call = fac.call("log", vec![], Ty::Unit);
        let handler = fac.block(Ty::Unit, vec![handler_call]);
        let clause = fac.catch_clause(e, Ty::Any, handler);
        let fin_call = fac.call("cleanup", vec![], Ty::Unit);
        let fin = fac.block(Ty::Unit, vec![fin_call]);
        let tr = fac.try_stmt(Ty::Unit, risky_stmt, vec![clause], Some(fin));
        let root = fac.block(Ty::Unit, vec![tr]);
        let machine = build(root, &mut fac);
        // one state ends by dispatching on the completion variable
        let has_completion_dispatch = machine.states.iter().any(|body| {
            body.iter().any(|n| {
                matches!(
                    &n.kind,
                    NodeKind::SetState { target } if matches!(target.kind, NodeKind::GetVar(_))
                )
            })
        });
        assert!(has_completion_dispatch);
    }
}
