//! Expression decomposition
//!
//! Flattens suspendable expressions so that every suspension call ends up in
//! statement position: as a bare statement, a variable initializer, or an
//! assignment source, always with effect-free operands. Rewritten
//! subexpressions become [`NodeKind::Composite`] sequences whose trailing
//! statement is the (pure) value; parents splice the sequence into their own
//! statement stream.
//!
//! Non-suspendable subtrees pass through untouched, which keeps the pass
//! idempotent and preserves node identities the classifier marked.

use crate::classify::SuspendableSet;
use vesper_ir::{Node, NodeFactory, NodeId, NodeKind, Ty, VarId};

/// Decompose a function body. The result is a body whose suspendable
/// constructs appear only in statement position.
pub fn decompose(body: Node, fac: &mut NodeFactory, susp: &SuspendableSet) -> Node {
    let mut dec = Decomposer { fac, susp };
    let out = dec.stmt(body);
    if out.is_composite() {
        let stmts = out.into_statements();
        dec.fac.block(Ty::Unit, stmts)
    } else {
        out
    }
}

struct Decomposer<'a> {
    fac: &'a mut NodeFactory,
    susp: &'a SuspendableSet,
}

impl Decomposer<'_> {
    /// Transform a node in statement position. A returned composite is meant
    /// to be spliced into the enclosing statement stream.
    fn stmt(&mut self, node: Node) -> Node {
        if !self.susp.contains(&node) {
            return node;
        }
        let Node { id, ty, kind } = node;
        match kind {
            NodeKind::Block(stmts) => {
                let mut out = Vec::with_capacity(stmts.len());
                for stmt in stmts {
                    out.extend(self.stmt(stmt).into_statements());
                }
                Node {
                    id,
                    ty,
                    kind: NodeKind::Block(out),
                }
            }
            NodeKind::Composite(stmts) => {
                let mut out = Vec::with_capacity(stmts.len());
                for stmt in stmts {
                    out.extend(self.stmt(stmt).into_statements());
                }
                Node {
                    id,
                    ty,
                    kind: NodeKind::Composite(out),
                }
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.expr(*cond);
                let then_branch = self.stmt_scoped(*then_branch);
                let else_branch = else_branch.map(|e| self.stmt_scoped(*e));
                let (mut prefix, cond) = self.split(cond);
                let if_node = Node {
                    id,
                    ty,
                    kind: NodeKind::If {
                        cond: Box::new(cond),
                        then_branch: Box::new(then_branch),
                        else_branch: else_branch.map(Box::new),
                    },
                };
                if prefix.is_empty() {
                    if_node
                } else {
                    prefix.push(if_node);
                    self.fac.composite(Ty::Unit, prefix)
                }
            }
            NodeKind::While { cond, body } => self.while_loop(id, ty, *cond, *body),
            NodeKind::DoWhile { body, cond } => self.do_while_loop(id, ty, *body, *cond),
            NodeKind::SetVar { var, value } => {
                let value = self.expr(*value);
                let (mut prefix, value) = self.split(value);
                let set = Node {
                    id,
                    ty,
                    kind: NodeKind::SetVar {
                        var,
                        value: Box::new(value),
                    },
                };
                if prefix.is_empty() {
                    set
                } else {
                    prefix.push(set);
                    self.fac.composite(Ty::Unit, prefix)
                }
            }
            NodeKind::VarDecl {
                var,
                var_ty,
                init: Some(init),
            } => {
                let init = self.expr(*init);
                let (mut prefix, init) = self.split(init);
                let decl = Node {
                    id,
                    ty,
                    kind: NodeKind::VarDecl {
                        var,
                        var_ty,
                        init: Some(Box::new(init)),
                    },
                };
                if prefix.is_empty() {
                    decl
                } else {
                    prefix.push(decl);
                    self.fac.composite(Ty::Unit, prefix)
                }
            }
            NodeKind::Return { value } => {
                let value = self.expr(*value);
                let (mut prefix, value) = self.split(value);
                let ret = Node {
                    id,
                    ty,
                    kind: NodeKind::Return {
                        value: Box::new(value),
                    },
                };
                if prefix.is_empty() {
                    ret
                } else {
                    prefix.push(ret);
                    self.fac.composite(Ty::Nothing, prefix)
                }
            }
            NodeKind::Throw { value } => {
                let value = self.expr(*value);
                let (mut prefix, value) = self.split(value);
                let throw = Node {
                    id,
                    ty,
                    kind: NodeKind::Throw {
                        value: Box::new(value),
                    },
                };
                if prefix.is_empty() {
                    throw
                } else {
                    prefix.push(throw);
                    self.fac.composite(Ty::Nothing, prefix)
                }
            }
            NodeKind::Call {
                func,
                args,
                suspending,
            } => {
                let (mut prefix, args) = self.materialize_args(args);
                let call = Node {
                    id,
                    ty,
                    kind: NodeKind::Call {
                        func,
                        args,
                        suspending,
                    },
                };
                if prefix.is_empty() {
                    call
                } else {
                    prefix.push(call);
                    self.fac.composite(Ty::Unit, prefix)
                }
            }
            NodeKind::Try {
                body,
                catches,
                finally,
            } => {
                let body = self.stmt_scoped(*body);
                let catches = catches
                    .into_iter()
                    .map(|mut c| {
                        c.body = self.stmt_scoped(c.body);
                        c
                    })
                    .collect();
                let finally = finally.map(|f| Box::new(self.stmt_scoped(*f)));
                Node {
                    id,
                    ty,
                    kind: NodeKind::Try {
                        body: Box::new(body),
                        catches,
                        finally,
                    },
                }
            }
            // Jumps carry no subexpressions; marked ones become state
            // transitions in the builder.
            kind @ (NodeKind::Break { .. } | NodeKind::Continue { .. }) => Node { id, ty, kind },
            // A suspendable expression in bare statement position; its value
            // is discarded by the enclosing stream.
            kind => self.expr(Node { id, ty, kind }),
        }
    }

    /// Transform a node in value position. The result is either the original
    /// node or a composite whose trailing statement is effect-free.
    fn expr(&mut self, node: Node) -> Node {
        if !self.susp.contains(&node) {
            return node;
        }
        let Node { id, ty, kind } = node;
        match kind {
            NodeKind::Call {
                func,
                args,
                suspending,
            } => {
                let (mut stmts, args) = self.materialize_args(args);
                let call = Node {
                    id,
                    ty,
                    kind: NodeKind::Call {
                        func,
                        args,
                        suspending,
                    },
                };
                let tmp = self.fac.fresh_var("tmp", ty);
                let decl = self.fac.var_decl(tmp, Some(call));
                stmts.push(decl);
                let value = self.fac.get_var(tmp);
                stmts.push(value);
                self.fac.composite(ty, stmts)
            }
            NodeKind::Binary { op, lhs, rhs } => {
                let (mut stmts, mut vals) = self.materialize_args(vec![*lhs, *rhs]);
                let rhs = vals.pop().map(Box::new);
                let lhs = vals.pop().map(Box::new);
                match (lhs, rhs) {
                    (Some(lhs), Some(rhs)) => {
                        let bin = Node {
                            id,
                            ty,
                            kind: NodeKind::Binary { op, lhs, rhs },
                        };
                        stmts.push(bin);
                        self.fac.composite(ty, stmts)
                    }
                    // materialize_args returns one value per input
                    _ => self.fac.unit(),
                }
            }
            NodeKind::Unary { op, operand } => {
                let operand = self.expr(*operand);
                let (mut stmts, operand) = self.split(operand);
                let un = Node {
                    id,
                    ty,
                    kind: NodeKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                };
                stmts.push(un);
                self.fac.composite(ty, stmts)
            }
            NodeKind::TypeTest { value, test } => {
                let value = self.expr(*value);
                let (mut stmts, value) = self.split(value);
                let tt = Node {
                    id,
                    ty,
                    kind: NodeKind::TypeTest {
                        value: Box::new(value),
                        test,
                    },
                };
                stmts.push(tt);
                self.fac.composite(ty, stmts)
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let tmp = self.fac.fresh_var("tmp", ty);
                let decl = self.fac.var_decl(tmp, None);
                let cond = self.expr(*cond);
                let then_branch = self.assign_into(tmp, *then_branch);
                let else_branch = else_branch.map(|e| self.assign_into(tmp, *e));
                let (cond_stmts, cond) = self.split(cond);
                let if_node = Node {
                    id,
                    ty: Ty::Unit,
                    kind: NodeKind::If {
                        cond: Box::new(cond),
                        then_branch: Box::new(then_branch),
                        else_branch: else_branch.map(Box::new),
                    },
                };
                let mut stmts = vec![decl];
                stmts.extend(cond_stmts);
                stmts.push(if_node);
                let value = self.fac.get_var(tmp);
                stmts.push(value);
                self.fac.composite(ty, stmts)
            }
            NodeKind::Block(inner) => {
                let tmp = self.fac.fresh_var("tmp", ty);
                let decl = self.fac.var_decl(tmp, None);
                let mut out = Vec::with_capacity(inner.len());
                let mut iter = inner.into_iter().peekable();
                while let Some(stmt) = iter.next() {
                    if iter.peek().is_none() {
                        // trailing statement is the block's value
                        let assign = self.assign_value_into(tmp, stmt);
                        out.extend(assign.into_statements());
                    } else {
                        out.extend(self.stmt(stmt).into_statements());
                    }
                }
                let block = Node {
                    id,
                    ty: Ty::Unit,
                    kind: NodeKind::Block(out),
                };
                let value = self.fac.get_var(tmp);
                self.fac.composite(ty, vec![decl, block, value])
            }
            NodeKind::Composite(inner) => {
                let mut out = Vec::with_capacity(inner.len());
                let mut iter = inner.into_iter().peekable();
                let mut value = None;
                while let Some(stmt) = iter.next() {
                    if iter.peek().is_none() {
                        let e = self.expr(stmt);
                        let (stmts, v) = self.split(e);
                        out.extend(stmts);
                        value = Some(v);
                    } else {
                        out.extend(self.stmt(stmt).into_statements());
                    }
                }
                let value = match value {
                    Some(v) => v,
                    None => self.fac.unit(),
                };
                out.push(value);
                self.fac.composite(ty, out)
            }
            NodeKind::Try {
                body,
                catches,
                finally,
            } => {
                let tmp = self.fac.fresh_var("tmp", ty);
                let decl = self.fac.var_decl(tmp, None);
                let body = self.assign_into(tmp, *body);
                let catches = catches
                    .into_iter()
                    .map(|mut c| {
                        c.body = self.assign_into(tmp, c.body);
                        c
                    })
                    .collect();
                let finally = finally.map(|f| Box::new(self.stmt_scoped(*f)));
                let try_node = Node {
                    id,
                    ty: Ty::Unit,
                    kind: NodeKind::Try {
                        body: Box::new(body),
                        catches,
                        finally,
                    },
                };
                let value = self.fac.get_var(tmp);
                self.fac.composite(ty, vec![decl, try_node, value])
            }
            // Diverging nodes used as values leave an unreachable trailing
            // value behind.
            kind @ (NodeKind::Return { .. }
            | NodeKind::Throw { .. }
            | NodeKind::Break { .. }
            | NodeKind::Continue { .. }) => {
                let stmt = self.stmt(Node {
                    id,
                    ty: Ty::Nothing,
                    kind,
                });
                let mut stmts = stmt.into_statements();
                let value = self.fac.unreachable();
                stmts.push(value);
                self.fac.composite(Ty::Nothing, stmts)
            }
            // Unit-valued statements used as values.
            kind @ (NodeKind::While { .. }
            | NodeKind::DoWhile { .. }
            | NodeKind::SetVar { .. }
            | NodeKind::VarDecl { .. }) => {
                let stmt = self.stmt(Node {
                    id,
                    ty: Ty::Unit,
                    kind,
                });
                let mut stmts = stmt.into_statements();
                let value = self.fac.unit();
                stmts.push(value);
                self.fac.composite(Ty::Unit, stmts)
            }
            // Leaves are never suspendable.
            kind => Node { id, ty, kind },
        }
    }

    /// Statement-position transform that keeps the result a single node.
    fn stmt_scoped(&mut self, node: Node) -> Node {
        let out = self.stmt(node);
        if out.is_composite() {
            let stmts = out.into_statements();
            self.fac.block(Ty::Unit, stmts)
        } else {
            out
        }
    }

    /// Split a composite into (prefix statements, trailing value). Any other
    /// node is a pure value with no prefix.
    fn split(&mut self, node: Node) -> (Vec<Node>, Node) {
        match node.kind {
            NodeKind::Composite(mut stmts) => match stmts.pop() {
                Some(value) => (stmts, value),
                None => (Vec::new(), self.fac.unit()),
            },
            _ => (Vec::new(), node),
        }
    }

    /// Build a statement that evaluates `node` and stores its value in `tmp`.
    /// Diverging nodes are emitted as-is; there is no value to store.
    fn assign_into(&mut self, tmp: VarId, node: Node) -> Node {
        if node.ty == Ty::Nothing {
            return self.stmt_scoped(node);
        }
        let value = self.expr(node);
        let (mut stmts, value) = self.split(value);
        let set = self.fac.set_var(tmp, value);
        stmts.push(set);
        if stmts.len() == 1 {
            stmts.remove(0)
        } else {
            self.fac.block(Ty::Unit, stmts)
        }
    }

    /// Like [`assign_into`] but may return a composite for splicing.
    fn assign_value_into(&mut self, tmp: VarId, node: Node) -> Node {
        if node.ty == Ty::Nothing {
            return self.stmt(node);
        }
        let value = self.expr(node);
        let (mut stmts, value) = self.split(value);
        let set = self.fac.set_var(tmp, value);
        stmts.push(set);
        self.fac.composite(Ty::Unit, stmts)
    }

    /// Left-to-right argument materialization. Statements of composite
    /// arguments are hoisted into a shared prefix; any non-trivial argument
    /// evaluated before a later composite is stored in a temporary so the
    /// original evaluation order survives the hoist. Composite trailing
    /// values are already materialized and literals are order-insensitive;
    /// neither gets a fresh temporary.
    fn materialize_args(&mut self, args: Vec<Node>) -> (Vec<Node>, Vec<Node>) {
        let args: Vec<Node> = args.into_iter().map(|a| self.expr(a)).collect();
        let mut composites_left = args.iter().filter(|a| a.is_composite()).count();
        let mut prefix = Vec::new();
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let value = if arg.is_composite() {
                composites_left -= 1;
                let (stmts, value) = self.split(arg);
                prefix.extend(stmts);
                value
            } else if composites_left > 0 && !matches!(arg.kind, NodeKind::Literal(_)) {
                let tmp = self.fac.fresh_var("arg", arg.ty);
                let decl = self.fac.var_decl(tmp, Some(arg));
                prefix.push(decl);
                self.fac.get_var(tmp)
            } else {
                arg
            };
            values.push(value);
        }
        (prefix, values)
    }

    /// Rewrite `while (cond) body` with a suspendable condition into
    /// `while (true) { cond-stmts; if (!c) break; body }`, retargeting jumps
    /// from the original loop to the new one.
    fn while_loop(&mut self, id: NodeId, ty: Ty, cond: Node, body: Node) -> Node {
        let body = self.stmt_scoped(body);
        let cond = self.expr(cond);
        if !cond.is_composite() {
            return Node {
                id,
                ty,
                kind: NodeKind::While {
                    cond: Box::new(cond),
                    body: Box::new(body),
                },
            };
        }
        let (mut stmts, cond_value) = self.split(cond);
        let always = self.fac.bool(true);
        let placeholder = self.fac.unit();
        let mut new_loop = self.fac.while_loop(always, placeholder);
        let brk = self.fac.break_stmt(new_loop.id);
        let exit_cond = self.fac.not(cond_value);
        let guard = self.fac.if_stmt(exit_cond, brk);
        let mut body = body;
        retarget_jumps(&mut body, id, new_loop.id, new_loop.id);
        stmts.push(guard);
        stmts.push(body);
        let new_body = self.fac.block(Ty::Unit, stmts);
        if let NodeKind::While { body: slot, .. } = &mut new_loop.kind {
            *slot = Box::new(new_body);
        }
        new_loop
    }

    /// Rewrite `do body while (cond)` with a suspendable condition into an
    /// inner loop that absorbs `continue` and an outer loop that evaluates
    /// the condition statements:
    ///
    /// ```text
    /// outer: while (true) {
    ///     inner: do { body } while (false)
    ///     cond-stmts
    ///     if (!c) break outer
    /// }
    /// ```
    fn do_while_loop(&mut self, id: NodeId, ty: Ty, body: Node, cond: Node) -> Node {
        let body = self.stmt_scoped(body);
        let cond = self.expr(cond);
        if !cond.is_composite() {
            return Node {
                id,
                ty,
                kind: NodeKind::DoWhile {
                    body: Box::new(body),
                    cond: Box::new(cond),
                },
            };
        }
        let always = self.fac.bool(true);
        let placeholder = self.fac.unit();
        let mut outer = self.fac.while_loop(always, placeholder);
        let never = self.fac.bool(false);
        let inner_placeholder = self.fac.unit();
        let mut inner = self.fac.do_while_loop(inner_placeholder, never);
        let mut body = body;
        retarget_jumps(&mut body, id, outer.id, inner.id);
        if let NodeKind::DoWhile { body: slot, .. } = &mut inner.kind {
            *slot = Box::new(body);
        }
        let (cond_stmts, cond_value) = self.split(cond);
        let brk = self.fac.break_stmt(outer.id);
        let exit_cond = self.fac.not(cond_value);
        let guard = self.fac.if_stmt(exit_cond, brk);
        let mut stmts = vec![inner];
        stmts.extend(cond_stmts);
        stmts.push(guard);
        let outer_body = self.fac.block(Ty::Unit, stmts);
        if let NodeKind::While { body: slot, .. } = &mut outer.kind {
            *slot = Box::new(outer_body);
        }
        outer
    }
}

/// Repoint `break`/`continue` nodes that target `old` at the replacement
/// loops. Node identities are unique, so the walk can descend everywhere.
fn retarget_jumps(node: &mut Node, old: NodeId, break_to: NodeId, continue_to: NodeId) {
    match &mut node.kind {
        NodeKind::Break { loop_id } => {
            if *loop_id == old {
                *loop_id = break_to;
            }
        }
        NodeKind::Continue { loop_id } => {
            if *loop_id == old {
                *loop_id = continue_to;
            }
        }
        NodeKind::SetVar { value, .. }
        | NodeKind::Return { value }
        | NodeKind::Throw { value }
        | NodeKind::TypeTest { value, .. }
        | NodeKind::SetSlot { value, .. } => retarget_jumps(value, old, break_to, continue_to),
        NodeKind::VarDecl { init, .. } => {
            if let Some(init) = init {
                retarget_jumps(init, old, break_to, continue_to);
            }
        }
        NodeKind::Call { args, .. } => {
            for arg in args {
                retarget_jumps(arg, old, break_to, continue_to);
            }
        }
        NodeKind::Unary { operand, .. } => retarget_jumps(operand, old, break_to, continue_to),
        NodeKind::Binary { lhs, rhs, .. } => {
            retarget_jumps(lhs, old, break_to, continue_to);
            retarget_jumps(rhs, old, break_to, continue_to);
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            retarget_jumps(cond, old, break_to, continue_to);
            retarget_jumps(then_branch, old, break_to, continue_to);
            if let Some(else_branch) = else_branch {
                retarget_jumps(else_branch, old, break_to, continue_to);
            }
        }
        NodeKind::Block(stmts) | NodeKind::Composite(stmts) => {
            for stmt in stmts {
                retarget_jumps(stmt, old, break_to, continue_to);
            }
        }
        NodeKind::While { cond, body } => {
            retarget_jumps(cond, old, break_to, continue_to);
            retarget_jumps(body, old, break_to, continue_to);
        }
        NodeKind::DoWhile { body, cond } => {
            retarget_jumps(body, old, break_to, continue_to);
            retarget_jumps(cond, old, break_to, continue_to);
        }
        NodeKind::Try {
            body,
            catches,
            finally,
        } => {
            retarget_jumps(body, old, break_to, continue_to);
            for catch in catches {
                retarget_jumps(&mut catch.body, old, break_to, continue_to);
            }
            if let Some(finally) = finally {
                retarget_jumps(finally, old, break_to, continue_to);
            }
        }
        _ => {}
    }
}
