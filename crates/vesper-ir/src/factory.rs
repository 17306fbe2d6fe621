//! Node factory
//!
//! Allocates node identities and typed variables for one function body. All
//! node construction goes through the factory so every node has a fresh
//! `NodeId`; the counters are per-function and never shared across bodies.

use crate::node::{
    BinaryOp, CatchClause, DispatchTarget, FuncRef, Node, NodeId, NodeKind, StateRef, Ty, UnaryOp,
    Value, VarId,
};

/// Declared name and type of a variable.
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub name: String,
    pub ty: Ty,
}

/// Per-function allocator for nodes and variables.
#[derive(Debug, Default)]
pub struct NodeFactory {
    next_node: u32,
    vars: Vec<VarInfo>,
}

impl NodeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a node of the given type and kind with a fresh identity.
    pub fn node(&mut self, ty: Ty, kind: NodeKind) -> Node {
        let id = NodeId::new(self.next_node);
        self.next_node += 1;
        Node { id, ty, kind }
    }

    /// Declare a fresh variable. Temporaries use a hint like `tmp` or `cond`.
    pub fn fresh_var(&mut self, hint: &str, ty: Ty) -> VarId {
        let id = VarId::new(self.vars.len() as u32);
        self.vars.push(VarInfo {
            name: format!("{}${}", hint, id.as_u32()),
            ty,
        });
        id
    }

    pub fn var_ty(&self, var: VarId) -> Ty {
        self.vars[var.as_u32() as usize].ty
    }

    pub fn var_name(&self, var: VarId) -> &str {
        &self.vars[var.as_u32() as usize].name
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    // ===== Literals =====

    pub fn literal(&mut self, value: Value) -> Node {
        let ty = value.ty();
        self.node(ty, NodeKind::Literal(value))
    }

    pub fn unit(&mut self) -> Node {
        self.literal(Value::Unit)
    }

    pub fn int(&mut self, v: i64) -> Node {
        self.literal(Value::Int(v))
    }

    pub fn bool(&mut self, v: bool) -> Node {
        self.literal(Value::Bool(v))
    }

    pub fn str(&mut self, v: impl Into<String>) -> Node {
        self.literal(Value::Str(v.into()))
    }

    /// The suspended sentinel as a literal, for the post-call check.
    pub fn suspended_sentinel(&mut self) -> Node {
        self.literal(Value::Suspended)
    }

    // ===== Variables =====

    pub fn get_var(&mut self, var: VarId) -> Node {
        let ty = self.var_ty(var);
        self.node(ty, NodeKind::GetVar(var))
    }

    pub fn set_var(&mut self, var: VarId, value: Node) -> Node {
        self.node(
            Ty::Unit,
            NodeKind::SetVar {
                var,
                value: Box::new(value),
            },
        )
    }

    pub fn var_decl(&mut self, var: VarId, init: Option<Node>) -> Node {
        let var_ty = self.var_ty(var);
        self.node(
            Ty::Unit,
            NodeKind::VarDecl {
                var,
                var_ty,
                init: init.map(Box::new),
            },
        )
    }

    // ===== Calls and operators =====

    pub fn call(&mut self, name: impl Into<String>, args: Vec<Node>, ret: Ty) -> Node {
        self.node(
            ret,
            NodeKind::Call {
                func: FuncRef::new(name),
                args,
                suspending: false,
            },
        )
    }

    /// A call flagged as a suspension point by the upstream classifier.
    pub fn suspend_call(&mut self, name: impl Into<String>, args: Vec<Node>, ret: Ty) -> Node {
        self.node(
            ret,
            NodeKind::Call {
                func: FuncRef::new(name),
                args,
                suspending: true,
            },
        )
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Node, rhs: Node) -> Node {
        self.node(
            op.result_ty(),
            NodeKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
        )
    }

    pub fn unary(&mut self, op: UnaryOp, operand: Node) -> Node {
        let ty = match op {
            UnaryOp::Neg => Ty::Int,
            UnaryOp::Not => Ty::Bool,
        };
        self.node(
            ty,
            NodeKind::Unary {
                op,
                operand: Box::new(operand),
            },
        )
    }

    pub fn not(&mut self, operand: Node) -> Node {
        self.unary(UnaryOp::Not, operand)
    }

    pub fn eq(&mut self, lhs: Node, rhs: Node) -> Node {
        self.binary(BinaryOp::Equal, lhs, rhs)
    }

    // ===== Control flow =====

    pub fn if_stmt(&mut self, cond: Node, then_branch: Node) -> Node {
        self.node(
            Ty::Unit,
            NodeKind::If {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: None,
            },
        )
    }

    pub fn if_else(&mut self, ty: Ty, cond: Node, then_branch: Node, else_branch: Node) -> Node {
        self.node(
            ty,
            NodeKind::If {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Some(Box::new(else_branch)),
            },
        )
    }

    pub fn block(&mut self, ty: Ty, stmts: Vec<Node>) -> Node {
        self.node(ty, NodeKind::Block(stmts))
    }

    pub fn composite(&mut self, ty: Ty, stmts: Vec<Node>) -> Node {
        self.node(ty, NodeKind::Composite(stmts))
    }

    pub fn while_loop(&mut self, cond: Node, body: Node) -> Node {
        self.node(
            Ty::Unit,
            NodeKind::While {
                cond: Box::new(cond),
                body: Box::new(body),
            },
        )
    }

    pub fn do_while_loop(&mut self, body: Node, cond: Node) -> Node {
        self.node(
            Ty::Unit,
            NodeKind::DoWhile {
                body: Box::new(body),
                cond: Box::new(cond),
            },
        )
    }

    pub fn break_stmt(&mut self, loop_id: NodeId) -> Node {
        self.node(Ty::Nothing, NodeKind::Break { loop_id })
    }

    pub fn continue_stmt(&mut self, loop_id: NodeId) -> Node {
        self.node(Ty::Nothing, NodeKind::Continue { loop_id })
    }

    pub fn ret(&mut self, value: Node) -> Node {
        self.node(
            Ty::Nothing,
            NodeKind::Return {
                value: Box::new(value),
            },
        )
    }

    pub fn ret_unit(&mut self) -> Node {
        let unit = self.unit();
        self.ret(unit)
    }

    pub fn throw(&mut self, value: Node) -> Node {
        self.node(
            Ty::Nothing,
            NodeKind::Throw {
                value: Box::new(value),
            },
        )
    }

    pub fn try_stmt(
        &mut self,
        ty: Ty,
        body: Node,
        catches: Vec<CatchClause>,
        finally: Option<Node>,
    ) -> Node {
        self.node(
            ty,
            NodeKind::Try {
                body: Box::new(body),
                catches,
                finally: finally.map(Box::new),
            },
        )
    }

    pub fn catch_clause(&mut self, var: VarId, filter: Ty, body: Node) -> CatchClause {
        CatchClause { var, filter, body }
    }

    pub fn type_test(&mut self, value: Node, test: Ty) -> Node {
        self.node(
            Ty::Bool,
            NodeKind::TypeTest {
                value: Box::new(value),
                test,
            },
        )
    }

    pub fn unreachable(&mut self) -> Node {
        self.node(Ty::Nothing, NodeKind::Unreachable)
    }

    // ===== Synthetic state-machine nodes =====

    pub fn dispatch_point(&mut self, state: StateRef) -> Node {
        self.node(Ty::Int, NodeKind::DispatchPoint(DispatchTarget::State(state)))
    }

    pub fn set_state(&mut self, target: Node) -> Node {
        self.node(
            Ty::Unit,
            NodeKind::SetState {
                target: Box::new(target),
            },
        )
    }

    pub fn set_exception_state(&mut self, target: Node) -> Node {
        self.node(
            Ty::Unit,
            NodeKind::SetExceptionState {
                target: Box::new(target),
            },
        )
    }

    pub fn dispatch(&mut self) -> Node {
        self.node(Ty::Nothing, NodeKind::Dispatch)
    }

    pub fn suspend(&mut self) -> Node {
        self.node(Ty::Nothing, NodeKind::Suspend)
    }

    pub fn get_pending_exception(&mut self) -> Node {
        self.node(Ty::Any, NodeKind::GetPendingException)
    }
}
