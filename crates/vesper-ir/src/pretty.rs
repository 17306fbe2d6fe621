//! Pretty-printing for IR trees
//!
//! Human-readable output for debugging bodies before and after lowering.

use crate::node::{Node, NodeKind};
use std::fmt::Write;

/// Trait for pretty-printing IR constructs.
pub trait PrettyPrint {
    fn pretty_print(&self) -> String;
}

impl PrettyPrint for Node {
    fn pretty_print(&self) -> String {
        let mut out = String::new();
        write_node(&mut out, self, 0);
        out
    }
}

impl PrettyPrint for [Node] {
    fn pretty_print(&self) -> String {
        let mut out = String::new();
        for node in self {
            write_node(&mut out, node, 0);
        }
        out
    }
}

fn write_node(out: &mut String, node: &Node, indent: usize) {
    let prefix = "  ".repeat(indent);
    match &node.kind {
        NodeKind::Literal(v) => writeln!(out, "{}{}", prefix, v).unwrap(),
        NodeKind::GetVar(v) => writeln!(out, "{}{}", prefix, v).unwrap(),
        NodeKind::SetVar { var, value } => {
            writeln!(out, "{}{} =", prefix, var).unwrap();
            write_node(out, value, indent + 1);
        }
        NodeKind::VarDecl { var, var_ty, init } => {
            writeln!(out, "{}var {}: {}", prefix, var, var_ty).unwrap();
            if let Some(init) = init {
                write_node(out, init, indent + 1);
            }
        }
        NodeKind::Call {
            func,
            args,
            suspending,
        } => {
            let marker = if *suspending { "suspend " } else { "" };
            writeln!(out, "{}{}call {}", prefix, marker, func).unwrap();
            for arg in args {
                write_node(out, arg, indent + 1);
            }
        }
        NodeKind::Unary { op, operand } => {
            writeln!(out, "{}unary {}", prefix, op).unwrap();
            write_node(out, operand, indent + 1);
        }
        NodeKind::Binary { op, lhs, rhs } => {
            writeln!(out, "{}binary {}", prefix, op).unwrap();
            write_node(out, lhs, indent + 1);
            write_node(out, rhs, indent + 1);
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            writeln!(out, "{}if", prefix).unwrap();
            write_node(out, cond, indent + 1);
            writeln!(out, "{}then", prefix).unwrap();
            write_node(out, then_branch, indent + 1);
            if let Some(else_branch) = else_branch {
                writeln!(out, "{}else", prefix).unwrap();
                write_node(out, else_branch, indent + 1);
            }
        }
        NodeKind::Block(stmts) => {
            writeln!(out, "{}block {}", prefix, node.id).unwrap();
            for stmt in stmts {
                write_node(out, stmt, indent + 1);
            }
        }
        NodeKind::Composite(stmts) => {
            writeln!(out, "{}composite", prefix).unwrap();
            for stmt in stmts {
                write_node(out, stmt, indent + 1);
            }
        }
        NodeKind::While { cond, body } => {
            writeln!(out, "{}while {}", prefix, node.id).unwrap();
            write_node(out, cond, indent + 1);
            writeln!(out, "{}do", prefix).unwrap();
            write_node(out, body, indent + 1);
        }
        NodeKind::DoWhile { body, cond } => {
            writeln!(out, "{}do {}", prefix, node.id).unwrap();
            write_node(out, body, indent + 1);
            writeln!(out, "{}while", prefix).unwrap();
            write_node(out, cond, indent + 1);
        }
        NodeKind::Break { loop_id } => writeln!(out, "{}break -> {}", prefix, loop_id).unwrap(),
        NodeKind::Continue { loop_id } => {
            writeln!(out, "{}continue -> {}", prefix, loop_id).unwrap()
        }
        NodeKind::Return { value } => {
            writeln!(out, "{}return", prefix).unwrap();
            write_node(out, value, indent + 1);
        }
        NodeKind::Throw { value } => {
            writeln!(out, "{}throw", prefix).unwrap();
            write_node(out, value, indent + 1);
        }
        NodeKind::Try {
            body,
            catches,
            finally,
        } => {
            writeln!(out, "{}try", prefix).unwrap();
            write_node(out, body, indent + 1);
            for catch in catches {
                writeln!(out, "{}catch {} : {}", prefix, catch.var, catch.filter).unwrap();
                write_node(out, &catch.body, indent + 1);
            }
            if let Some(finally) = finally {
                writeln!(out, "{}finally", prefix).unwrap();
                write_node(out, finally, indent + 1);
            }
        }
        NodeKind::TypeTest { value, test } => {
            writeln!(out, "{}is {}", prefix, test).unwrap();
            write_node(out, value, indent + 1);
        }
        NodeKind::Unreachable => writeln!(out, "{}unreachable", prefix).unwrap(),
        NodeKind::DispatchPoint(target) => {
            writeln!(out, "{}dispatch-point {}", prefix, target).unwrap()
        }
        NodeKind::SetState { target } => {
            writeln!(out, "{}state =", prefix).unwrap();
            write_node(out, target, indent + 1);
        }
        NodeKind::SetExceptionState { target } => {
            writeln!(out, "{}exstate =", prefix).unwrap();
            write_node(out, target, indent + 1);
        }
        NodeKind::Dispatch => writeln!(out, "{}dispatch", prefix).unwrap(),
        NodeKind::Suspend => writeln!(out, "{}suspend", prefix).unwrap(),
        NodeKind::GetPendingException => writeln!(out, "{}pending-exception", prefix).unwrap(),
        NodeKind::GetSlot(slot) => writeln!(out, "{}{}", prefix, slot).unwrap(),
        NodeKind::SetSlot { slot, value } => {
            writeln!(out, "{}{} =", prefix, slot).unwrap();
            write_node(out, value, indent + 1);
        }
    }
}
