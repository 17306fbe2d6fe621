//! Suspendable-node classification
//!
//! Marks every node whose evaluation may cross a suspension point. The
//! decomposer only rewrites marked nodes and the builder only splits states
//! at them; everything else is carried through verbatim.

use rustc_hash::FxHashSet;
use vesper_ir::{Node, NodeId, NodeKind};

/// The set of node identities that may suspend.
#[derive(Debug, Default)]
pub struct SuspendableSet {
    inner: FxHashSet<NodeId>,
}

impl SuspendableSet {
    pub fn contains(&self, node: &Node) -> bool {
        self.inner.contains(&node.id)
    }

    pub fn contains_id(&self, id: NodeId) -> bool {
        self.inner.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Classify a function body.
///
/// First pass: a node is suspendable if it is a suspending call or contains
/// one. Second pass: a jump that has to become a state transition is
/// suspendable too, together with every node between it and its target. That
/// covers `break`/`continue` whose target loop is suspendable, and
/// `return`/`throw` crossing a suspendable region with a `finally` (the
/// builder routes those through the finally chain, so they must not be
/// emitted verbatim). Marking a node this way can make further jumps
/// suspendable, so the second pass runs to a fixpoint.
pub fn collect_suspendable(body: &Node) -> SuspendableSet {
    let mut set = SuspendableSet::default();
    mark_suspending_calls(body, &mut set.inner);
    loop {
        let mut jumps = JumpMarker {
            set: &mut set.inner,
            stack: Vec::new(),
            regions: Vec::new(),
            changed: false,
        };
        jumps.visit(body);
        if !jumps.changed {
            break;
        }
    }
    set
}

fn mark_suspending_calls(node: &Node, set: &mut FxHashSet<NodeId>) -> bool {
    let mut suspendable = false;
    let child = |n: &Node, set: &mut FxHashSet<NodeId>, flag: &mut bool| {
        if mark_suspending_calls(n, set) {
            *flag = true;
        }
    };
    match &node.kind {
        NodeKind::Literal(_)
        | NodeKind::GetVar(_)
        | NodeKind::Break { .. }
        | NodeKind::Continue { .. }
        | NodeKind::Unreachable => {}
        NodeKind::SetVar { value, .. } => child(value, set, &mut suspendable),
        NodeKind::VarDecl { init, .. } => {
            if let Some(init) = init {
                child(init, set, &mut suspendable);
            }
        }
        NodeKind::Call {
            args, suspending, ..
        } => {
            for arg in args {
                child(arg, set, &mut suspendable);
            }
            if *suspending {
                suspendable = true;
            }
        }
        NodeKind::Unary { operand, .. } => child(operand, set, &mut suspendable),
        NodeKind::Binary { lhs, rhs, .. } => {
            child(lhs, set, &mut suspendable);
            child(rhs, set, &mut suspendable);
        }
        NodeKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            child(cond, set, &mut suspendable);
            child(then_branch, set, &mut suspendable);
            if let Some(else_branch) = else_branch {
                child(else_branch, set, &mut suspendable);
            }
        }
        NodeKind::Block(stmts) | NodeKind::Composite(stmts) => {
            for stmt in stmts {
                child(stmt, set, &mut suspendable);
            }
        }
        NodeKind::While { cond, body } => {
            child(cond, set, &mut suspendable);
            child(body, set, &mut suspendable);
        }
        NodeKind::DoWhile { body, cond } => {
            child(body, set, &mut suspendable);
            child(cond, set, &mut suspendable);
        }
        NodeKind::Return { value } | NodeKind::Throw { value } => {
            child(value, set, &mut suspendable)
        }
        NodeKind::Try {
            body,
            catches,
            finally,
        } => {
            child(body, set, &mut suspendable);
            for catch in catches {
                child(&catch.body, set, &mut suspendable);
            }
            if let Some(finally) = finally {
                child(finally, set, &mut suspendable);
            }
        }
        NodeKind::TypeTest { value, .. } => child(value, set, &mut suspendable),
        // Synthetic kinds never occur in input bodies; the pipeline rejects
        // them before classification.
        _ => {}
    }
    if suspendable {
        set.insert(node.id);
    }
    suspendable
}

struct JumpMarker<'a> {
    set: &'a mut FxHashSet<NodeId>,
    stack: Vec<NodeId>,
    /// Enclosing suspendable `try` regions that carry a `finally`, outermost
    /// first. A `return`/`throw` inside one tunnels through its finally chain.
    regions: Vec<NodeId>,
    changed: bool,
}

impl JumpMarker<'_> {
    fn visit(&mut self, node: &Node) {
        self.stack.push(node.id);
        match &node.kind {
            NodeKind::Break { loop_id } | NodeKind::Continue { loop_id } => {
                if self.set.contains(loop_id) {
                    self.mark_up_to(*loop_id);
                }
            }
            NodeKind::SetVar { value, .. } => self.visit(value),
            NodeKind::VarDecl { init, .. } => {
                if let Some(init) = init {
                    self.visit(init);
                }
            }
            NodeKind::Call { args, .. } => {
                for arg in args {
                    self.visit(arg);
                }
            }
            NodeKind::Unary { operand, .. } => self.visit(operand),
            NodeKind::Binary { lhs, rhs, .. } => {
                self.visit(lhs);
                self.visit(rhs);
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.visit(cond);
                self.visit(then_branch);
                if let Some(else_branch) = else_branch {
                    self.visit(else_branch);
                }
            }
            NodeKind::Block(stmts) | NodeKind::Composite(stmts) => {
                for stmt in stmts {
                    self.visit(stmt);
                }
            }
            NodeKind::While { cond, body } => {
                self.visit(cond);
                self.visit(body);
            }
            NodeKind::DoWhile { body, cond } => {
                self.visit(body);
                self.visit(cond);
            }
            NodeKind::Return { value } | NodeKind::Throw { value } => {
                self.visit(value);
                if let Some(&region) = self.regions.first() {
                    self.mark_up_to(region);
                }
            }
            NodeKind::Try {
                body,
                catches,
                finally,
            } => {
                let tracked = finally.is_some() && self.set.contains(&node.id);
                if tracked {
                    self.regions.push(node.id);
                }
                self.visit(body);
                for catch in catches {
                    self.visit(&catch.body);
                }
                // a jump inside the finally body does not tunnel through the
                // region's own finally
                if tracked {
                    self.regions.pop();
                }
                if let Some(finally) = finally {
                    self.visit(finally);
                }
            }
            NodeKind::TypeTest { value, .. } => self.visit(value),
            _ => {}
        }
        self.stack.pop();
    }

    /// Mark every node on the current path from the jump up to (and
    /// including) the target loop or region.
    fn mark_up_to(&mut self, target: NodeId) {
        let Some(start) = self.stack.iter().position(|&id| id == target) else {
            // Malformed target; the builder reports it as an error.
            return;
        };
        for &id in &self.stack[start..] {
            if self.set.insert(id) {
                self.changed = true;
            }
        }
    }
}
