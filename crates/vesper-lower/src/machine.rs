//! Reference executor
//!
//! A direct interpreter for resolved state graphs: the trampoline loop
//! dispatches on the state selector, runs one state body, and either loops,
//! parks, finishes, or routes a thrown value to the state named by the
//! exception selector. External calls go through the [`Host`] trait, which
//! is also how tests observe evaluation order and inject suspensions.

use crate::graph::StateGraph;
use rustc_hash::FxHashMap;
use vesper_ir::{DispatchTarget, Node, NodeId, NodeKind, Ty, UnaryOp, Value, VarId};

/// Outcome of one host call.
#[derive(Debug, Clone)]
pub enum HostOutcome {
    Return(Value),
    /// The callee is not ready; the machine parks and is woken later with
    /// `resume`.
    Suspend,
    Throw(Value),
}

/// The environment a machine runs against.
pub trait Host {
    fn call(&mut self, func: &str, args: &[Value]) -> HostOutcome;
}

/// What a run of the machine produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Resumption {
    Done(Value),
    Suspended,
    /// An exception left the function with no handler.
    Faulted(Value),
}

enum Control {
    Value(Value),
    Dispatch,
    SuspendExit,
    Return(Value),
    Throw(Value),
    Break(NodeId),
    Continue(NodeId),
}

macro_rules! value {
    ($e:expr) => {
        match $e {
            Control::Value(v) => v,
            other => return other,
        }
    };
}

/// A parked or running instance of one lowered function.
pub struct Machine<'g> {
    graph: &'g StateGraph,
    state: u32,
    ex_state: u32,
    locals: FxHashMap<VarId, Value>,
    slots: Vec<Value>,
    pending_ex: Value,
}

impl<'g> Machine<'g> {
    pub fn new(graph: &'g StateGraph) -> Self {
        Self {
            graph,
            state: graph.entry,
            ex_state: graph.trap,
            locals: FxHashMap::default(),
            slots: vec![Value::Unit; graph.slot_count],
            pending_ex: Value::Unit,
        }
    }

    /// Run from the entry state until the machine finishes or parks.
    pub fn start(&mut self, host: &mut dyn Host) -> Resumption {
        self.run(host)
    }

    /// Wake a parked machine, delivering `value` as the suspension call's
    /// result.
    pub fn resume(&mut self, value: Value, host: &mut dyn Host) -> Resumption {
        match self.graph.resume_slot {
            Some(slot) => self.slots[slot.as_u32() as usize] = value,
            None => {
                self.locals.insert(self.graph.resume_var, value);
            }
        }
        self.run(host)
    }

    /// Wake a parked machine with a failure: the pending operation threw
    /// instead of producing a value.
    pub fn resume_with_exception(&mut self, exception: Value, host: &mut dyn Host) -> Resumption {
        if self.ex_state == self.graph.trap {
            return Resumption::Faulted(exception);
        }
        self.pending_ex = exception;
        self.state = self.ex_state;
        self.run(host)
    }

    fn run(&mut self, host: &mut dyn Host) -> Resumption {
        let graph = self.graph;
        loop {
            let body = &graph.states[self.state as usize].body;
            match self.exec(body, host) {
                Control::Dispatch => {}
                Control::SuspendExit => return Resumption::Suspended,
                Control::Return(value) => return Resumption::Done(value),
                Control::Throw(exception) => {
                    if self.ex_state == self.graph.trap {
                        return Resumption::Faulted(exception);
                    }
                    self.pending_ex = exception;
                    self.state = self.ex_state;
                }
                Control::Value(_) => return Resumption::Done(Value::Unit),
                Control::Break(_) | Control::Continue(_) => {
                    return Resumption::Faulted(Value::Str("jump escaped the state body".into()))
                }
            }
        }
    }

    fn exec(&mut self, body: &[Node], host: &mut dyn Host) -> Control {
        let mut last = Value::Unit;
        for node in body {
            last = value!(self.eval(node, host));
        }
        Control::Value(last)
    }

    fn eval(&mut self, node: &Node, host: &mut dyn Host) -> Control {
        match &node.kind {
            NodeKind::Literal(value) => Control::Value(value.clone()),
            NodeKind::GetVar(var) => {
                Control::Value(self.locals.get(var).cloned().unwrap_or(Value::Unit))
            }
            NodeKind::SetVar { var, value } => {
                let value = value!(self.eval(value, host));
                self.locals.insert(*var, value);
                Control::Value(Value::Unit)
            }
            NodeKind::VarDecl { var, init, .. } => {
                let value = match init {
                    Some(init) => value!(self.eval(init, host)),
                    None => Value::Unit,
                };
                self.locals.insert(*var, value);
                Control::Value(Value::Unit)
            }
            NodeKind::GetSlot(slot) => {
                Control::Value(self.slots[slot.as_u32() as usize].clone())
            }
            NodeKind::SetSlot { slot, value } => {
                let value = value!(self.eval(value, host));
                self.slots[slot.as_u32() as usize] = value;
                Control::Value(Value::Unit)
            }
            NodeKind::Call { func, args, .. } => {
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(value!(self.eval(arg, host)));
                }
                match host.call(&func.name, &evaluated) {
                    HostOutcome::Return(value) => Control::Value(value),
                    HostOutcome::Suspend => Control::Value(Value::Suspended),
                    HostOutcome::Throw(exception) => Control::Throw(exception),
                }
            }
            NodeKind::Unary { op, operand } => {
                let operand = value!(self.eval(operand, host));
                match (op, operand) {
                    (UnaryOp::Neg, Value::Int(i)) => Control::Value(Value::Int(-i)),
                    (UnaryOp::Not, v) => Control::Value(Value::Bool(!v.is_truthy())),
                    (op, v) => type_fault(&format!("{} on {}", op, v)),
                }
            }
            NodeKind::Binary { op, lhs, rhs } => {
                let lhs = value!(self.eval(lhs, host));
                let rhs = value!(self.eval(rhs, host));
                apply_binary(*op, lhs, rhs)
            }
            NodeKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = value!(self.eval(cond, host));
                if cond.is_truthy() {
                    self.eval(then_branch, host)
                } else if let Some(else_branch) = else_branch {
                    self.eval(else_branch, host)
                } else {
                    Control::Value(Value::Unit)
                }
            }
            NodeKind::Block(stmts) | NodeKind::Composite(stmts) => self.exec(stmts, host),
            NodeKind::While { cond, body } => loop {
                let test = value!(self.eval(cond, host));
                if !test.is_truthy() {
                    break Control::Value(Value::Unit);
                }
                match self.eval(body, host) {
                    Control::Value(_) => {}
                    Control::Break(id) if id == node.id => break Control::Value(Value::Unit),
                    Control::Continue(id) if id == node.id => {}
                    other => break other,
                }
            },
            NodeKind::DoWhile { body, cond } => loop {
                match self.eval(body, host) {
                    Control::Value(_) => {}
                    Control::Break(id) if id == node.id => break Control::Value(Value::Unit),
                    Control::Continue(id) if id == node.id => {}
                    other => break other,
                }
                let test = value!(self.eval(cond, host));
                if !test.is_truthy() {
                    break Control::Value(Value::Unit);
                }
            },
            NodeKind::Break { loop_id } => Control::Break(*loop_id),
            NodeKind::Continue { loop_id } => Control::Continue(*loop_id),
            NodeKind::Return { value } => {
                let value = value!(self.eval(value, host));
                Control::Return(value)
            }
            NodeKind::Throw { value } => {
                let value = value!(self.eval(value, host));
                Control::Throw(value)
            }
            NodeKind::Try {
                body,
                catches,
                finally,
            } => {
                // verbatim try: the whole region stayed inside one state
                let mut control = self.eval(body, host);
                if let Control::Throw(exception) = &control {
                    let exception = exception.clone();
                    for clause in catches {
                        if type_matches(&exception, clause.filter) {
                            self.locals.insert(clause.var, exception.clone());
                            control = self.eval(&clause.body, host);
                            break;
                        }
                    }
                }
                if let Some(finally) = finally {
                    match self.eval(finally, host) {
                        Control::Value(_) => {}
                        interrupting => control = interrupting,
                    }
                }
                control
            }
            NodeKind::TypeTest { value, test } => {
                let value = value!(self.eval(value, host));
                Control::Value(Value::Bool(type_matches(&value, *test)))
            }
            NodeKind::Unreachable => {
                Control::Throw(Value::Str("entered unreachable code".into()))
            }
            NodeKind::DispatchPoint(target) => match target {
                DispatchTarget::Resolved(id) => Control::Value(Value::Int(*id as i64)),
                DispatchTarget::State(state) => {
                    Control::Throw(Value::Str(format!("unresolved dispatch target {}", state)))
                }
            },
            NodeKind::SetState { target } => {
                let target = value!(self.eval(target, host));
                match target {
                    Value::Int(id) => {
                        self.state = id as u32;
                        Control::Value(Value::Unit)
                    }
                    other => type_fault(&format!("state selector set to {}", other)),
                }
            }
            NodeKind::SetExceptionState { target } => {
                let target = value!(self.eval(target, host));
                match target {
                    Value::Int(id) => {
                        self.ex_state = id as u32;
                        Control::Value(Value::Unit)
                    }
                    other => type_fault(&format!("exception selector set to {}", other)),
                }
            }
            NodeKind::Dispatch => Control::Dispatch,
            NodeKind::Suspend => Control::SuspendExit,
            NodeKind::GetPendingException => Control::Value(self.pending_ex.clone()),
        }
    }
}

fn type_matches(value: &Value, filter: Ty) -> bool {
    filter == Ty::Any || value.ty() == filter
}

fn type_fault(detail: &str) -> Control {
    Control::Throw(Value::Str(format!("type error: {}", detail)))
}

fn apply_binary(op: vesper_ir::BinaryOp, lhs: Value, rhs: Value) -> Control {
    use vesper_ir::BinaryOp::*;
    match (op, lhs, rhs) {
        (Add, Value::Int(a), Value::Int(b)) => Control::Value(Value::Int(a + b)),
        (Sub, Value::Int(a), Value::Int(b)) => Control::Value(Value::Int(a - b)),
        (Mul, Value::Int(a), Value::Int(b)) => Control::Value(Value::Int(a * b)),
        (Less, Value::Int(a), Value::Int(b)) => Control::Value(Value::Bool(a < b)),
        (Greater, Value::Int(a), Value::Int(b)) => Control::Value(Value::Bool(a > b)),
        (Concat, Value::Str(a), Value::Str(b)) => Control::Value(Value::Str(a + &b)),
        (Equal, a, b) => Control::Value(Value::Bool(a == b)),
        (NotEqual, a, b) => Control::Value(Value::Bool(a != b)),
        (op, a, b) => type_fault(&format!("{} on {} and {}", op, a, b)),
    }
}

/// Evaluate a body directly, without lowering it. Only valid for bodies
/// with no suspension points; used by tests to compare observable behavior
/// against the lowered machine.
pub fn eval_direct(body: &Node, host: &mut dyn Host) -> Resumption {
    let graph = StateGraph {
        states: Vec::new(),
        entry: 0,
        trap: 0,
        resume_var: VarId::new(u32::MAX),
        resume_slot: None,
        var_count: 0,
        slot_count: 0,
    };
    let mut machine = Machine::new(&graph);
    match machine.eval(body, host) {
        Control::Value(value) => Resumption::Done(value),
        Control::Return(value) => Resumption::Done(value),
        Control::Throw(exception) => Resumption::Faulted(exception),
        Control::SuspendExit | Control::Dispatch => {
            Resumption::Faulted(Value::Str("direct evaluation cannot suspend".into()))
        }
        Control::Break(_) | Control::Continue(_) => {
            Resumption::Faulted(Value::Str("jump escaped the function body".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_ir::NodeFactory;

    struct ScriptHost {
        log: Vec<String>,
    }

    impl Host for ScriptHost {
        fn call(&mut self, func: &str, _args: &[Value]) -> HostOutcome {
            self.log.push(func.to_string());
            match func {
                "one" => HostOutcome::Return(Value::Int(1)),
                "boom" => HostOutcome::Throw(Value::Str("boom".into())),
                _ => HostOutcome::Return(Value::Unit),
            }
        }
    }

    #[test]
    fn test_direct_eval_runs_calls_in_order() {
        let mut fac = NodeFactory::new();
        let a = fac.call("a", vec![], Ty::Unit);
        let b = fac.call("b", vec![], Ty::Unit);
        let body = fac.block(Ty::Unit, vec![a, b]);
        let mut host = ScriptHost { log: Vec::new() };
        let out = eval_direct(&body, &mut host);
        assert_eq!(out, Resumption::Done(Value::Unit));
        assert_eq!(host.log, vec!["a", "b"]);
    }

    #[test]
    fn test_direct_eval_try_catches_by_type() {
        let mut fac = NodeFactory::new();
        let boom = fac.call("boom", vec![], Ty::Unit);
        let try_body = fac.block(Ty::Unit, vec![boom]);
        let e = fac.fresh_var("e", Ty::Any);
        let get_e = fac.get_var(e);
        let caught = fac.ret(get_e);
        let handler = fac.block(Ty::Unit, vec![caught]);
        let clause = fac.catch_clause(e, Ty::Str, handler);
        let tr = fac.try_stmt(Ty::Unit, try_body, vec![clause], None);
        let body = fac.block(Ty::Unit, vec![tr]);
        let mut host = ScriptHost { log: Vec::new() };
        let out = eval_direct(&body, &mut host);
        assert_eq!(out, Resumption::Done(Value::Str("boom".into())));
    }

    #[test]
    fn test_direct_eval_loop_breaks() {
        let mut fac = NodeFactory::new();
        // i = 0; while (i < 3) { if (i == 2) break; i = i + 1 }; return i
        let i = fac.fresh_var("i", Ty::Int);
        let zero = fac.int(0);
        let decl = fac.var_decl(i, Some(zero));
        let placeholder = fac.unit();
        let three = fac.int(3);
        let get1 = fac.get_var(i);
        let cond = fac.binary(vesper_ir::BinaryOp::Less, get1, three);
        let mut lp = fac.while_loop(cond, placeholder);
        let brk = fac.break_stmt(lp.id);
        let two = fac.int(2);
        let get2 = fac.get_var(i);
        let at_two = fac.eq(get2, two);
        let guard = fac.if_stmt(at_two, brk);
        let get3 = fac.get_var(i);
        let one = fac.int(1);
        let next = fac.binary(vesper_ir::BinaryOp::Add, get3, one);
        let step = fac.set_var(i, next);
        let loop_body = fac.block(Ty::Unit, vec![guard, step]);
        if let NodeKind::While { body, .. } = &mut lp.kind {
            *body = Box::new(loop_body);
        }
        let get4 = fac.get_var(i);
        let ret = fac.ret(get4);
        let body = fac.block(Ty::Unit, vec![decl, lp, ret]);
        let mut host = ScriptHost { log: Vec::new() };
        let out = eval_direct(&body, &mut host);
        assert_eq!(out, Resumption::Done(Value::Int(2)));
    }
}
