//! Shared harness for the lowering integration tests
#![allow(dead_code)]

use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use vesper_ir::{Node, NodeFactory, Value};
use vesper_lower::{lower_function, Host, HostOutcome, Machine, Resumption, StateGraph};

/// A host with scripted outcomes per function name and a call log. Calls
/// with no script return `Unit`. Log entries render the arguments, so order
/// tests can compare full call sequences.
pub struct ScriptedHost {
    pub log: Vec<String>,
    outcomes: FxHashMap<String, VecDeque<HostOutcome>>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self {
            log: Vec::new(),
            outcomes: FxHashMap::default(),
        }
    }

    pub fn on(mut self, func: &str, outcome: HostOutcome) -> Self {
        self.outcomes
            .entry(func.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn returning(self, func: &str, value: Value) -> Self {
        self.on(func, HostOutcome::Return(value))
    }

    pub fn suspending(self, func: &str) -> Self {
        self.on(func, HostOutcome::Suspend)
    }

    pub fn throwing(self, func: &str, value: Value) -> Self {
        self.on(func, HostOutcome::Throw(value))
    }

    pub fn count(&self, func: &str) -> usize {
        let prefix = format!("{}(", func);
        self.log
            .iter()
            .filter(|entry| entry.starts_with(&prefix))
            .count()
    }
}

impl Host for ScriptedHost {
    fn call(&mut self, func: &str, args: &[Value]) -> HostOutcome {
        let rendered: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.log.push(format!("{}({})", func, rendered.join(", ")));
        self.outcomes
            .get_mut(func)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(HostOutcome::Return(Value::Unit))
    }
}

pub fn lower(body: Node, fac: &mut NodeFactory) -> StateGraph {
    lower_function(body, fac).expect("lowering failed")
}

/// Start the machine, then feed it the resume values one by one; panics if
/// the machine settles before all values are consumed.
pub fn drive(graph: &StateGraph, host: &mut ScriptedHost, resumes: &[Value]) -> Resumption {
    let mut machine = Machine::new(graph);
    let mut outcome = machine.start(host);
    for value in resumes {
        assert!(
            matches!(outcome, Resumption::Suspended),
            "machine settled before all resume values were used: {:?}",
            outcome
        );
        outcome = machine.resume(value.clone(), host);
    }
    outcome
}
