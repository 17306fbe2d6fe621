//! Lowered state graphs
//!
//! The output of the pipeline: a flat list of states whose bodies are plain
//! IR statement lists ending in a terminator, with all dispatch targets
//! resolved to dense integer ids.

use vesper_ir::{Node, PrettyPrint, SlotId, VarId};

/// One state of the machine. Its body runs top to bottom; the trailing
/// statement is always a terminator (`Dispatch`, `Suspend`, `Return`,
/// `Throw`, or `Unreachable`).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct State {
    pub body: Vec<Node>,
}

/// A resolved, executable state graph.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StateGraph {
    /// States indexed by their resolved id.
    pub states: Vec<State>,
    /// Resolved id of the entry state; always 0.
    pub entry: u32,
    /// Resolved id of the trap state. An exception with the exception-state
    /// selector pointing here has no handler in this function.
    pub trap: u32,
    /// The variable that receives a suspension call's result, and the resume
    /// value when the machine is woken.
    pub resume_var: VarId,
    /// Set once live-local promotion has moved `resume_var` into a slot.
    pub resume_slot: Option<SlotId>,
    /// Locals table size for the executor.
    pub var_count: usize,
    /// Slot table size; zero before promotion.
    pub slot_count: usize,
}

impl StateGraph {
    pub fn state_count(&self) -> usize {
        self.states.len()
    }
}

impl PrettyPrint for StateGraph {
    fn pretty_print(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        writeln!(
            out,
            "graph: {} states, entry #{}, trap #{}, {} slots",
            self.states.len(),
            self.entry,
            self.trap,
            self.slot_count
        )
        .unwrap();
        for (id, state) in self.states.iter().enumerate() {
            writeln!(out, "state #{}:", id).unwrap();
            for node in &state.body {
                for line in node.pretty_print().lines() {
                    writeln!(out, "  {}", line).unwrap();
                }
            }
        }
        out
    }
}
