//! Lowering errors

use thiserror::Error;
use vesper_ir::{NodeId, StateRef};

pub type LowerResult<T> = Result<T, LowerError>;

#[derive(Debug, Error)]
pub enum LowerError {
    #[error("Break targets unknown loop {loop_id}")]
    UnknownBreakTarget { loop_id: NodeId },

    #[error("Continue targets unknown loop {loop_id}")]
    UnknownContinueTarget { loop_id: NodeId },

    #[error("Dispatch point still symbolic after resolution: {state}")]
    UnresolvedDispatch { state: StateRef },

    #[error("Dispatch target {state} has no state in the graph")]
    DanglingStateRef { state: StateRef },

    #[error("State {index} does not end in a terminator")]
    MissingTerminator { index: usize },

    #[error("Synthetic node in unlowered body: {node}")]
    SyntheticInSource { node: NodeId },

    #[error("Internal lowering error: {message}")]
    Internal { message: String },
}
