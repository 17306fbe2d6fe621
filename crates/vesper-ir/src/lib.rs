//! Vesper mid-level tree IR
//!
//! The tree representation that the lowering passes operate on: a closed set
//! of node kinds (source constructs plus the synthetic state-machine nodes
//! introduced during lowering), a per-function [`NodeFactory`] that allocates
//! node and variable identities, and a pretty printer for debugging.

pub mod factory;
pub mod node;
pub mod pretty;

pub use factory::{NodeFactory, VarInfo};
pub use node::{
    BinaryOp, CatchClause, DispatchTarget, FuncRef, Node, NodeId, NodeKind, SlotId, StateRef, Ty,
    UnaryOp, Value, VarId,
};
pub use pretty::PrettyPrint;
