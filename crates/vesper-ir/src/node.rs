//! IR node kinds
//!
//! The tree-shaped mid-level IR the lowering pipeline consumes and produces.
//! The set of node kinds is closed: passes match on it exhaustively, and an
//! unhandled shape is an internal error, never a silent fallthrough.
//!
//! Nodes carry an identity (`NodeId`) assigned by the [`NodeFactory`]; passes
//! that need per-node bookkeeping (the suspendable set, loop bounds) key it on
//! that id rather than on structure.
//!
//! [`NodeFactory`]: crate::NodeFactory

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Node identity within one function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Variable identifier (locals and compiler temporaries alike).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VarId(pub u32);

impl VarId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A persistent machine slot, assigned by live-local promotion.
///
/// Variables live across a suspension point are rewritten to slot accesses so
/// their values survive while the machine is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SlotId(pub u32);

impl SlotId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Symbolic reference to a state in the builder's arena, before the resolver
/// assigns dense integer ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StateRef(pub u32);

impl StateRef {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for StateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// Dispatch target of a synthetic state-machine node.
///
/// Symbolic while the graph is under construction; the resolver rewrites every
/// occurrence to the dense integer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DispatchTarget {
    /// Arena reference, pre-resolution.
    State(StateRef),
    /// Dense integer id, post-resolution.
    Resolved(u32),
}

impl std::fmt::Display for DispatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchTarget::State(s) => write!(f, "{}", s),
            DispatchTarget::Resolved(id) => write!(f, "#{}", id),
        }
    }
}

/// Static types of the closed type universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Ty {
    /// The unit type; statements and value-less constructs.
    Unit,
    Bool,
    Int,
    Str,
    /// Top type; the pending-exception cell and catch-all filters.
    Any,
    /// Bottom type; `break`, `continue`, `return`, `throw`.
    Nothing,
}

impl std::fmt::Display for Ty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Ty::Unit => "unit",
            Ty::Bool => "bool",
            Ty::Int => "int",
            Ty::Str => "str",
            Ty::Any => "any",
            Ty::Nothing => "nothing",
        };
        write!(f, "{}", s)
    }
}

/// Runtime values.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
    /// The suspended sentinel a suspension call yields when it parks the
    /// machine instead of completing synchronously.
    Suspended,
}

impl Value {
    /// The runtime type of this value, as used by catch-clause type tests.
    pub fn ty(&self) -> Ty {
        match self {
            Value::Unit => Ty::Unit,
            Value::Bool(_) => Ty::Bool,
            Value::Int(_) => Ty::Int,
            Value::Str(_) => Ty::Str,
            Value::Suspended => Ty::Any,
        }
    }

    pub fn is_truthy(&self) -> bool {
        matches!(self, Value::Bool(true))
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Unit => write!(f, "unit"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Suspended => write!(f, "<suspended>"),
        }
    }
}

/// Reference to a callee, resolved by an upstream phase.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FuncRef {
    pub name: String,
}

impl FuncRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl std::fmt::Display for FuncRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Equal,
    NotEqual,
    Less,
    Greater,
    Concat,
}

impl BinaryOp {
    /// Result type of the operator.
    pub fn result_ty(&self) -> Ty {
        match self {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => Ty::Int,
            BinaryOp::Equal | BinaryOp::NotEqual | BinaryOp::Less | BinaryOp::Greater => Ty::Bool,
            BinaryOp::Concat => Ty::Str,
        }
    }
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::Greater => ">",
            BinaryOp::Concat => "++",
        };
        write!(f, "{}", s)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum UnaryOp {
    Neg,
    Not,
}

impl std::fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
        };
        write!(f, "{}", s)
    }
}

/// One `catch` clause of a [`NodeKind::Try`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CatchClause {
    /// The caught-exception binding.
    pub var: VarId,
    /// Runtime type filter; `Ty::Any` is a catch-all.
    pub filter: Ty,
    pub body: Node,
}

/// An IR node: identity, static type, and kind.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Node {
    pub id: NodeId,
    pub ty: Ty,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_composite(&self) -> bool {
        matches!(self.kind, NodeKind::Composite(_))
    }

    /// Splice a composite into its statements; any other node is a single
    /// statement.
    pub fn into_statements(self) -> Vec<Node> {
        match self.kind {
            NodeKind::Composite(stmts) => stmts,
            _ => vec![self],
        }
    }
}

/// The closed node-kind set.
///
/// The first group is the source-level surface handed to the pipeline by the
/// type checker; the trailing group is synthetic kinds only the lowering
/// introduces.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NodeKind {
    Literal(Value),
    GetVar(VarId),
    SetVar {
        var: VarId,
        value: Box<Node>,
    },
    VarDecl {
        var: VarId,
        var_ty: Ty,
        init: Option<Box<Node>>,
    },
    /// A call; `suspending` is trusted input classification, not re-derived.
    Call {
        func: FuncRef,
        args: Vec<Node>,
        suspending: bool,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    If {
        cond: Box<Node>,
        then_branch: Box<Node>,
        else_branch: Option<Box<Node>>,
    },
    /// A scope block. As an expression its value is the trailing statement's.
    Block(Vec<Node>),
    /// A transparent statement sequence; callers splice it into their own
    /// statement stream. The trailing statement is the value.
    Composite(Vec<Node>),
    /// Pre-test loop.
    While {
        cond: Box<Node>,
        body: Box<Node>,
    },
    /// Post-test loop.
    DoWhile {
        body: Box<Node>,
        cond: Box<Node>,
    },
    /// `break`, targeting the loop with the given node identity.
    Break {
        loop_id: NodeId,
    },
    /// `continue`, targeting the loop with the given node identity.
    Continue {
        loop_id: NodeId,
    },
    Return {
        value: Box<Node>,
    },
    Throw {
        value: Box<Node>,
    },
    Try {
        body: Box<Node>,
        catches: Vec<CatchClause>,
        finally: Option<Box<Node>>,
    },
    /// Runtime type test, used by lowered catch dispatch.
    TypeTest {
        value: Box<Node>,
        test: Ty,
    },
    /// Trailing value of a decomposed diverging expression; never executed.
    Unreachable,

    // ===== Synthetic kinds introduced by the lowering =====
    /// A state id as a value. Resolved to an integer literal-like form by the
    /// dispatch resolver.
    DispatchPoint(DispatchTarget),
    /// Write the machine's state selector. `target` evaluates to a state id
    /// (a `DispatchPoint` or a completion-target variable read).
    SetState {
        target: Box<Node>,
    },
    /// Write the machine's current exception-region selector.
    SetExceptionState {
        target: Box<Node>,
    },
    /// Jump to the top of the trampoline: re-dispatch on the state selector.
    Dispatch,
    /// Leave the machine, reporting the suspended sentinel to the caller.
    Suspend,
    /// Read the machine's pending-exception cell.
    GetPendingException,
    /// Read a persistent machine slot.
    GetSlot(SlotId),
    /// Write a persistent machine slot.
    SetSlot {
        slot: SlotId,
        value: Box<Node>,
    },
}
