//! Resolved syntax tree.
//!
//! Names are resolved while parsing: locals become frame slots, calls point
//! at a builtin or at a function index, and every store carries the type it
//! converts to.

use crate::backend::ScalarType;

use super::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Scalar(ScalarType),
    Pointer(ScalarType),
}

#[derive(Debug)]
pub struct Program {
    pub functions: Vec<Function>,
}

impl Program {
    /// Index of the `kernel` entry point called `name`.
    pub fn kernel(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.is_kernel && f.name == name)
    }

    pub fn function(&self, index: usize) -> &Function {
        &self.functions[index]
    }

    pub fn kernel_names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().filter(|f| f.is_kernel).map(|f| f.name.as_str())
    }
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub is_kernel: bool,
    pub ret: Option<ScalarType>,
    pub params: Vec<VarType>,
    /// Slots needed by parameters and every local declared in the body.
    pub frame_size: usize,
    pub body: Vec<Stmt>,
}

#[derive(Debug)]
pub enum Stmt {
    Decl(Vec<(usize, ScalarType, Option<Expr>)>),
    Expr(Expr),
    Block(Vec<Stmt>),
    If {
        cond: Expr,
        then: Box<Stmt>,
        otherwise: Option<Box<Stmt>>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    Return(Option<Expr>),
    Break,
    Continue,
}

#[derive(Debug)]
pub enum Place {
    Local { slot: usize, ty: ScalarType },
    Element { slot: usize, elem: ScalarType, index: Box<Expr> },
}

#[derive(Debug)]
pub enum Expr {
    Const(Value),
    Local(usize),
    Index {
        slot: usize,
        elem: ScalarType,
        index: Box<Expr>,
    },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Cast(ScalarType, Box<Expr>),
    Assign {
        target: Place,
        op: Option<BinaryOp>,
        value: Box<Expr>,
    },
    Step {
        target: Place,
        delta: i32,
        prefix: bool,
    },
    Call {
        callee: Callee,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    Builtin(Builtin),
    Function(usize),
}

/// Work-item queries and math functions known to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    GlobalId,
    GlobalSize,
    LocalId,
    LocalSize,
    GroupId,
    NumGroups,
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Fabs,
    Floor,
    Ceil,
    Tanh,
    Pow,
    Fmin,
    Fmax,
    Fmod,
    Min,
    Max,
    Abs,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "get_global_id" => Builtin::GlobalId,
            "get_global_size" => Builtin::GlobalSize,
            "get_local_id" => Builtin::LocalId,
            "get_local_size" => Builtin::LocalSize,
            "get_group_id" => Builtin::GroupId,
            "get_num_groups" => Builtin::NumGroups,
            "sqrt" => Builtin::Sqrt,
            "exp" => Builtin::Exp,
            "log" => Builtin::Log,
            "sin" => Builtin::Sin,
            "cos" => Builtin::Cos,
            "tan" => Builtin::Tan,
            "fabs" => Builtin::Fabs,
            "floor" => Builtin::Floor,
            "ceil" => Builtin::Ceil,
            "tanh" => Builtin::Tanh,
            "pow" => Builtin::Pow,
            "fmin" => Builtin::Fmin,
            "fmax" => Builtin::Fmax,
            "fmod" => Builtin::Fmod,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "abs" => Builtin::Abs,
            _ => return None,
        })
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::Pow | Builtin::Fmin | Builtin::Fmax | Builtin::Fmod | Builtin::Min | Builtin::Max => 2,
            _ => 1,
        }
    }
}
