//! Expression trees over device vectors
//!
//! Arithmetic on `&DeviceVector<T>`, scalars and other expressions builds an
//! [`Expr`] instead of computing anything. Assigning the tree to a vector
//! compiles it into one fused kernel.
//!
//! ```rust
//! use manifold_core::{expr::sqrt, Context, DeviceVector};
//!
//! # fn main() -> manifold_core::Result<()> {
//! let contexts = vec![Context::cpu()];
//! let x = DeviceVector::from_slice(&contexts, &[1.0f32, 4.0, 9.0])?;
//! let y = DeviceVector::from_slice(&contexts, &[1.0f32, 1.0, 1.0])?;
//! let z = DeviceVector::new(&contexts, 3)?;
//!
//! let e = sqrt(&x) + 2.0 * &y;
//! assert_eq!(e.shape().as_str(), "float_add_sqrt_v_mul_c_v");
//! z.assign(e)?;
//! assert_eq!(z.to_vec()?, vec![3.0, 4.0, 5.0]);
//! # Ok(())
//! # }
//! ```
//!
//! Terminals borrow their vectors, so a tree cannot outlive its operands.

use std::collections::hash_map::DefaultHasher;
use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Add, BitAnd, BitOr, BitXor, Div, Mul, Neg, Not, Rem, Shl, Shr, Sub};

use crate::error::{Error, Result};
use crate::scalar::Scalar;
use crate::spmat::SpMat;
use crate::vector::DeviceVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    /// Bitwise complement; integer element types only.
    BitNot,
}

impl UnaryOp {
    fn token(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::BitNot => "not",
        }
    }

    pub(crate) fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::BitNot => "~",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinaryOp {
    fn token(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Rem => "rem",
            BinaryOp::BitAnd => "and",
            BinaryOp::BitOr => "or",
            BinaryOp::BitXor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::Shr => "shr",
        }
    }

    pub(crate) fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        }
    }

    pub(crate) fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr
        )
    }
}

/// Math builtins of the kernel language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
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
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Sqrt => "sqrt",
            Builtin::Exp => "exp",
            Builtin::Log => "log",
            Builtin::Sin => "sin",
            Builtin::Cos => "cos",
            Builtin::Tan => "tan",
            Builtin::Fabs => "fabs",
            Builtin::Floor => "floor",
            Builtin::Ceil => "ceil",
            Builtin::Tanh => "tanh",
            Builtin::Pow => "pow",
            Builtin::Fmin => "fmin",
            Builtin::Fmax => "fmax",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::Pow | Builtin::Fmin | Builtin::Fmax => 2,
            _ => 1,
        }
    }
}

/// A function written in kernel source, callable inside expressions.
///
/// ```rust
/// use manifold_core::expr::UserFunction;
///
/// let axpy = UserFunction::<f64>::new("axpy", &["a", "x", "y"], "return a * x + y;").unwrap();
/// assert_eq!(axpy.arity(), 3);
/// assert!(axpy.declaration().starts_with("double axpy(double a, double x, double y)"));
/// ```
#[derive(Debug, Clone)]
pub struct UserFunction<T: Scalar> {
    name: String,
    params: Vec<String>,
    body: String,
    /// Hash of the declaration; part of the shape so two bodies under one
    /// name never share a cache entry.
    digest: u64,
    _marker: PhantomData<T>,
}

impl<T: Scalar> UserFunction<T> {
    pub fn new(name: &str, params: &[&str], body: &str) -> Result<Self> {
        for ident in std::iter::once(&name).chain(params) {
            if !is_identifier(ident) {
                return Err(Error::InvalidOperation(format!("'{ident}' is not a valid identifier")));
            }
        }
        let mut function = Self {
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            body: body.trim().to_string(),
            digest: 0,
            _marker: PhantomData,
        };
        let mut hasher = DefaultHasher::new();
        function.declaration().hash(&mut hasher);
        function.digest = hasher.finish();
        Ok(function)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Full definition as emitted into kernel source.
    pub fn declaration(&self) -> String {
        let ty = T::cl_name();
        let params: Vec<String> = self.params.iter().map(|p| format!("{ty} {p}")).collect();
        format!("{ty} {}({})\n{{\n    {}\n}}\n", self.name, params.join(", "), self.body)
    }

    /// Call node with `args`, one per parameter.
    pub fn call<'a, A>(&'a self, args: impl IntoIterator<Item = A>) -> Expr<'a, T>
    where
        A: Into<Expr<'a, T>>,
    {
        Expr::Call(self, args.into_iter().map(Into::into).collect())
    }

    pub(crate) fn digest(&self) -> u64 {
        self.digest
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Expression tree node.
#[derive(Debug, Clone)]
pub enum Expr<'a, T: Scalar> {
    Vector(&'a DeviceVector<T>),
    Constant(T),
    /// Sparse matrix times vector; only valid at the top of an assignment.
    SpMv(&'a SpMat<T>, &'a DeviceVector<T>),
    Unary(UnaryOp, Box<Expr<'a, T>>),
    Binary(BinaryOp, Box<Expr<'a, T>>, Box<Expr<'a, T>>),
    Builtin(Builtin, Vec<Expr<'a, T>>),
    Call(&'a UserFunction<T>, Vec<Expr<'a, T>>),
}

/// A leaf that becomes a kernel parameter.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Terminal<'a, T: Scalar> {
    Vector(&'a DeviceVector<T>),
    Constant(T),
}

impl<'a, T: Scalar> Expr<'a, T> {
    pub fn vector(v: &'a DeviceVector<T>) -> Self {
        Expr::Vector(v)
    }

    pub fn constant(value: T) -> Self {
        Expr::Constant(value)
    }

    pub fn unary(op: UnaryOp, operand: impl Into<Self>) -> Self {
        Expr::Unary(op, Box::new(operand.into()))
    }

    /// Binary node; the way to reach the bitwise and shift operators.
    pub fn binary(op: BinaryOp, lhs: impl Into<Self>, rhs: impl Into<Self>) -> Self {
        Expr::Binary(op, Box::new(lhs.into()), Box::new(rhs.into()))
    }

    pub fn builtin(function: Builtin, args: Vec<Self>) -> Self {
        Expr::Builtin(function, args)
    }

    /// Structural signature: operators, terminal kinds and element type.
    pub fn shape(&self) -> Shape {
        let mut encoded = String::from(T::cl_name());
        self.encode(&mut encoded);
        Shape(encoded)
    }

    fn encode(&self, out: &mut String) {
        out.push('_');
        match self {
            Expr::Vector(_) => out.push('v'),
            Expr::Constant(_) => out.push('c'),
            Expr::SpMv(..) => out.push_str("spmv"),
            Expr::Unary(op, operand) => {
                out.push_str(op.token());
                operand.encode(out);
            }
            Expr::Binary(op, lhs, rhs) => {
                out.push_str(op.token());
                lhs.encode(out);
                rhs.encode(out);
            }
            Expr::Builtin(function, args) => {
                out.push_str(function.name());
                args.iter().for_each(|arg| arg.encode(out));
            }
            Expr::Call(function, args) => {
                // Length-prefixed name, argument count, declaration digest.
                let _ = write!(
                    out,
                    "u{}{}{}x{:016x}",
                    function.name().len(),
                    function.name(),
                    args.len(),
                    function.digest()
                );
                args.iter().for_each(|arg| arg.encode(out));
            }
        }
    }

    /// Vector and constant leaves in kernel parameter order.
    pub(crate) fn terminals(&self) -> Vec<Terminal<'a, T>> {
        let mut out = Vec::new();
        self.collect_terminals(&mut out);
        out
    }

    fn collect_terminals(&self, out: &mut Vec<Terminal<'a, T>>) {
        match self {
            Expr::Vector(v) => out.push(Terminal::Vector(v)),
            Expr::Constant(c) => out.push(Terminal::Constant(*c)),
            Expr::SpMv(..) => {}
            Expr::Unary(_, operand) => operand.collect_terminals(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_terminals(out);
                rhs.collect_terminals(out);
            }
            Expr::Builtin(_, args) | Expr::Call(_, args) => args.iter().for_each(|arg| arg.collect_terminals(out)),
        }
    }

    /// Every vector leaf, in parameter order.
    pub(crate) fn vectors(&self) -> Vec<&'a DeviceVector<T>> {
        self.terminals()
            .into_iter()
            .filter_map(|t| match t {
                Terminal::Vector(v) => Some(v),
                Terminal::Constant(_) => None,
            })
            .collect()
    }

    /// True if `v` is read anywhere in the tree, including as a product operand.
    pub(crate) fn references(&self, v: &DeviceVector<T>) -> bool {
        match self {
            Expr::Vector(x) => std::ptr::eq(*x, v),
            Expr::Constant(_) => false,
            Expr::SpMv(_, x) => std::ptr::eq(*x, v),
            Expr::Unary(_, operand) => operand.references(v),
            Expr::Binary(_, lhs, rhs) => lhs.references(v) || rhs.references(v),
            Expr::Builtin(_, args) | Expr::Call(_, args) => args.iter().any(|arg| arg.references(v)),
        }
    }

    pub(crate) fn contains_spmv(&self) -> bool {
        match self {
            Expr::SpMv(..) => true,
            Expr::Vector(_) | Expr::Constant(_) => false,
            Expr::Unary(_, operand) => operand.contains_spmv(),
            Expr::Binary(_, lhs, rhs) => lhs.contains_spmv() || rhs.contains_spmv(),
            Expr::Builtin(_, args) | Expr::Call(_, args) => args.iter().any(Expr::contains_spmv),
        }
    }
}

/// Structural signature of an expression or a fixed kernel.
///
/// Tokens are joined with `_`, operators precede their operands and every
/// token has a fixed arity, so distinct trees never share an encoding. The
/// encoding doubles as the tail of the kernel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Shape(String);

impl Shape {
    pub(crate) fn new(encoded: String) -> Self {
        Shape(encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'a, T: Scalar> From<&'a DeviceVector<T>> for Expr<'a, T> {
    fn from(v: &'a DeviceVector<T>) -> Self {
        Expr::Vector(v)
    }
}

impl<'a, T: Scalar> From<T> for Expr<'a, T> {
    fn from(value: T) -> Self {
        Expr::Constant(value)
    }
}

macro_rules! binary_operator {
    ($trait:ident, $method:ident, $op:ident) => {
        impl<'a, T: Scalar> $trait<Expr<'a, T>> for Expr<'a, T> {
            type Output = Expr<'a, T>;
            fn $method(self, rhs: Expr<'a, T>) -> Expr<'a, T> {
                Expr::binary(BinaryOp::$op, self, rhs)
            }
        }

        impl<'a, T: Scalar> $trait<&'a DeviceVector<T>> for Expr<'a, T> {
            type Output = Expr<'a, T>;
            fn $method(self, rhs: &'a DeviceVector<T>) -> Expr<'a, T> {
                Expr::binary(BinaryOp::$op, self, rhs)
            }
        }

        impl<'a, T: Scalar> $trait<T> for Expr<'a, T> {
            type Output = Expr<'a, T>;
            fn $method(self, rhs: T) -> Expr<'a, T> {
                Expr::binary(BinaryOp::$op, self, rhs)
            }
        }

        impl<'a, T: Scalar> $trait<Expr<'a, T>> for &'a DeviceVector<T> {
            type Output = Expr<'a, T>;
            fn $method(self, rhs: Expr<'a, T>) -> Expr<'a, T> {
                Expr::binary(BinaryOp::$op, self, rhs)
            }
        }

        impl<'a, T: Scalar> $trait<&'a DeviceVector<T>> for &'a DeviceVector<T> {
            type Output = Expr<'a, T>;
            fn $method(self, rhs: &'a DeviceVector<T>) -> Expr<'a, T> {
                Expr::binary(BinaryOp::$op, self, rhs)
            }
        }

        impl<'a, T: Scalar> $trait<T> for &'a DeviceVector<T> {
            type Output = Expr<'a, T>;
            fn $method(self, rhs: T) -> Expr<'a, T> {
                Expr::binary(BinaryOp::$op, self, rhs)
            }
        }
    };
}

/// Scalar on the left needs one impl per concrete type.
macro_rules! scalar_lhs_operator {
    ($trait:ident, $method:ident, $op:ident; $($ty:ty),+) => {$(
        impl<'a> $trait<&'a DeviceVector<$ty>> for $ty {
            type Output = Expr<'a, $ty>;
            fn $method(self, rhs: &'a DeviceVector<$ty>) -> Expr<'a, $ty> {
                Expr::binary(BinaryOp::$op, self, rhs)
            }
        }

        impl<'a> $trait<Expr<'a, $ty>> for $ty {
            type Output = Expr<'a, $ty>;
            fn $method(self, rhs: Expr<'a, $ty>) -> Expr<'a, $ty> {
                Expr::binary(BinaryOp::$op, self, rhs)
            }
        }
    )+};
}

binary_operator!(Add, add, Add);
binary_operator!(Sub, sub, Sub);
binary_operator!(Mul, mul, Mul);
binary_operator!(Div, div, Div);
binary_operator!(Rem, rem, Rem);
binary_operator!(BitAnd, bitand, BitAnd);
binary_operator!(BitOr, bitor, BitOr);
binary_operator!(BitXor, bitxor, BitXor);
binary_operator!(Shl, shl, Shl);
binary_operator!(Shr, shr, Shr);

scalar_lhs_operator!(Add, add, Add; f32, f64, i32, u32, i64, u64);
scalar_lhs_operator!(Sub, sub, Sub; f32, f64, i32, u32, i64, u64);
scalar_lhs_operator!(Mul, mul, Mul; f32, f64, i32, u32, i64, u64);
scalar_lhs_operator!(Div, div, Div; f32, f64, i32, u32, i64, u64);
scalar_lhs_operator!(Rem, rem, Rem; f32, f64, i32, u32, i64, u64);

impl<'a, T: Scalar> Neg for Expr<'a, T> {
    type Output = Expr<'a, T>;
    fn neg(self) -> Expr<'a, T> {
        Expr::unary(UnaryOp::Neg, self)
    }
}

impl<'a, T: Scalar> Neg for &'a DeviceVector<T> {
    type Output = Expr<'a, T>;
    fn neg(self) -> Expr<'a, T> {
        Expr::unary(UnaryOp::Neg, self)
    }
}

impl<'a, T: Scalar> Not for Expr<'a, T> {
    type Output = Expr<'a, T>;
    fn not(self) -> Expr<'a, T> {
        Expr::unary(UnaryOp::BitNot, self)
    }
}

impl<'a, T: Scalar> Not for &'a DeviceVector<T> {
    type Output = Expr<'a, T>;
    fn not(self) -> Expr<'a, T> {
        Expr::unary(UnaryOp::BitNot, self)
    }
}

macro_rules! unary_builtins {
    ($($name:ident => $builtin:ident),+ $(,)?) => {$(
        pub fn $name<'a, T: Scalar>(x: impl Into<Expr<'a, T>>) -> Expr<'a, T> {
            Expr::Builtin(Builtin::$builtin, vec![x.into()])
        }
    )+};
}

macro_rules! binary_builtins {
    ($($name:ident => $builtin:ident),+ $(,)?) => {$(
        pub fn $name<'a, T: Scalar>(x: impl Into<Expr<'a, T>>, y: impl Into<Expr<'a, T>>) -> Expr<'a, T> {
            Expr::Builtin(Builtin::$builtin, vec![x.into(), y.into()])
        }
    )+};
}

unary_builtins! {
    sqrt => Sqrt,
    exp => Exp,
    log => Log,
    sin => Sin,
    cos => Cos,
    tan => Tan,
    fabs => Fabs,
    floor => Floor,
    ceil => Ceil,
    tanh => Tanh,
}

binary_builtins! {
    pow => Pow,
    fmin => Fmin,
    fmax => Fmax,
}
