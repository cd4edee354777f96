//! Kernel source generation
//!
//! One traversal of the tree emits the expression text and, in the same
//! depth-first order, one parameter per vector or constant leaf. The
//! dispatcher binds arguments from [`Expr::terminals`], which walks the tree
//! in that same order.

use std::fmt::Write as _;

use crate::error::{Error, Result};
use crate::expr::{BinaryOp, Expr, Shape, UnaryOp, UserFunction};
use crate::reduce::ReduceOp;
use crate::scalar::Scalar;

/// Generated kernel: entry point name plus complete source.
#[derive(Debug, Clone)]
pub(crate) struct KernelSource {
    pub name: String,
    pub source: String,
}

struct Emitter<'e, T: Scalar> {
    params: Vec<String>,
    functions: Vec<&'e UserFunction<T>>,
}

impl<'e, T: Scalar> Emitter<'e, T> {
    fn new() -> Self {
        Self {
            params: Vec::new(),
            functions: Vec::new(),
        }
    }

    fn param(&mut self, declaration: String) -> String {
        let name = format!("prm_{}", self.params.len() + 1);
        self.params.push(format!("{declaration} {name}"));
        name
    }

    fn emit(&mut self, expr: &'e Expr<'_, T>) -> Result<String> {
        let ty = T::cl_name();
        match expr {
            Expr::Vector(_) => {
                let name = self.param(format!("global {ty} *"));
                Ok(format!("{name}[idx]"))
            }
            Expr::Constant(_) => Ok(self.param(ty.to_string())),
            Expr::SpMv(..) => Err(Error::unsupported(
                "a sparse matrix-vector product can only be the whole right-hand side, \
                 or one side of a top-level sum or difference",
            )),
            Expr::Unary(op, operand) => {
                if *op == UnaryOp::BitNot && T::is_float() {
                    return Err(Error::unsupported(format!("bitwise complement of {ty}")));
                }
                let operand = self.emit(operand)?;
                Ok(format!("({}{operand})", op.symbol()))
            }
            Expr::Binary(op, lhs, rhs) => {
                if op.is_bitwise() && T::is_float() {
                    return Err(Error::unsupported(format!("operator '{}' on {ty}", op.symbol())));
                }
                let lhs = self.emit(lhs)?;
                let rhs = self.emit(rhs)?;
                if *op == BinaryOp::Rem && T::is_float() {
                    Ok(format!("fmod({lhs}, {rhs})"))
                } else {
                    Ok(format!("({lhs} {} {rhs})", op.symbol()))
                }
            }
            Expr::Builtin(function, args) => {
                if args.len() != function.arity() {
                    return Err(Error::unsupported(format!(
                        "{} takes {} arguments, {} given",
                        function.name(),
                        function.arity(),
                        args.len()
                    )));
                }
                let args = self.emit_all(args)?;
                Ok(format!("{}({args})", function.name()))
            }
            Expr::Call(function, args) => {
                if args.len() != function.arity() {
                    return Err(Error::unsupported(format!(
                        "{} takes {} arguments, {} given",
                        function.name(),
                        function.arity(),
                        args.len()
                    )));
                }
                self.declare(function)?;
                let args = self.emit_all(args)?;
                Ok(format!("{}({args})", function.name()))
            }
        }
    }

    fn emit_all(&mut self, args: &'e [Expr<'_, T>]) -> Result<String> {
        let args = args.iter().map(|arg| self.emit(arg)).collect::<Result<Vec<_>>>()?;
        Ok(args.join(", "))
    }

    fn declare(&mut self, function: &'e UserFunction<T>) -> Result<()> {
        match self.functions.iter().find(|f| f.name() == function.name()) {
            Some(known) if known.digest() == function.digest() => Ok(()),
            Some(_) => Err(Error::unsupported(format!(
                "two different definitions of function '{}'",
                function.name()
            ))),
            None => {
                self.functions.push(function);
                Ok(())
            }
        }
    }

    /// Pragmas and helper functions that precede the kernel.
    fn preamble(&self) -> String {
        let mut out = String::new();
        if T::TYPE == manifold_backends::ScalarType::F64 {
            out.push_str("#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n");
        }
        for function in &self.functions {
            out.push_str(&function.declaration());
        }
        out
    }

    fn signature(&self, name: &str, output: &str) -> String {
        let ty = T::cl_name();
        let mut params = vec!["ulong n".to_string(), format!("global {ty} *{output}")];
        params.extend(self.params.iter().cloned());
        format!("kernel void {name}(\n    {}\n)\n", params.join(",\n    "))
    }
}

/// `res[idx] = expr` over a grid-strided loop.
pub(crate) fn expression_kernel<T: Scalar>(expr: &Expr<'_, T>, shape: &Shape) -> Result<KernelSource> {
    let name = format!("vexpr_{shape}");
    let mut emitter = Emitter::new();
    let body = emitter.emit(expr)?;

    let mut source = emitter.preamble();
    source.push_str(&emitter.signature(&name, "res"));
    let _ = write!(
        source,
        "{{\n    for(size_t idx = get_global_id(0); idx < n; idx += get_global_size(0)) {{\n        res[idx] = {body};\n    }}\n}}\n"
    );
    Ok(KernelSource { name, source })
}

/// Per-work-item fold of `expr` into `partial[get_global_id(0)]`.
///
/// Work-items past the end of the data write the identity.
pub(crate) fn reduction_kernel<T: Scalar>(expr: &Expr<'_, T>, op: ReduceOp, shape: &Shape) -> Result<KernelSource> {
    let name = shape.to_string();
    let mut emitter = Emitter::new();
    let value = emitter.emit(expr)?;
    let ty = T::cl_name();

    let mut source = emitter.preamble();
    source.push_str(&emitter.signature(&name, "partial"));
    let _ = write!(
        source,
        "{{\n    {ty} acc = {};\n    for(size_t idx = get_global_id(0); idx < n; idx += get_global_size(0)) {{\n        acc = {};\n    }}\n    partial[get_global_id(0)] = acc;\n}}\n",
        op.identity_literal::<T>(),
        op.combine_source("acc", &value)
    );
    Ok(KernelSource { name, source })
}

/// CSR row-per-work-item product: `y = alpha * A * x`, or `y += ...` with `append`.
pub(crate) fn spmv_kernel<T: Scalar>(shape: &Shape) -> KernelSource {
    let ty = T::cl_name();
    let name = shape.to_string();
    let mut source = String::new();
    if T::TYPE == manifold_backends::ScalarType::F64 {
        source.push_str("#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n");
    }
    let _ = write!(
        source,
        "kernel void {name}(
    ulong n,
    {ty} alpha,
    int append,
    global const ulong *row,
    global const ulong *col,
    global const {ty} *val,
    global const {ty} *x,
    global {ty} *y
)
{{
    for(size_t i = get_global_id(0); i < n; i += get_global_size(0)) {{
        {ty} sum = 0;
        for(size_t j = row[i], e = row[i + 1]; j < e; j++) {{
            sum += val[j] * x[col[j]];
        }}
        if (append) y[i] += alpha * sum;
        else y[i] = alpha * sum;
    }}
}}
"
    );
    KernelSource { name, source }
}
