//! Work-item interpreter.
//!
//! A launch runs the kernel body once per work-item of the grid, in order.
//! Buffer access goes through [`DeviceMemory`], which owns bounds checking.

use crate::backend::ScalarType;

use super::ast::{BinaryOp, Builtin, Callee, Expr, Function, Place, Program, Stmt, VarType};
use super::value::Value;

/// Failure while running a kernel; fails the launch that produced it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ExecError(String);

impl ExecError {
    pub fn new(message: impl Into<String>) -> Self {
        ExecError(message.into())
    }
}

type XResult<T> = Result<T, ExecError>;

/// Typed element access to device buffers.
pub trait DeviceMemory {
    fn load(&self, buffer: u64, elem: ScalarType, index: i64) -> XResult<Value>;
    fn store(&mut self, buffer: u64, elem: ScalarType, index: i64, value: Value) -> XResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
struct WorkItem {
    global_id: u64,
    global_size: u64,
    local_id: u64,
    local_size: u64,
    group_id: u64,
    num_groups: u64,
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Option<Value>),
}

struct Machine<'p, 'm, M> {
    program: &'p Program,
    memory: &'m mut M,
    item: WorkItem,
    depth: usize,
}

const MAX_CALL_DEPTH: usize = 256;

/// Run `kernel` over `global_size` work-items grouped by `local_size`.
///
/// `args` must already match the kernel's parameter list; pointer
/// parameters are passed as [`Value::Ptr`].
pub fn launch<M: DeviceMemory>(
    program: &Program,
    kernel: usize,
    args: &[Value],
    global_size: usize,
    local_size: usize,
    memory: &mut M,
) -> XResult<()> {
    let function = program.function(kernel);
    if args.len() != function.params.len() {
        return Err(ExecError::new(format!(
            "kernel '{}' takes {} arguments, {} given",
            function.name,
            function.params.len(),
            args.len()
        )));
    }
    if local_size == 0 {
        return Err(ExecError::new("local size must be positive"));
    }

    let mut frame = vec![Value::I32(0); function.frame_size];
    let mut machine = Machine {
        program,
        memory,
        item: WorkItem {
            global_size: global_size as u64,
            local_size: local_size as u64,
            num_groups: (global_size / local_size) as u64,
            ..WorkItem::default()
        },
        depth: 0,
    };

    for gid in 0..global_size as u64 {
        machine.item.global_id = gid;
        machine.item.local_id = gid % local_size as u64;
        machine.item.group_id = gid / local_size as u64;
        frame[..args.len()].copy_from_slice(args);
        machine.exec_block(&function.body, &mut frame)?;
    }
    Ok(())
}

impl<M: DeviceMemory> Machine<'_, '_, M> {
    fn exec_block(&mut self, stmts: &[Stmt], frame: &mut [Value]) -> XResult<Flow> {
        for stmt in stmts {
            match self.exec(stmt, frame)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, frame: &mut [Value]) -> XResult<Flow> {
        match stmt {
            Stmt::Decl(declarators) => {
                for (slot, ty, init) in declarators {
                    frame[*slot] = match init {
                        Some(expr) => self.eval(expr, frame)?.cast(*ty)?,
                        None => Value::zero(*ty),
                    };
                }
                Ok(Flow::Normal)
            }
            Stmt::Expr(expr) => {
                self.eval(expr, frame)?;
                Ok(Flow::Normal)
            }
            Stmt::Block(stmts) => self.exec_block(stmts, frame),
            Stmt::If { cond, then, otherwise } => {
                if self.eval(cond, frame)?.truthy()? {
                    self.exec(then, frame)
                } else if let Some(otherwise) = otherwise {
                    self.exec(otherwise, frame)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::For { init, cond, step, body } => {
                if let Some(init) = init {
                    self.exec(init, frame)?;
                }
                loop {
                    if let Some(cond) = cond {
                        if !self.eval(cond, frame)?.truthy()? {
                            break;
                        }
                    }
                    match self.exec(body, frame)? {
                        Flow::Break => break,
                        flow @ Flow::Return(_) => return Ok(flow),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if let Some(step) = step {
                        self.eval(step, frame)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::While { cond, body } => {
                while self.eval(cond, frame)?.truthy()? {
                    match self.exec(body, frame)? {
                        Flow::Break => break,
                        flow @ Flow::Return(_) => return Ok(flow),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => Some(self.eval(expr, frame)?),
                    None => None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
        }
    }

    fn pointer(&self, frame: &[Value], slot: usize) -> XResult<u64> {
        match frame[slot] {
            Value::Ptr { buffer, .. } => Ok(buffer),
            _ => Err(ExecError::new("subscripted value is not a buffer")),
        }
    }

    fn load(&mut self, place: &Place, frame: &mut [Value]) -> XResult<Value> {
        match place {
            Place::Local { slot, .. } => Ok(frame[*slot]),
            Place::Element { slot, elem, index } => {
                let index = self.eval(index, frame)?.as_i64()?;
                let buffer = self.pointer(frame, *slot)?;
                self.memory.load(buffer, *elem, index)
            }
        }
    }

    fn store(&mut self, place: &Place, frame: &mut [Value], value: Value, index: Option<i64>) -> XResult<Value> {
        match place {
            Place::Local { slot, ty } => {
                let value = value.cast(*ty)?;
                frame[*slot] = value;
                Ok(value)
            }
            Place::Element { slot, elem, index: expr } => {
                let index = match index {
                    Some(index) => index,
                    None => self.eval(expr, frame)?.as_i64()?,
                };
                let value = value.cast(*elem)?;
                let buffer = self.pointer(frame, *slot)?;
                self.memory.store(buffer, *elem, index, value)?;
                Ok(value)
            }
        }
    }

    /// Read-modify-write; the element index is evaluated once.
    fn update(
        &mut self,
        place: &Place,
        frame: &mut [Value],
        f: impl FnOnce(Value) -> XResult<Value>,
    ) -> XResult<(Value, Value)> {
        match place {
            Place::Local { slot, .. } => {
                let old = frame[*slot];
                let new = self.store(place, frame, f(old)?, None)?;
                Ok((old, new))
            }
            Place::Element { slot, elem, index } => {
                let index = self.eval(index, frame)?.as_i64()?;
                let buffer = self.pointer(frame, *slot)?;
                let old = self.memory.load(buffer, *elem, index)?;
                let new = self.store(place, frame, f(old)?, Some(index))?;
                Ok((old, new))
            }
        }
    }

    fn eval(&mut self, expr: &Expr, frame: &mut [Value]) -> XResult<Value> {
        match expr {
            Expr::Const(value) => Ok(*value),
            Expr::Local(slot) => Ok(frame[*slot]),
            Expr::Index { slot, elem, index } => {
                let index = self.eval(index, frame)?.as_i64()?;
                let buffer = self.pointer(frame, *slot)?;
                self.memory.load(buffer, *elem, index)
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand, frame)?;
                Value::unary(*op, value)
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs, frame)?;
                let rhs = self.eval(rhs, frame)?;
                Value::binary(*op, lhs, rhs)
            }
            Expr::And(lhs, rhs) => {
                let result = self.eval(lhs, frame)?.truthy()? && self.eval(rhs, frame)?.truthy()?;
                Ok(Value::I32(result as i32))
            }
            Expr::Or(lhs, rhs) => {
                let result = self.eval(lhs, frame)?.truthy()? || self.eval(rhs, frame)?.truthy()?;
                Ok(Value::I32(result as i32))
            }
            Expr::Ternary(cond, a, b) => {
                if self.eval(cond, frame)?.truthy()? {
                    self.eval(a, frame)
                } else {
                    self.eval(b, frame)
                }
            }
            Expr::Cast(ty, operand) => self.eval(operand, frame)?.cast(*ty),
            Expr::Assign { target, op: None, value } => {
                let value = self.eval(value, frame)?;
                self.store(target, frame, value, None)
            }
            Expr::Assign {
                target,
                op: Some(op),
                value,
            } => {
                let rhs = self.eval(value, frame)?;
                let (_, new) = self.update(target, frame, |old| Value::binary(*op, old, rhs))?;
                Ok(new)
            }
            Expr::Step { target, delta, prefix } => {
                let (old, new) = self.update(target, frame, |old| Value::binary(BinaryOp::Add, old, Value::I32(*delta)))?;
                Ok(if *prefix { new } else { old })
            }
            Expr::Call { callee, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, frame)?);
                }
                let program = self.program;
                match callee {
                    Callee::Builtin(builtin) => self.builtin(*builtin, &values),
                    Callee::Function(index) => self.call(program.function(*index), values),
                }
            }
        }
    }

    fn call(&mut self, function: &'_ Function, args: Vec<Value>) -> XResult<Value> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(ExecError::new(format!("call depth exceeded in '{}'", function.name)));
        }
        let mut frame = vec![Value::I32(0); function.frame_size];
        for (slot, (param, arg)) in function.params.iter().zip(args).enumerate() {
            frame[slot] = match param {
                VarType::Scalar(ty) => arg.cast(*ty)?,
                VarType::Pointer(_) => arg,
            };
        }

        self.depth += 1;
        let flow = self.exec_block(&function.body, &mut frame);
        self.depth -= 1;

        let returned = match flow? {
            Flow::Return(value) => value,
            _ => None,
        };
        match (function.ret, returned) {
            (Some(ty), Some(value)) => value.cast(ty),
            (Some(ty), None) => Ok(Value::zero(ty)),
            (None, _) => Ok(Value::I32(0)),
        }
    }

    fn builtin(&mut self, builtin: Builtin, args: &[Value]) -> XResult<Value> {
        let item = self.item;
        let dim = |args: &[Value]| -> XResult<bool> { Ok(args[0].as_i64()? == 0) };
        let query = |value: u64, fallback: u64| -> XResult<Value> {
            Ok(Value::U64(if dim(args)? { value } else { fallback }))
        };

        match builtin {
            Builtin::GlobalId => query(item.global_id, 0),
            Builtin::GlobalSize => query(item.global_size, 1),
            Builtin::LocalId => query(item.local_id, 0),
            Builtin::LocalSize => query(item.local_size, 1),
            Builtin::GroupId => query(item.group_id, 0),
            Builtin::NumGroups => query(item.num_groups, 1),
            Builtin::Sqrt => unary_math(args[0], f32::sqrt, f64::sqrt),
            Builtin::Exp => unary_math(args[0], f32::exp, f64::exp),
            Builtin::Log => unary_math(args[0], f32::ln, f64::ln),
            Builtin::Sin => unary_math(args[0], f32::sin, f64::sin),
            Builtin::Cos => unary_math(args[0], f32::cos, f64::cos),
            Builtin::Tan => unary_math(args[0], f32::tan, f64::tan),
            Builtin::Fabs => unary_math(args[0], f32::abs, f64::abs),
            Builtin::Floor => unary_math(args[0], f32::floor, f64::floor),
            Builtin::Ceil => unary_math(args[0], f32::ceil, f64::ceil),
            Builtin::Tanh => unary_math(args[0], f32::tanh, f64::tanh),
            Builtin::Pow => binary_math(args[0], args[1], f32::powf, f64::powf),
            Builtin::Fmin => binary_math(args[0], args[1], f32::min, f64::min),
            Builtin::Fmax => binary_math(args[0], args[1], f32::max, f64::max),
            Builtin::Fmod => binary_math(args[0], args[1], |a, b| a % b, |a, b| a % b),
            Builtin::Min => {
                let lt = Value::binary(BinaryOp::Lt, args[1], args[0])?.truthy()?;
                pick(args[0], args[1], lt)
            }
            Builtin::Max => {
                let gt = Value::binary(BinaryOp::Gt, args[1], args[0])?.truthy()?;
                pick(args[0], args[1], gt)
            }
            Builtin::Abs => match args[0] {
                Value::I32(x) => Ok(Value::U32(x.unsigned_abs())),
                Value::I64(x) => Ok(Value::U64(x.unsigned_abs())),
                value @ (Value::U32(_) | Value::U64(_)) => Ok(value),
                other => unary_math(other, f32::abs, f64::abs),
            },
        }
    }
}

/// Returns the second argument if `take_second`, converted to the common type.
fn pick(a: Value, b: Value, take_second: bool) -> XResult<Value> {
    let ty = match (a.scalar_type(), b.scalar_type()) {
        (Some(x), Some(y)) => super::value::common_type(x, y),
        _ => return Err(ExecError::new("pointer passed to min/max")),
    };
    if take_second {
        b.cast(ty)
    } else {
        a.cast(ty)
    }
}

fn unary_math(value: Value, single: fn(f32) -> f32, double: fn(f64) -> f64) -> XResult<Value> {
    match value {
        Value::F32(x) => Ok(Value::F32(single(x))),
        other => Ok(Value::F64(double(other.as_f64()?))),
    }
}

fn binary_math(a: Value, b: Value, single: fn(f32, f32) -> f32, double: fn(f64, f64) -> f64) -> XResult<Value> {
    match (a, b) {
        (Value::F32(x), Value::F32(y)) => Ok(Value::F32(single(x, y))),
        (a, b) => Ok(Value::F64(double(a.as_f64()?, b.as_f64()?))),
    }
}
