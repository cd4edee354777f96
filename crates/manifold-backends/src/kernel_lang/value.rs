//! Runtime values and C arithmetic conversions.

use crate::backend::{ScalarType, ScalarValue};

use super::ast::{BinaryOp, UnaryOp};
use super::interp::ExecError;

/// A value held in a kernel local or produced by an expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    /// A `global T *` kernel parameter.
    Ptr { buffer: u64, elem: ScalarType },
}

macro_rules! convert {
    ($value:expr, $t:ty) => {
        match $value {
            Value::I32(x) => x as $t,
            Value::U32(x) => x as $t,
            Value::I64(x) => x as $t,
            Value::U64(x) => x as $t,
            Value::F32(x) => x as $t,
            Value::F64(x) => x as $t,
            Value::Ptr { .. } => return Err(ExecError::new("pointer used as a number")),
        }
    };
}

macro_rules! int_op {
    ($op:expr, $x:expr, $y:expr, $variant:ident) => {{
        let (x, y) = ($x, $y);
        Value::$variant(match $op {
            BinaryOp::Add => x.wrapping_add(y),
            BinaryOp::Sub => x.wrapping_sub(y),
            BinaryOp::Mul => x.wrapping_mul(y),
            BinaryOp::Div => {
                if y == 0 {
                    return Err(ExecError::new("integer division by zero"));
                }
                x.wrapping_div(y)
            }
            BinaryOp::Rem => {
                if y == 0 {
                    return Err(ExecError::new("integer remainder by zero"));
                }
                x.wrapping_rem(y)
            }
            BinaryOp::Shl => x.wrapping_shl(y as u32),
            BinaryOp::Shr => x.wrapping_shr(y as u32),
            BinaryOp::BitAnd => x & y,
            BinaryOp::BitOr => x | y,
            BinaryOp::BitXor => x ^ y,
            _ => unreachable!("comparisons are handled before arithmetic"),
        })
    }};
}

macro_rules! float_op {
    ($op:expr, $x:expr, $y:expr, $variant:ident) => {{
        let (x, y) = ($x, $y);
        Value::$variant(match $op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Rem => x % y,
            op => {
                return Err(ExecError::new(format!(
                    "invalid operands to '{}' (floating point)",
                    op.symbol()
                )))
            }
        })
    }};
}

fn rank(ty: ScalarType) -> u8 {
    match ty {
        ScalarType::I32 => 0,
        ScalarType::U32 => 1,
        ScalarType::I64 => 2,
        ScalarType::U64 => 3,
        ScalarType::F32 => 4,
        ScalarType::F64 => 5,
    }
}

/// Usual arithmetic conversions over the supported types.
pub(super) fn common_type(a: ScalarType, b: ScalarType) -> ScalarType {
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}

impl Value {
    pub fn zero(ty: ScalarType) -> Self {
        match ty {
            ScalarType::I32 => Value::I32(0),
            ScalarType::U32 => Value::U32(0),
            ScalarType::I64 => Value::I64(0),
            ScalarType::U64 => Value::U64(0),
            ScalarType::F32 => Value::F32(0.0),
            ScalarType::F64 => Value::F64(0.0),
        }
    }

    pub fn scalar_type(&self) -> Option<ScalarType> {
        match self {
            Value::I32(_) => Some(ScalarType::I32),
            Value::U32(_) => Some(ScalarType::U32),
            Value::I64(_) => Some(ScalarType::I64),
            Value::U64(_) => Some(ScalarType::U64),
            Value::F32(_) => Some(ScalarType::F32),
            Value::F64(_) => Some(ScalarType::F64),
            Value::Ptr { .. } => None,
        }
    }

    fn number_type(&self) -> Result<ScalarType, ExecError> {
        self.scalar_type()
            .ok_or_else(|| ExecError::new("pointer used as a number"))
    }

    pub fn as_f64(self) -> Result<f64, ExecError> {
        Ok(convert!(self, f64))
    }

    pub fn as_i64(self) -> Result<i64, ExecError> {
        Ok(convert!(self, i64))
    }

    pub fn cast(self, ty: ScalarType) -> Result<Value, ExecError> {
        Ok(match ty {
            ScalarType::I32 => Value::I32(convert!(self, i32)),
            ScalarType::U32 => Value::U32(convert!(self, u32)),
            ScalarType::I64 => Value::I64(convert!(self, i64)),
            ScalarType::U64 => Value::U64(convert!(self, u64)),
            ScalarType::F32 => Value::F32(convert!(self, f32)),
            ScalarType::F64 => Value::F64(convert!(self, f64)),
        })
    }

    pub fn truthy(self) -> Result<bool, ExecError> {
        Ok(match self {
            Value::I32(x) => x != 0,
            Value::U32(x) => x != 0,
            Value::I64(x) => x != 0,
            Value::U64(x) => x != 0,
            Value::F32(x) => x != 0.0,
            Value::F64(x) => x != 0.0,
            Value::Ptr { .. } => true,
        })
    }

    fn from_bool(b: bool) -> Value {
        Value::I32(b as i32)
    }

    pub fn unary(op: UnaryOp, value: Value) -> Result<Value, ExecError> {
        Ok(match (op, value) {
            (UnaryOp::Plus, v) => {
                v.number_type()?;
                v
            }
            (UnaryOp::Not, v) => Value::from_bool(!v.truthy()?),
            (UnaryOp::Neg, Value::I32(x)) => Value::I32(x.wrapping_neg()),
            (UnaryOp::Neg, Value::U32(x)) => Value::U32(x.wrapping_neg()),
            (UnaryOp::Neg, Value::I64(x)) => Value::I64(x.wrapping_neg()),
            (UnaryOp::Neg, Value::U64(x)) => Value::U64(x.wrapping_neg()),
            (UnaryOp::Neg, Value::F32(x)) => Value::F32(-x),
            (UnaryOp::Neg, Value::F64(x)) => Value::F64(-x),
            (UnaryOp::BitNot, Value::I32(x)) => Value::I32(!x),
            (UnaryOp::BitNot, Value::U32(x)) => Value::U32(!x),
            (UnaryOp::BitNot, Value::I64(x)) => Value::I64(!x),
            (UnaryOp::BitNot, Value::U64(x)) => Value::U64(!x),
            (UnaryOp::BitNot, _) => return Err(ExecError::new("invalid operand to '~'")),
            (UnaryOp::Neg, Value::Ptr { .. }) => return Err(ExecError::new("invalid operand to unary '-'")),
        })
    }

    pub fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExecError> {
        let ty = common_type(lhs.number_type()?, rhs.number_type()?);
        let (lhs, rhs) = (lhs.cast(ty)?, rhs.cast(ty)?);

        if op.is_comparison() {
            let ordering = match (lhs, rhs) {
                (Value::I32(x), Value::I32(y)) => x.partial_cmp(&y),
                (Value::U32(x), Value::U32(y)) => x.partial_cmp(&y),
                (Value::I64(x), Value::I64(y)) => x.partial_cmp(&y),
                (Value::U64(x), Value::U64(y)) => x.partial_cmp(&y),
                (Value::F32(x), Value::F32(y)) => x.partial_cmp(&y),
                (Value::F64(x), Value::F64(y)) => x.partial_cmp(&y),
                _ => unreachable!("operands share a numeric type after conversion"),
            };
            let result = match (op, ordering) {
                (BinaryOp::Ne, None) => true,
                (_, None) => false,
                (BinaryOp::Lt, Some(o)) => o.is_lt(),
                (BinaryOp::Gt, Some(o)) => o.is_gt(),
                (BinaryOp::Le, Some(o)) => o.is_le(),
                (BinaryOp::Ge, Some(o)) => o.is_ge(),
                (BinaryOp::Eq, Some(o)) => o.is_eq(),
                (BinaryOp::Ne, Some(o)) => o.is_ne(),
                _ => unreachable!("checked by is_comparison"),
            };
            return Ok(Value::from_bool(result));
        }

        Ok(match (lhs, rhs) {
            (Value::I32(x), Value::I32(y)) => int_op!(op, x, y, I32),
            (Value::U32(x), Value::U32(y)) => int_op!(op, x, y, U32),
            (Value::I64(x), Value::I64(y)) => int_op!(op, x, y, I64),
            (Value::U64(x), Value::U64(y)) => int_op!(op, x, y, U64),
            (Value::F32(x), Value::F32(y)) => float_op!(op, x, y, F32),
            (Value::F64(x), Value::F64(y)) => float_op!(op, x, y, F64),
            _ => unreachable!("operands share a numeric type after conversion"),
        })
    }
}

impl From<ScalarValue> for Value {
    fn from(value: ScalarValue) -> Self {
        match value {
            ScalarValue::F32(x) => Value::F32(x),
            ScalarValue::F64(x) => Value::F64(x),
            ScalarValue::I32(x) => Value::I32(x),
            ScalarValue::U32(x) => Value::U32(x),
            ScalarValue::I64(x) => Value::I64(x),
            ScalarValue::U64(x) => Value::U64(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_arithmetic_follows_c_promotion() {
        assert_eq!(Value::binary(BinaryOp::Add, Value::I32(1), Value::F64(0.5)).unwrap(), Value::F64(1.5));
        assert_eq!(Value::binary(BinaryOp::Add, Value::I32(-1), Value::U32(2)).unwrap(), Value::U32(1));
        assert_eq!(Value::binary(BinaryOp::Mul, Value::U32(3), Value::I64(-2)).unwrap(), Value::I64(-6));
        assert_eq!(Value::binary(BinaryOp::Div, Value::F32(1.0), Value::I64(4)).unwrap(), Value::F32(0.25));
    }

    #[test]
    fn comparisons_yield_int() {
        assert_eq!(Value::binary(BinaryOp::Lt, Value::U64(3), Value::I32(4)).unwrap(), Value::I32(1));
        assert_eq!(Value::binary(BinaryOp::Eq, Value::F64(f64::NAN), Value::F64(f64::NAN)).unwrap(), Value::I32(0));
        assert_eq!(Value::binary(BinaryOp::Ne, Value::F64(f64::NAN), Value::F64(1.0)).unwrap(), Value::I32(1));
    }

    #[test]
    fn integer_division_by_zero_is_an_error() {
        assert!(Value::binary(BinaryOp::Div, Value::I32(1), Value::I32(0)).is_err());
        assert!(Value::binary(BinaryOp::Rem, Value::U64(1), Value::U64(0)).is_err());
    }

    #[test]
    fn bitwise_ops_reject_floats() {
        assert!(Value::binary(BinaryOp::BitAnd, Value::F32(1.0), Value::I32(1)).is_err());
        assert_eq!(Value::binary(BinaryOp::Shl, Value::U32(1), Value::I32(4)).unwrap(), Value::U32(16));
    }

    #[test]
    fn casts_truncate_like_c() {
        assert_eq!(Value::F64(2.9).cast(ScalarType::I32).unwrap(), Value::I32(2));
        assert_eq!(Value::I64(-1).cast(ScalarType::U32).unwrap(), Value::U32(u32::MAX));
        assert!(Value::Ptr { buffer: 1, elem: ScalarType::F32 }.cast(ScalarType::F32).is_err());
    }

    #[test]
    fn unary_ops() {
        assert_eq!(Value::unary(UnaryOp::Neg, Value::F32(2.0)).unwrap(), Value::F32(-2.0));
        assert_eq!(Value::unary(UnaryOp::Not, Value::I32(0)).unwrap(), Value::I32(1));
        assert_eq!(Value::unary(UnaryOp::BitNot, Value::U32(0)).unwrap(), Value::U32(u32::MAX));
    }
}
