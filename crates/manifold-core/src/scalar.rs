//! Element types a device vector can hold

use std::fmt::Debug;

use manifold_backends::{ScalarType, ScalarValue};

/// Element type of a [`DeviceVector`](crate::DeviceVector).
///
/// Implemented for `f32`, `f64`, `i32`, `u32`, `i64` and `u64`. Values cross
/// between host and device as raw bytes, hence the `Pod` bound.
pub trait Scalar: bytemuck::Pod + Default + PartialOrd + Debug + Send + Sync + 'static {
    /// Tag used by the backend argument binder.
    const TYPE: ScalarType;

    /// Name of the type in kernel source.
    fn cl_name() -> &'static str {
        Self::TYPE.cl_name()
    }

    fn is_float() -> bool {
        Self::TYPE.is_float()
    }

    fn to_value(self) -> ScalarValue;

    fn zero() -> Self {
        Self::default()
    }

    fn one() -> Self;

    /// Additive inverse; wraps for unsigned types.
    fn negate(self) -> Self;

    /// Smallest and largest values; infinities for floats.
    fn lowest() -> Self;
    fn highest() -> Self;

    /// Kernel-source literals for the smallest and largest values.
    fn min_literal() -> &'static str;
    fn max_literal() -> &'static str;

    /// Host-side combine steps for reductions.
    fn add(self, other: Self) -> Self;
    fn min_of(self, other: Self) -> Self;
    fn max_of(self, other: Self) -> Self;
}

macro_rules! float_scalar {
    ($ty:ty, $tag:ident) => {
        impl Scalar for $ty {
            const TYPE: ScalarType = ScalarType::$tag;

            fn to_value(self) -> ScalarValue {
                ScalarValue::$tag(self)
            }

            fn one() -> Self {
                1.0
            }

            fn negate(self) -> Self {
                -self
            }

            fn lowest() -> Self {
                <$ty>::NEG_INFINITY
            }

            fn highest() -> Self {
                <$ty>::INFINITY
            }

            fn min_literal() -> &'static str {
                "-INFINITY"
            }

            fn max_literal() -> &'static str {
                "INFINITY"
            }

            fn add(self, other: Self) -> Self {
                self + other
            }

            fn min_of(self, other: Self) -> Self {
                self.min(other)
            }

            fn max_of(self, other: Self) -> Self {
                self.max(other)
            }
        }
    };
}

macro_rules! int_scalar {
    ($ty:ty, $tag:ident, $min:literal, $max:literal) => {
        impl Scalar for $ty {
            const TYPE: ScalarType = ScalarType::$tag;

            fn to_value(self) -> ScalarValue {
                ScalarValue::$tag(self)
            }

            fn one() -> Self {
                1
            }

            fn negate(self) -> Self {
                self.wrapping_neg()
            }

            fn lowest() -> Self {
                <$ty>::MIN
            }

            fn highest() -> Self {
                <$ty>::MAX
            }

            fn min_literal() -> &'static str {
                $min
            }

            fn max_literal() -> &'static str {
                $max
            }

            // Device integer arithmetic wraps; the host fold matches it.
            fn add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }

            fn min_of(self, other: Self) -> Self {
                Ord::min(self, other)
            }

            fn max_of(self, other: Self) -> Self {
                Ord::max(self, other)
            }
        }
    };
}

float_scalar!(f32, F32);
float_scalar!(f64, F64);
int_scalar!(i32, I32, "(-2147483647 - 1)", "2147483647");
int_scalar!(u32, U32, "0u", "4294967295u");
int_scalar!(i64, I64, "(-9223372036854775807L - 1)", "9223372036854775807L");
int_scalar!(u64, U64, "0ul", "18446744073709551615ul");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_names_follow_the_backend_tags() {
        assert_eq!(f32::cl_name(), "float");
        assert_eq!(f64::cl_name(), "double");
        assert_eq!(i64::cl_name(), "long");
        assert_eq!(u32::cl_name(), "uint");
        assert!(f64::is_float());
        assert!(!u64::is_float());
    }

    #[test]
    fn host_fold_wraps_like_the_device() {
        assert_eq!(i32::MAX.add(1), i32::MIN);
        assert_eq!(u64::MAX.add(2), 1);
        assert_eq!(3.5f64.add(0.5), 4.0);
        assert_eq!(u32::one().negate(), u32::MAX);
        assert_eq!(5u32.add(u32::one().negate()), 4);
    }

    #[test]
    fn values_keep_their_tag() {
        assert_eq!(7u32.to_value(), ScalarValue::U32(7));
        assert_eq!(2.0f32.to_value().scalar_type(), ScalarType::F32);
    }
}
