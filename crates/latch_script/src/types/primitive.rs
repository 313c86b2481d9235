// primitive.rs - Scalar and string codecs

use rquickjs::Value;

use super::Type;
use crate::error::{Result, TypeError};
use crate::stack::Frame;

impl Type for bool {
    fn type_name() -> String {
        "boolean".to_string()
    }

    fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
        let value = Value::new_bool(frame.ctx().clone(), value);
        frame.push_value(value);
        Ok(())
    }

    fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        let value = frame.value(index)?;
        value
            .as_bool()
            .ok_or_else(|| TypeError::shape("boolean", value.type_name()).into())
    }
}

fn number_at(frame: &Frame<'_>, index: i32, expected: &str) -> Result<f64> {
    let value = frame.value(index)?;
    value
        .as_number()
        .ok_or_else(|| TypeError::shape(expected, value.type_name()).into())
}

/// Integers travel as numbers. A value is accepted in either direction only if
/// it is exactly representable on both sides: wide integers past 2^53 that a
/// double cannot hold fail with `Shape` instead of being rounded or clamped.
macro_rules! integer_type {
    ($($ty:ty => $value_bits:expr),*) => {$(
        impl Type for $ty {
            fn type_name() -> String {
                stringify!($ty).to_string()
            }

            fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
                let value = match i32::try_from(value) {
                    Ok(small) => Value::new_int(frame.ctx().clone(), small),
                    Err(_) => {
                        let wide = value as f64;
                        if wide >= exclusive_max($value_bits) || wide as $ty != value {
                            return Err(TypeError::shape("exact number", value.to_string()).into());
                        }
                        Value::new_number(frame.ctx().clone(), wide)
                    }
                };
                frame.push_value(value);
                Ok(())
            }

            fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
                let number = number_at(frame, index, stringify!($ty))?;
                if number.fract() != 0.0
                    || number < <$ty>::MIN as f64
                    || number >= exclusive_max($value_bits)
                {
                    return Err(TypeError::shape(stringify!($ty), number.to_string()).into());
                }
                Ok(number as $ty)
            }
        }
    )*};
}

/// 2^bits, one past the largest integer with that many value bits. Exact in
/// an f64, unlike `MAX as f64` which rounds up for 64-bit types.
fn exclusive_max(value_bits: i32) -> f64 {
    2f64.powi(value_bits)
}

integer_type!(i8 => 7, i16 => 15, i32 => 31, i64 => 63, u8 => 8, u16 => 16, u32 => 32, u64 => 64);

impl Type for f64 {
    fn type_name() -> String {
        "number".to_string()
    }

    fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
        let value = Value::new_number(frame.ctx().clone(), value);
        frame.push_value(value);
        Ok(())
    }

    fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        number_at(frame, index, "number")
    }
}

impl Type for f32 {
    fn type_name() -> String {
        "number".to_string()
    }

    fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
        f64::push(frame, value as f64)
    }

    fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        Ok(number_at(frame, index, "number")? as f32)
    }
}

impl Type for String {
    fn type_name() -> String {
        "string".to_string()
    }

    fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
        let string = rquickjs::String::from_str(frame.ctx().clone(), &value)
            .map_err(|e| frame.engine_error(e))?;
        frame.push_value(string.into_value());
        Ok(())
    }

    fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        let value = frame.value(index)?;
        let Some(string) = value.as_string() else {
            return Err(TypeError::shape("string", value.type_name()).into());
        };
        string.to_string().map_err(|e| frame.engine_error(e))
    }
}
