// sequence.rs - Array, tuple and optional codecs

use super::Type;
use crate::error::{FatalError, Result, TypeError};
use crate::registry::TypeRegistry;
use crate::stack::Frame;

impl<T: Type> Type for Vec<T> {
    fn type_name() -> String {
        format!("Array<{}>", T::type_name())
    }

    fn check(registry: &TypeRegistry) -> Result<(), FatalError> {
        T::check(registry)
    }

    fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
        let array = frame.push_array()?;
        for (position, item) in value.into_iter().enumerate() {
            T::push(frame, item)?;
            frame.put_index(array, position as u32)?;
        }
        Ok(())
    }

    /// Reads the enumerable indexed properties in ascending order, so holes
    /// are skipped and array-like objects are accepted
    fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        let index = frame.normalize(index)?;
        let positions = frame.index_keys(index).map_err(|_| shape_error::<Self>(frame, index))?;
        let mut items = Vec::with_capacity(positions.len());
        for position in positions {
            frame.get_index(index, position)?;
            let item = T::get(frame, -1);
            frame.pop()?;
            items.push(item?);
        }
        Ok(items)
    }
}

fn shape_error<T: Type>(frame: &Frame<'_>, index: i32) -> crate::error::ScriptError {
    let found = frame
        .value(index)
        .map(|value| value.type_name())
        .unwrap_or("nothing");
    TypeError::shape(T::type_name(), found).into()
}

impl<T: Type> Type for Option<T> {
    const PRIMITIVE: bool = T::PRIMITIVE;

    fn type_name() -> String {
        format!("{} | null", T::type_name())
    }

    fn check(registry: &TypeRegistry) -> Result<(), FatalError> {
        T::check(registry)
    }

    fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
        match value {
            Some(value) => T::push(frame, value),
            None => {
                frame.push_null();
                Ok(())
            }
        }
    }

    fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        if frame.is_null_or_undefined(index)? {
            Ok(None)
        } else {
            T::try_get(frame, index)
        }
    }
}

macro_rules! tuple_type {
    ($len:expr; $($name:ident $pos:tt),+) => {
        impl<$($name: Type),+> Type for ($($name,)+) {
            fn type_name() -> String {
                let parts: Vec<String> = vec![$($name::type_name()),+];
                format!("[{}]", parts.join(", "))
            }

            fn check(registry: &TypeRegistry) -> Result<(), FatalError> {
                $($name::check(registry)?;)+
                Ok(())
            }

            fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
                let array = frame.push_array()?;
                $(
                    $name::push(frame, value.$pos)?;
                    frame.put_index(array, $pos)?;
                )+
                Ok(())
            }

            fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
                let index = frame.normalize(index)?;
                let len = frame.array_len(index).map_err(|_| shape_error::<Self>(frame, index))?;
                if len != $len {
                    return Err(TypeError::shape(
                        Self::type_name(),
                        format!("array of length {len}"),
                    )
                    .into());
                }
                Ok(($(
                    {
                        frame.get_index(index, $pos)?;
                        let item = $name::get(frame, -1);
                        frame.pop()?;
                        item?
                    },
                )+))
            }
        }
    };
}

tuple_type!(1; A 0);
tuple_type!(2; A 0, B 1);
tuple_type!(3; A 0, B 1, C 2);
tuple_type!(4; A 0, B 1, C 2, D 3);
tuple_type!(5; A 0, B 1, C 2, D 3, E 4);
tuple_type!(6; A 0, B 1, C 2, D 3, E 4, F 5);
