//! Type codecs
//!
//! A [`Type`] knows how to push a native value onto a [`Frame`] and how to read
//! one back. Primitives and composites copy by value; `Rc<C>` and `Box<C>` for
//! a bindable class travel through an ownership box and a handle instead.
//!
//! Native signatures use two more traits on top: [`Arg`] for parameters (which
//! adds the borrowed [`Ref<C>`]) and [`Returns`] for results (which adds `()`
//! and `Result<T, ScriptError>`).

mod function;
mod object;
mod primitive;
mod sequence;

pub use function::{CallArgs, Completion, ScriptFunction};
pub use object::Ref;

pub(crate) use object::{prototype_for, push_transient};

use crate::error::{FatalError, Result, ScriptError, TypeError};
use crate::registry::TypeRegistry;
use crate::stack::Frame;

/// Conversion between a native value and a script value
pub trait Type: Sized + 'static {
    /// Copied across the boundary, as opposed to linked through a handle
    const PRIMITIVE: bool = true;

    /// Name used in error messages and registry listings
    fn type_name() -> String {
        short_name(std::any::type_name::<Self>())
    }

    /// Verify that every leaf codec this type needs is registered
    fn check(registry: &TypeRegistry) -> Result<(), FatalError> {
        registry.require::<Self>()
    }

    /// Push `value`. On error the frame may hold partial output; [`Frame::push`]
    /// cuts it back.
    fn push(frame: &mut Frame<'_>, value: Self) -> Result<()>;

    /// Read the value at `index`. Anything pushed while reading is the
    /// codec's own business; [`Frame::get`] restores the depth afterwards.
    fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self>;

    /// Read for an `Option<Self>` slot. Class codecs answer `None` when the
    /// checked cast to `Self` does not hold; every other codec reads through
    /// [`Type::get`].
    fn try_get(frame: &mut Frame<'_>, index: i32) -> Result<Option<Self>> {
        Self::get(frame, index).map(Some)
    }
}

fn short_name(full: &str) -> String {
    match full.find('<') {
        Some(open) => {
            let (head, rest) = full.split_at(open);
            format!("{}{}", head.rsplit("::").next().unwrap_or(head), rest)
        }
        None => full.rsplit("::").next().unwrap_or(full).to_string(),
    }
}

/// Parameter of a native function or method
pub trait Arg: Sized + 'static {
    fn check(registry: &TypeRegistry) -> Result<(), FatalError>;

    fn unpack(frame: &mut Frame<'_>, index: i32) -> Result<Self>;
}

impl<T: Type> Arg for T {
    fn check(registry: &TypeRegistry) -> Result<(), FatalError> {
        T::check(registry)
    }

    fn unpack(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        let linked = T::PRIMITIVE
            || frame.is_null_or_undefined(index)?
            || object::is_handle(frame.value(index)?);
        if !linked {
            return Err(TypeError::MissingLinkage {
                expected: T::type_name(),
            }
            .into());
        }
        frame.get::<T>(index)
    }
}

/// Unpack parameter `index` of a call with `arity` declared parameters. A
/// type error on a parameter the script never passed reads as a count error.
pub(crate) fn unpack_arg<A: Arg>(frame: &mut Frame<'_>, index: usize, arity: usize) -> Result<A> {
    let given = frame.given();
    A::unpack(frame, index as i32).map_err(|error| match error {
        ScriptError::Type(_) if index >= given => TypeError::ArgumentCount {
            expected: arity,
            given,
        }
        .into(),
        other => other,
    })
}

/// Result of a native function or method
pub trait Returns: 'static {
    fn check(registry: &TypeRegistry) -> Result<(), FatalError>;

    /// Push the result; `()` pushes nothing and the call yields `undefined`
    fn push_return(self, frame: &mut Frame<'_>) -> Result<()>;
}

impl Returns for () {
    fn check(_: &TypeRegistry) -> Result<(), FatalError> {
        Ok(())
    }

    fn push_return(self, _: &mut Frame<'_>) -> Result<()> {
        Ok(())
    }
}

impl<T: Type> Returns for T {
    fn check(registry: &TypeRegistry) -> Result<(), FatalError> {
        T::check(registry)
    }

    fn push_return(self, frame: &mut Frame<'_>) -> Result<()> {
        frame.push(self)
    }
}

impl<T: Returns> Returns for Result<T, ScriptError> {
    fn check(registry: &TypeRegistry) -> Result<(), FatalError> {
        T::check(registry)
    }

    fn push_return(self, frame: &mut Frame<'_>) -> Result<()> {
        self?.push_return(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::short_name;

    #[test]
    fn short_names_drop_module_paths() {
        assert_eq!(short_name("game::ships::Spaceship"), "Spaceship");
        assert_eq!(short_name("alloc::vec::Vec<i32>"), "Vec<i32>");
        assert_eq!(short_name("f64"), "f64");
    }
}
