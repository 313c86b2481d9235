// function.rs - Script callables held by native code

use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use super::Type;
use crate::bridge::Shared;
use crate::error::{FatalError, Result};
use crate::registry::TypeRegistry;
use crate::stack::Frame;
use crate::stash::RefKey;

/// Arguments a native caller passes to a script function
pub trait CallArgs: 'static {
    fn check(registry: &TypeRegistry) -> Result<(), FatalError>;

    /// Push every argument; returns how many were pushed
    fn push_args(self, frame: &mut Frame<'_>) -> Result<usize>;
}

impl CallArgs for () {
    fn check(_: &TypeRegistry) -> Result<(), FatalError> {
        Ok(())
    }

    fn push_args(self, _: &mut Frame<'_>) -> Result<usize> {
        Ok(0)
    }
}

macro_rules! call_args {
    ($len:expr; $($name:ident $pos:tt),+) => {
        impl<$($name: Type),+> CallArgs for ($($name,)+) {
            fn check(registry: &TypeRegistry) -> Result<(), FatalError> {
                $($name::check(registry)?;)+
                Ok(())
            }

            fn push_args(self, frame: &mut Frame<'_>) -> Result<usize> {
                $(frame.push(self.$pos)?;)+
                Ok($len)
            }
        }
    };
}

call_args!(1; A 0);
call_args!(2; A 0, B 1);
call_args!(3; A 0, B 1, C 2);
call_args!(4; A 0, B 1, C 2, D 3);
call_args!(5; A 0, B 1, C 2, D 3, E 4);
call_args!(6; A 0, B 1, C 2, D 3, E 4, F 5);

/// What a native caller reads back from a script function
pub trait Completion: Sized + 'static {
    fn check(registry: &TypeRegistry) -> Result<(), FatalError>;

    fn complete(frame: &mut Frame<'_>) -> Result<Self>;
}

impl Completion for () {
    fn check(_: &TypeRegistry) -> Result<(), FatalError> {
        Ok(())
    }

    fn complete(_: &mut Frame<'_>) -> Result<Self> {
        Ok(())
    }
}

impl<T: Type> Completion for T {
    fn check(registry: &TypeRegistry) -> Result<(), FatalError> {
        T::check(registry)
    }

    fn complete(frame: &mut Frame<'_>) -> Result<Self> {
        frame.get::<T>(-1)
    }
}

/// A script function retained by native code.
///
/// The function stays in the bridge's reference stash until this value is
/// dropped. Calling it after the bridge is gone fails with `BridgeDropped`.
pub struct ScriptFunction<A = (), R = ()> {
    key: RefKey,
    shared: Weak<Shared>,
    _signature: PhantomData<fn(A) -> R>,
}

impl<A: CallArgs, R: Completion> ScriptFunction<A, R> {
    pub fn key(&self) -> RefKey {
        self.key
    }

    /// Call from outside any frame; enters the bridge for the duration
    pub fn call(&self, args: A) -> Result<R> {
        let shared = self.shared.upgrade().ok_or(FatalError::BridgeDropped)?;
        shared.enter(|frame| self.call_in(frame, args))
    }

    /// Call on an existing frame, e.g. from inside a native method
    pub fn call_in(&self, frame: &mut Frame<'_>, args: A) -> Result<R> {
        let top = frame.top();
        let result = self.invoke(frame, args);
        frame.pop_n(frame.top() - top)?;
        result
    }

    fn invoke(&self, frame: &mut Frame<'_>, args: A) -> Result<R> {
        frame.get_ref(self.key)?;
        let nargs = args.push_args(frame)?;
        frame.call(nargs)?;
        R::complete(frame)
    }
}

impl<A: CallArgs, R: Completion> Type for ScriptFunction<A, R> {
    fn type_name() -> String {
        "function".to_string()
    }

    fn check(registry: &TypeRegistry) -> Result<(), FatalError> {
        A::check(registry)?;
        R::check(registry)
    }

    /// Pushes the retained function itself
    fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
        frame.get_ref(value.key)
    }

    fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        frame.function_at(index)?;
        let key = frame.stash_ref(index)?;
        Ok(ScriptFunction {
            key,
            shared: Rc::downgrade(frame.shared()),
            _signature: PhantomData,
        })
    }
}

impl<A, R> Drop for ScriptFunction<A, R> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let removed = shared.stash.borrow_mut().remove(self.key);
            drop(removed);
        }
    }
}

impl<A, R> fmt::Debug for ScriptFunction<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptFunction")
            .field("key", &self.key.raw())
            .field("bridge_alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::ScriptFunction;
    use crate::{Bridge, FatalError, ScriptError};

    #[test]
    fn retained_function_survives_collection() {
        let bridge = Bridge::new().unwrap();
        let add: ScriptFunction<(i32, i32), i32> = bridge
            .eval("(function (a, b) { return a + b; })")
            .unwrap();
        bridge.run_gc();
        assert_eq!(add.call((2, 3)).unwrap(), 5);
        assert_eq!(bridge.stash_len(), 1);
        drop(add);
        assert_eq!(bridge.stash_len(), 0);
    }

    #[test]
    fn script_errors_come_back_as_evaluation() {
        let bridge = Bridge::new().unwrap();
        let fail: ScriptFunction<(), ()> = bridge
            .eval("(function () { throw new RangeError('out of range'); })")
            .unwrap();
        match fail.call(()) {
            Err(ScriptError::Evaluation { message, .. }) => {
                assert!(message.contains("RangeError"));
                assert!(message.contains("out of range"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn calling_after_bridge_drop_fails_cleanly() {
        let bridge = Bridge::new().unwrap();
        let noop: ScriptFunction = bridge.eval("(function () {})").unwrap();
        drop(bridge);
        assert_eq!(
            noop.call(()).unwrap_err(),
            ScriptError::Fatal(FatalError::BridgeDropped)
        );
    }
}
