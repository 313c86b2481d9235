//! Native call dispatch
//!
//! Every native function, method, accessor and constructor the bridge exposes
//! is one engine function wrapping a [`Trampoline`]. The trampoline builds a
//! call [`Frame`], hands it to its [`Dispatch`] target, and turns the outcome
//! into a return value or a thrown exception. Panics stop here too.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use rquickjs::function::{IntoJsFunc, ParamRequirement, Params};
use rquickjs::{Exception, Function, Value};

use crate::bridge::Shared;
use crate::class::ClassInfo;
use crate::error::{FatalError, Result, TypeError};
use crate::registry::TypeRegistry;
use crate::stack::Frame;
use crate::types::{unpack_arg, Arg, Ref, Returns, Type};

/// A native function callable with the arguments `A`
pub trait NativeFn<A, R>: 'static {
    const ARITY: usize;

    fn check(registry: &TypeRegistry) -> Result<(), FatalError>;

    fn invoke(&self, frame: &mut Frame<'_>) -> Result<R>;
}

/// A native method of `C` callable with the arguments `A`
pub trait NativeMethod<C: ?Sized, A, R>: 'static {
    const ARITY: usize;

    fn check(registry: &TypeRegistry) -> Result<(), FatalError>;

    fn invoke(&self, this: &C, frame: &mut Frame<'_>) -> Result<R>;
}

macro_rules! native_signatures {
    ($len:expr; $($arg:ident $val:ident $pos:tt),*) => {
        impl<F, R, $($arg),*> NativeFn<($($arg,)*), R> for F
        where
            F: Fn($($arg),*) -> R + 'static,
            R: Returns,
            $($arg: Arg,)*
        {
            const ARITY: usize = $len;

            fn check(registry: &TypeRegistry) -> Result<(), FatalError> {
                $($arg::check(registry)?;)*
                R::check(registry)
            }

            #[allow(unused_variables)]
            fn invoke(&self, frame: &mut Frame<'_>) -> Result<R> {
                $(let $val = unpack_arg::<$arg>(frame, $pos, $len)?;)*
                Ok(self($($val),*))
            }
        }

        impl<F, C, R, $($arg),*> NativeMethod<C, ($($arg,)*), R> for F
        where
            F: Fn(&C, $($arg),*) -> R + 'static,
            C: ?Sized,
            R: Returns,
            $($arg: Arg,)*
        {
            const ARITY: usize = $len;

            fn check(registry: &TypeRegistry) -> Result<(), FatalError> {
                $($arg::check(registry)?;)*
                R::check(registry)
            }

            #[allow(unused_variables)]
            fn invoke(&self, this: &C, frame: &mut Frame<'_>) -> Result<R> {
                $(let $val = unpack_arg::<$arg>(frame, $pos, $len)?;)*
                Ok(self(this, $($val),*))
            }
        }
    };
}

native_signatures!(0;);
native_signatures!(1; A a 0);
native_signatures!(2; A a 0, B b 1);
native_signatures!(3; A a 0, B b 1, C2 c 2);
native_signatures!(4; A a 0, B b 1, C2 c 2, D d 3);
native_signatures!(5; A a 0, B b 1, C2 c 2, D d 3, E e 4);
native_signatures!(6; A a 0, B b 1, C2 c 2, D d 3, E e 4, G g 5);
native_signatures!(7; A a 0, B b 1, C2 c 2, D d 3, E e 4, G g 5, H h 6);
native_signatures!(8; A a 0, B b 1, C2 c 2, D d 3, E e 4, G g 5, H h 6, I i 7);

/// One native entry point, as seen by a trampoline
pub(crate) trait Dispatch: 'static {
    fn arity(&self) -> usize;

    /// Run against a call frame; leaves the return value, if any, on top.
    /// `new_target` is set exactly when the engine invoked a construct call.
    fn dispatch<'js>(
        &self,
        frame: &mut Frame<'js>,
        this: &Value<'js>,
        new_target: Option<&Value<'js>>,
    ) -> Result<()>;
}

pub(crate) struct FunctionCall<F, A, R> {
    f: F,
    _signature: PhantomData<fn(A) -> R>,
}

impl<F, A, R> FunctionCall<F, A, R> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _signature: PhantomData,
        }
    }
}

impl<F, A, R> Dispatch for FunctionCall<F, A, R>
where
    F: NativeFn<A, R>,
    A: 'static,
    R: Returns,
{
    fn arity(&self) -> usize {
        F::ARITY
    }

    fn dispatch<'js>(&self, frame: &mut Frame<'js>, _: &Value<'js>, _: Option<&Value<'js>>) -> Result<()> {
        self.f.invoke(frame)?.push_return(frame)
    }
}

pub(crate) struct MethodCall<C: ?Sized, F, A, R> {
    f: F,
    _signature: PhantomData<fn(&C, A) -> R>,
}

impl<C: ?Sized, F, A, R> MethodCall<C, F, A, R> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _signature: PhantomData,
        }
    }
}

impl<C, F, A, R> Dispatch for MethodCall<C, F, A, R>
where
    C: ClassInfo + ?Sized,
    F: NativeMethod<C, A, R>,
    A: 'static,
    R: Returns,
{
    fn arity(&self) -> usize {
        F::ARITY
    }

    fn dispatch<'js>(&self, frame: &mut Frame<'js>, this: &Value<'js>, _: Option<&Value<'js>>) -> Result<()> {
        let receiver = Ref::<C>::resolve(frame, this)?;
        let result = self.f.invoke(&receiver, frame)?;
        drop(receiver);
        result.push_return(frame)
    }
}

/// Constructor producing `P` (an `Rc<C>` or `Box<C>`); refuses plain calls
pub(crate) struct ConstructorCall<F, A, P> {
    f: F,
    _signature: PhantomData<fn(A) -> P>,
}

impl<F, A, P> ConstructorCall<F, A, P> {
    pub(crate) fn new(f: F) -> Self {
        Self {
            f,
            _signature: PhantomData,
        }
    }
}

impl<F, A, P> Dispatch for ConstructorCall<F, A, P>
where
    F: NativeFn<A, P>,
    A: 'static,
    P: Type,
{
    fn arity(&self) -> usize {
        F::ARITY
    }

    fn dispatch<'js>(
        &self,
        frame: &mut Frame<'js>,
        _: &Value<'js>,
        new_target: Option<&Value<'js>>,
    ) -> Result<()> {
        let Some(new_target) = new_target else {
            return Err(TypeError::NotConstructCall.into());
        };
        let instance = self.f.invoke(frame)?;
        frame.push(instance)?;
        adopt_target_prototype(frame, new_target)
    }
}

/// Give the fresh instance `new.target.prototype`, so script subclasses
/// (`class Sub extends Native`) and `Reflect.construct` see their own chain
fn adopt_target_prototype<'js>(frame: &Frame<'js>, new_target: &Value<'js>) -> Result<()> {
    let Some(target) = new_target.as_object() else {
        return Ok(());
    };
    let prototype: Value<'js> = target.get("prototype").map_err(|e| frame.engine_error(e))?;
    let (Some(prototype), Some(instance)) = (prototype.as_object(), frame.value(-1)?.as_object()) else {
        return Ok(());
    };
    if instance.get_prototype().as_ref() == Some(prototype) {
        return Ok(());
    }
    instance
        .set_prototype(Some(prototype))
        .map_err(|e| frame.engine_error(e))
}

/// Engine-side callable for one [`Dispatch`] target
pub(crate) struct Trampoline {
    target: Rc<dyn Dispatch>,
    shared: Weak<Shared>,
}

/// Parameter marker for [`Trampoline`]'s `IntoJsFunc` impl
pub(crate) struct RawParams;

impl Trampoline {
    pub(crate) fn new(shared: &Rc<Shared>, target: impl Dispatch) -> Self {
        shared.callables.set(shared.callables.get() + 1);
        Self {
            target: Rc::new(target),
            shared: Rc::downgrade(shared),
        }
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.callables.set(shared.callables.get().saturating_sub(1));
        }
    }
}

impl<'js> IntoJsFunc<'js, RawParams> for Trampoline {
    fn param_requirements() -> ParamRequirement {
        ParamRequirement::any()
    }

    fn call<'a>(&self, params: Params<'a, 'js>) -> rquickjs::Result<Value<'js>> {
        let ctx = params.ctx().clone();
        let Some(shared) = self.shared.upgrade() else {
            return Err(Exception::throw_internal(&ctx, &FatalError::BridgeDropped.to_string()));
        };

        // On a construct call `this` carries new.target
        let this = params.this();
        let new_target = params.is_constructor().then_some(&this);
        let mut frame = Frame::for_call(ctx.clone(), shared, &params, self.target.arity());
        let depth = frame.top();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.target.dispatch(&mut frame, &this, new_target)
        }));
        match outcome {
            Ok(Ok(())) if frame.top() > depth => Ok(frame.take_top()),
            Ok(Ok(())) => Ok(Value::new_undefined(ctx)),
            Ok(Err(error)) => Err(frame.raise(error)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(%message, "native callback panicked");
                Err(frame.raise(FatalError::Panic { message }.into()))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Wrap `target` as a named engine function
pub(crate) fn function<'js>(frame: &Frame<'js>, name: &str, target: impl Dispatch) -> Result<Function<'js>> {
    let arity = target.arity();
    let trampoline = Trampoline::new(frame.shared(), target);
    let function = Function::new(frame.ctx().clone(), trampoline)
        .and_then(|function| function.with_name(name))
        .map_err(|e| frame.engine_error(e))?;
    function.set_length(arity).map_err(|e| frame.engine_error(e))?;
    Ok(function)
}

/// Like [`function`], but callable with `new`
pub(crate) fn constructor<'js>(frame: &Frame<'js>, name: &str, target: impl Dispatch) -> Result<Function<'js>> {
    let function = function(frame, name, target)?;
    function.set_constructor(true);
    Ok(function)
}

#[cfg(test)]
mod tests {
    use super::panic_message;
    use crate::{Bridge, FatalError, ScriptError, TypeError};

    #[test]
    fn panic_payloads_become_messages() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(format!("code {}", 7));
        assert_eq!(panic_message(payload.as_ref()), "code 7");
    }

    #[test]
    fn missing_arguments_are_a_count_error() {
        let bridge = Bridge::new().unwrap();
        bridge.register_function("add", |a: i32, b: i32| a + b).unwrap();
        assert_eq!(bridge.eval::<i32>("add(2, 3)").unwrap(), 5);

        let err = bridge.eval::<String>("try { add(1); } catch (e) { e.message }").unwrap();
        assert_eq!(
            err,
            TypeError::ArgumentCount {
                expected: 2,
                given: 1
            }
            .to_string()
        );
        let err = bridge.eval::<String>("try { add(1, 'x'); } catch (e) { e.name }").unwrap();
        assert_eq!(err, "TypeError");
    }

    #[test]
    fn panics_surface_as_fatal_even_if_caught() {
        let bridge = Bridge::new().unwrap();
        bridge
            .register_function("explode", || -> i32 { panic!("kaboom") })
            .unwrap();
        let result = bridge.eval_void("try { explode(); } catch (e) {}");
        match result {
            Err(ScriptError::Fatal(FatalError::Panic { message })) => assert_eq!(message, "kaboom"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn callables_are_released_with_their_functions() {
        let bridge = Bridge::new().unwrap();
        let before = bridge.bound_callables();
        bridge.register_function("temp", || 1_i32).unwrap();
        assert_eq!(bridge.bound_callables(), before + 1);
        bridge.eval_void("delete globalThis.temp").unwrap();
        bridge.run_gc();
        assert_eq!(bridge.bound_callables(), before);
    }
}
