//! Value stack over the script engine
//!
//! Every bridge operation runs against a [`Frame`]: an explicit stack of engine
//! values addressed by absolute (`0..top`) or negative (`-1` = top) indices.
//! Codecs, dispatchers and inspectors only talk to the engine through it, so
//! "every operation leaves the stack as it found it" is something tests can
//! check directly.

use std::any::{Any, TypeId};
use std::rc::Rc;

use rquickjs::function::Params;
use rquickjs::{
    Array, CaughtError, Coerced, Ctx, Exception, Function, Object, Persistent, Value,
};

use crate::bridge::Shared;
use crate::error::{FatalError, Result, ScriptError, TypeError};
use crate::stash::RefKey;
use crate::types::Type;

pub struct Frame<'js> {
    ctx: Ctx<'js>,
    shared: Rc<Shared>,
    stack: Vec<Value<'js>>,
    /// Arguments the script actually passed, for call frames
    given: usize,
}

impl<'js> Frame<'js> {
    pub(crate) fn new(ctx: Ctx<'js>, shared: Rc<Shared>) -> Self {
        Self {
            ctx,
            shared,
            stack: Vec::new(),
            given: 0,
        }
    }

    /// Frame for a native call: arguments at `0..max(given, arity)`, missing
    /// ones padded with `undefined`
    pub(crate) fn for_call(
        ctx: Ctx<'js>,
        shared: Rc<Shared>,
        params: &Params<'_, 'js>,
        arity: usize,
    ) -> Self {
        let mut frame = Self::new(ctx, shared);
        for index in 0..params.len().max(arity) {
            let value = params
                .arg(index)
                .unwrap_or_else(|| Value::new_undefined(frame.ctx.clone()));
            frame.stack.push(value);
        }
        frame.given = params.len();
        frame
    }

    pub fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    pub(crate) fn shared(&self) -> &Rc<Shared> {
        &self.shared
    }

    /// Number of arguments the script passed to the current native call
    pub fn given(&self) -> usize {
        self.given
    }

    /// Current stack depth
    pub fn top(&self) -> usize {
        self.stack.len()
    }

    fn slot(&self, index: i32) -> Result<usize> {
        let top = self.stack.len();
        let slot = if index < 0 {
            top.checked_sub(index.unsigned_abs() as usize)
        } else {
            Some(index as usize).filter(|&slot| slot < top)
        };
        slot.ok_or_else(|| FatalError::StackIndex { index, top }.into())
    }

    /// Absolute index of `index`, stable across later pushes
    pub fn normalize(&self, index: i32) -> Result<i32> {
        Ok(self.slot(index)? as i32)
    }

    pub fn value(&self, index: i32) -> Result<&Value<'js>> {
        let slot = self.slot(index)?;
        Ok(&self.stack[slot])
    }

    pub fn push_value(&mut self, value: Value<'js>) {
        self.stack.push(value);
    }

    /// Push through `T`'s codec
    pub fn push<T: Type>(&mut self, value: T) -> Result<()> {
        T::check(&self.shared.types.borrow())?;
        let top = self.top();
        let pushed = T::push(self, value);
        if pushed.is_err() {
            self.stack.truncate(top);
        }
        pushed
    }

    /// Read through `T`'s codec without changing the depth
    pub fn get<T: Type>(&mut self, index: i32) -> Result<T> {
        T::check(&self.shared.types.borrow())?;
        let top = self.top();
        let value = T::get(self, index);
        self.stack.truncate(top);
        debug_assert_eq!(top, self.top(), "codec for {} popped below its frame", T::type_name());
        value
    }

    /// Push a value whose codec is only known by `TypeId`
    pub fn push_dyn(&mut self, id: TypeId, value: Box<dyn Any>) -> Result<()> {
        let (push, _) = self.shared.types.borrow().codec(id)?;
        push(self, value)
    }

    pub fn get_dyn(&mut self, id: TypeId, index: i32) -> Result<Box<dyn Any>> {
        let (_, get) = self.shared.types.borrow().codec(id)?;
        get(self, index)
    }

    pub fn push_undefined(&mut self) {
        let value = Value::new_undefined(self.ctx.clone());
        self.stack.push(value);
    }

    pub fn push_null(&mut self) {
        let value = Value::new_null(self.ctx.clone());
        self.stack.push(value);
    }

    /// Push a fresh object; returns its absolute index
    pub fn push_object(&mut self) -> Result<i32> {
        let object = Object::new(self.ctx.clone()).map_err(|e| self.engine_error(e))?;
        self.stack.push(object.into_value());
        Ok(self.top() as i32 - 1)
    }

    /// Push a fresh array; returns its absolute index
    pub fn push_array(&mut self) -> Result<i32> {
        let array = Array::new(self.ctx.clone()).map_err(|e| self.engine_error(e))?;
        self.stack.push(array.into_value());
        Ok(self.top() as i32 - 1)
    }

    pub fn push_global_object(&mut self) -> i32 {
        self.stack.push(self.ctx.globals().into_value());
        self.top() as i32 - 1
    }

    pub fn pop(&mut self) -> Result<Value<'js>> {
        self.stack.pop().ok_or_else(|| {
            FatalError::StackIndex {
                index: -1,
                top: 0,
            }
            .into()
        })
    }

    pub fn pop_n(&mut self, count: usize) -> Result<()> {
        let top = self.top();
        if count > top {
            return Err(FatalError::StackIndex {
                index: -(count as i32),
                top,
            }
            .into());
        }
        self.stack.truncate(top - count);
        Ok(())
    }

    pub fn dup(&mut self, index: i32) -> Result<()> {
        let value = self.value(index)?.clone();
        self.stack.push(value);
        Ok(())
    }

    pub fn swap(&mut self, a: i32, b: i32) -> Result<()> {
        let (a, b) = (self.slot(a)?, self.slot(b)?);
        self.stack.swap(a, b);
        Ok(())
    }

    pub fn remove(&mut self, index: i32) -> Result<Value<'js>> {
        let slot = self.slot(index)?;
        Ok(self.stack.remove(slot))
    }

    pub fn is_undefined(&self, index: i32) -> Result<bool> {
        Ok(self.value(index)?.is_undefined())
    }

    pub fn is_null_or_undefined(&self, index: i32) -> Result<bool> {
        let value = self.value(index)?;
        Ok(value.is_undefined() || value.is_null())
    }

    pub(crate) fn object_at(&self, index: i32) -> Result<Object<'js>> {
        let value = self.value(index)?;
        value
            .as_object()
            .cloned()
            .ok_or_else(|| TypeError::shape("object", value.type_name()).into())
    }

    /// Push `object[key]`; returns whether it was defined
    pub fn get_prop(&mut self, index: i32, key: &str) -> Result<bool> {
        let object = self.object_at(index)?;
        let value: Value<'js> = object.get(key).map_err(|e| self.engine_error(e))?;
        let defined = !value.is_undefined();
        self.stack.push(value);
        Ok(defined)
    }

    /// Push `object[key]`, failing with `MissingField` when it is undefined
    pub fn get_required_prop(&mut self, index: i32, key: &str) -> Result<()> {
        if self.get_prop(index, key)? {
            return Ok(());
        }
        self.pop()?;
        Err(TypeError::MissingField {
            field: key.to_string(),
        }
        .into())
    }

    /// Pop the top value into `object[key]`; `index` is resolved before the pop
    pub fn put_prop(&mut self, index: i32, key: &str) -> Result<()> {
        let object = self.object_at(index)?;
        let value = self.pop()?;
        object.set(key, value).map_err(|e| self.engine_error(e))
    }

    pub fn has_prop(&self, index: i32, key: &str) -> Result<bool> {
        self.object_at(index)?
            .contains_key(key)
            .map_err(|e| self.engine_error(e))
    }

    pub fn del_prop(&self, index: i32, key: &str) -> Result<()> {
        self.object_at(index)?
            .remove(key)
            .map_err(|e| self.engine_error(e))
    }

    /// Push `object[position]`; returns whether it was defined
    pub fn get_index(&mut self, index: i32, position: u32) -> Result<bool> {
        let object = self.object_at(index)?;
        let value: Value<'js> = object.get(position).map_err(|e| self.engine_error(e))?;
        let defined = !value.is_undefined();
        self.stack.push(value);
        Ok(defined)
    }

    pub fn put_index(&mut self, index: i32, position: u32) -> Result<()> {
        let object = self.object_at(index)?;
        let value = self.pop()?;
        object.set(position, value).map_err(|e| self.engine_error(e))
    }

    pub fn has_index(&self, index: i32, position: u32) -> Result<bool> {
        self.object_at(index)?
            .contains_key(position)
            .map_err(|e| self.engine_error(e))
    }

    pub fn del_index(&self, index: i32, position: u32) -> Result<()> {
        self.object_at(index)?
            .remove(position)
            .map_err(|e| self.engine_error(e))
    }

    /// `length` of the array at `index`
    pub fn array_len(&self, index: i32) -> Result<u32> {
        let value = self.value(index)?;
        value
            .as_array()
            .map(|array| array.len() as u32)
            .ok_or_else(|| TypeError::shape("array", value.type_name()).into())
    }

    /// Own enumerable array-index keys of the object at `index`, ascending.
    /// Holes are absent; array-like objects work as well as arrays.
    pub fn index_keys(&self, index: i32) -> Result<Vec<u32>> {
        let object = self.object_at(index)?;
        let mut positions = Vec::new();
        for key in object.keys::<String>() {
            let key = key.map_err(|e| self.engine_error(e))?;
            if let Some(position) = array_index(&key) {
                positions.push(position);
            }
        }
        positions.sort_unstable();
        Ok(positions)
    }

    /// Call the function sitting below `nargs` arguments. Pops function and
    /// arguments, pushes the result; on failure pushes nothing.
    pub fn call(&mut self, nargs: usize) -> Result<()> {
        let top = self.top();
        let base = top.checked_sub(nargs + 1).ok_or(FatalError::StackIndex {
            index: -(nargs as i32 + 1),
            top,
        })?;
        let mut values = self.stack.split_off(base);
        let callee = values.remove(0);
        let Some(function) = callee.as_function().cloned() else {
            return Err(TypeError::shape("function", callee.type_name()).into());
        };

        let mut args = rquickjs::function::Args::new(self.ctx.clone(), nargs);
        for value in values {
            args.push_arg(value).map_err(|e| self.engine_error(e))?;
        }
        let result: Value<'js> = function.call_arg(args).map_err(|e| self.engine_error(e))?;
        self.stack.push(result);
        Ok(())
    }

    /// Evaluate `source` and push its completion value
    pub fn eval(&mut self, source: &str) -> Result<()> {
        if self.shared.settings.log_evaluations {
            tracing::debug!(source, "eval");
        }
        let value: Value<'js> = self.ctx.eval(source).map_err(|e| self.engine_error(e))?;
        self.stack.push(value);
        Ok(())
    }

    /// Evaluate `source` for its side effects only
    pub fn eval_void(&mut self, source: &str) -> Result<()> {
        self.eval(source)?;
        self.pop().map(drop)
    }

    /// Pop the top value into global `name`
    pub fn put_global(&mut self, name: &str) -> Result<()> {
        let value = self.pop()?;
        self.ctx
            .globals()
            .set(name, value)
            .map_err(|e| self.engine_error(e))
    }

    /// Push global `name`; an undefined binding is a `Key` error
    pub fn get_global(&mut self, name: &str) -> Result<()> {
        let value: Value<'js> = self
            .ctx
            .globals()
            .get(name)
            .map_err(|e| self.engine_error(e))?;
        if value.is_undefined() {
            return Err(ScriptError::Key {
                name: name.to_string(),
            });
        }
        self.stack.push(value);
        Ok(())
    }

    /// Retain the value at `index` in the reference stash
    pub fn stash_ref(&mut self, index: i32) -> Result<RefKey> {
        let value = self.value(index)?.clone();
        let key = self
            .shared
            .stash
            .borrow_mut()
            .insert(Persistent::save(&self.ctx, value));
        tracing::trace!(key = key.raw(), "value stashed");
        Ok(key)
    }

    /// Push a stashed value
    pub fn get_ref(&mut self, key: RefKey) -> Result<()> {
        let stored = self.shared.stash.borrow().get(key);
        let Some(stored) = stored else {
            self.push_undefined();
            return Ok(());
        };
        let value = stored.restore(&self.ctx).map_err(|e| self.engine_error(e))?;
        self.stack.push(value);
        Ok(())
    }

    /// Release a stashed value; unknown keys are ignored
    pub fn unstash_ref(&mut self, key: RefKey) {
        let removed = self.shared.stash.borrow_mut().remove(key);
        drop(removed);
    }

    /// Take the top value for handing back to the engine
    pub(crate) fn take_top(&mut self) -> Value<'js> {
        self.stack
            .pop()
            .unwrap_or_else(|| Value::new_undefined(self.ctx.clone()))
    }

    /// Translate an engine failure. A fatal error recorded while the engine was
    /// running wins over the script error it caused.
    pub(crate) fn engine_error(&self, error: rquickjs::Error) -> ScriptError {
        let caught = CaughtError::from_error(&self.ctx, error);
        if let Some(fatal) = self.shared.take_fatal() {
            return fatal.into();
        }
        match caught {
            CaughtError::Exception(exception) => exception_error(&exception),
            CaughtError::Value(value) => ScriptError::Evaluation {
                message: value
                    .get::<Coerced<String>>()
                    .map(|coerced| coerced.0)
                    .unwrap_or_else(|_| format!("uncaught {}", value.type_name())),
                stack: None,
            },
            CaughtError::Error(rquickjs::Error::FromJs { from, to, .. }) => {
                TypeError::shape(to, from).into()
            }
            CaughtError::Error(error) => FatalError::Engine {
                message: error.to_string(),
            }
            .into(),
        }
    }

    /// Raise `error` into the running script. Fatal errors are also recorded
    /// so the host sees them even if script code catches the exception.
    pub(crate) fn raise(&self, error: ScriptError) -> rquickjs::Error {
        match error {
            ScriptError::Type(error) => Exception::throw_type(&self.ctx, &error.to_string()),
            ScriptError::Key { name } => {
                Exception::throw_reference(&self.ctx, &format!("{name} is undefined"))
            }
            ScriptError::Evaluation { message, .. } => {
                Exception::throw_message(&self.ctx, &message)
            }
            ScriptError::Fatal(fatal) => {
                tracing::warn!(error = %fatal, "fatal bridge error raised into script");
                let message = fatal.to_string();
                self.shared.record_fatal(fatal);
                Exception::throw_internal(&self.ctx, &message)
            }
        }
    }

    /// Function value at `index`
    pub(crate) fn function_at(&self, index: i32) -> Result<Function<'js>> {
        let value = self.value(index)?;
        value
            .as_function()
            .cloned()
            .ok_or_else(|| TypeError::shape("function", value.type_name()).into())
    }
}

fn exception_error(exception: &Exception<'_>) -> ScriptError {
    let name: Option<String> = exception.as_object().get("name").ok();
    let message = exception.message().unwrap_or_default();
    let message = match name {
        Some(name) if !name.is_empty() => format!("{name}: {message}"),
        _ => message,
    };
    ScriptError::Evaluation {
        message,
        stack: exception.stack().filter(|stack| !stack.is_empty()),
    }
}

/// Canonical array index (`"0"`, `"17"`; not `"01"` or `"4294967295"`)
fn array_index(key: &str) -> Option<u32> {
    let position: u32 = key.parse().ok()?;
    (position != u32::MAX && position.to_string() == key).then_some(position)
}

#[cfg(test)]
mod tests {
    use super::array_index;
    use crate::{Bridge, FatalError, ScriptError, TypeError};

    #[test]
    fn only_canonical_keys_are_indices() {
        assert_eq!(array_index("0"), Some(0));
        assert_eq!(array_index("17"), Some(17));
        assert_eq!(array_index("01"), None);
        assert_eq!(array_index("-1"), None);
        assert_eq!(array_index("length"), None);
        assert_eq!(array_index("4294967295"), None);
    }

    #[test]
    fn negative_indices_count_from_top() {
        let bridge = Bridge::new().unwrap();
        bridge
            .with(|frame| {
                frame.push(1_i32)?;
                frame.push(2_i32)?;
                frame.push(3_i32)?;
                assert_eq!(frame.get::<i32>(-1)?, 3);
                assert_eq!(frame.get::<i32>(0)?, 1);
                assert_eq!(frame.normalize(-2)?, 1);

                frame.swap(0, -1)?;
                assert_eq!(frame.get::<i32>(0)?, 3);
                frame.dup(1)?;
                assert_eq!(frame.get::<i32>(-1)?, 2);
                assert_eq!(frame.top(), 4);

                frame.pop_n(4)?;
                assert!(matches!(
                    frame.value(0),
                    Err(ScriptError::Fatal(FatalError::StackIndex { .. }))
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn properties_by_key_and_index() {
        let bridge = Bridge::new().unwrap();
        bridge
            .with(|frame| {
                let object = frame.push_object()?;
                frame.push(7_i32)?;
                frame.put_prop(object, "seven")?;
                assert!(frame.has_prop(object, "seven")?);
                assert!(frame.get_prop(object, "seven")?);
                assert_eq!(frame.get::<i32>(-1)?, 7);
                frame.pop()?;

                assert!(!frame.get_prop(object, "eight")?);
                frame.pop()?;
                assert!(matches!(
                    frame.get_required_prop(object, "eight"),
                    Err(ScriptError::Type(TypeError::MissingField { .. }))
                ));

                frame.del_prop(object, "seven")?;
                assert!(!frame.has_prop(object, "seven")?);

                let array = frame.push_array()?;
                frame.push("a".to_string())?;
                frame.put_index(array, 0)?;
                frame.push("b".to_string())?;
                frame.put_index(array, 1)?;
                assert_eq!(frame.array_len(array)?, 2);
                assert!(frame.get_index(array, 1)?);
                assert_eq!(frame.get::<String>(-1)?, "b");
                frame.pop_n(3)?;
                assert_eq!(frame.top(), 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn call_replaces_function_and_args_with_result() {
        let bridge = Bridge::new().unwrap();
        bridge
            .with(|frame| {
                frame.eval("(function (a, b) { return a * b; })")?;
                frame.push(6_i32)?;
                frame.push(7_i32)?;
                frame.call(2)?;
                assert_eq!(frame.top(), 1);
                assert_eq!(frame.get::<i32>(-1)?, 42);
                frame.pop()?;

                frame.eval("(function () { throw new Error('nope'); })")?;
                let err = frame.call(0).unwrap_err();
                assert!(err.to_string().contains("nope"));
                assert_eq!(frame.top(), 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn failed_eval_leaves_stack_untouched() {
        let bridge = Bridge::new().unwrap();
        bridge
            .with(|frame| {
                frame.push(1_i32)?;
                let err = frame.eval("this is not javascript").unwrap_err();
                assert!(matches!(err, ScriptError::Evaluation { .. }));
                assert_eq!(frame.top(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn stash_outlives_the_frame() {
        let bridge = Bridge::new().unwrap();
        let key = bridge
            .with(|frame| {
                frame.eval("({ answer: 42 })")?;
                let key = frame.stash_ref(-1)?;
                frame.pop()?;
                Ok(key)
            })
            .unwrap();
        bridge.run_gc();
        assert_eq!(bridge.stash_len(), 1);

        bridge
            .with(|frame| {
                frame.get_ref(key)?;
                assert!(frame.get_prop(-1, "answer")?);
                assert_eq!(frame.get::<i32>(-1)?, 42);
                frame.pop_n(2)?;
                frame.unstash_ref(key);
                Ok(())
            })
            .unwrap();
        assert_eq!(bridge.stash_len(), 0);
    }
}
