//! The bridge: one script runtime plus the native-side tables that back it
//!
//! [`Bridge`] is the host's handle. Everything script-reachable (stash,
//! prototypes, ownership boxes, handle records) lives in [`Shared`], which
//! trampolines and finalizers reach through a `Weak` so a dropped bridge is
//! detected instead of dereferenced.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::rc::Rc;

use rquickjs::{qjs, Context, Ctx, Object, Persistent, Runtime};

use crate::boxes::{BoxKey, BoxTable};
use crate::class::ClassTable;
use crate::dispatch::NativeFn;
use crate::error::{FatalError, Result};
use crate::handle::{HandleId, HandleTable};
use crate::inspect::Bindable;
use crate::registry::TypeRegistry;
use crate::settings::BridgeSettings;
use crate::stack::Frame;
use crate::stash::RefStash;
use crate::types::{push_transient, CallArgs, Completion, Returns, Type};

/// State shared by the bridge, its trampolines and its handle finalizers.
///
/// Field order is drop order: script values held from native code go first,
/// the engine itself last.
pub(crate) struct Shared {
    pub(crate) stash: RefCell<RefStash>,
    pub(crate) prototypes: RefCell<HashMap<TypeId, Persistent<Object<'static>>>>,
    pub(crate) boxes: RefCell<BoxTable>,
    pub(crate) handles: RefCell<HandleTable>,
    pub(crate) classes: RefCell<ClassTable>,
    pub(crate) types: RefCell<TypeRegistry>,
    /// Live native callables (trampolines) owned by the engine
    pub(crate) callables: Cell<usize>,
    pub(crate) settings: BridgeSettings,
    fatal: RefCell<Option<FatalError>>,
    /// Context of the innermost active `enter`, while the runtime is locked
    scope: Cell<Option<NonNull<qjs::JSContext>>>,
    context: Context,
    runtime: Runtime,
}

/// Clears the active scope when the outermost `enter` unwinds
struct ScopeGuard<'a> {
    scope: &'a Cell<Option<NonNull<qjs::JSContext>>>,
}

impl<'a> ScopeGuard<'a> {
    fn open(scope: &'a Cell<Option<NonNull<qjs::JSContext>>>, ctx: &Ctx<'_>) -> Self {
        scope.set(Some(ctx.as_raw()));
        Self { scope }
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.scope.set(None);
    }
}

impl Shared {
    /// Run `f` on a fresh frame, reusing the active scope when called from
    /// inside one (a native callback calling back into script).
    pub(crate) fn enter<R>(self: &Rc<Self>, f: impl FnOnce(&mut Frame<'_>) -> Result<R>) -> Result<R> {
        if let Some(raw) = self.scope.get() {
            // SAFETY: `raw` was set by an enclosing `enter` that still holds
            // the runtime lock further up this thread's stack.
            let ctx = unsafe { Ctx::from_raw(raw) };
            return self.run(ctx, f);
        }
        self.context.with(|ctx| {
            let _scope = ScopeGuard::open(&self.scope, &ctx);
            self.run(ctx, f)
        })
    }

    fn run<'js, R>(self: &Rc<Self>, ctx: Ctx<'js>, f: impl FnOnce(&mut Frame<'js>) -> Result<R>) -> Result<R> {
        let mut frame = Frame::new(ctx, Rc::clone(self));
        let result = f(&mut frame);
        drop(frame);
        match self.take_fatal() {
            Some(fatal) => Err(fatal.into()),
            None => result,
        }
    }

    /// Remember a fatal error raised into script; the first one wins
    pub(crate) fn record_fatal(&self, fatal: FatalError) {
        let mut pending = self.fatal.borrow_mut();
        if pending.is_none() {
            *pending = Some(fatal);
        }
    }

    pub(crate) fn take_fatal(&self) -> Option<FatalError> {
        self.fatal.borrow_mut().take()
    }

    /// A handle object was collected: release its record and the box it owns
    pub(crate) fn finalize_handle(&self, id: HandleId) {
        let record = self.handles.borrow_mut().remove(id);
        let released = record
            .as_ref()
            .and_then(|record| record.key)
            .and_then(|key| self.boxes.borrow_mut().remove(key));
        if let Some(released) = &released {
            tracing::trace!(handle = ?id, class = released.class_name(), "handle finalized");
        }
        drop(released);
        drop(record);
    }
}

/// Host-side entry point to a script runtime
pub struct Bridge {
    shared: Rc<Shared>,
}

fn engine_failure(error: rquickjs::Error) -> FatalError {
    FatalError::Engine {
        message: error.to_string(),
    }
}

impl Bridge {
    pub fn new() -> Result<Self> {
        Self::with_settings(BridgeSettings::default())
    }

    pub fn with_settings(settings: BridgeSettings) -> Result<Self> {
        let runtime = Runtime::new().map_err(engine_failure)?;
        if let Some(limit) = settings.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = settings.max_stack_size {
            runtime.set_max_stack_size(limit);
        }
        if let Some(threshold) = settings.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }
        let context = Context::full(&runtime).map_err(engine_failure)?;

        tracing::debug!(?settings, "script bridge created");
        Ok(Self {
            shared: Rc::new(Shared {
                stash: RefCell::new(RefStash::default()),
                prototypes: RefCell::new(HashMap::new()),
                boxes: RefCell::new(BoxTable::new()),
                handles: RefCell::new(HandleTable::default()),
                classes: RefCell::new(ClassTable::new()),
                types: RefCell::new(TypeRegistry::bootstrap()),
                callables: Cell::new(0),
                settings,
                fatal: RefCell::new(None),
                scope: Cell::new(None),
                context,
                runtime,
            }),
        })
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.shared.settings
    }

    /// Run `f` against a fresh frame. A fatal error raised while `f` ran is
    /// returned even if script code caught the exception.
    pub fn with<R>(&self, f: impl FnOnce(&mut Frame<'_>) -> Result<R>) -> Result<R> {
        self.shared.enter(f)
    }

    /// Make a value codec available to frames and registration checks
    pub fn register_type<T: Type>(&self) {
        self.shared.types.borrow_mut().register::<T>();
    }

    pub fn register_class<C: Bindable + ?Sized>(&self) -> Result<()> {
        self.with(|frame| frame.register_class::<C>())
    }

    pub fn register_enum<E: Bindable + ?Sized>(&self) -> Result<()> {
        self.with(|frame| frame.register_enum::<E>())
    }

    pub fn register_function<A, R, F>(&self, name: &str, function: F) -> Result<()>
    where
        A: 'static,
        R: Returns,
        F: NativeFn<A, R>,
    {
        self.with(|frame| frame.register_function(name, function))
    }

    pub fn set_global<T: Type>(&self, name: &str, value: T) -> Result<()> {
        self.with(|frame| {
            frame.push(value)?;
            frame.put_global(name)
        })
    }

    /// Read global `name`; a missing binding is a `Key` error
    pub fn get_global<T: Type>(&self, name: &str) -> Result<T> {
        self.with(|frame| {
            frame.get_global(name)?;
            let value = frame.get::<T>(-1);
            frame.pop()?;
            value
        })
    }

    /// Evaluate `source` and convert its completion value
    pub fn eval<T: Type>(&self, source: &str) -> Result<T> {
        self.with(|frame| {
            frame.eval(source)?;
            let value = frame.get::<T>(-1);
            frame.pop()?;
            value
        })
    }

    pub fn eval_void(&self, source: &str) -> Result<()> {
        self.with(|frame| frame.eval_void(source))
    }

    /// Call the global function `name`
    pub fn call_global<A: CallArgs, R: Completion>(&self, name: &str, args: A) -> Result<R> {
        self.with(|frame| {
            let top = frame.top();
            let result = (|| {
                frame.get_global(name)?;
                let nargs = args.push_args(frame)?;
                frame.call(nargs)?;
                R::complete(frame)
            })();
            frame.pop_n(frame.top() - top)?;
            result
        })
    }

    /// Lend `value` to script for the length of `f`. The handle at the given
    /// stack index goes stale when `f` returns; later use is a `TypeError`.
    pub fn with_ref<C, R>(&self, value: &C, f: impl FnOnce(&mut Frame<'_>, i32) -> Result<R>) -> Result<R>
    where
        C: Bindable + ?Sized,
    {
        let alive = Rc::new(Cell::new(true));
        let result = self.with(|frame| {
            let id = push_transient(frame, value, Rc::clone(&alive))?;
            let index = frame.top() as i32 - 1;
            let result = f(frame, index);
            alive.set(false);
            let record = self.shared.handles.borrow_mut().remove(id);
            drop(record);
            result
        });
        alive.set(false);
        result
    }

    /// Drop the box behind `key` now instead of waiting for collection.
    /// Handles still pointing at it fail with `StaleBoxKey`.
    pub fn remove_box(&self, key: BoxKey) -> bool {
        let removed = self.shared.boxes.borrow_mut().remove(key);
        let found = removed.is_some();
        drop(removed);
        found
    }

    pub fn box_count(&self) -> usize {
        self.shared.boxes.borrow().len()
    }

    pub fn handle_count(&self) -> usize {
        self.shared.handles.borrow().len()
    }

    pub fn stash_len(&self) -> usize {
        self.shared.stash.borrow().len()
    }

    pub fn bound_callables(&self) -> usize {
        self.shared.callables.get()
    }

    /// Run a full collection cycle; unreachable handles are finalized
    pub fn run_gc(&self) {
        match self.shared.scope.get() {
            // SAFETY: see `Shared::enter`
            Some(raw) => unsafe { Ctx::from_raw(raw) }.run_gc(),
            None => self.shared.runtime.run_gc(),
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        tracing::debug!(
            boxes = self.box_count(),
            handles = self.handle_count(),
            stashed = self.stash_len(),
            "script bridge dropped"
        );
        let boxes = self.shared.boxes.borrow_mut().drain();
        drop(boxes);
        let stashed = self.shared.stash.borrow_mut().drain();
        drop(stashed);
        let prototypes: Vec<_> = self.shared.prototypes.borrow_mut().drain().collect();
        drop(prototypes);
        self.shared.handles.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ScriptError, TypeError};

    #[test]
    fn settings_reach_the_runtime() {
        let settings = BridgeSettings {
            memory_limit: Some(64 * 1024 * 1024),
            log_evaluations: true,
            ..Default::default()
        };
        let bridge = Bridge::with_settings(settings.clone()).unwrap();
        assert_eq!(bridge.settings(), &settings);
        assert_eq!(bridge.eval::<i32>("1 + 1").unwrap(), 2);
    }

    #[test]
    fn globals_round_trip() {
        let bridge = Bridge::new().unwrap();
        bridge.set_global("answer", 42_u32).unwrap();
        assert_eq!(bridge.get_global::<u32>("answer").unwrap(), 42);
        assert_eq!(
            bridge.get_global::<u32>("question").unwrap_err(),
            ScriptError::Key {
                name: "question".to_string()
            }
        );
    }

    #[test]
    fn call_global_passes_arguments() {
        let bridge = Bridge::new().unwrap();
        bridge
            .eval_void("function greet(name, times) { return name.repeat(times); }")
            .unwrap();
        let greeting: String = bridge.call_global("greet", ("ab".to_string(), 3)).unwrap();
        assert_eq!(greeting, "ababab");
    }

    #[test]
    fn nested_entry_reuses_the_scope() {
        let bridge = Rc::new(Bridge::new().unwrap());
        let inner = Rc::downgrade(&bridge);
        bridge
            .register_function("nested", move |x: i32| -> crate::Result<i32> {
                let bridge = inner.upgrade().ok_or(FatalError::BridgeDropped)?;
                bridge.eval::<i32>(&format!("{x} * 3"))
            })
            .unwrap();
        assert_eq!(bridge.eval::<i32>("nested(5) + 1").unwrap(), 16);
    }

    #[test]
    fn conversion_failure_is_a_type_error() {
        let bridge = Bridge::new().unwrap();
        assert!(matches!(
            bridge.eval::<i32>("'not a number'"),
            Err(ScriptError::Type(TypeError::Shape { .. }))
        ));
        bridge.with(|frame| {
            assert_eq!(frame.top(), 0);
            Ok(())
        })
        .unwrap();
    }
}
