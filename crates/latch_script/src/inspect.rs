// inspect.rs - Class declarations and the inspectors that consume them
//
// A class declares its members once, in `Bindable::inspect`. Each consumer is
// an `Inspector` that acts on the members it cares about and ignores the rest:
//   - registration: constructor + instance members on a shared prototype,
//     static members and constants on the class object
//   - instance push: instance members on a per-object table, for classes
//     that were never registered
//   - constants: a frozen object of named values (enum export)

use std::any::TypeId;
use std::marker::PhantomData;
use std::rc::Rc;

use rquickjs::object::{Accessor, Property};
use rquickjs::{Function, Object, Value};

use crate::class::ClassInfo;
use crate::dispatch::{
    self, ConstructorCall, FunctionCall, MethodCall, NativeFn, NativeMethod, Trampoline,
};
use crate::error::{Result, ScriptError};
use crate::stack::Frame;
use crate::types::{prototype_for, Returns, Type};

/// A native class script can see.
///
/// ```ignore
/// impl Bindable for Spaceship {
///     fn inspect<I: Inspector<Self>>(i: &mut I) {
///         i.construct_shared(|x: i32| Rc::new(Spaceship::new(x)));
///         i.method("moveLeft", Spaceship::move_left);
///         i.property("pos", Spaceship::pos, Spaceship::set_pos);
///     }
/// }
/// ```
pub trait Bindable: ClassInfo {
    fn inspect<I: Inspector<Self>>(inspector: &mut I) {
        let _ = inspector;
    }
}

/// Visitor over a class declaration. Every hook defaults to doing nothing.
pub trait Inspector<C: ?Sized + 'static> {
    /// Constructor whose instances script shares with native code
    fn construct_shared<A: 'static, F: NativeFn<A, Rc<C>>>(&mut self, _constructor: F) {}

    /// Constructor whose instances script owns outright
    fn construct_exclusive<A: 'static, F: NativeFn<A, Box<C>>>(&mut self, _constructor: F) {}

    fn method<A: 'static, R: Returns, F: NativeMethod<C, A, R>>(&mut self, _name: &'static str, _method: F) {
    }

    fn property<T, G, S>(&mut self, _name: &'static str, _get: G, _set: S)
    where
        T: Type,
        G: NativeMethod<C, (), T>,
        S: NativeMethod<C, (T,), ()>,
    {
    }

    fn property_readonly<T: Type, G: NativeMethod<C, (), T>>(&mut self, _name: &'static str, _get: G) {}

    fn static_method<A: 'static, R: Returns, F: NativeFn<A, R>>(&mut self, _name: &'static str, _function: F) {
    }

    fn static_property<T, G, S>(&mut self, _name: &'static str, _get: G, _set: S)
    where
        T: Type,
        G: NativeFn<(), T>,
        S: NativeFn<(T,), ()>,
    {
    }

    fn static_property_readonly<T: Type, G: NativeFn<(), T>>(&mut self, _name: &'static str, _get: G) {}

    fn constant<T: Type>(&mut self, _name: &'static str, _value: T) {}
}

fn define_method<'js, C, A, R, F>(frame: &Frame<'js>, target: &Object<'js>, name: &'static str, method: F) -> Result<()>
where
    C: ClassInfo + ?Sized,
    A: 'static,
    R: Returns,
    F: NativeMethod<C, A, R>,
{
    F::check(&frame.shared().types.borrow())?;
    let function = dispatch::function(frame, name, MethodCall::<C, F, A, R>::new(method))?;
    target.set(name, function).map_err(|e| frame.engine_error(e))
}

fn define_function<'js, A, R, F>(frame: &Frame<'js>, target: &Object<'js>, name: &'static str, function: F) -> Result<()>
where
    A: 'static,
    R: Returns,
    F: NativeFn<A, R>,
{
    F::check(&frame.shared().types.borrow())?;
    let function = dispatch::function(frame, name, FunctionCall::<F, A, R>::new(function))?;
    target.set(name, function).map_err(|e| frame.engine_error(e))
}

fn define_accessor<'js>(
    frame: &Frame<'js>,
    target: &Object<'js>,
    name: &'static str,
    get: Trampoline,
    set: Option<Trampoline>,
) -> Result<()> {
    let defined = match set {
        Some(set) => target.prop(name, Accessor::new(get, set).configurable().enumerable()),
        None => target.prop(name, Accessor::new_get(get).configurable().enumerable()),
    };
    defined.map_err(|e| frame.engine_error(e))
}

fn getter<C, T, G>(frame: &Frame<'_>, get: G) -> Result<Trampoline>
where
    C: ClassInfo + ?Sized,
    T: Type,
    G: NativeMethod<C, (), T>,
{
    G::check(&frame.shared().types.borrow())?;
    Ok(Trampoline::new(frame.shared(), MethodCall::<C, G, (), T>::new(get)))
}

fn setter<C, T, S>(frame: &Frame<'_>, set: S) -> Result<Trampoline>
where
    C: ClassInfo + ?Sized,
    T: Type,
    S: NativeMethod<C, (T,), ()>,
{
    S::check(&frame.shared().types.borrow())?;
    Ok(Trampoline::new(frame.shared(), MethodCall::<C, S, (T,), ()>::new(set)))
}

fn static_getter<T: Type, G: NativeFn<(), T>>(frame: &Frame<'_>, get: G) -> Result<Trampoline> {
    G::check(&frame.shared().types.borrow())?;
    Ok(Trampoline::new(frame.shared(), FunctionCall::<G, (), T>::new(get)))
}

fn static_setter<T: Type, S: NativeFn<(T,), ()>>(frame: &Frame<'_>, set: S) -> Result<Trampoline> {
    S::check(&frame.shared().types.borrow())?;
    Ok(Trampoline::new(frame.shared(), FunctionCall::<S, (T,), ()>::new(set)))
}

/// Read-only, non-configurable data property
fn define_constant<'js, T: Type>(frame: &mut Frame<'js>, target: &Object<'js>, name: &'static str, value: T) -> Result<()> {
    frame.push(value)?;
    let value = frame.pop()?;
    target
        .prop(name, Property::from(value).enumerable())
        .map_err(|e| frame.engine_error(e))
}

fn freeze<'js>(frame: &Frame<'js>, object: &Object<'js>) -> Result<()> {
    let freeze = || -> rquickjs::Result<()> {
        let builtin: Object = frame.ctx().globals().get("Object")?;
        let freeze: Function = builtin.get("freeze")?;
        freeze.call::<_, Value>((object.clone(),)).map(drop)
    };
    freeze().map_err(|e| frame.engine_error(e))
}

/// Shared prototype and constructor of a registered class
struct RegistrationInspector<'a, 'js, C: ?Sized> {
    frame: &'a mut Frame<'js>,
    prototype: Object<'js>,
    constructor: Option<Function<'js>>,
    error: Option<ScriptError>,
    _class: PhantomData<fn(&C)>,
}

impl<'a, 'js, C: Bindable + ?Sized> RegistrationInspector<'a, 'js, C> {
    fn record(&mut self, result: Result<()>) {
        if let Err(error) = result {
            self.error.get_or_insert(error);
        }
    }

    fn set_constructor(&mut self, constructor: Result<Function<'js>>) {
        if self.constructor.is_some() {
            tracing::warn!(class = C::NAME, "second constructor declared; keeping the first");
            return;
        }
        match constructor {
            Ok(constructor) => self.constructor = Some(constructor),
            Err(error) => self.record(Err(error)),
        }
    }

    fn constructor_of<A: 'static, P: Type, F: NativeFn<A, P>>(&self, constructor: F) -> Result<Function<'js>> {
        F::check(&self.frame.shared().types.borrow())?;
        let (_, leaf) = C::descriptor().split_name();
        dispatch::constructor(self.frame, leaf, ConstructorCall::<F, A, P>::new(constructor))
    }
}

impl<'a, 'js, C: Bindable + ?Sized> Inspector<C> for RegistrationInspector<'a, 'js, C> {
    fn construct_shared<A: 'static, F: NativeFn<A, Rc<C>>>(&mut self, constructor: F) {
        let constructor = self.constructor_of::<A, Rc<C>, F>(constructor);
        self.set_constructor(constructor);
    }

    fn construct_exclusive<A: 'static, F: NativeFn<A, Box<C>>>(&mut self, constructor: F) {
        let constructor = self.constructor_of::<A, Box<C>, F>(constructor);
        self.set_constructor(constructor);
    }

    fn method<A: 'static, R: Returns, F: NativeMethod<C, A, R>>(&mut self, name: &'static str, method: F) {
        let result = define_method::<C, A, R, F>(self.frame, &self.prototype, name, method);
        self.record(result);
    }

    fn property<T, G, S>(&mut self, name: &'static str, get: G, set: S)
    where
        T: Type,
        G: NativeMethod<C, (), T>,
        S: NativeMethod<C, (T,), ()>,
    {
        let result = getter::<C, T, G>(self.frame, get).and_then(|get| {
            let set = setter::<C, T, S>(self.frame, set)?;
            define_accessor(self.frame, &self.prototype, name, get, Some(set))
        });
        self.record(result);
    }

    fn property_readonly<T: Type, G: NativeMethod<C, (), T>>(&mut self, name: &'static str, get: G) {
        let result = getter::<C, T, G>(self.frame, get)
            .and_then(|get| define_accessor(self.frame, &self.prototype, name, get, None));
        self.record(result);
    }
}

/// Constants, and optionally static members, written onto one object
struct ConstantsInspector<'a, 'js, C: ?Sized> {
    frame: &'a mut Frame<'js>,
    target: Object<'js>,
    statics: bool,
    error: Option<ScriptError>,
    _class: PhantomData<fn(&C)>,
}

impl<'a, 'js, C: ?Sized> ConstantsInspector<'a, 'js, C> {
    fn new(frame: &'a mut Frame<'js>, target: Object<'js>, statics: bool) -> Self {
        Self {
            frame,
            target,
            statics,
            error: None,
            _class: PhantomData,
        }
    }

    fn record(&mut self, result: Result<()>) {
        if let Err(error) = result {
            self.error.get_or_insert(error);
        }
    }

    fn finish(self) -> Result<()> {
        self.error.map_or(Ok(()), Err)
    }
}

impl<'a, 'js, C: Bindable + ?Sized> Inspector<C> for ConstantsInspector<'a, 'js, C> {
    fn static_method<A: 'static, R: Returns, F: NativeFn<A, R>>(&mut self, name: &'static str, function: F) {
        if self.statics {
            let result = define_function::<A, R, F>(self.frame, &self.target, name, function);
            self.record(result);
        }
    }

    fn static_property<T, G, S>(&mut self, name: &'static str, get: G, set: S)
    where
        T: Type,
        G: NativeFn<(), T>,
        S: NativeFn<(T,), ()>,
    {
        if self.statics {
            let result = static_getter::<T, G>(self.frame, get).and_then(|get| {
                let set = static_setter::<T, S>(self.frame, set)?;
                define_accessor(self.frame, &self.target, name, get, Some(set))
            });
            self.record(result);
        }
    }

    fn static_property_readonly<T: Type, G: NativeFn<(), T>>(&mut self, name: &'static str, get: G) {
        if self.statics {
            let result = static_getter::<T, G>(self.frame, get)
                .and_then(|get| define_accessor(self.frame, &self.target, name, get, None));
            self.record(result);
        }
    }

    fn constant<T: Type>(&mut self, name: &'static str, value: T) {
        let result = define_constant(self.frame, &self.target, name, value);
        self.record(result);
    }
}

/// Instance members on one handle's own table
struct InstanceInspector<'a, 'js, C: ?Sized> {
    frame: &'a mut Frame<'js>,
    table: Object<'js>,
    error: Option<ScriptError>,
    _class: PhantomData<fn(&C)>,
}

impl<'a, 'js, C: Bindable + ?Sized> Inspector<C> for InstanceInspector<'a, 'js, C> {
    fn method<A: 'static, R: Returns, F: NativeMethod<C, A, R>>(&mut self, name: &'static str, method: F) {
        if let Err(error) = define_method::<C, A, R, F>(self.frame, &self.table, name, method) {
            self.error.get_or_insert(error);
        }
    }

    fn property<T, G, S>(&mut self, name: &'static str, get: G, set: S)
    where
        T: Type,
        G: NativeMethod<C, (), T>,
        S: NativeMethod<C, (T,), ()>,
    {
        let result = getter::<C, T, G>(self.frame, get).and_then(|get| {
            let set = setter::<C, T, S>(self.frame, set)?;
            define_accessor(self.frame, &self.table, name, get, Some(set))
        });
        if let Err(error) = result {
            self.error.get_or_insert(error);
        }
    }

    fn property_readonly<T: Type, G: NativeMethod<C, (), T>>(&mut self, name: &'static str, get: G) {
        let result = getter::<C, T, G>(self.frame, get)
            .and_then(|get| define_accessor(self.frame, &self.table, name, get, None));
        if let Err(error) = result {
            self.error.get_or_insert(error);
        }
    }

    fn constant<T: Type>(&mut self, name: &'static str, value: T) {
        if let Err(error) = define_constant(self.frame, &self.table, name, value) {
            self.error.get_or_insert(error);
        }
    }
}

/// Prototype of the nearest registered ancestor of `C`
fn inherited_prototype<'js, C: ClassInfo + ?Sized>(frame: &Frame<'js>) -> Result<Option<Object<'js>>> {
    let ancestors: Vec<TypeId> = frame
        .shared()
        .classes
        .borrow()
        .chain(TypeId::of::<C>())
        .iter()
        .skip(1)
        .map(|descriptor| descriptor.type_id())
        .collect();
    for ancestor in ancestors {
        if let Some(prototype) = prototype_for(frame, ancestor)? {
            return Ok(Some(prototype));
        }
    }
    Ok(None)
}

/// Member table for a handle of a class that has no registered prototype
pub(crate) fn instance_table<'js, C: Bindable + ?Sized>(frame: &mut Frame<'js>) -> Result<Object<'js>> {
    let table = Object::new(frame.ctx().clone()).map_err(|e| frame.engine_error(e))?;
    if let Some(parent) = inherited_prototype::<C>(frame)? {
        table
            .set_prototype(Some(&parent))
            .map_err(|e| frame.engine_error(e))?;
    }
    let mut inspector = InstanceInspector::<C> {
        frame,
        table: table.clone(),
        error: None,
        _class: PhantomData,
    };
    C::inspect(&mut inspector);
    match inspector.error {
        Some(error) => Err(error),
        None => Ok(table),
    }
}

impl<'js> Frame<'js> {
    /// Bind `value` at a dot-separated path below the global object, creating
    /// intermediate namespace objects as needed
    pub fn define_qualified(&mut self, qualified: &str, value: Value<'js>) -> Result<()> {
        let mut parts: Vec<&str> = qualified.split('.').collect();
        let leaf = parts.pop().unwrap_or(qualified);
        let mut scope = self.ctx().globals();
        for part in parts {
            let existing: Value<'js> = scope.get(part).map_err(|e| self.engine_error(e))?;
            scope = match existing.into_object() {
                Some(namespace) => namespace,
                None => {
                    let namespace = Object::new(self.ctx().clone()).map_err(|e| self.engine_error(e))?;
                    scope
                        .set(part, namespace.clone())
                        .map_err(|e| self.engine_error(e))?;
                    namespace
                }
            };
        }
        scope.set(leaf, value).map_err(|e| self.engine_error(e))
    }

    /// Register `C` under its qualified name: constructor (if declared),
    /// shared prototype, statics and constants. Register bases first; a
    /// class's prototype chains to its base's.
    pub fn register_class<C: Bindable + ?Sized>(&mut self) -> Result<()> {
        let shared = Rc::clone(self.shared());
        let descriptor = shared.classes.borrow_mut().describe::<C>().clone();
        if shared.prototypes.borrow().contains_key(&descriptor.type_id()) {
            tracing::debug!(class = C::NAME, "class already registered");
            return Ok(());
        }

        let prototype = Object::new(self.ctx().clone()).map_err(|e| self.engine_error(e))?;
        if let Some(parent) = inherited_prototype::<C>(self)? {
            prototype
                .set_prototype(Some(&parent))
                .map_err(|e| self.engine_error(e))?;
        }

        let mut registration = RegistrationInspector::<C> {
            frame: self,
            prototype: prototype.clone(),
            constructor: None,
            error: None,
            _class: PhantomData,
        };
        C::inspect(&mut registration);
        let RegistrationInspector {
            constructor, error, ..
        } = registration;
        if let Some(error) = error {
            return Err(error);
        }

        let class_object = match constructor {
            Some(constructor) => {
                let wire = || -> rquickjs::Result<()> {
                    constructor.set("prototype", prototype.clone())?;
                    prototype.prop("constructor", Property::from(constructor.clone()).writable().configurable())
                };
                wire().map_err(|e| self.engine_error(e))?;
                constructor.into_inner()
            }
            None => {
                let class_object = Object::new(self.ctx().clone()).map_err(|e| self.engine_error(e))?;
                class_object
                    .set("prototype", prototype.clone())
                    .map_err(|e| self.engine_error(e))?;
                class_object
            }
        };

        let mut statics = ConstantsInspector::<C>::new(self, class_object.clone(), true);
        C::inspect(&mut statics);
        statics.finish()?;

        shared.prototypes.borrow_mut().insert(
            descriptor.type_id(),
            rquickjs::Persistent::save(self.ctx(), prototype),
        );
        // Erased access and listings only; typed class codecs are not gated
        let mut types = shared.types.borrow_mut();
        types.register::<Rc<C>>();
        types.register::<Box<C>>();
        drop(types);

        self.define_qualified(descriptor.name(), class_object.into_value())?;
        tracing::debug!(class = C::NAME, base = ?descriptor.base_name(), "class registered");
        Ok(())
    }

    /// Export `E`'s constants as a frozen object under its qualified name
    pub fn register_enum<E: Bindable + ?Sized>(&mut self) -> Result<()> {
        let object = Object::new(self.ctx().clone()).map_err(|e| self.engine_error(e))?;
        let mut constants = ConstantsInspector::<E>::new(self, object.clone(), false);
        E::inspect(&mut constants);
        constants.finish()?;
        freeze(self, &object)?;
        self.define_qualified(E::NAME, object.into_value())?;
        tracing::debug!(name = E::NAME, "constants registered");
        Ok(())
    }

    /// Write `C`'s constants into the object at `index`
    pub fn put_constants<C: Bindable + ?Sized>(&mut self, index: i32) -> Result<()> {
        let target = self.object_at(index)?;
        let mut constants = ConstantsInspector::<C>::new(self, target, false);
        C::inspect(&mut constants);
        constants.finish()
    }

    /// Bind a native function at a (possibly qualified) global name
    pub fn register_function<A, R, F>(&mut self, name: &str, function: F) -> Result<()>
    where
        A: 'static,
        R: Returns,
        F: NativeFn<A, R>,
    {
        self.push_function(name, function)?;
        let function = self.pop()?;
        self.define_qualified(name, function)
    }

    /// Push a native function as a script value
    pub fn push_function<A, R, F>(&mut self, name: &str, function: F) -> Result<()>
    where
        A: 'static,
        R: Returns,
        F: NativeFn<A, R>,
    {
        F::check(&self.shared().types.borrow())?;
        let leaf = name.rsplit('.').next().unwrap_or(name);
        let function = dispatch::function(self, leaf, FunctionCall::<F, A, R>::new(function))?;
        self.push_value(function.into_value());
        Ok(())
    }
}
