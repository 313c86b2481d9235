// class.rs - Class descriptors and the polymorphic cast table
//
// Every bindable type declares a qualified name and at most one base with
// `define_class!`. A base is a trait object the class coerces into, so a chain
// reads `Circle -> dyn Shape -> dyn Drawable`. Casts between levels walk the
// recorded parent links; only a trip *down* the chain needs a dynamic check.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::rc::Rc;

use crate::boxes::Erased;
use crate::error::FatalError;

/// Runtime identity for trait-object classes.
///
/// Make it a supertrait (`trait Shape: Polymorphic`) and declare the class
/// `polymorphic` to let script values stored as `dyn Shape` be recovered as
/// their concrete type.
pub trait Polymorphic: Any {
    fn as_any(&self) -> &dyn Any;
    fn into_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
    fn into_any_box(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Any> Polymorphic for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }

    fn into_any_box(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Static class metadata, implemented with [`define_class!`](crate::define_class)
pub trait ClassInfo: 'static {
    /// Qualified, dot-separated script name (e.g. `"SpaceInvaders.Spaceship"`)
    const NAME: &'static str;

    fn descriptor() -> ClassDescriptor;
}

/// Which smart pointer an erased value travels in
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Carrier {
    Shared,
    Exclusive,
    Pointer,
}

/// Upcasts for one parent link, one per carrier
#[doc(hidden)]
#[derive(Clone, Copy)]
pub struct CastFns {
    pub shared: fn(Erased) -> Option<Erased>,
    pub exclusive: fn(Erased) -> Option<Erased>,
    pub pointer: fn(Erased) -> Option<Erased>,
}

impl CastFns {
    fn get(&self, carrier: Carrier) -> fn(Erased) -> Option<Erased> {
        match carrier {
            Carrier::Shared => self.shared,
            Carrier::Exclusive => self.exclusive,
            Carrier::Pointer => self.pointer,
        }
    }
}

#[derive(Clone, Copy)]
struct BaseLink {
    parent: TypeId,
    parent_name: &'static str,
    parent_descriptor: fn() -> ClassDescriptor,
    upcast: CastFns,
}

/// Recovers the concrete value behind a polymorphic trait object
#[derive(Clone, Copy)]
struct DynamicCast {
    shared_id: fn(&Erased) -> Option<TypeId>,
    exclusive_id: fn(&Erased) -> Option<TypeId>,
    pointer_id: fn(&Erased) -> Option<TypeId>,
    shared_any: fn(Erased) -> Option<Rc<dyn Any>>,
    exclusive_any: fn(Erased) -> Option<Box<dyn Any>>,
    pointer_thin: fn(Erased) -> Option<*const ()>,
}

fn shared_id<T: ?Sized + Polymorphic>(value: &Erased) -> Option<TypeId> {
    value
        .downcast_ref::<Rc<T>>()
        .map(|rc| Any::type_id(<T as Polymorphic>::as_any(&**rc)))
}

fn exclusive_id<T: ?Sized + Polymorphic>(value: &Erased) -> Option<TypeId> {
    value
        .downcast_ref::<Box<T>>()
        .map(|boxed| Any::type_id(<T as Polymorphic>::as_any(&**boxed)))
}

fn pointer_id<T: ?Sized + Polymorphic>(value: &Erased) -> Option<TypeId> {
    let ptr = *value.downcast_ref::<*const T>()?;
    // SAFETY: pointers only enter the cast table while the object they point at
    // is pinned by its box or by a `with_ref` borrow.
    unsafe { ptr.as_ref() }.map(|object| Any::type_id(<T as Polymorphic>::as_any(object)))
}

fn shared_any<T: ?Sized + Polymorphic>(value: Erased) -> Option<Rc<dyn Any>> {
    value
        .downcast::<Rc<T>>()
        .ok()
        .map(|rc| <T as Polymorphic>::into_any_rc(*rc))
}

fn exclusive_any<T: ?Sized + Polymorphic>(value: Erased) -> Option<Box<dyn Any>> {
    value
        .downcast::<Box<T>>()
        .ok()
        .map(|boxed| <T as Polymorphic>::into_any_box(*boxed))
}

fn pointer_thin<T: ?Sized + 'static>(value: Erased) -> Option<*const ()> {
    value.downcast::<*const T>().ok().map(|ptr| *ptr as *const ())
}

/// Rebuilds a typed carrier once the concrete type is known
#[derive(Clone, Copy)]
struct ConcreteCast {
    from_shared: fn(Rc<dyn Any>) -> Option<Erased>,
    from_exclusive: fn(Box<dyn Any>) -> Option<Erased>,
    from_thin: fn(*const ()) -> Erased,
}

fn from_shared<T: Any>(value: Rc<dyn Any>) -> Option<Erased> {
    value.downcast::<T>().ok().map(|rc| Box::new(rc) as Erased)
}

fn from_exclusive<T: Any>(value: Box<dyn Any>) -> Option<Erased> {
    value.downcast::<T>().ok().map(|boxed| Box::new(boxed) as Erased)
}

fn from_thin<T: Any>(ptr: *const ()) -> Erased {
    Box::new(ptr as *const T)
}

/// Static per-type record: name, optional base, polymorphic flag
#[derive(Clone)]
pub struct ClassDescriptor {
    name: &'static str,
    type_id: TypeId,
    base: Option<BaseLink>,
    dynamic: Option<DynamicCast>,
    concrete: Option<ConcreteCast>,
}

impl ClassDescriptor {
    /// Descriptor for a trait-object class
    pub fn new<T: ?Sized + 'static>(name: &'static str) -> Self {
        Self {
            name,
            type_id: TypeId::of::<T>(),
            base: None,
            dynamic: None,
            concrete: None,
        }
    }

    /// Descriptor for a sized class; such a class can be the target of a downcast
    pub fn concrete<T: Any>(name: &'static str) -> Self {
        Self {
            concrete: Some(ConcreteCast {
                from_shared: from_shared::<T>,
                from_exclusive: from_exclusive::<T>,
                from_thin: from_thin::<T>,
            }),
            ..Self::new::<T>(name)
        }
    }

    #[doc(hidden)]
    pub fn with_base<P: ClassInfo + ?Sized>(mut self, upcast: CastFns) -> Self {
        self.base = Some(BaseLink {
            parent: TypeId::of::<P>(),
            parent_name: P::NAME,
            parent_descriptor: P::descriptor,
            upcast,
        });
        self
    }

    #[doc(hidden)]
    pub fn polymorphic<T: ?Sized + Polymorphic>(mut self) -> Self {
        self.dynamic = Some(DynamicCast {
            shared_id: shared_id::<T>,
            exclusive_id: exclusive_id::<T>,
            pointer_id: pointer_id::<T>,
            shared_any: shared_any::<T>,
            exclusive_any: exclusive_any::<T>,
            pointer_thin: pointer_thin::<T>,
        });
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is_polymorphic(&self) -> bool {
        self.dynamic.is_some()
    }

    pub fn base_name(&self) -> Option<&'static str> {
        self.base.as_ref().map(|base| base.parent_name)
    }

    pub fn parent(&self) -> Option<TypeId> {
        self.base.as_ref().map(|base| base.parent)
    }

    /// Namespace path and leaf name of the qualified name
    pub fn split_name(&self) -> (Vec<&'static str>, &'static str) {
        let mut parts: Vec<&'static str> = self.name.split('.').collect();
        let leaf = parts.pop().unwrap_or(self.name);
        (parts, leaf)
    }
}

impl std::fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("base", &self.base_name())
            .field("polymorphic", &self.is_polymorphic())
            .finish()
    }
}

/// Resolved route from a stored class to a requested one
pub(crate) struct CastPlan {
    carrier: Carrier,
    dynamic: Option<(DynamicCast, ConcreteCast)>,
    links: Vec<CastFns>,
    from: &'static str,
    to: &'static str,
}

/// Parent-link table of every described class
#[derive(Default)]
pub struct ClassTable {
    classes: HashMap<TypeId, ClassDescriptor>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `T` and its whole base chain; a no-op if already present
    pub fn describe<T: ClassInfo + ?Sized>(&mut self) -> &ClassDescriptor {
        self.insert(T::descriptor());
        &self.classes[&TypeId::of::<T>()]
    }

    fn insert(&mut self, descriptor: ClassDescriptor) {
        if self.classes.contains_key(&descriptor.type_id) {
            return;
        }
        if let Some(base) = descriptor.base {
            if !self.classes.contains_key(&base.parent) {
                self.insert((base.parent_descriptor)());
            }
        }
        tracing::trace!(class = descriptor.name, base = ?descriptor.base_name(), "class described");
        self.classes.insert(descriptor.type_id, descriptor);
    }

    pub fn get(&self, id: TypeId) -> Option<&ClassDescriptor> {
        self.classes.get(&id)
    }

    pub fn name_of(&self, id: TypeId) -> &'static str {
        self.get(id).map_or("<unregistered class>", ClassDescriptor::name)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// `id` followed by each of its ancestors, nearest first
    pub fn chain(&self, id: TypeId) -> Vec<&ClassDescriptor> {
        let mut chain = Vec::new();
        let mut current = self.get(id);
        while let Some(descriptor) = current {
            chain.push(descriptor);
            current = descriptor.parent().and_then(|parent| self.get(parent));
        }
        chain
    }

    /// True if `ancestor` is `id` or appears on its base chain
    pub fn is_a(&self, id: TypeId, ancestor: TypeId) -> bool {
        self.path(id, ancestor).is_some()
    }

    fn path(&self, from: TypeId, to: TypeId) -> Option<Vec<CastFns>> {
        let mut links = Vec::new();
        let mut current = from;
        while current != to {
            let base = self.classes.get(&current)?.base?;
            links.push(base.upcast);
            current = base.parent;
        }
        Some(links)
    }

    /// Work out how to view a value stored as `from` as a `to`.
    ///
    /// Upcasts resolve statically. Anything else needs `from` to be polymorphic
    /// and the value's concrete type to have `to` on its chain. `None` means the
    /// value is not a `to`; nothing has been consumed yet.
    pub(crate) fn plan(
        &self,
        carrier: Carrier,
        from: TypeId,
        to: TypeId,
        value: &Erased,
    ) -> Option<CastPlan> {
        let names = (self.name_of(from), self.name_of(to));
        if let Some(links) = self.path(from, to) {
            return Some(CastPlan {
                carrier,
                dynamic: None,
                links,
                from: names.0,
                to: names.1,
            });
        }

        let dynamic = self.get(from)?.dynamic?;
        let concrete_id = match carrier {
            Carrier::Shared => (dynamic.shared_id)(value),
            Carrier::Exclusive => (dynamic.exclusive_id)(value),
            Carrier::Pointer => (dynamic.pointer_id)(value),
        }?;
        let concrete = self.get(concrete_id)?.concrete?;
        let links = self.path(concrete_id, to)?;
        Some(CastPlan {
            carrier,
            dynamic: Some((dynamic, concrete)),
            links,
            from: names.0,
            to: names.1,
        })
    }

    /// Carry out a plan. Failure here means the table lied about a type.
    pub(crate) fn apply(&self, plan: CastPlan, value: Erased) -> Result<Erased, FatalError> {
        let failed = || FatalError::CastFailed {
            from: plan.from.to_string(),
            to: plan.to.to_string(),
        };

        let mut value = value;
        if let Some((dynamic, concrete)) = plan.dynamic {
            value = match plan.carrier {
                Carrier::Shared => (dynamic.shared_any)(value).and_then(concrete.from_shared),
                Carrier::Exclusive => {
                    (dynamic.exclusive_any)(value).and_then(concrete.from_exclusive)
                }
                Carrier::Pointer => (dynamic.pointer_thin)(value).map(concrete.from_thin),
            }
            .ok_or_else(failed)?;
        }
        for link in &plan.links {
            value = (link.get(plan.carrier))(value).ok_or_else(failed)?;
        }
        Ok(value)
    }
}

/// Declare a class's script name and optional base.
///
/// ```ignore
/// define_class!(dyn Shape, "Geometry.Shape", polymorphic);
/// define_class!(Circle: dyn Shape, "Geometry.Circle");
/// define_class!(Spaceship, "SpaceInvaders.Spaceship");
/// ```
///
/// A base must be a trait object the class coerces into.
#[macro_export]
macro_rules! define_class {
    (dyn $tr:path $(: $base:ty)?, $name:expr, polymorphic) => {
        impl $crate::class::ClassInfo for dyn $tr {
            const NAME: &'static str = $name;

            fn descriptor() -> $crate::class::ClassDescriptor {
                let descriptor = $crate::class::ClassDescriptor::new::<dyn $tr>($name)
                    .polymorphic::<dyn $tr>();
                $(let descriptor = descriptor.with_base::<$base>($crate::__cast_link!(dyn $tr => $base));)?
                descriptor
            }
        }
    };
    (dyn $tr:path $(: $base:ty)?, $name:expr) => {
        impl $crate::class::ClassInfo for dyn $tr {
            const NAME: &'static str = $name;

            fn descriptor() -> $crate::class::ClassDescriptor {
                let descriptor = $crate::class::ClassDescriptor::new::<dyn $tr>($name);
                $(let descriptor = descriptor.with_base::<$base>($crate::__cast_link!(dyn $tr => $base));)?
                descriptor
            }
        }
    };
    ($ty:ty $(: $base:ty)?, $name:expr) => {
        impl $crate::class::ClassInfo for $ty {
            const NAME: &'static str = $name;

            fn descriptor() -> $crate::class::ClassDescriptor {
                let descriptor = $crate::class::ClassDescriptor::concrete::<$ty>($name);
                $(let descriptor = descriptor.with_base::<$base>($crate::__cast_link!($ty => $base));)?
                descriptor
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __cast_link {
    ($from:ty => $to:ty) => {
        $crate::class::CastFns {
            shared: |value| {
                value
                    .downcast::<::std::rc::Rc<$from>>()
                    .ok()
                    .map(|rc| ::std::boxed::Box::new(*rc as ::std::rc::Rc<$to>) as $crate::boxes::Erased)
            },
            exclusive: |value| {
                value
                    .downcast::<::std::boxed::Box<$from>>()
                    .ok()
                    .map(|b| ::std::boxed::Box::new(*b as ::std::boxed::Box<$to>) as $crate::boxes::Erased)
            },
            pointer: |value| {
                value
                    .downcast::<*const $from>()
                    .ok()
                    .map(|p| ::std::boxed::Box::new(*p as *const $to) as $crate::boxes::Erased)
            },
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Animal: Polymorphic {
        fn noise(&self) -> String;
    }

    trait Pet: Animal {
        fn owner(&self) -> String;
    }

    struct Dog;

    impl Animal for Dog {
        fn noise(&self) -> String {
            "woof".into()
        }
    }

    impl Pet for Dog {
        fn owner(&self) -> String {
            "ada".into()
        }
    }

    struct Crow;

    impl Animal for Crow {
        fn noise(&self) -> String {
            "caw".into()
        }
    }

    crate::define_class!(dyn Animal, "Zoo.Animal", polymorphic);
    crate::define_class!(dyn Pet: dyn Animal, "Zoo.Pet", polymorphic);
    crate::define_class!(Dog: dyn Pet, "Zoo.Dog");
    crate::define_class!(Crow: dyn Animal, "Zoo.Crow");

    fn cast<T: ?Sized + 'static>(table: &ClassTable, from: TypeId, value: Erased) -> Option<Rc<T>> {
        let plan = table.plan(Carrier::Shared, from, TypeId::of::<T>(), &value)?;
        let value = table.apply(plan, value).ok()?;
        value.downcast::<Rc<T>>().ok().map(|rc| *rc)
    }

    #[test]
    fn describe_records_the_whole_chain() {
        let mut table = ClassTable::new();
        table.describe::<Dog>();
        assert_eq!(table.len(), 3);

        let names: Vec<_> = table
            .chain(TypeId::of::<Dog>())
            .iter()
            .map(|d| d.name())
            .collect();
        assert_eq!(names, ["Zoo.Dog", "Zoo.Pet", "Zoo.Animal"]);
        assert_eq!(table.get(TypeId::of::<dyn Pet>()).unwrap().base_name(), Some("Zoo.Animal"));
    }

    #[test]
    fn upcast_walks_two_links() {
        let mut table = ClassTable::new();
        table.describe::<Dog>();

        let stored: Erased = Box::new(Rc::new(Dog));
        let animal = cast::<dyn Animal>(&table, TypeId::of::<Dog>(), stored).unwrap();
        assert_eq!(animal.noise(), "woof");
    }

    #[test]
    fn downcast_checks_dynamic_type() {
        let mut table = ClassTable::new();
        table.describe::<Dog>();
        table.describe::<Crow>();

        let dog: Rc<dyn Animal> = Rc::new(Dog);
        let stored: Erased = Box::new(dog);
        let pet = cast::<dyn Pet>(&table, TypeId::of::<dyn Animal>(), stored).unwrap();
        assert_eq!(pet.owner(), "ada");

        let crow: Rc<dyn Animal> = Rc::new(Crow);
        let stored: Erased = Box::new(crow);
        assert!(cast::<dyn Pet>(&table, TypeId::of::<dyn Animal>(), stored).is_none());
    }

    #[test]
    fn unrelated_classes_do_not_cast() {
        let mut table = ClassTable::new();
        table.describe::<Dog>();
        table.describe::<Crow>();

        let stored: Erased = Box::new(Rc::new(Crow));
        assert!(cast::<Dog>(&table, TypeId::of::<Crow>(), stored).is_none());
        assert!(!table.is_a(TypeId::of::<Crow>(), TypeId::of::<dyn Pet>()));
    }

    #[test]
    fn split_name_separates_namespace() {
        let descriptor = Dog::descriptor();
        assert_eq!(descriptor.split_name(), (vec!["Zoo"], "Dog"));
    }
}
