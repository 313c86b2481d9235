//! Codecs for bindable classes
//!
//! `Rc<C>` and `Box<C>` hand ownership to script: the value goes into an
//! ownership box and script receives a handle. Reading them back retrieves from
//! that box. [`Ref<C>`] only borrows, pinning the object for one call.

use std::any::TypeId;
use std::cell::Cell;
use std::ops::Deref;
use std::rc::{Rc, Weak};

use rquickjs::{Object, Value};

use super::Type;
use crate::boxes::{BoxKey, Erased, Ownership, OwnershipBox};
use crate::bridge::Shared;
use crate::class::{Carrier, ClassInfo};
use crate::error::{FatalError, Result, ScriptError, TypeError};
use crate::handle::{typed_pointer, HandleId, HandleRecord, NativeHandle};
use crate::inspect::{self, Bindable};
use crate::registry::TypeRegistry;
use crate::stack::Frame;

pub(crate) fn is_handle(value: &Value<'_>) -> bool {
    NativeHandle::id_of(value).is_some()
}

impl<'js> Frame<'js> {
    /// True if the value at `index` is a native object handle
    pub fn is_handle(&self, index: i32) -> Result<bool> {
        Ok(is_handle(self.value(index)?))
    }

    /// Box behind the handle at `index`; `None` for values that are not
    /// handles and for borrowed objects
    pub fn box_key(&self, index: i32) -> Result<Option<BoxKey>> {
        let Some(id) = NativeHandle::id_of(self.value(index)?) else {
            return Ok(None);
        };
        Ok(self.shared().handles.borrow().get(id).and_then(|record| record.key))
    }
}

fn missing_linkage<T: ClassInfo + ?Sized>() -> ScriptError {
    TypeError::MissingLinkage {
        expected: T::NAME.to_string(),
    }
    .into()
}

fn wrong_class(expected: &str, found: &str) -> ScriptError {
    TypeError::shape(expected, found).into()
}

/// Registered prototype for `class`, if any
pub(crate) fn prototype_for<'js>(frame: &Frame<'js>, class: TypeId) -> Result<Option<Object<'js>>> {
    let stored = frame.shared().prototypes.borrow().get(&class).cloned();
    stored
        .map(|prototype| prototype.restore(frame.ctx()))
        .transpose()
        .map_err(|e| frame.engine_error(e))
}

/// Record a handle and push its script object. On failure the record, and the
/// box it points at, are released again.
pub(crate) fn push_handle<T: Bindable + ?Sized>(
    frame: &mut Frame<'_>,
    record: HandleRecord,
) -> Result<HandleId> {
    let shared = Rc::clone(frame.shared());
    shared.classes.borrow_mut().describe::<T>();
    let id = shared.handles.borrow_mut().insert(record);

    let value = prototype_for(frame, TypeId::of::<T>())
        .and_then(|prototype| match prototype {
            Some(prototype) => Ok(prototype),
            None => inspect::instance_table::<T>(frame),
        })
        .and_then(|prototype| {
            NativeHandle::instance(id, Rc::downgrade(&shared), prototype)
                .map_err(|e| frame.engine_error(e))
        });

    match value {
        Ok(value) => {
            tracing::trace!(class = T::NAME, handle = ?id, "handle pushed");
            frame.push_value(value);
            Ok(id)
        }
        Err(error) => {
            shared.finalize_handle(id);
            Err(error)
        }
    }
}

/// Push a handle to an object the host keeps; it goes stale once `alive` clears
pub(crate) fn push_transient<T: Bindable + ?Sized>(
    frame: &mut Frame<'_>,
    value: &T,
    alive: Rc<Cell<bool>>,
) -> Result<HandleId> {
    push_handle::<T>(frame, HandleRecord::borrowed(value as *const T, alive))
}

/// Outcome of reading an owning carrier out of a handle
enum Retrieved {
    Cast(Erased),
    /// The object is not a `T`; the box is left as it was
    Mismatch { found: String },
}

impl Retrieved {
    fn required<T: ClassInfo + ?Sized>(self) -> Result<Erased> {
        match self {
            Retrieved::Cast(erased) => Ok(erased),
            Retrieved::Mismatch { found } => Err(wrong_class(T::NAME, &found)),
        }
    }

    fn optional(self) -> Option<Erased> {
        match self {
            Retrieved::Cast(erased) => Some(erased),
            Retrieved::Mismatch { .. } => None,
        }
    }
}

/// Retrieve an owning carrier of `T` from the handle at `index`
fn retrieve<T: ClassInfo + ?Sized>(frame: &Frame<'_>, index: i32, carrier: Carrier) -> Result<Retrieved> {
    let id = NativeHandle::id_of(frame.value(index)?).ok_or_else(missing_linkage::<T>)?;
    let shared = frame.shared();
    shared.classes.borrow_mut().describe::<T>();

    let key = {
        let handles = shared.handles.borrow();
        let record = handles.get(id).ok_or(TypeError::StaleHandle)?;
        record.key
    };
    let Some(key) = key else {
        return Err(wrong_class(&format!("owned {}", T::NAME), "borrowed reference"));
    };

    let wanted = match carrier {
        Carrier::Shared => Ownership::Shared,
        _ => Ownership::Exclusive,
    };
    let (class, erased) = {
        let mut boxes = shared.boxes.borrow_mut();
        let slot = boxes.get_mut(key).ok_or(FatalError::StaleBoxKey { key })?;
        if slot.ownership() != wanted {
            let found = match slot.ownership() {
                Ownership::Shared => "shared object",
                Ownership::Exclusive => "exclusively owned object",
            };
            let expected = match wanted {
                Ownership::Shared => format!("Rc<{}>", T::NAME),
                Ownership::Exclusive => format!("Box<{}>", T::NAME),
            };
            return Err(wrong_class(&expected, found));
        }
        (slot.class(), slot.retrieve(key)?)
    };

    let plan = shared
        .classes
        .borrow()
        .plan(carrier, class, TypeId::of::<T>(), &erased);
    let Some(plan) = plan else {
        let found = shared.classes.borrow().name_of(class);
        if wanted == Ownership::Exclusive {
            restore(shared, key, erased);
        }
        return Ok(Retrieved::Mismatch {
            found: found.to_string(),
        });
    };
    let cast = shared.classes.borrow().apply(plan, erased)?;
    Ok(Retrieved::Cast(cast))
}

/// Put an exclusive value back into its box, or drop it if the box is gone
fn restore(shared: &Shared, key: BoxKey, value: Erased) {
    let leftover = match shared.boxes.borrow_mut().get_mut(key) {
        Some(slot) => {
            slot.restore(value);
            None
        }
        None => Some(value),
    };
    drop(leftover);
}

impl<T: Bindable + ?Sized> Type for Rc<T> {
    const PRIMITIVE: bool = false;

    fn type_name() -> String {
        format!("Rc<{}>", T::NAME)
    }

    /// Class carriers are resolved through the class table, not the registry
    fn check(_: &TypeRegistry) -> Result<(), FatalError> {
        Ok(())
    }

    fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
        let pointer = Rc::as_ptr(&value);
        let key = frame
            .shared()
            .boxes
            .borrow_mut()
            .insert(OwnershipBox::shared(value));
        push_handle::<T>(frame, HandleRecord::new(pointer, Some(key))).map(drop)
    }

    fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        let erased = retrieve::<T>(frame, index, Carrier::Shared)?.required::<T>()?;
        unerase_rc(erased)
    }

    /// A handle of an unrelated or sibling class reads as `None`
    fn try_get(frame: &mut Frame<'_>, index: i32) -> Result<Option<Self>> {
        retrieve::<T>(frame, index, Carrier::Shared)?
            .optional()
            .map(unerase_rc)
            .transpose()
    }
}

impl<T: Bindable + ?Sized> Type for Box<T> {
    const PRIMITIVE: bool = false;

    fn type_name() -> String {
        format!("Box<{}>", T::NAME)
    }

    fn check(_: &TypeRegistry) -> Result<(), FatalError> {
        Ok(())
    }

    fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
        let pointer: *const T = &*value;
        let key = frame
            .shared()
            .boxes
            .borrow_mut()
            .insert(OwnershipBox::exclusive(value));
        push_handle::<T>(frame, HandleRecord::new(pointer, Some(key))).map(drop)
    }

    /// Moves the object out; the box stays behind emptied
    fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        let erased = retrieve::<T>(frame, index, Carrier::Exclusive)?.required::<T>()?;
        unerase_box(erased)
    }

    /// On a class mismatch the object stays in its box and `None` comes back
    fn try_get(frame: &mut Frame<'_>, index: i32) -> Result<Option<Self>> {
        retrieve::<T>(frame, index, Carrier::Exclusive)?
            .optional()
            .map(unerase_box)
            .transpose()
    }
}

fn unerase_rc<T: ClassInfo + ?Sized>(erased: Erased) -> Result<Rc<T>> {
    erased
        .downcast::<Rc<T>>()
        .map(|rc| *rc)
        .map_err(|_| cast_failed::<T>("Rc"))
}

fn unerase_box<T: ClassInfo + ?Sized>(erased: Erased) -> Result<Box<T>> {
    erased
        .downcast::<Box<T>>()
        .map(|boxed| *boxed)
        .map_err(|_| cast_failed::<T>("Box"))
}

fn cast_failed<T: ClassInfo + ?Sized>(carrier: &str) -> ScriptError {
    FatalError::CastFailed {
        from: "erased carrier".to_string(),
        to: format!("{carrier}<{}>", T::NAME),
    }
    .into()
}

/// Keeps a referenced object alive while a [`Ref`] exists. The owning
/// variants are only held for their drop.
enum Pin {
    Shared { _clone: Erased },
    Lent { _lent: Lent },
    Scoped(Rc<Cell<bool>>),
}

/// An exclusive value taken out of its box for the length of a call
struct Lent {
    shared: Weak<Shared>,
    key: BoxKey,
    value: Option<Erased>,
}

impl Drop for Lent {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        match self.shared.upgrade() {
            Some(shared) => restore(&shared, self.key, value),
            None => drop(value),
        }
    }
}

/// Borrowed view of a script-held native object.
///
/// As a native parameter it accepts any handle whose class is `T` or derives
/// from it, without taking ownership. The object is pinned until the `Ref` is
/// dropped; an exclusively owned object cannot be reached again meanwhile.
pub struct Ref<T: ?Sized + 'static> {
    pointer: *const T,
    pin: Pin,
}

impl<T: ClassInfo + ?Sized> Ref<T> {
    pub(crate) fn resolve(frame: &Frame<'_>, value: &Value<'_>) -> Result<Self> {
        let id = NativeHandle::id_of(value).ok_or_else(missing_linkage::<T>)?;
        let shared = frame.shared();
        shared.classes.borrow_mut().describe::<T>();

        let (pointer, class, key, alive) = {
            let handles = shared.handles.borrow();
            let record = handles.get(id).ok_or(TypeError::StaleHandle)?;
            (record.pointer(), record.class, record.key, record.alive.clone())
        };
        let pointer = pointer.ok_or(FatalError::NullHandle)?;

        let pin = match (key, alive) {
            (Some(key), _) => {
                let mut boxes = shared.boxes.borrow_mut();
                let slot = boxes.get_mut(key).ok_or(FatalError::StaleBoxKey { key })?;
                let ownership = slot.ownership();
                let value = slot.lend(key)?;
                match ownership {
                    Ownership::Shared => Pin::Shared { _clone: value },
                    Ownership::Exclusive => Pin::Lent {
                        _lent: Lent {
                            shared: Rc::downgrade(shared),
                            key,
                            value: Some(value),
                        },
                    },
                }
            }
            (None, Some(alive)) if alive.get() => Pin::Scoped(alive),
            (None, Some(_)) => return Err(TypeError::StaleHandle.into()),
            (None, None) => return Err(FatalError::NullHandle.into()),
        };

        let plan = shared
            .classes
            .borrow()
            .plan(Carrier::Pointer, class, TypeId::of::<T>(), &pointer);
        let Some(plan) = plan else {
            let found = shared.classes.borrow().name_of(class);
            drop(pin);
            return Err(wrong_class(T::NAME, found));
        };
        let cast = shared.classes.borrow().apply(plan, pointer)?;
        let pointer = typed_pointer::<T>(cast).ok_or_else(|| cast_failed::<T>("Ref"))?;
        if pointer.is_null() {
            return Err(FatalError::NullHandle.into());
        }
        Ok(Ref { pointer, pin })
    }
}

impl<T: ?Sized + 'static> Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        if let Pin::Scoped(alive) = &self.pin {
            assert!(alive.get(), "borrowed native object used after its scope ended");
        }
        // SAFETY: the pin keeps the pointee alive: an `Rc` clone, the lent
        // `Box`, or a host borrow whose scope is still open.
        unsafe { &*self.pointer }
    }
}

impl<T: ?Sized + std::fmt::Debug + 'static> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Ref").field(&&**self).finish()
    }
}

impl<T: ClassInfo + ?Sized> super::Arg for Ref<T> {
    fn check(_: &TypeRegistry) -> Result<(), FatalError> {
        Ok(())
    }

    fn unpack(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        let value = frame.value(index)?.clone();
        Ref::resolve(frame, &value)
    }
}
