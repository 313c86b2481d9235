//! Native object handles
//!
//! A handle is a script object of the engine class [`NativeHandle`]. The object
//! itself only carries an id. The native pointer and box key live in the
//! bridge's [`HandleTable`], so no script-visible property can shadow or forge them.

use std::any::TypeId;
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use rquickjs::class::{JsClass, Readable, Trace, Tracer};
use rquickjs::{Class, Ctx, JsLifetime, Object, Value};

use crate::boxes::{BoxKey, Erased};
use crate::bridge::Shared;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

/// Side-table entry for one handle
pub(crate) struct HandleRecord {
    /// `*const C` for the record's `class`
    pointer: Erased,
    copy_pointer: fn(&Erased) -> Option<Erased>,
    pub(crate) class: TypeId,
    pub(crate) key: Option<BoxKey>,
    /// Scope flag of a borrowed object; `None` for boxed ones
    pub(crate) alive: Option<Rc<Cell<bool>>>,
}

fn copy_pointer<T: ?Sized + 'static>(pointer: &Erased) -> Option<Erased> {
    pointer
        .downcast_ref::<*const T>()
        .map(|ptr| Box::new(*ptr) as Erased)
}

impl HandleRecord {
    pub(crate) fn new<T: ?Sized + 'static>(pointer: *const T, key: Option<BoxKey>) -> Self {
        Self {
            pointer: Box::new(pointer),
            copy_pointer: copy_pointer::<T>,
            class: TypeId::of::<T>(),
            key,
            alive: None,
        }
    }

    /// Record for an object the host only lends for the length of a scope
    pub(crate) fn borrowed<T: ?Sized + 'static>(pointer: *const T, alive: Rc<Cell<bool>>) -> Self {
        Self {
            alive: Some(alive),
            ..Self::new(pointer, None)
        }
    }

    pub(crate) fn pointer(&self) -> Option<Erased> {
        (self.copy_pointer)(&self.pointer)
    }
}

#[derive(Default)]
pub(crate) struct HandleTable {
    next: u64,
    records: HashMap<HandleId, HandleRecord>,
}

impl HandleTable {
    pub(crate) fn insert(&mut self, record: HandleRecord) -> HandleId {
        let id = HandleId(self.next);
        self.next += 1;
        self.records.insert(id, record);
        id
    }

    pub(crate) fn get(&self, id: HandleId) -> Option<&HandleRecord> {
        self.records.get(&id)
    }

    pub(crate) fn remove(&mut self, id: HandleId) -> Option<HandleRecord> {
        self.records.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}

/// Engine-side payload of a handle object. Dropping it is the finalizer.
pub(crate) struct NativeHandle {
    id: HandleId,
    shared: Weak<Shared>,
}

impl NativeHandle {
    /// Create the script object for an already-recorded handle
    pub(crate) fn instance<'js>(
        id: HandleId,
        shared: Weak<Shared>,
        prototype: Object<'js>,
    ) -> rquickjs::Result<Value<'js>> {
        Class::instance_proto(NativeHandle { id, shared }, prototype).map(Class::into_value)
    }

    /// Handle id behind a script value, if it is a handle object
    pub(crate) fn id_of(value: &Value<'_>) -> Option<HandleId> {
        let object = value.as_object()?;
        let class = Class::<NativeHandle>::from_object(object)?;
        let handle = class.try_borrow().ok()?;
        Some(handle.id)
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.finalize_handle(self.id);
        }
    }
}

impl<'js> Trace<'js> for NativeHandle {
    fn trace<'a>(&self, _tracer: Tracer<'a, 'js>) {}
}

unsafe impl<'js> JsLifetime<'js> for NativeHandle {
    type Changed<'to> = NativeHandle;
}

impl<'js> JsClass<'js> for NativeHandle {
    const NAME: &'static str = "NativeHandle";

    type Mutable = Readable;

    fn constructor(_ctx: &Ctx<'js>) -> rquickjs::Result<Option<rquickjs::function::Constructor<'js>>> {
        Ok(None)
    }
}

/// `*const T` out of an erased pointer carrier
pub(crate) fn typed_pointer<T: ?Sized + 'static>(pointer: Erased) -> Option<*const T> {
    pointer.downcast::<*const T>().ok().map(|ptr| *ptr)
}
