//! Type conversion registry
//!
//! Codecs themselves are [`Type`] impls. The registry is the runtime table of
//! which codecs a bridge has bootstrapped, keyed by `TypeId`. Frame-level
//! pushes and gets refuse leaf types that were never registered, and
//! registration checks every member signature against it up front.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::error::{FatalError, Result};
use crate::stack::Frame;
use crate::types::Type;

type PushFn = fn(&mut Frame<'_>, Box<dyn Any>) -> Result<()>;
type GetFn = fn(&mut Frame<'_>, i32) -> Result<Box<dyn Any>>;

/// One registered codec
#[derive(Clone)]
pub struct TypeEntry {
    name: String,
    primitive: bool,
    push: PushFn,
    get: GetFn,
}

impl TypeEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copied by value, as opposed to carried through an ownership box
    pub fn is_primitive(&self) -> bool {
        self.primitive
    }
}

impl std::fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeEntry")
            .field("name", &self.name)
            .field("primitive", &self.primitive)
            .finish()
    }
}

fn push_erased<T: Type>(frame: &mut Frame<'_>, value: Box<dyn Any>) -> Result<()> {
    let value = value.downcast::<T>().map_err(|_| FatalError::CastFailed {
        from: "dyn Any".to_string(),
        to: T::type_name(),
    })?;
    T::push(frame, *value)
}

fn get_erased<T: Type>(frame: &mut Frame<'_>, index: i32) -> Result<Box<dyn Any>> {
    Ok(Box::new(T::get(frame, index)?))
}

#[derive(Default, Debug)]
pub struct TypeRegistry {
    entries: HashMap<TypeId, TypeEntry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every primitive codec already in place
    pub fn bootstrap() -> Self {
        let mut registry = Self::new();
        registry.register::<bool>();
        registry.register::<i8>();
        registry.register::<i16>();
        registry.register::<i32>();
        registry.register::<i64>();
        registry.register::<u8>();
        registry.register::<u16>();
        registry.register::<u32>();
        registry.register::<u64>();
        registry.register::<f32>();
        registry.register::<f64>();
        registry.register::<String>();
        registry
    }

    pub fn register<T: Type>(&mut self) {
        self.entries.entry(TypeId::of::<T>()).or_insert_with(|| TypeEntry {
            name: T::type_name(),
            primitive: T::PRIMITIVE,
            push: push_erased::<T>,
            get: get_erased::<T>,
        });
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn entry(&self, id: TypeId) -> Option<&TypeEntry> {
        self.entries.get(&id)
    }

    /// Fails with `UnregisteredType` unless `T` was registered
    pub fn require<T: Type>(&self) -> Result<(), FatalError> {
        if self.contains::<T>() {
            Ok(())
        } else {
            Err(FatalError::UnregisteredType {
                type_name: T::type_name(),
            })
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn codec(&self, id: TypeId) -> Result<(PushFn, GetFn), FatalError> {
        self.entries
            .get(&id)
            .map(|entry| (entry.push, entry.get))
            .ok_or_else(|| FatalError::UnregisteredType {
                type_name: format!("{id:?}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_covers_primitives() {
        let registry = TypeRegistry::bootstrap();
        assert!(registry.contains::<f32>());
        assert!(registry.contains::<String>());
        assert!(registry.entry(TypeId::of::<i32>()).unwrap().is_primitive());
    }

    #[test]
    fn composites_follow_their_elements() {
        let registry = TypeRegistry::bootstrap();
        assert!(<Vec<(i32, String)>>::check(&registry).is_ok());
        assert!(<Option<Vec<f64>>>::check(&registry).is_ok());
    }

    #[test]
    fn unregistered_leaf_is_fatal() {
        #[derive(Debug)]
        struct Opaque;

        impl Type for Opaque {
            fn push(_: &mut Frame<'_>, _: Self) -> Result<()> {
                Ok(())
            }

            fn get(_: &mut Frame<'_>, _: i32) -> Result<Self> {
                Ok(Opaque)
            }
        }

        let mut registry = TypeRegistry::bootstrap();
        assert!(matches!(
            <Vec<Opaque>>::check(&registry),
            Err(FatalError::UnregisteredType { .. })
        ));
        registry.register::<Opaque>();
        assert!(<Vec<Opaque>>::check(&registry).is_ok());
    }
}
