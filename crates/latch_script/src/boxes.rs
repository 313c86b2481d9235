//! Ownership boxes and the generational box table
//!
//! A box is the one place a native object handed to script lives. Script handles
//! only ever refer to it by [`BoxKey`]; the box decides what "retrieving" the
//! object means for its ownership kind.

use std::any::{Any, TypeId};
use std::fmt;
use std::rc::Rc;

use crate::error::FatalError;

/// Type-erased carrier: `Rc<T>`, `Box<T>` or `*const T` behind `dyn Any`.
///
/// `T` may be unsized (`dyn Trait`); the carrier itself is always sized.
pub type Erased = Box<dyn Any>;

/// Box key (generation-indexed for safety)
///
/// Format: [32-bit index | 32-bit generation]
/// - Index: slot in the box table
/// - Generation: incremented whenever the slot is vacated, so a key held by a
///   collected handle never matches a box created later in the same slot
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BoxKey {
    index: u32,
    generation: u32,
}

impl BoxKey {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn to_bits(&self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64)
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Display for BoxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ownership {
    Shared,
    Exclusive,
}

enum Slot {
    Shared(Erased),
    Exclusive(Erased),
    /// Moved out for the duration of an instance call
    Lent,
    /// Moved out for good by a native retrieval
    Emptied,
}

/// Native object held by shared or exclusive ownership
pub struct OwnershipBox {
    class: TypeId,
    class_name: &'static str,
    slot: Slot,
    share: fn(&Erased) -> Option<Erased>,
}

fn share_rc<T: ?Sized + 'static>(value: &Erased) -> Option<Erased> {
    value
        .downcast_ref::<Rc<T>>()
        .map(|rc| Box::new(Rc::clone(rc)) as Erased)
}

fn no_share(_: &Erased) -> Option<Erased> {
    None
}

impl OwnershipBox {
    /// Box one more strong holder of `value`
    pub fn shared<T: ?Sized + 'static>(value: Rc<T>) -> Self {
        Self {
            class: TypeId::of::<T>(),
            class_name: std::any::type_name::<T>(),
            slot: Slot::Shared(Box::new(value)),
            share: share_rc::<T>,
        }
    }

    /// Box the sole owner of `value`
    pub fn exclusive<T: ?Sized + 'static>(value: Box<T>) -> Self {
        Self {
            class: TypeId::of::<T>(),
            class_name: std::any::type_name::<T>(),
            slot: Slot::Exclusive(Box::new(value)),
            share: no_share,
        }
    }

    pub fn ownership(&self) -> Ownership {
        match self.slot {
            Slot::Shared(_) => Ownership::Shared,
            _ => Ownership::Exclusive,
        }
    }

    /// Static type the value was boxed as
    pub fn class(&self) -> TypeId {
        self.class
    }

    pub fn class_name(&self) -> &'static str {
        self.class_name
    }

    /// True once an exclusive box has handed its value to native code
    pub fn is_emptied(&self) -> bool {
        matches!(self.slot, Slot::Emptied)
    }

    /// Read the value for a native owner.
    ///
    /// Shared boxes hand out another `Rc`; exclusive boxes move the `Box` out
    /// and stay emptied.
    pub(crate) fn retrieve(&mut self, key: BoxKey) -> Result<Erased, FatalError> {
        match std::mem::replace(&mut self.slot, Slot::Emptied) {
            Slot::Shared(value) => {
                let copy = (self.share)(&value);
                self.slot = Slot::Shared(value);
                copy.ok_or_else(|| FatalError::CastFailed {
                    from: self.class_name.to_string(),
                    to: "Rc".to_string(),
                })
            }
            Slot::Exclusive(value) => Ok(value),
            Slot::Lent => {
                self.slot = Slot::Lent;
                Err(FatalError::ExclusiveBoxBorrowed { key })
            }
            Slot::Emptied => Err(FatalError::ExclusiveBoxEmptied { key }),
        }
    }

    /// Pin the value for one call. An exclusive value leaves the table until
    /// [`OwnershipBox::restore`] puts it back.
    pub(crate) fn lend(&mut self, key: BoxKey) -> Result<Erased, FatalError> {
        match self.slot {
            Slot::Exclusive(_) => match std::mem::replace(&mut self.slot, Slot::Lent) {
                Slot::Exclusive(value) => Ok(value),
                _ => Err(FatalError::NullHandle),
            },
            _ => self.retrieve(key),
        }
    }

    /// Return a lent or rejected exclusive value to its box
    pub(crate) fn restore(&mut self, value: Erased) {
        if matches!(self.slot, Slot::Lent | Slot::Emptied) {
            self.slot = Slot::Exclusive(value);
        }
    }
}

impl fmt::Debug for OwnershipBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnershipBox")
            .field("class", &self.class_name)
            .field("ownership", &self.ownership())
            .field("emptied", &self.is_emptied())
            .finish()
    }
}

struct Entry {
    generation: u32,
    value: Option<OwnershipBox>,
}

/// Arena of ownership boxes keyed by [`BoxKey`]
#[derive(Default)]
pub struct BoxTable {
    entries: Vec<Entry>,
    free: Vec<u32>,
}

impl BoxTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: OwnershipBox) -> BoxKey {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            let key = BoxKey {
                index,
                generation: entry.generation,
            };
            tracing::trace!(?key, "box reused slot");
            return key;
        }

        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        BoxKey {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, key: BoxKey) -> Option<&OwnershipBox> {
        self.entries
            .get(key.index as usize)
            .filter(|entry| entry.generation == key.generation)
            .and_then(|entry| entry.value.as_ref())
    }

    pub fn get_mut(&mut self, key: BoxKey) -> Option<&mut OwnershipBox> {
        self.entries
            .get_mut(key.index as usize)
            .filter(|entry| entry.generation == key.generation)
            .and_then(|entry| entry.value.as_mut())
    }

    pub fn contains(&self, key: BoxKey) -> bool {
        self.get(key).is_some()
    }

    /// Remove exactly the box behind `key`.
    ///
    /// The caller drops the returned box after releasing any borrow of the
    /// table: dropping native objects may re-enter the bridge.
    pub fn remove(&mut self, key: BoxKey) -> Option<OwnershipBox> {
        let entry = self.entries.get_mut(key.index as usize)?;
        if entry.generation != key.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(key.index);
        tracing::trace!(?key, ownership = ?value.ownership(), "box removed");
        Some(value)
    }

    /// Live boxes (total slots minus vacated ones)
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the table, handing every box back to the caller
    pub(crate) fn drain(&mut self) -> Vec<OwnershipBox> {
        self.free.clear();
        self.entries
            .drain(..)
            .filter_map(|entry| entry.value)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_key_is_never_valid_again() {
        let mut table = BoxTable::new();
        let first = table.insert(OwnershipBox::shared(Rc::new(1_i32)));
        assert!(table.remove(first).is_some());

        let second = table.insert(OwnershipBox::shared(Rc::new(2_i32)));
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
        assert!(table.remove(first).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_leaves_other_boxes_alone() {
        let mut table = BoxTable::new();
        let a = table.insert(OwnershipBox::shared(Rc::new("a".to_string())));
        let b = table.insert(OwnershipBox::exclusive(Box::new(7_u8)));
        table.remove(a);
        assert!(table.contains(b));
        assert_eq!(table.get(b).map(OwnershipBox::ownership), Some(Ownership::Exclusive));
    }

    #[test]
    fn shared_retrieval_adds_a_holder() {
        let value = Rc::new(5_i32);
        let mut table = BoxTable::new();
        let key = table.insert(OwnershipBox::shared(Rc::clone(&value)));
        assert_eq!(Rc::strong_count(&value), 2);

        let copy = table.get_mut(key).unwrap().retrieve(key).unwrap();
        let copy = copy.downcast::<Rc<i32>>().unwrap();
        assert!(Rc::ptr_eq(&value, &copy));
        assert_eq!(Rc::strong_count(&value), 3);

        drop(table.remove(key));
        assert_eq!(Rc::strong_count(&value), 2);
    }

    #[test]
    fn exclusive_retrieval_moves_out_once() {
        let mut table = BoxTable::new();
        let key = table.insert(OwnershipBox::exclusive(Box::new(String::from("solo"))));
        let slot = table.get_mut(key).unwrap();

        let moved = slot.retrieve(key).unwrap();
        assert_eq!(**moved.downcast::<Box<String>>().unwrap(), "solo");
        assert!(slot.is_emptied());
        assert_eq!(
            slot.retrieve(key).unwrap_err(),
            FatalError::ExclusiveBoxEmptied { key }
        );
    }

    #[test]
    fn lent_exclusive_value_comes_back() {
        let mut table = BoxTable::new();
        let key = table.insert(OwnershipBox::exclusive(Box::new(3_u32)));
        let slot = table.get_mut(key).unwrap();

        let lent = slot.lend(key).unwrap();
        assert_eq!(
            slot.lend(key).unwrap_err(),
            FatalError::ExclusiveBoxBorrowed { key }
        );
        slot.restore(lent);
        assert!(slot.lend(key).is_ok());
    }

    #[test]
    fn key_bits_round_trip() {
        let mut table = BoxTable::new();
        let key = table.insert(OwnershipBox::shared(Rc::new(())));
        assert_eq!(BoxKey::from_bits(key.to_bits()), key);
    }
}
