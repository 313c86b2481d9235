//! Reference stash
//!
//! Script values native code keeps across calls (mostly callables). Entries
//! live outside the script heap's reach; the bridge releases every entry
//! before the engine is torn down.

use std::collections::HashMap;

use rquickjs::{Persistent, Value};

/// Key of one stashed value. Keys only ever increase.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefKey(u32);

impl RefKey {
    pub fn raw(&self) -> u32 {
        self.0
    }
}

#[derive(Default)]
pub(crate) struct RefStash {
    next: u32,
    refs: HashMap<RefKey, Persistent<Value<'static>>>,
}

impl RefStash {
    pub(crate) fn insert(&mut self, value: Persistent<Value<'static>>) -> RefKey {
        let key = RefKey(self.next);
        self.next += 1;
        self.refs.insert(key, value);
        key
    }

    pub(crate) fn get(&self, key: RefKey) -> Option<Persistent<Value<'static>>> {
        self.refs.get(&key).cloned()
    }

    pub(crate) fn remove(&mut self, key: RefKey) -> Option<Persistent<Value<'static>>> {
        self.refs.remove(&key)
    }

    pub(crate) fn len(&self) -> usize {
        self.refs.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<Persistent<Value<'static>>> {
        self.refs.drain().map(|(_, value)| value).collect()
    }
}
