//! Latch Scripting Bridge
//!
//! Embeds a JavaScript runtime (QuickJS) in a native host and binds native
//! types to it.
//!
//! ## Architecture
//!
//! - **Frames:** every exchange with the engine goes through a [`Frame`], an
//!   explicit value stack with absolute and negative (top-relative) indices
//! - **Codecs:** [`Type`] converts values; primitives and composites copy,
//!   `Rc<C>` / `Box<C>` of a [`Bindable`] class travel as handles
//! - **Ownership boxes:** a native object handed to script lives in a
//!   generational [`BoxTable`] slot until its handle is collected
//! - **Classes:** [`define_class!`] names a class and its base;
//!   [`Bindable::inspect`] declares its members once for every [`Inspector`]
//! - **Errors:** [`ScriptError`] separates script failures, boundary
//!   [`TypeError`]s and bridge-level [`FatalError`]s
//!
//! ```ignore
//! let bridge = Bridge::new()?;
//! bridge.register_class::<Spaceship>()?;
//! bridge.eval_void("const ship = new SpaceInvaders.Spaceship(3); ship.moveLeft();")?;
//! ```

pub mod boxes;
pub mod class;
pub mod error;
pub mod registry;
pub mod settings;

mod bridge;
mod dispatch;
mod handle;
mod inspect;
mod stack;
mod stash;
mod types;

pub use boxes::{BoxKey, BoxTable, Ownership, OwnershipBox};
pub use bridge::Bridge;
pub use class::{ClassDescriptor, ClassInfo, ClassTable, Polymorphic};
pub use dispatch::{NativeFn, NativeMethod};
pub use error::{FatalError, Result, ScriptError, TypeError};
pub use inspect::{Bindable, Inspector};
pub use registry::{TypeEntry, TypeRegistry};
pub use settings::{BridgeSettings, SettingsError};
pub use stack::Frame;
pub use stash::RefKey;
pub use types::{Arg, CallArgs, Completion, Ref, Returns, ScriptFunction, Type};

pub use rquickjs;
