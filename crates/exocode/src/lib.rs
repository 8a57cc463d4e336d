//! # exocode
//!
//! On-demand code distribution. The host records the code units it loads (or the units under
//! chosen roots) and serves them by name; the worker's loader pulls them across the channel
//! the first time a closure needs them.

pub mod loader;
pub mod lookup;
pub mod provider;
pub mod roots;
pub mod store;
pub mod unit;

pub use loader::CodeLoader;
pub use loader::Error as LoadError;
pub use loader::LoaderState;
pub use loader::Origin;
pub use lookup::CodeLookupService;
pub use lookup::RemoteLookup;
pub use lookup::UnitSource;
pub use provider::CodeProvider;
pub use provider::Instrumentation;
pub use provider::ScopedRoots;
pub use roots::CodeRoot;
pub use store::CodeUnitStore;
pub use unit::CodeUnit;
