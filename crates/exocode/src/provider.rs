//! # Code Unit Providers
//!
//! Where the host's code lookup endpoint gets the bytes it serves. Two strategies:
//!
//! - [`Instrumentation`]: whole-process capture. The host loads its own units through the hook,
//!   and everything loaded that way from then on is recorded, regardless of which part of the
//!   host loaded it.
//! - [`ScopedRoots`]: a curated subset. The caller names directories, archives or single files;
//!   a visitor walks them and records what it finds, no hook needed.

use std::sync::Arc;
use std::sync::OnceLock;

use wasmtime::Engine;
use wasmtime::Module;

use crate::roots;
use crate::roots::CodeRoot;
use crate::store::CodeUnitStore;
use crate::unit::CodeUnit;

/// Serves code units by qualified name.
pub trait CodeProvider: Send + Sync + 'static {
    /// `None` means "not ours to serve"; the asking side falls back to its own resolution.
    fn fetch(&self, name: &str) -> Option<CodeUnit>;

    /// Names this provider can serve, sorted.
    fn names(&self) -> Vec<String>;
}

impl CodeProvider for CodeUnitStore {
    fn fetch(&self, name: &str) -> Option<CodeUnit> {
        self.get(name)
    }

    fn names(&self) -> Vec<String> {
        CodeUnitStore::names(self)
    }
}

/// Capture hook on the host's own module-loading path.
pub struct Instrumentation {
    engine: Engine,
    store: CodeUnitStore,
}

impl Instrumentation {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            store: CodeUnitStore::new(),
        }
    }

    /// The process-wide hook. Install it (call this) before starting any worker so every unit
    /// the host loads afterwards is captured.
    pub fn global() -> &'static Instrumentation {
        static GLOBAL: OnceLock<Instrumentation> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            tracing::debug!("installing process-wide code capture");
            Instrumentation::new(Engine::default())
        })
    }

    /// Compiles a unit for local use and records it for workers.
    ///
    /// Units that fail to compile are not recorded.
    pub fn load(&self, name: &str, bytes: &[u8]) -> wasmtime::Result<Module> {
        let module = Module::new(&self.engine, bytes)?;
        self.store.record(CodeUnit::new(name, bytes));
        Ok(module)
    }

    /// Loads a unit from disk, naming it by its path relative to `root`.
    pub fn load_file(&self, root: &std::path::Path, path: &std::path::Path) -> wasmtime::Result<Module> {
        let relative = path.strip_prefix(root).unwrap_or(path).to_string_lossy().replace('\\', "/");
        let name = crate::unit::unit_name_from_path(&relative)
            .ok_or_else(|| wasmtime::Error::msg(format!("{} is not a code unit", path.display())))?;
        let bytes = std::fs::read(path)?;
        self.load(&name, &bytes)
    }

    pub fn store(&self) -> &CodeUnitStore {
        &self.store
    }
}

impl CodeProvider for Instrumentation {
    fn fetch(&self, name: &str) -> Option<CodeUnit> {
        self.store.get(name)
    }

    fn names(&self) -> Vec<String> {
        self.store.names()
    }
}

/// Lets `Instrumentation::global()` be handed to a backend as an `Arc<dyn CodeProvider>`.
impl CodeProvider for &'static Instrumentation {
    fn fetch(&self, name: &str) -> Option<CodeUnit> {
        (**self).fetch(name)
    }

    fn names(&self) -> Vec<String> {
        (**self).names()
    }
}

/// Units collected from an explicit list of code roots.
pub struct ScopedRoots {
    store: CodeUnitStore,
}

impl ScopedRoots {
    /// Walks every root eagerly. Earlier roots shadow later ones on name clashes.
    pub fn scan(roots: Vec<CodeRoot>) -> roots::Result<Self> {
        let store = CodeUnitStore::new();
        for root in &roots {
            let mut collect = |unit: CodeUnit| {
                store.record(unit);
                true
            };
            root.accept(&mut collect)?;
            tracing::debug!(root = %root.path().display(), units = store.len(), "scanned code root");
        }
        Ok(Self { store })
    }

    /// An empty provider: serves nothing, so workers resolve everything locally.
    pub fn empty() -> Self {
        Self {
            store: CodeUnitStore::new(),
        }
    }

    pub fn into_provider(self) -> Arc<dyn CodeProvider> {
        Arc::new(self)
    }
}

impl CodeProvider for ScopedRoots {
    fn fetch(&self, name: &str) -> Option<CodeUnit> {
        self.store.get(name)
    }

    fn names(&self) -> Vec<String> {
        self.store.names()
    }
}
