//! # Code Loader
//!
//! Worker-side resolution of code units by name. The resolver chain is:
//!
//! 1. units already resolved (cached by name, compiled modules shared by content digest),
//! 2. bootstrap units embedded in the worker, available before any channel exists,
//! 3. the protected namespace (`core.`), which only ever resolves locally,
//! 4. the host's code lookup endpoint, once bound,
//! 5. the worker's own local units, consulted after a negative remote answer,
//! 6. failure.
//!
//! ## States
//!
//! `Unbound` until [`CodeLoader::bind`] is called, `Bound` afterwards. The transition happens
//! exactly once and is never reversed: losing the channel later shows up as per-lookup
//! `NotFound` errors while everything already resolved keeps working.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use dashmap::DashMap;
use wasmtime::Engine;
use wasmtime::Module;

use crate::lookup::UnitSource;
use crate::provider::CodeProvider;
use crate::unit::CodeUnit;
use crate::unit::Digest;

/// Names under this prefix belong to the runtime and are never fetched from the host.
pub const PROTECTED_PREFIX: &str = "core.";

#[derive(Debug, Clone)]
pub enum Error {
    /// Neither the bootstrap set, the host, nor the local units know this name.
    NotFound { name: String, cause: Option<String> },
    /// The bytes were found but are not a valid module.
    Compile { name: String, detail: String },
    /// `bind` was called on a loader that is already bound.
    AlreadyBound,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { name, cause: None } => write!(f, "code unit '{}' not found", name),
            Self::NotFound { name, cause: Some(cause) } => {
                write!(f, "code unit '{}' not found: {}", name, cause)
            }
            Self::Compile { name, detail } => write!(f, "code unit '{}' does not compile: {}", name, detail),
            Self::AlreadyBound => write!(f, "code loader is already bound to a lookup endpoint"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Unbound,
    Bound,
}

/// Which link of the chain produced a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Bootstrap,
    Remote,
    Local,
}

/// A resolved, compiled unit.
pub struct LoadedUnit {
    pub name: String,
    pub digest: Digest,
    pub origin: Origin,
    pub module: Module,
}

pub struct CodeLoader {
    engine: Engine,
    bootstrap: HashMap<String, CodeUnit>,
    local: Arc<dyn CodeProvider>,
    remote: OnceLock<Arc<dyn UnitSource>>,
    resolved: DashMap<String, Arc<LoadedUnit>>,
    compiled: DashMap<Digest, Module>,
}

impl CodeLoader {
    /// Creates an unbound loader that resolves non-bootstrap names from `local`.
    pub fn new(engine: Engine, local: Arc<dyn CodeProvider>) -> Self {
        Self {
            engine,
            bootstrap: HashMap::new(),
            local,
            remote: OnceLock::new(),
            resolved: DashMap::new(),
            compiled: DashMap::new(),
        }
    }

    /// Adds units that must resolve before the lookup channel exists.
    pub fn with_bootstrap(mut self, units: impl IntoIterator<Item = CodeUnit>) -> Self {
        for unit in units {
            self.bootstrap.insert(unit.name.clone(), unit);
        }
        self
    }

    pub fn state(&self) -> LoaderState {
        match self.remote.get() {
            Some(_) => LoaderState::Bound,
            None => LoaderState::Unbound,
        }
    }

    /// Binds the lookup endpoint. Succeeds exactly once.
    pub fn bind(&self, source: Arc<dyn UnitSource>) -> Result<()> {
        self.remote.set(source).map_err(|_| Error::AlreadyBound)?;
        tracing::info!("code loader bound to lookup endpoint");
        Ok(())
    }

    pub fn is_protected(name: &str) -> bool {
        name.starts_with(PROTECTED_PREFIX)
    }

    /// Resolves and compiles `name`, walking the resolver chain.
    pub async fn resolve(&self, name: &str) -> Result<Arc<LoadedUnit>> {
        if let Some(hit) = self.resolved.get(name) {
            return Ok(hit.value().clone());
        }

        let (unit, origin) = self.find(name).await?;
        let loaded = self.define(unit, origin).await?;
        tracing::debug!(unit = %name, ?origin, digest = %loaded.digest, "code unit resolved");

        // Two tasks may race on the same name; the first insert wins and both get its entry.
        let entry = self.resolved.entry(name.to_string()).or_insert(loaded);
        Ok(entry.value().clone())
    }

    async fn find(&self, name: &str) -> Result<(CodeUnit, Origin)> {
        if let Some(unit) = self.bootstrap.get(name) {
            return Ok((unit.clone(), Origin::Bootstrap));
        }

        if Self::is_protected(name) {
            return self.find_local(name);
        }

        let Some(remote) = self.remote.get() else {
            return self.find_local(name);
        };

        match remote.fetch(name).await {
            Ok(Some(unit)) => Ok((unit, Origin::Remote)),
            Ok(None) => self.find_local(name),
            Err(e) => {
                tracing::warn!(unit = %name, error = %e, "code lookup channel unavailable");
                Err(Error::NotFound {
                    name: name.to_string(),
                    cause: Some(format!("lookup channel unavailable: {}", e)),
                })
            }
        }
    }

    fn find_local(&self, name: &str) -> Result<(CodeUnit, Origin)> {
        self.local
            .fetch(name)
            .map(|unit| (unit, Origin::Local))
            .ok_or_else(|| Error::NotFound {
                name: name.to_string(),
                cause: None,
            })
    }

    async fn define(&self, unit: CodeUnit, origin: Origin) -> Result<Arc<LoadedUnit>> {
        let digest = unit.digest();
        let cached = self.compiled.get(&digest).map(|module| module.value().clone());
        let module = match cached {
            Some(module) => module,
            None => {
                let engine = self.engine.clone();
                let bytes = unit.bytes.clone();
                let compiled = tokio::task::spawn_blocking(move || Module::new(&engine, &bytes[..]))
                    .await
                    .map_err(|e| Error::Compile {
                        name: unit.name.clone(),
                        detail: e.to_string(),
                    })?
                    .map_err(|e| Error::Compile {
                        name: unit.name.clone(),
                        detail: e.to_string(),
                    })?;
                self.compiled.entry(digest).or_insert(compiled).value().clone()
            }
        };

        Ok(Arc::new(LoadedUnit {
            name: unit.name,
            digest,
            origin,
            module,
        }))
    }
}
