//! # Code roots
//!
//! Places compiled units are loaded from: plain directories of loose units, zip archives
//! bundling many units, or a single unit file. A [`RootVisitor`] walks every kind uniformly
//! and sees the same `{name, bytes}` pairs regardless of where they came from.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use crate::unit;
use crate::unit::CodeUnit;

#[derive(Debug)]
pub enum Error {
    Io { path: PathBuf, source: std::io::Error },
    Archive { path: PathBuf, detail: String },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "cannot read {}: {}", path.display(), source),
            Self::Archive { path, detail } => write!(f, "bad archive {}: {}", path.display(), detail),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Receives every unit found under a root. Return `false` to stop the walk early.
pub trait RootVisitor {
    fn visit(&mut self, unit: CodeUnit) -> bool;
}

impl<F> RootVisitor for F
where
    F: FnMut(CodeUnit) -> bool,
{
    fn visit(&mut self, unit: CodeUnit) -> bool {
        self(unit)
    }
}

/// One entry of a code path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeRoot {
    Directory(PathBuf),
    Archive(PathBuf),
    File(PathBuf),
}

impl CodeRoot {
    /// Classifies a path by what is on disk: directories stay directories, `.zip` files are
    /// archives, anything else is a single unit.
    pub fn detect(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.is_dir() {
            CodeRoot::Directory(path)
        } else if path.extension().is_some_and(|ext| ext == "zip") {
            CodeRoot::Archive(path)
        } else {
            CodeRoot::File(path)
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            CodeRoot::Directory(p) | CodeRoot::Archive(p) | CodeRoot::File(p) => p,
        }
    }

    /// Walks the root, handing each unit to `visitor`.
    ///
    /// Returns false if the visitor stopped the walk.
    pub fn accept(&self, visitor: &mut dyn RootVisitor) -> Result<bool> {
        match self {
            CodeRoot::Directory(dir) => walk_directory(dir, dir, visitor),
            CodeRoot::Archive(path) => walk_archive(path, visitor),
            CodeRoot::File(path) => {
                let name = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let bytes = read(path)?;
                Ok(visitor.visit(CodeUnit::new(name, bytes)))
            }
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn walk_directory(base: &Path, dir: &Path, visitor: &mut dyn RootVisitor) -> Result<bool> {
    let io = |source| Error::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries: Vec<_> = fs::read_dir(dir).map_err(io)?.collect::<std::io::Result<_>>().map_err(io)?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            if !walk_directory(base, &path, visitor)? {
                return Ok(false);
            }
            continue;
        }

        let Ok(relative) = path.strip_prefix(base) else { continue };
        let relative = relative.to_string_lossy().replace('\\', "/");
        let Some(name) = unit::unit_name_from_path(&relative) else { continue };

        if !visitor.visit(CodeUnit::new(name, read(&path)?)) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn walk_archive(path: &Path, visitor: &mut dyn RootVisitor) -> Result<bool> {
    let archive_err = |detail: String| Error::Archive {
        path: path.to_path_buf(),
        detail,
    };
    let file = fs::File::open(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| archive_err(e.to_string()))?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| archive_err(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let Some(name) = unit::unit_name_from_path(entry.name()) else { continue };

        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| archive_err(format!("{}: {}", name, e)))?;

        if !visitor.visit(CodeUnit::new(name, bytes)) {
            return Ok(false);
        }
    }
    Ok(true)
}
