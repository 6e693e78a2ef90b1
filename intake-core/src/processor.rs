//! Processing capabilities and their binding to watched roots.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BindingError, ProcessorError};

/// Everything a capability gets to see about one file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessRequest {
    /// The file as it sits in the watched tree.
    pub source: PathBuf,
    /// Private copy made for this dispatch; deleted afterwards.
    pub staged: PathBuf,
    /// Root the source was resolved under.
    pub root: PathBuf,
}

impl ProcessRequest {
    /// Path of the source relative to its root.
    pub fn relative_path(&self) -> &Path {
        self.source.strip_prefix(&self.root).unwrap_or(&self.source)
    }
}

/// Domain logic invoked for each stabilized file.
///
/// Returning `Ok` marks the file processed; the source is then deleted by
/// the sweep. Any error marks it failed and leaves the source in place.
#[async_trait]
pub trait FileProcessor: Send + Sync {
    async fn process(&self, request: &ProcessRequest) -> Result<(), ProcessorError>;
}

#[derive(Clone)]
pub struct ProcessorBinding {
    pub root: PathBuf,
    pub id: String,
    pub processor: Arc<dyn FileProcessor>,
}

impl fmt::Debug for ProcessorBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorBinding")
            .field("root", &self.root)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ProcessorBinding {
    pub fn new(
        root: impl Into<PathBuf>,
        id: impl Into<String>,
        processor: Arc<dyn FileProcessor>,
    ) -> Self {
        Self {
            root: root.into(),
            id: id.into(),
            processor,
        }
    }
}

/// Immutable root -> capability lookup built once at startup.
///
/// Roots never overlap, so every path resolves to at most one binding.
#[derive(Clone, Debug)]
pub struct ProcessorTable {
    bindings: Vec<ProcessorBinding>,
}

impl ProcessorTable {
    pub fn new(bindings: Vec<ProcessorBinding>) -> Result<Self, BindingError> {
        if bindings.is_empty() {
            return Err(BindingError::Empty);
        }
        if let Some(relative) = bindings.iter().find(|b| !b.root.is_absolute()) {
            return Err(BindingError::RelativeRoot(relative.root.clone()));
        }
        let bindings: Vec<ProcessorBinding> = bindings
            .into_iter()
            .map(|mut binding| {
                binding.root = normalize_path(&binding.root);
                binding
            })
            .collect();
        check_disjoint_roots(bindings.iter().map(|b| b.root.as_path()))?;
        Ok(Self { bindings })
    }

    pub fn resolve(&self, path: &Path) -> Option<&ProcessorBinding> {
        self.bindings.iter().find(|b| path.starts_with(&b.root))
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.bindings.iter().map(|b| b.root.clone()).collect()
    }

    pub fn bindings(&self) -> &[ProcessorBinding] {
        &self.bindings
    }
}

/// Drop `.` and fold `..` without touching the filesystem, then, for
/// absolute paths, resolve symlinks along the longest prefix that exists.
/// Components past that prefix are kept as written.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut lexical = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match lexical.components().next_back() {
                Some(Component::Normal(_)) => {
                    lexical.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => lexical.push(".."),
            },
            other => lexical.push(other),
        }
    }
    if !lexical.is_absolute() {
        return lexical;
    }

    let mut existing = lexical.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(real) = existing.canonicalize() {
            return missing.iter().rev().fold(real, |acc, name| acc.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => break,
        }
    }
    lexical
}

/// Reject any pair of roots where one contains (or equals) the other.
pub fn check_disjoint_roots<'a>(
    roots: impl IntoIterator<Item = &'a Path>,
) -> Result<(), BindingError> {
    let roots: Vec<&Path> = roots.into_iter().collect();
    for (i, a) in roots.iter().enumerate() {
        for b in &roots[i + 1..] {
            let (outer, inner) = if b.starts_with(a) {
                (a, b)
            } else if a.starts_with(b) {
                (b, a)
            } else {
                continue;
            };
            return Err(BindingError::OverlappingRoots {
                outer: outer.to_path_buf(),
                inner: inner.to_path_buf(),
            });
        }
    }
    Ok(())
}
