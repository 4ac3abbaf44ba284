use std::fmt::{self, Debug, Display, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::engine::Variable;
use crate::key::{Key, VersionTag};

/// Access level a scope or a task holds on a handle.
///
/// Permissions are ordered, `None < Read < Modify`, and a request may never
/// exceed what the enclosing scope holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    None,
    Read,
    Modify,
}

impl Display for Permission {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Permission::None => "none",
            Permission::Read => "read",
            Permission::Modify => "modify",
        })
    }
}

/// Process-unique identity of one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        HandleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A typed reference to a named piece of data.
///
/// An `AccessHandle<T>` is a lightweight token; it does not own the value and
/// it carries no version. Which version a handle refers to, and what the
/// holder may do with it, is tracked by the scope the handle lives in. Tasks
/// get access by capturing the handle when they are declared.
///
/// Cloning a handle gives another token for the same scope entry, it does
/// not copy the data.
pub struct AccessHandle<T> {
    pub(crate) id: HandleId,
    pub(crate) variable: Arc<Variable>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> AccessHandle<T> {
    pub(crate) fn new(variable: Arc<Variable>) -> Self {
        Self {
            id: HandleId::next(),
            variable,
            _phantom: PhantomData,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn key(&self) -> &Key {
        &self.variable.key
    }
}

impl<T> Clone for AccessHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            variable: self.variable.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> Debug for AccessHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessHandle")
            .field("id", &self.id.0)
            .field("key", self.key())
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// Options for [`Scope::publish`](crate::Scope::publish).
///
/// ```rust
/// use nagare::PublishOpts;
///
/// let opts = PublishOpts::default().version(3u64).n_readers(2);
/// assert_eq!(opts.n_readers, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOpts {
    /// Version tag fetchers must name to match this publication.
    pub version: VersionTag,
    /// Exact number of fetches the publication will serve.
    pub n_readers: usize,
}

impl Default for PublishOpts {
    fn default() -> Self {
        Self {
            version: VersionTag::unversioned(),
            n_readers: 1,
        }
    }
}

impl PublishOpts {
    pub fn version(mut self, version: impl Into<VersionTag>) -> Self {
        self.version = version.into();
        self
    }

    pub fn n_readers(mut self, n_readers: usize) -> Self {
        self.n_readers = n_readers;
        self
    }
}

/// Options for [`Scope::read_access`](crate::Scope::read_access).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchOpts {
    pub version: VersionTag,
}

impl FetchOpts {
    pub fn version(mut self, version: impl Into<VersionTag>) -> Self {
        self.version = version.into();
        self
    }
}
