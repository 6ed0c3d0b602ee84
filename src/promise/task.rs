//! Inputs and outputs of the promise combinators.
//!
//! Combinators accept a [`Tasks`] collection: an ordered sequence of
//! key → task pairs where each key is an integer or a string and each task
//! is either a ready [`Promise`] or a lazy zero-argument callable producing
//! one (invoked exactly once, its return adopted). Results come back as a
//! [`TaskMap`]: an order-preserving map that round-trips integer keys,
//! keeps string keys byte-identical, and collapses losslessly to a plain
//! `Vec` when the keys are the dense sequence `0..n`.

use std::fmt;

use crate::error::{Error, Result};
use crate::promise::Promise;

////////////////////////////////////////////////////////////////////////////////
// TaskKey
////////////////////////////////////////////////////////////////////////////////

/// An integer-or-string key identifying a task in its input collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Index(usize),
    Name(String),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{}", i),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<usize> for TaskKey {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for TaskKey {
    fn from(name: &str) -> Self {
        Self::Name(name.into())
    }
}

impl From<String> for TaskKey {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Settlement
////////////////////////////////////////////////////////////////////////////////

/// The non-throwing result of a task, as produced by the `*_settled`
/// combinators: either the value or the rejection reason, never a panic
/// across the combinator boundary.
#[derive(Debug, Clone)]
pub enum Settlement<T> {
    Fulfilled(T),
    Rejected(Error),
}

impl<T> Settlement<T> {
    #[inline]
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    #[inline]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Fulfilled(v) => Some(v),
            Self::Rejected(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&Error> {
        match self {
            Self::Fulfilled(_) => None,
            Self::Rejected(e) => Some(e),
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            Self::Fulfilled(v) => Ok(v),
            Self::Rejected(e) => Err(e),
        }
    }
}

impl<T> From<Result<T>> for Settlement<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(v) => Self::Fulfilled(v),
            Err(e) => Self::Rejected(e),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// TaskMap
////////////////////////////////////////////////////////////////////////////////

/// An order-preserving key → value map.
///
/// Iteration order is insertion order, which the combinators guarantee to be
/// the input order of the corresponding tasks. Lookup is linear; these maps
/// hold combinator results, not hot-path state.
#[derive(Clone, PartialEq)]
pub struct TaskMap<V> {
    entries: Vec<(TaskKey, V)>,
}

impl<V> TaskMap<V> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Inserts at the back, or replaces in place if the key already exists.
    pub fn insert(&mut self, key: impl Into<TaskKey>, value: V) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: impl Into<TaskKey>) -> Option<&V> {
        let key = key.into();
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TaskKey> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskKey, &V)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    /// Whether the keys are exactly `Index(0), Index(1), .. Index(n - 1)`.
    ///
    /// A dense map converts losslessly to a `Vec` via
    /// [`into_values`](Self::into_values).
    pub fn is_dense(&self) -> bool {
        self.entries
            .iter()
            .enumerate()
            .all(|(i, (k, _))| *k == TaskKey::Index(i))
    }

    pub fn into_values(self) -> Vec<V> {
        self.entries.into_iter().map(|(_, v)| v).collect()
    }

    pub fn into_entries(self) -> Vec<(TaskKey, V)> {
        self.entries
    }
}

impl<V> Default for TaskMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IntoIterator for TaskMap<V> {
    type Item = (TaskKey, V);
    type IntoIter = std::vec::IntoIter<(TaskKey, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<V> std::iter::FromIterator<(TaskKey, V)> for TaskMap<V> {
    fn from_iter<I: IntoIterator<Item = (TaskKey, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for TaskMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tasks
////////////////////////////////////////////////////////////////////////////////

pub(crate) type LazyTask<T> = Box<dyn FnOnce() -> Result<Promise<T>> + Send>;

/// A single combinator input: a ready promise, or a callable that produces
/// one when the combinator decides to start the task.
pub enum TaskInput<T> {
    Ready(Promise<T>),
    Lazy(LazyTask<T>),
}

impl<T> TaskInput<T> {
    /// Obtains the promise, invoking a lazy task. An `Err` means task
    /// construction failed; the combinators turn that into a rejection.
    pub(crate) fn into_promise(self) -> Result<Promise<T>> {
        match self {
            Self::Ready(promise) => Ok(promise),
            Self::Lazy(f) => f(),
        }
    }
}

impl<T> fmt::Debug for TaskInput<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("TaskInput::Ready"),
            Self::Lazy(_) => f.write_str("TaskInput::Lazy"),
        }
    }
}

/// The ordered key → task input collection every combinator accepts.
///
/// Build one explicitly with [`push`](Self::push) / [`push_fn`](Self::push_fn),
/// or convert from plain collections: a `Vec<Promise<T>>` gets dense integer
/// keys, a `Vec<(&str, Promise<T>)>` keeps its names.
#[derive(Debug, Default)]
pub struct Tasks<T> {
    entries: Vec<(TaskKey, TaskInput<T>)>,
}

impl<T> Tasks<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a ready promise under `key`.
    pub fn push(&mut self, key: impl Into<TaskKey>, promise: Promise<T>) -> &mut Self {
        self.entries.push((key.into(), TaskInput::Ready(promise)));
        self
    }

    /// Adds a lazy task under `key`; `f` runs once, when the combinator
    /// starts the task.
    pub fn push_fn<F>(&mut self, key: impl Into<TaskKey>, f: F) -> &mut Self
    where
        F: FnOnce() -> Promise<T> + Send + 'static,
    {
        self.entries
            .push((key.into(), TaskInput::Lazy(Box::new(move || Ok(f())))));
        self
    }

    /// Like [`push_fn`](Self::push_fn) for constructors that can fail; an
    /// `Err` return rejects (or records a rejection for) the task.
    pub fn push_try_fn<F>(&mut self, key: impl Into<TaskKey>, f: F) -> &mut Self
    where
        F: FnOnce() -> Result<Promise<T>> + Send + 'static,
    {
        self.entries.push((key.into(), TaskInput::Lazy(Box::new(f))));
        self
    }

    /// Dense-keyed lazy tasks, in iteration order.
    pub fn from_fns<I, F>(fns: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() -> Promise<T> + Send + 'static,
    {
        let mut tasks = Self::new();
        for (i, f) in fns.into_iter().enumerate() {
            tasks.push_fn(i, f);
        }
        tasks
    }

    /// Name-keyed lazy tasks, in iteration order.
    pub fn from_named_fns<S, I, F>(fns: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = (S, F)>,
        F: FnOnce() -> Promise<T> + Send + 'static,
    {
        let mut tasks = Self::new();
        for (name, f) in fns {
            tasks.push_fn(name.into(), f);
        }
        tasks
    }

    pub(crate) fn into_entries(self) -> Vec<(TaskKey, TaskInput<T>)> {
        self.entries
    }

    pub(crate) fn from_entries(entries: Vec<(TaskKey, TaskInput<T>)>) -> Self {
        Self { entries }
    }
}

impl<T: Clone + Send + 'static> From<Vec<Promise<T>>> for Tasks<T> {
    fn from(promises: Vec<Promise<T>>) -> Self {
        let mut tasks = Self::new();
        for (i, p) in promises.into_iter().enumerate() {
            tasks.push(i, p);
        }
        tasks
    }
}

impl<T: Clone + Send + 'static> From<Vec<(&str, Promise<T>)>> for Tasks<T> {
    fn from(promises: Vec<(&str, Promise<T>)>) -> Self {
        let mut tasks = Self::new();
        for (name, p) in promises {
            tasks.push(name, p);
        }
        tasks
    }
}

impl<T: Clone + Send + 'static> From<Vec<(String, Promise<T>)>> for Tasks<T> {
    fn from(promises: Vec<(String, Promise<T>)>) -> Self {
        let mut tasks = Self::new();
        for (name, p) in promises {
            tasks.push(name, p);
        }
        tasks
    }
}

impl<T: Clone + Send + 'static> std::iter::FromIterator<Promise<T>> for Tasks<T> {
    fn from_iter<I: IntoIterator<Item = Promise<T>>>(iter: I) -> Self {
        iter.into_iter().collect::<Vec<_>>().into()
    }
}
