use std::any::{Any, type_name};
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::core::Dynamic;
use crate::engine::flow::{Flow, Variable};
use crate::engine::task::{Body, TaskId, TaskNode};
use crate::engine::usage::{self, Tail, Use};
use crate::engine::{Captures, RankShared};
use crate::error::UsageError;
use crate::handle::{AccessHandle, FetchOpts, HandleId, Permission, PublishOpts};
use crate::key::{Key, VersionTag};

/// What the body of a task can see of a handle's value.
pub(crate) enum Slot {
    /// The value of the current flow, `None` if nothing set it yet.
    Value(Option<Dynamic>),
    /// A private copy the body has modified.
    Owned(Box<dyn Any + Send + Sync>),
    /// The value belongs to work scheduled later.
    Unavailable,
}

/// Per-handle state of one scope.
pub(crate) struct Entry {
    pub(crate) variable: Arc<Variable>,
    pub(crate) flow: Arc<Flow>,
    pub(crate) scheduling: Permission,
    pub(crate) immediate: Permission,
    pub(crate) slot: Slot,
    held: Option<Arc<Flow>>,
}

impl Entry {
    pub(crate) fn new(
        variable: Arc<Variable>,
        flow: Arc<Flow>,
        scheduling: Permission,
        immediate: Permission,
    ) -> Self {
        let slot = match immediate {
            Permission::None => Slot::Unavailable,
            _ => Slot::Value(flow.value()),
        };

        Self {
            variable,
            flow,
            scheduling,
            immediate,
            slot,
            held: None,
        }
    }

    /// Turns a locally modified value into a ready flow so work registered
    /// from here on observes it.
    pub(crate) fn commit_local(&mut self) {
        if !matches!(self.slot, Slot::Owned(_)) {
            return;
        }

        if let Slot::Owned(value) = std::mem::replace(&mut self.slot, Slot::Unavailable) {
            let value: Dynamic = Arc::from(value);
            let flow = Flow::commit(self.variable.clone());
            flow.advance(Some(value.clone()));

            self.flow = flow;
            self.slot = Slot::Value(Some(value));
        }
    }

    fn release_hold(&mut self) {
        if let Some(flow) = self.held.take() {
            flow.release_reader();
        }
    }

    fn into_tail(mut self) -> Tail {
        self.release_hold();
        match std::mem::replace(&mut self.slot, Slot::Unavailable) {
            Slot::Owned(value) => Tail::Value(Arc::from(value)),
            _ => Tail::Flow(self.flow.clone()),
        }
    }
}

/// A region of graph construction: the root of a rank, or the body of a task.
///
/// A scope maps every handle it knows to the flow that handle currently
/// refers to. Declaring work moves that mapping along, which is how accesses
/// are ordered by program order without any locking.
pub struct Scope {
    pub(crate) shared: Arc<RankShared>,
    entries: HashMap<HandleId, Entry>,
    /// Final state of captured handles the body released early. Only task
    /// scopes keep it, their uses still need it at close.
    released: HashMap<HandleId, Tail>,
    in_task: bool,
}

impl Scope {
    /// The root scope of a rank.
    pub(crate) fn root(shared: Arc<RankShared>) -> Self {
        Self::with(shared, false)
    }

    fn nested(shared: Arc<RankShared>) -> Self {
        Self::with(shared, true)
    }

    fn with(shared: Arc<RankShared>, in_task: bool) -> Self {
        Self {
            shared,
            entries: HashMap::new(),
            released: HashMap::new(),
            in_task,
        }
    }

    /// Index of the rank this scope runs on.
    pub fn rank(&self) -> usize {
        self.shared.rank
    }

    pub fn n_ranks(&self) -> usize {
        self.shared.n_ranks
    }

    /// Declares a new variable named `key`. Its first version holds no value,
    /// schedule a task that modifies it to give it one.
    pub fn initial_access<T>(&mut self, key: impl Into<Key>) -> Result<AccessHandle<T>, UsageError>
    where
        T: Send + Sync + 'static,
    {
        self.declare(key.into(), None)
    }

    /// Declares a new variable named `key` whose first version is `value`.
    pub fn initial_access_with<T>(
        &mut self,
        key: impl Into<Key>,
        value: T,
    ) -> Result<AccessHandle<T>, UsageError>
    where
        T: Send + Sync + 'static,
    {
        self.declare(key.into(), Some(Arc::new(value)))
    }

    fn declare<T>(&mut self, key: Key, value: Option<Dynamic>) -> Result<AccessHandle<T>, UsageError>
    where
        T: Send + Sync + 'static,
    {
        let variable = self.shared.initial_variable(key, type_name::<T>())?;
        let flow = Flow::initial(variable.clone());
        flow.advance(value);

        let handle = AccessHandle::new(variable.clone());
        let entry = Entry::new(variable, flow, Permission::Modify, Permission::None);
        self.entries.insert(handle.id(), entry);

        Ok(handle)
    }

    /// Fetches a published version of `key`.
    ///
    /// This never waits. The handle refers to a placeholder version that
    /// becomes ready once a matching publication exists and has a value, so
    /// tasks reading it simply run later. Fetching a key this rank already
    /// has live handles of with another type fails with
    /// [`UsageError::TypeMismatch`].
    pub fn read_access<T>(&mut self, key: impl Into<Key>, opts: FetchOpts) -> Result<AccessHandle<T>, UsageError>
    where
        T: Send + Sync + 'static,
    {
        let key = key.into();
        let variable = self.shared.fetched_variable(key.clone(), type_name::<T>())?;
        let flow = Flow::fetching(variable.clone(), opts.version.clone());

        self.shared
            .coordinator
            .fetch(&key, &opts.version, flow.clone())?;

        tracing::debug!(key = %key, version = %opts.version, rank = self.rank(), "fetch registered");

        let handle = AccessHandle::new(variable.clone());
        let entry = Entry::new(variable, flow, Permission::Read, Permission::None);
        self.entries.insert(handle.id(), entry);

        Ok(handle)
    }

    /// Returns a read-only handle pinned to the current version of `handle`.
    ///
    /// The new handle holds a reader on that version until it is released, so
    /// any modification of `handle` scheduled meanwhile waits for it. Holding
    /// it across such a modification and then waiting for the result is a
    /// deadlock, which the rank reports as a stall.
    pub fn read_only<T>(&mut self, handle: &AccessHandle<T>) -> Result<AccessHandle<T>, UsageError> {
        let entry = self.entry_mut(handle.id(), handle.key())?;
        entry.commit_local();

        let flow = entry.flow.clone();
        flow.add_reader();

        let pinned = AccessHandle::new(entry.variable.clone());
        let mut pinned_entry = Entry::new(
            entry.variable.clone(),
            flow.clone(),
            Permission::Read,
            Permission::None,
        );
        pinned_entry.held = Some(flow);
        self.entries.insert(pinned.id(), pinned_entry);

        Ok(pinned)
    }

    /// Publishes the current version of `handle` for exactly
    /// `opts.n_readers` fetches.
    pub fn publish<T>(&mut self, handle: &AccessHandle<T>, opts: PublishOpts) -> Result<(), UsageError> {
        let rank = self.shared.rank;
        let coordinator = self.shared.coordinator.clone();
        let entry = self.entry_mut(handle.id(), handle.key())?;

        if entry.scheduling < Permission::Modify {
            return Err(UsageError::PermissionDenied {
                key: handle.key().clone(),
                requested: Permission::Modify,
                held: entry.scheduling,
            });
        }

        entry.commit_local();
        coordinator.publish(handle.key(), &opts.version, entry.flow.clone(), opts.n_readers)?;

        tracing::debug!(
            key = %handle.key(),
            version = %opts.version,
            n_readers = opts.n_readers,
            rank,
            "published"
        );

        Ok(())
    }

    /// Drops `handle` from this scope, releasing anything it holds.
    pub fn release<T>(&mut self, handle: &AccessHandle<T>) -> Result<(), UsageError> {
        let entry = self
            .entries
            .remove(&handle.id())
            .ok_or_else(|| UsageError::NotCaptured(handle.key().clone()))?;

        let tail = entry.into_tail();
        if self.in_task {
            self.released.insert(handle.id(), tail);
        }
        Ok(())
    }

    /// Version `handle` refers to in this scope.
    pub fn current_version<T>(&self, handle: &AccessHandle<T>) -> Result<VersionTag, UsageError> {
        Ok(self.entry(handle.id(), handle.key())?.flow.version.clone())
    }

    /// Scheduling and immediate permission this scope holds on `handle`.
    pub fn permissions<T>(&self, handle: &AccessHandle<T>) -> Option<(Permission, Permission)> {
        self.entries
            .get(&handle.id())
            .map(|entry| (entry.scheduling, entry.immediate))
    }

    /// Starts declaring a task.
    pub fn task(&mut self) -> TaskDef<'_> {
        TaskDef {
            scope: self,
            name: None,
            captures: Vec::new(),
        }
    }

    pub(crate) fn current_flow(&self, id: HandleId, key: &Key) -> Result<Arc<Flow>, UsageError> {
        Ok(self.entry(id, key)?.flow.clone())
    }

    pub(crate) fn flows(&self) -> Vec<Arc<Flow>> {
        self.entries.values().map(|entry| entry.flow.clone()).collect()
    }

    /// Releases every hold of the scope.
    pub(crate) fn release_all(&mut self) {
        for (_, mut entry) in self.entries.drain() {
            entry.release_hold();
        }
        self.released.clear();
    }

    fn entry(&self, id: HandleId, key: &Key) -> Result<&Entry, UsageError> {
        self.entries
            .get(&id)
            .ok_or_else(|| UsageError::NotCaptured(key.clone()))
    }

    fn entry_mut(&mut self, id: HandleId, key: &Key) -> Result<&mut Entry, UsageError> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| UsageError::NotCaptured(key.clone()))
    }
}

#[derive(Clone)]
struct Capture {
    id: HandleId,
    key: Key,
    scheduling: Permission,
    immediate: Permission,
}

impl Capture {
    /// The same capture, with at most read access for the body itself.
    fn read_only(&self) -> Self {
        Self {
            immediate: self.immediate.min(Permission::Read),
            ..self.clone()
        }
    }
}

/// Folds repeated captures of one handle into the strongest of them.
fn merge(captures: Vec<Capture>) -> Vec<Capture> {
    let mut merged: Vec<Capture> = Vec::with_capacity(captures.len());
    for capture in captures {
        match merged.iter_mut().find(|known| known.id == capture.id) {
            Some(known) => {
                known.scheduling = known.scheduling.max(capture.scheduling);
                known.immediate = known.immediate.max(capture.immediate);
            }
            None => merged.push(capture),
        }
    }
    merged
}

impl Scope {
    /// Checks every capture before anything is registered, so a failed
    /// declaration leaves the scope untouched.
    fn check(&self, captures: &[Capture]) -> Result<(), UsageError> {
        for capture in captures {
            debug_assert!(usage::is_valid(capture.scheduling, capture.immediate));
            let entry = self.entry(capture.id, &capture.key)?;

            if capture.scheduling > entry.scheduling {
                return Err(UsageError::PermissionDenied {
                    key: capture.key.clone(),
                    requested: capture.scheduling,
                    held: entry.scheduling,
                });
            }
        }
        Ok(())
    }

    fn spawn(&mut self, name: Cow<'static, str>, captures: &[Capture], body: Body) -> TaskId {
        let uses = captures
            .iter()
            .filter_map(|capture| {
                let entry = self.entries.get_mut(&capture.id)?;
                Some(Use::register(capture.id, entry, capture.scheduling, capture.immediate))
            })
            .collect();

        TaskNode::spawn(self.shared.clone(), name, body, uses).id
    }

    /// Declares one iteration of `looped`: a task that checks the condition
    /// and, while it holds, declares the body and the next iteration.
    fn schedule_iteration(&mut self, looped: Arc<Loop>) -> Result<TaskId, UsageError> {
        let outer: Vec<Capture> = looped.captures.iter().map(Capture::read_only).collect();
        self.check(&outer)?;

        let name = looped.name.clone();
        let body: Body = Box::new(move |ctx: &mut TaskContext| -> anyhow::Result<()> {
            if !(looped.condition)(&*ctx)? {
                return Ok(());
            }

            let iteration = looped.clone();
            ctx.check(&looped.captures)?;
            ctx.spawn(
                format!("{}/do", looped.name).into(),
                &looped.captures,
                Box::new(move |ctx: &mut TaskContext| (iteration.body)(ctx)),
            );

            ctx.schedule_iteration(looped.clone())?;
            Ok(())
        });

        Ok(self.spawn(name, &outer, body))
    }
}

type Condition = Box<dyn FnOnce(&TaskContext) -> anyhow::Result<bool> + Send>;

/// Shared state of every iteration of a [`TaskDef::run_while`] loop.
struct Loop {
    name: Cow<'static, str>,
    captures: Vec<Capture>,
    condition: Box<dyn Fn(&TaskContext) -> anyhow::Result<bool> + Send + Sync>,
    body: Box<dyn Fn(&mut TaskContext) -> anyhow::Result<()> + Send + Sync>,
}

/// Builder for one task.
///
/// Each capture method takes any [`Captures`] and the permissions it grants.
/// Capturing the same handle more than once keeps the strongest of the
/// requested permissions.
///
/// ```rust
/// use nagare::{Config, Runtime, make_key};
///
/// let mut rt = Runtime::new(Config::default())?;
/// let h = rt.initial_access::<i32>(make_key!("h"))?;
///
/// rt.task().name("set").modifies(&h).run({
///     let h = h.clone();
///     move |ctx| {
///         ctx.set(&h, 5)?;
///         Ok(())
///     }
/// })?;
///
/// assert_eq!(rt.wait(&h)?, 5);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct TaskDef<'a> {
    scope: &'a mut Scope,
    name: Option<Cow<'static, str>>,
    captures: Vec<Capture>,
}

impl<'a> TaskDef<'a> {
    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The body reads the value.
    pub fn reads(self, captures: impl Captures) -> Self {
        self.capture(captures, Permission::Read, Permission::Read)
    }

    /// The body reads and writes the value.
    pub fn modifies(self, captures: impl Captures) -> Self {
        self.capture(captures, Permission::Modify, Permission::Modify)
    }

    /// The body only schedules nested reads.
    pub fn schedules_reads(self, captures: impl Captures) -> Self {
        self.capture(captures, Permission::Read, Permission::None)
    }

    /// The body only schedules nested work, which may modify the value.
    pub fn schedules_modify(self, captures: impl Captures) -> Self {
        self.capture(captures, Permission::Modify, Permission::None)
    }

    /// The body reads the value and schedules nested work that may modify it.
    pub fn reads_schedules_modify(self, captures: impl Captures) -> Self {
        self.capture(captures, Permission::Modify, Permission::Read)
    }

    fn capture(mut self, captures: impl Captures, scheduling: Permission, immediate: Permission) -> Self {
        let list = &mut self.captures;
        captures.visit(&mut |id, key| {
            list.push(Capture {
                id,
                key: key.clone(),
                scheduling,
                immediate,
            })
        });
        self
    }

    /// Registers the task.
    ///
    /// Every capture is checked before anything is registered, so a failed
    /// call leaves the scope untouched.
    pub fn run<F>(self, body: F) -> Result<TaskId, UsageError>
    where
        F: FnOnce(&mut TaskContext) -> anyhow::Result<()> + Send + 'static,
    {
        let TaskDef {
            scope,
            name,
            captures,
        } = self;

        let captures = merge(captures);
        scope.check(&captures)?;

        let name = name.unwrap_or_else(|| type_name::<F>().into());
        Ok(scope.spawn(name, &captures, Box::new(body)))
    }

    /// Registers a task that runs `then` only if `condition` holds.
    ///
    /// `condition` runs first, in a task of its own that may read every
    /// capture the body may read. When it holds, `then` is declared as a
    /// nested task with the full captures, so work declared after this call
    /// is ordered after `then` either way.
    pub fn run_if<C, F>(self, condition: C, then: F) -> Result<TaskId, UsageError>
    where
        C: FnOnce(&TaskContext) -> anyhow::Result<bool> + Send + 'static,
        F: FnOnce(&mut TaskContext) -> anyhow::Result<()> + Send + 'static,
    {
        self.branch(Box::new(condition), Box::new(then), None)
    }

    /// Like [`run_if`](Self::run_if), running `otherwise` when `condition`
    /// does not hold.
    pub fn run_if_else<C, F, G>(self, condition: C, then: F, otherwise: G) -> Result<TaskId, UsageError>
    where
        C: FnOnce(&TaskContext) -> anyhow::Result<bool> + Send + 'static,
        F: FnOnce(&mut TaskContext) -> anyhow::Result<()> + Send + 'static,
        G: FnOnce(&mut TaskContext) -> anyhow::Result<()> + Send + 'static,
    {
        self.branch(Box::new(condition), Box::new(then), Some(Box::new(otherwise)))
    }

    fn branch(self, condition: Condition, then: Body, otherwise: Option<Body>) -> Result<TaskId, UsageError> {
        let TaskDef {
            scope,
            name,
            captures,
        } = self;

        let captures = merge(captures);
        let outer: Vec<Capture> = captures.iter().map(Capture::read_only).collect();
        scope.check(&outer)?;

        let name = name.unwrap_or(Cow::Borrowed("if"));
        let prefix = name.clone();
        let body: Body = Box::new(move |ctx: &mut TaskContext| -> anyhow::Result<()> {
            let (branch, suffix) = if condition(&*ctx)? {
                (then, "then")
            } else {
                match otherwise {
                    Some(otherwise) => (otherwise, "else"),
                    None => return Ok(()),
                }
            };

            ctx.check(&captures)?;
            ctx.spawn(format!("{prefix}/{suffix}").into(), &captures, branch);
            Ok(())
        });

        Ok(scope.spawn(name, &outer, body))
    }

    /// Registers a loop: `body` runs as long as `condition` holds.
    ///
    /// Every iteration is a task that checks `condition` and, when it holds,
    /// declares `body` followed by the next iteration. Each check sees the
    /// values the previous `body` left behind.
    pub fn run_while<C, F>(self, condition: C, body: F) -> Result<TaskId, UsageError>
    where
        C: Fn(&TaskContext) -> anyhow::Result<bool> + Send + Sync + 'static,
        F: Fn(&mut TaskContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let TaskDef {
            scope,
            name,
            captures,
        } = self;

        let captures = merge(captures);
        scope.check(&captures)?;

        let looped = Arc::new(Loop {
            name: name.unwrap_or(Cow::Borrowed("while")),
            captures,
            condition: Box::new(condition),
            body: Box::new(body),
        });

        scope.schedule_iteration(looped)
    }
}

/// The scope a task body runs in.
///
/// Dereferences to [`Scope`], so bodies declare nested work the same way the
/// root does. Values of captured handles are reached through
/// [`get`](Self::get), [`get_mut`](Self::get_mut) and [`set`](Self::set).
pub struct TaskContext {
    scope: Scope,
    task: TaskId,
    uses: Vec<Use>,
}

impl TaskContext {
    pub(crate) fn new(shared: Arc<RankShared>, task: TaskId, uses: Vec<Use>) -> Self {
        let mut scope = Scope::nested(shared);

        for usage in &uses {
            let entry = Entry::new(
                usage.input.variable.clone(),
                usage.input.clone(),
                usage.scheduling,
                usage.immediate,
            );
            scope.entries.insert(usage.handle, entry);
        }

        Self { scope, task, uses }
    }

    /// Id of the running task.
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    pub fn get<T>(&self, handle: &AccessHandle<T>) -> Result<&T, UsageError>
    where
        T: Send + Sync + 'static,
    {
        let key = handle.key();
        let entry = self.scope.entry(handle.id(), key)?;
        check_immediate(entry, key, Permission::Read)?;

        let value = match &entry.slot {
            Slot::Owned(value) => (**value).downcast_ref::<T>(),
            Slot::Value(Some(value)) => (**value).downcast_ref::<T>(),
            Slot::Value(None) => return Err(UsageError::Uninitialized(key.clone())),
            Slot::Unavailable => return Err(UsageError::ValueUnavailable(key.clone())),
        };

        value.ok_or_else(|| mismatch::<T>(key))
    }

    /// Mutable access to the value, copying it first if the version is
    /// shared with anyone else.
    pub fn get_mut<T>(&mut self, handle: &AccessHandle<T>) -> Result<&mut T, UsageError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = handle.key();
        let entry = self.scope.entry_mut(handle.id(), key)?;
        check_immediate(entry, key, Permission::Modify)?;

        entry.slot = match std::mem::replace(&mut entry.slot, Slot::Unavailable) {
            Slot::Value(Some(value)) => match value.downcast::<T>() {
                Ok(value) => Slot::Owned(Box::new(Arc::unwrap_or_clone(value))),
                Err(value) => {
                    entry.slot = Slot::Value(Some(value));
                    return Err(mismatch::<T>(key));
                }
            },
            other => other,
        };

        match &mut entry.slot {
            Slot::Owned(value) => (**value).downcast_mut::<T>().ok_or_else(|| mismatch::<T>(key)),
            Slot::Value(_) => Err(UsageError::Uninitialized(key.clone())),
            Slot::Unavailable => Err(UsageError::ValueUnavailable(key.clone())),
        }
    }

    pub fn set<T>(&mut self, handle: &AccessHandle<T>, value: T) -> Result<(), UsageError>
    where
        T: Send + Sync + 'static,
    {
        let key = handle.key();
        let entry = self.scope.entry_mut(handle.id(), key)?;
        check_immediate(entry, key, Permission::Modify)?;

        if let Slot::Unavailable = entry.slot {
            return Err(UsageError::ValueUnavailable(key.clone()));
        }

        entry.slot = Slot::Owned(Box::new(value));
        Ok(())
    }

    /// Releases every use of the task, handing each output its final value.
    pub(crate) fn close(self) {
        let TaskContext {
            mut scope, uses, ..
        } = self;

        for usage in uses {
            let tail = match scope.entries.remove(&usage.handle) {
                Some(entry) => Some(entry.into_tail()),
                None => scope.released.remove(&usage.handle),
            };
            usage.release(tail);
        }

        scope.release_all();
    }
}

impl Deref for TaskContext {
    type Target = Scope;

    fn deref(&self) -> &Self::Target {
        &self.scope
    }
}

impl DerefMut for TaskContext {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.scope
    }
}

fn check_immediate(entry: &Entry, key: &Key, requested: Permission) -> Result<(), UsageError> {
    if entry.immediate < requested {
        return Err(UsageError::PermissionDenied {
            key: key.clone(),
            requested,
            held: entry.immediate,
        });
    }
    Ok(())
}

fn mismatch<T>(key: &Key) -> UsageError {
    UsageError::TypeMismatch {
        key: key.clone(),
        expected: type_name::<T>(),
    }
}
