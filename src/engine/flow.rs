use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::core::Dynamic;
use crate::engine::runner::FlowInfo;
use crate::engine::task::TaskNode;
use crate::key::{Key, VersionTag};
use crate::publish::Publication;
use crate::utils::lock;

/// One named logical variable on one rank.
///
/// Every handle of a key on a rank shares the same variable while any of
/// them is alive, whether it came from an initial access or a fetch.
#[derive(Debug)]
pub(crate) struct Variable {
    pub(crate) key: Key,
    /// Type every handle of the variable must agree on.
    pub(crate) type_name: &'static str,
    versions: AtomicU64,
}

impl Variable {
    pub(crate) fn new(key: Key, type_name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            key,
            type_name,
            versions: AtomicU64::new(0),
        })
    }

    /// Hands out the next automatic version, the initial flow owns 0.
    pub(crate) fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FlowId(pub(crate) u64);

impl FlowId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        FlowId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Where a flow sits in its variable's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    /// Root of a chain, version 0.
    Initial,
    /// Output of a modify use.
    Next,
    /// A locally modified value made visible to nested work.
    Commit,
    /// Placeholder resolved by a matching publication.
    Fetching,
}

/// Work to run once a flow becomes ready.
///
/// Consumers of a flow are stored as continuations too, but only `Task` and
/// `Forward` ever wait for readers to drain.
pub(crate) enum Continuation {
    Task(Arc<TaskNode>),
    Forward(Arc<Flow>),
    Publish(Arc<Publication>),
}

#[derive(Default)]
struct FlowState {
    ready: bool,
    value: Option<Dynamic>,
    readers: usize,
    waiters: Vec<Continuation>,
    /// Run once the flow is ready and no reader is left.
    consumers: Vec<Continuation>,
}

/// One version-state of a variable.
///
/// A flow starts unready. It is satisfied exactly once by [`Flow::advance`],
/// which stores its value and wakes everything waiting on it. Read dependents
/// are woken on readiness alone, modify dependents (consumers) additionally
/// wait until every reader registered on the flow has been released. A
/// consumer is either a task or the output flow of a modify use that ended on
/// this flow unchanged.
pub(crate) struct Flow {
    pub(crate) id: FlowId,
    pub(crate) variable: Arc<Variable>,
    pub(crate) version: VersionTag,
    pub(crate) relation: Relation,
    state: Mutex<FlowState>,
}

impl Flow {
    fn create(variable: Arc<Variable>, version: VersionTag, relation: Relation) -> Arc<Self> {
        Arc::new(Self {
            id: FlowId::next(),
            variable,
            version,
            relation,
            state: Mutex::new(FlowState::default()),
        })
    }

    pub(crate) fn initial(variable: Arc<Variable>) -> Arc<Self> {
        Self::create(variable, VersionTag::Auto(0), Relation::Initial)
    }

    pub(crate) fn next(variable: Arc<Variable>) -> Arc<Self> {
        let version = VersionTag::Auto(variable.next_version());
        Self::create(variable, version, Relation::Next)
    }

    pub(crate) fn commit(variable: Arc<Variable>) -> Arc<Self> {
        let version = VersionTag::Auto(variable.next_version());
        Self::create(variable, version, Relation::Commit)
    }

    pub(crate) fn fetching(variable: Arc<Variable>, version: VersionTag) -> Arc<Self> {
        Self::create(variable, version, Relation::Fetching)
    }

    pub(crate) fn is_ready(&self) -> bool {
        lock(&self.state).ready
    }

    /// The stored value, `None` until the flow is ready or when nothing ever
    /// set the variable.
    pub(crate) fn value(&self) -> Option<Dynamic> {
        lock(&self.state).value.clone()
    }

    /// Marks the flow ready with `value` and propagates readiness through
    /// every dependent, forwarded flow and publication.
    pub(crate) fn advance(self: &Arc<Self>, value: Option<Dynamic>) {
        propagate(vec![(Continuation::Forward(self.clone()), value)]);
    }

    /// Runs `continuation` once this flow is ready, immediately if it already is.
    pub(crate) fn add_waiter(&self, continuation: Continuation) {
        let value = {
            let mut state = lock(&self.state);
            if !state.ready {
                state.waiters.push(continuation);
                return;
            }
            state.value.clone()
        };
        propagate(vec![(continuation, value)]);
    }

    /// Satisfies `task` once this flow is ready and has no readers left.
    pub(crate) fn add_consumer(&self, task: Arc<TaskNode>) {
        self.add_drained(Continuation::Task(task));
    }

    /// Makes `target` ready with this flow's value once this flow is ready.
    pub(crate) fn forward_to(&self, target: Arc<Flow>) {
        self.add_waiter(Continuation::Forward(target));
    }

    /// Like [`forward_to`](Self::forward_to), but `target` also waits for
    /// every reader of this flow to be released.
    pub(crate) fn forward_drained(&self, target: Arc<Flow>) {
        self.add_drained(Continuation::Forward(target));
    }

    fn add_drained(&self, consumer: Continuation) {
        let value = {
            let mut state = lock(&self.state);
            if !state.ready || state.readers > 0 {
                state.consumers.push(consumer);
                return;
            }
            state.value.clone()
        };
        propagate(vec![(consumer, value)]);
    }

    pub(crate) fn add_reader(&self) {
        lock(&self.state).readers += 1;
    }

    pub(crate) fn release_reader(&self) {
        let (consumers, value) = {
            let mut state = lock(&self.state);
            assert!(state.readers > 0, "released a reader of flow {self} that was never added");
            state.readers -= 1;
            if state.readers > 0 || !state.ready {
                return;
            }
            (std::mem::take(&mut state.consumers), state.value.clone())
        };

        propagate(
            consumers
                .into_iter()
                .map(|consumer| (consumer, value.clone()))
                .collect(),
        );
    }

    /// Sets the ready flag and hands back everything waiting on it.
    fn mark_ready(&self, value: Option<Dynamic>) -> (Vec<Continuation>, Vec<Continuation>) {
        let mut state = lock(&self.state);
        assert!(!state.ready, "flow {self} was satisfied twice");
        state.ready = true;
        state.value = value;

        let waiters = std::mem::take(&mut state.waiters);
        let consumers = if state.readers == 0 {
            std::mem::take(&mut state.consumers)
        } else {
            Vec::new()
        };

        tracing::trace!(
            flow = %self,
            waiters = waiters.len(),
            consumers = consumers.len(),
            "flow ready"
        );

        (waiters, consumers)
    }

    pub(crate) fn inspect(&self) -> FlowInfo {
        let mut info = FlowInfo {
            id: self.id,
            key: self.variable.key.to_string(),
            version: self.version.to_string(),
            type_name: self.variable.type_name.to_string(),
            relation: self.relation,
            ready: false,
            readers: 0,
            waiting_tasks: Vec::new(),
            consumers: Vec::new(),
            forwards: Vec::new(),
            drained_forwards: Vec::new(),
            publications: 0,
            fetches: Vec::new(),
        };

        let publications = {
            let state = lock(&self.state);
            info.ready = state.ready;
            info.readers = state.readers;

            let mut publications = Vec::new();
            for waiter in &state.waiters {
                match waiter {
                    Continuation::Task(task) => info.waiting_tasks.push(task.id),
                    Continuation::Forward(flow) => info.forwards.push(flow.id),
                    Continuation::Publish(publication) => publications.push(publication.clone()),
                }
            }
            for consumer in &state.consumers {
                match consumer {
                    Continuation::Task(task) => info.consumers.push(task.id),
                    Continuation::Forward(flow) => info.drained_forwards.push(flow.id),
                    Continuation::Publish(_) => {}
                }
            }
            publications
        };

        info.publications = publications.len();
        info.fetches = publications
            .iter()
            .flat_map(|publication| publication.placeholders())
            .map(|flow| flow.id)
            .collect();

        info
    }

    /// Flows this one will satisfy: forward targets, drained forward targets
    /// and the fetch placeholders of its publications.
    pub(crate) fn successors(&self) -> Vec<Arc<Flow>> {
        let mut successors = Vec::new();
        let mut publications = Vec::new();

        {
            let state = lock(&self.state);
            for continuation in state.waiters.iter().chain(&state.consumers) {
                match continuation {
                    Continuation::Forward(flow) => successors.push(flow.clone()),
                    Continuation::Publish(publication) => publications.push(publication.clone()),
                    Continuation::Task(_) => {}
                }
            }
        }

        for publication in publications {
            successors.extend(publication.placeholders());
        }
        successors
    }
}

impl Display for Flow {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.variable.key, self.version)
    }
}

/// Drains a stack of pending continuations.
///
/// Forwarded flows and publications push their own dependents back onto the
/// stack instead of recursing, so long forwarding chains run in constant
/// stack depth.
fn propagate(mut stack: Vec<(Continuation, Option<Dynamic>)>) {
    while let Some((continuation, value)) = stack.pop() {
        match continuation {
            Continuation::Task(task) => task.satisfy(),
            Continuation::Forward(flow) => {
                let (waiters, consumers) = flow.mark_ready(value.clone());
                stack.extend(
                    waiters
                        .into_iter()
                        .chain(consumers)
                        .map(|continuation| (continuation, value.clone())),
                );
            }
            Continuation::Publish(publication) => {
                for flow in publication.resolve(value.clone()) {
                    stack.push((Continuation::Forward(flow), value.clone()));
                }
            }
        }
    }
}
