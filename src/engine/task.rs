use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::engine::flow::{Continuation, Flow};
use crate::engine::runner::{TaskInfo, UseInfo};
use crate::engine::scope::TaskContext;
use crate::engine::usage::{Dependency, Use};
use crate::engine::RankShared;
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Lifecycle of a task. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TaskState {
    Pending = 0,
    Ready = 1,
    Running = 2,
    Done = 3,
}

impl TaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskState::Pending,
            1 => TaskState::Ready,
            2 => TaskState::Running,
            _ => TaskState::Done,
        }
    }
}

pub(crate) type Body = Box<dyn FnOnce(&mut TaskContext) -> anyhow::Result<()> + Send>;

pub(crate) struct Payload {
    pub(crate) body: Body,
    pub(crate) uses: Vec<Use>,
}

/// A unit of deferred work on one rank.
///
/// `outstanding` counts unsatisfied input dependencies plus one guard held
/// while the task is being wired up. Dependencies that are already satisfied
/// when they are registered decrement it right away, and the guard is
/// dropped last, so the counter reaches zero exactly once.
pub(crate) struct TaskNode {
    pub(crate) id: TaskId,
    pub(crate) name: Cow<'static, str>,
    outstanding: AtomicUsize,
    state: AtomicU8,
    payload: Mutex<Option<Payload>>,
    pub(crate) shared: Arc<RankShared>,
}

impl TaskNode {
    /// Creates the task, wires its dependencies and enqueues it if nothing is
    /// left to wait for.
    pub(crate) fn spawn(
        shared: Arc<RankShared>,
        name: Cow<'static, str>,
        body: Body,
        uses: Vec<Use>,
    ) -> Arc<Self> {
        let dependencies: Vec<Dependency> = uses
            .iter()
            .map(Use::dependency)
            .filter(|dependency| !matches!(dependency, Dependency::None))
            .collect();

        let task = Arc::new(Self {
            id: TaskId::next(),
            name,
            outstanding: AtomicUsize::new(dependencies.len() + 1),
            state: AtomicU8::new(TaskState::Pending as u8),
            payload: Mutex::new(Some(Payload { body, uses })),
            shared,
        });

        tracing::debug!(
            task = %task.name,
            id = %task.id,
            dependencies = dependencies.len(),
            "task created"
        );

        task.shared.scheduler.register(&task);

        for dependency in dependencies {
            match dependency {
                Dependency::Ready(flow) => flow.add_waiter(Continuation::Task(task.clone())),
                Dependency::Drained(flow) => flow.add_consumer(task.clone()),
                Dependency::None => {}
            }
        }

        // registration guard
        task.satisfy();
        task
    }

    /// Marks one dependency as satisfied.
    pub(crate) fn satisfy(self: &Arc<Self>) {
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "task '{}' satisfied more often than it waits", self.name);

        if previous == 1 {
            self.transition(TaskState::Pending, TaskState::Ready);
            self.shared.scheduler.enqueue(self.clone());
        }
    }

    pub(crate) fn transition(&self, from: TaskState, to: TaskState) {
        let result = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire);

        if let Err(actual) = result {
            panic!(
                "task '{}' cannot move from {:?} to {:?}, it is {:?}",
                self.name,
                from,
                to,
                TaskState::from_u8(actual)
            );
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn take_payload(&self) -> Option<Payload> {
        lock(&self.payload).take()
    }

    /// Every flow the task's uses still refer to.
    pub(crate) fn flows(&self) -> Vec<Arc<Flow>> {
        lock(&self.payload)
            .as_ref()
            .map(|payload| {
                payload
                    .uses
                    .iter()
                    .flat_map(|usage| [usage.input.clone(), usage.output.clone()])
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn inspect(&self) -> TaskInfo {
        let uses = lock(&self.payload)
            .as_ref()
            .map(|payload| {
                payload
                    .uses
                    .iter()
                    .map(|usage| UseInfo {
                        key: usage.input.variable.key.to_string(),
                        input: usage.input.id,
                        output: usage.output.id,
                        scheduling: usage.scheduling,
                        immediate: usage.immediate,
                    })
                    .collect()
            })
            .unwrap_or_default();

        TaskInfo {
            id: self.id,
            name: self.name.to_string(),
            state: self.state(),
            outstanding: self.outstanding.load(Ordering::Acquire),
            uses,
        }
    }
}
