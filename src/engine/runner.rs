mod diagnostics;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::Level;

use crate::engine::flow::Flow;
use crate::engine::scope::TaskContext;
use crate::engine::task::{Payload, TaskId, TaskNode, TaskState};
use crate::engine::RankShared;
use crate::error::NagareError;
use crate::utils::lock;

pub use diagnostics::{
    BlockedConsumer, DependencySnapshot, Diagnostics, FlowInfo, GraphNode, TaskInfo, UseInfo,
};

/// How often an idle rank wakes up to look for work that arrived without a
/// notification, such as a publication from another rank.
const POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskExecution {
    #[serde(skip)]
    pub start: Instant,
    pub duration: Duration,
}

struct Queue {
    ready: VecDeque<Arc<TaskNode>>,
    /// Tasks created and not yet done.
    live: usize,
    running: usize,
    last_progress: Instant,
}

#[derive(Default)]
struct Report {
    execution_times: HashMap<TaskId, TaskExecution>,
    names: HashMap<TaskId, String>,
    failure: Option<NagareError>,
}

/// The ready queue of one rank and the bookkeeping around it.
pub(crate) struct Scheduler {
    queue: Mutex<Queue>,
    signal: Condvar,
    tasks: Mutex<HashMap<TaskId, Weak<TaskNode>>>,
    report: Mutex<Report>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            queue: Mutex::new(Queue {
                ready: VecDeque::new(),
                live: 0,
                running: 0,
                last_progress: Instant::now(),
            }),
            signal: Condvar::new(),
            tasks: Mutex::new(HashMap::new()),
            report: Mutex::new(Report::default()),
        }
    }
}

impl Scheduler {
    pub(crate) fn register(&self, task: &Arc<TaskNode>) {
        lock(&self.tasks).insert(task.id, Arc::downgrade(task));
        lock(&self.queue).live += 1;
    }

    pub(crate) fn enqueue(&self, task: Arc<TaskNode>) {
        {
            let mut queue = lock(&self.queue);
            queue.ready.push_back(task);
            queue.last_progress = Instant::now();
        }
        self.signal.notify_all();
    }

    fn finish(&self, task: &TaskNode, execution: TaskExecution, result: anyhow::Result<()>) {
        {
            let mut report = lock(&self.report);
            report.execution_times.insert(task.id, execution);
            report.names.insert(task.id, task.name.to_string());

            if let Err(err) = result {
                tracing::error!(task = %task.name, "task failed: {err:#}");
                if report.failure.is_none() {
                    report.failure = Some(NagareError::Task(task.name.to_string(), err));
                }
            }
        }

        lock(&self.tasks).remove(&task.id);

        {
            let mut queue = lock(&self.queue);
            queue.running -= 1;
            queue.live -= 1;
            queue.last_progress = Instant::now();
        }
        self.signal.notify_all();
    }

    /// Tasks that are not done yet, oldest first.
    pub(crate) fn live_tasks(&self) -> Vec<Arc<TaskNode>> {
        let mut tasks: Vec<_> = lock(&self.tasks)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        tasks.sort_by_key(|task| task.id);
        tasks
    }

    fn is_finished(&self, id: TaskId) -> bool {
        !lock(&self.tasks).contains_key(&id)
    }

    pub(crate) fn pending(&self) -> usize {
        lock(&self.queue).live
    }

    pub(crate) fn take_failure(&self) -> Option<NagareError> {
        lock(&self.report).failure.take()
    }

    pub(crate) fn diagnostics(&self) -> Diagnostics {
        let report = lock(&self.report);
        Diagnostics {
            execution_times: report.execution_times.clone(),
            names: report.names.clone(),
            leaked: Vec::new(),
        }
    }
}

/// What [`drive`] runs the rank for.
pub(crate) enum Goal<'a> {
    /// Every live task is done.
    Idle,
    /// The given flow is ready.
    Ready(&'a Flow),
    /// The given task is done.
    Finished(TaskId),
}

impl Goal<'_> {
    fn reached(&self, scheduler: &Scheduler, queue: &Queue) -> bool {
        match self {
            Goal::Idle => queue.live == 0,
            Goal::Ready(flow) => flow.is_ready(),
            Goal::Finished(id) => scheduler.is_finished(*id),
        }
    }
}

/// Executes ready tasks of the rank until `goal` is reached.
///
/// Without a pool tasks run one by one on the calling thread. With a pool,
/// the calling thread only dispatches and every ready task is spawned onto
/// the pool as soon as it is dequeued.
///
/// Failed tasks do not stop the loop, their uses are released like any other
/// and the first failure is returned once the goal is reached. A standalone
/// rank that runs out of ready tasks with work still pending is stalled for
/// good and reports it right away. Ranks sharing a coordinator with others
/// report a stall after `stall_timeout` without local progress. `roots` are
/// the flows the caller's scope still refers to, the stall report starts its
/// walk from them as well as from the live tasks.
pub(crate) fn drive(
    shared: &Arc<RankShared>,
    pool: Option<&rayon::ThreadPool>,
    stall_timeout: Option<Duration>,
    goal: Goal<'_>,
    roots: &[Arc<Flow>],
) -> Result<(), NagareError> {
    let outcome = match pool {
        None => pump(shared, stall_timeout, &goal, roots, execute),
        Some(pool) => pool.in_place_scope(|s| {
            pump(shared, stall_timeout, &goal, roots, |task| s.spawn(move |_| execute(task)))
        }),
    };

    if let Some(err) = shared.scheduler.take_failure() {
        return Err(err);
    }

    outcome
}

fn pump(
    shared: &Arc<RankShared>,
    stall_timeout: Option<Duration>,
    goal: &Goal<'_>,
    roots: &[Arc<Flow>],
    mut dispatch: impl FnMut(Arc<TaskNode>),
) -> Result<(), NagareError> {
    let scheduler = &shared.scheduler;

    loop {
        let task = {
            let mut queue = lock(&scheduler.queue);
            loop {
                if goal.reached(scheduler, &queue) {
                    return Ok(());
                }

                if let Some(task) = queue.ready.pop_front() {
                    queue.running += 1;
                    break task;
                }

                if queue.running == 0 {
                    let stalled = shared.standalone
                        || stall_timeout.is_some_and(|limit| queue.last_progress.elapsed() >= limit);

                    if stalled {
                        let pending = queue.live;
                        drop(queue);
                        return Err(stall(shared, pending, roots));
                    }
                }

                queue = scheduler
                    .signal
                    .wait_timeout(queue, POLL)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        dispatch(task);
    }
}

fn stall(shared: &RankShared, pending: usize, roots: &[Arc<Flow>]) -> NagareError {
    let snapshot = DependencySnapshot::capture(shared, roots.to_vec());
    let report = snapshot.summary();
    tracing::warn!(rank = shared.rank, pending, "rank stalled\n{report}");
    NagareError::Stalled { pending, report }
}

fn execute(task: Arc<TaskNode>) {
    task.transition(TaskState::Ready, TaskState::Running);

    let span = tracing::span!(Level::DEBUG, "task", name = %task.name, rank = task.shared.rank);
    let _enter = span.enter();

    let Some(Payload { body, uses }) = task.take_payload() else {
        unreachable!("task '{}' was dispatched twice", task.name);
    };

    let mut context = TaskContext::new(task.shared.clone(), task.id, uses);
    let start = Instant::now();

    // bodies only ever see owned copies and immutable snapshots
    let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(&mut context))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    };

    let duration = start.elapsed();
    context.close();
    task.transition(TaskState::Running, TaskState::Done);

    tracing::debug!(?duration, "task done");
    task.shared
        .scheduler
        .finish(&task, TaskExecution { start, duration }, result);
}
