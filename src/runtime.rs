use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::core::{Config, Workers};
use crate::engine::{
    Captures, DependencySnapshot, Diagnostics, Goal, RankShared, Scope, TaskContext, drive,
};
use crate::error::{NagareError, UsageError};
use crate::handle::AccessHandle;
use crate::publish::{Coordinator, Leak};
use crate::utils::lock;

/// One rank of the runtime.
///
/// A `Runtime` dereferences to the rank's root [`Scope`], which is where the
/// top level of the task graph is declared. Declaring work never runs it, call
/// [`run`](Self::run), [`wait`](Self::wait) or [`finalize`](Self::finalize) to
/// drive the rank.
pub struct Runtime {
    scope: Scope,
    pool: Option<rayon::ThreadPool>,
    config: Config,
}

impl Runtime {
    /// Creates a standalone rank with its own coordinator.
    pub fn new(config: Config) -> Result<Self, NagareError> {
        Self::for_rank(0, 1, Arc::new(Coordinator::new()), true, config)
    }

    fn for_rank(
        rank: usize,
        n_ranks: usize,
        coordinator: Arc<Coordinator>,
        standalone: bool,
        config: Config,
    ) -> Result<Self, NagareError> {
        let pool = match config.workers {
            Workers::Serial => None,
            Workers::Threads(threads) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(move |i| format!("nagare-{rank}-{i}"))
                    .build()?,
            ),
        };

        let shared = RankShared::new(rank, n_ranks, coordinator, standalone);

        Ok(Self {
            scope: Scope::root(shared),
            pool,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The coordinator this rank publishes to and fetches from.
    pub fn coordinator(&self) -> &Coordinator {
        &self.scope.shared.coordinator
    }

    /// Number of tasks declared on this rank that have not finished.
    pub fn pending(&self) -> usize {
        self.scope.shared.scheduler.pending()
    }

    /// Runs the rank until every declared task is done.
    pub fn run(&mut self) -> Result<(), NagareError> {
        self.drive(Goal::Idle)
    }

    fn drive(&self, goal: Goal<'_>) -> Result<(), NagareError> {
        drive(
            &self.scope.shared,
            self.pool.as_ref(),
            self.config.stall_timeout,
            goal,
            &self.scope.flows(),
        )
    }

    /// Runs the rank until the current version of `handle` is ready and
    /// returns a copy of it.
    ///
    /// Meant for the end of a program or for tests. Waiting on a version that
    /// depends on a read this scope still holds never returns, a standalone
    /// rank reports it as [`NagareError::Stalled`].
    pub fn wait<T>(&mut self, handle: &AccessHandle<T>) -> Result<T, NagareError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let key = handle.key();
        let flow = self.scope.current_flow(handle.id(), key)?;
        self.drive(Goal::Ready(&flow))?;

        let value = flow
            .value()
            .ok_or_else(|| UsageError::Uninitialized(key.clone()))?;

        let value = value
            .downcast_ref::<T>()
            .ok_or_else(|| UsageError::TypeMismatch {
                key: key.clone(),
                expected: std::any::type_name::<T>(),
            })?;

        Ok(value.clone())
    }

    /// Evaluates `condition` on the current versions of `captures` and returns
    /// the result to the caller.
    ///
    /// The condition runs as a task reading every capture, so the rank is
    /// driven until everything it depends on is done. Work that does not
    /// feed it may still be pending afterwards.
    pub fn condition<C, F>(&mut self, captures: C, condition: F) -> Result<bool, NagareError>
    where
        C: Captures,
        F: FnOnce(&TaskContext) -> anyhow::Result<bool> + Send + 'static,
    {
        let outcome = Arc::new(Mutex::new(None));
        let task = self.scope.task().name("condition").reads(captures).run({
            let outcome = outcome.clone();
            move |ctx| {
                let value = condition(&*ctx)?;
                *lock(&outcome) = Some(value);
                Ok(())
            }
        })?;

        self.drive(Goal::Finished(task))?;

        let value = lock(&outcome).take();
        value.ok_or_else(|| {
            NagareError::Task("condition".into(), anyhow::anyhow!("condition produced no value"))
        })
    }

    /// Captures the unfinished part of the graph for inspection.
    pub fn snapshot(&self) -> DependencySnapshot {
        DependencySnapshot::capture(&self.scope.shared, self.scope.flows())
    }

    /// Ends the root scope and runs the rank to completion.
    ///
    /// Reads held by the root scope are released first. A standalone rank
    /// also reports publications that were fetched fewer times than declared.
    pub fn finalize(mut self) -> Result<Diagnostics, NagareError> {
        self.scope.release_all();
        self.run()?;

        let shared = &self.scope.shared;
        let mut diagnostics = shared.scheduler.diagnostics();
        if shared.standalone {
            diagnostics.leaked = shared.coordinator.report();
        }

        tracing::info!(
            rank = shared.rank,
            tasks = diagnostics.tasks_run(),
            "rank finished"
        );

        Ok(diagnostics)
    }
}

impl Deref for Runtime {
    type Target = Scope;

    fn deref(&self) -> &Self::Target {
        &self.scope
    }
}

impl DerefMut for Runtime {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.scope
    }
}

/// Outcome of [`World::run`].
#[derive(Debug)]
pub struct WorldReport {
    /// Diagnostics of every rank, by rank index.
    pub ranks: Vec<Diagnostics>,
    /// Publications that were fetched fewer times than declared.
    pub leaked: Vec<Leak>,
}

/// A group of ranks in one process.
///
/// Every rank runs the same program on its own thread with its own
/// [`Runtime`]. Ranks share nothing but a [`Coordinator`], so the only way for
/// data to cross ranks is publish and fetch.
///
/// A rank cannot tell whether a publication it is waiting for will still
/// come. Give [`Config::stall_timeout`] a value when a failing rank should not
/// leave the others waiting forever.
pub struct World {
    n_ranks: usize,
    config: Config,
}

impl World {
    pub fn new(n_ranks: usize, config: Config) -> Self {
        Self { n_ranks, config }
    }

    /// Runs `program` on every rank and finalizes them.
    pub fn run<F>(self, program: F) -> Result<WorldReport, NagareError>
    where
        F: Fn(&mut Runtime) -> anyhow::Result<()> + Sync,
    {
        let coordinator = Arc::new(Coordinator::new());
        let n_ranks = self.n_ranks;

        let results: Vec<Result<Diagnostics, NagareError>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..n_ranks)
                .map(|rank| {
                    let coordinator = coordinator.clone();
                    let config = self.config.clone();
                    let program = &program;

                    s.spawn(move || -> Result<Diagnostics, NagareError> {
                        let span = tracing::info_span!("rank", rank);
                        let _enter = span.enter();

                        let mut rt = Runtime::for_rank(rank, n_ranks, coordinator, false, config)?;
                        program(&mut rt).map_err(|err| NagareError::Rank(rank, err))?;
                        rt.finalize()
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(NagareError::RankPanicked(rank)))
                })
                .collect()
        });

        let ranks = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        let leaked = coordinator.report();

        Ok(WorldReport { ranks, leaked })
    }
}
