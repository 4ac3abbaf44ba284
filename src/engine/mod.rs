mod flow;
mod runner;
mod scope;
mod task;
mod usage;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

pub(crate) use crate::engine::flow::{Continuation, Flow, Variable};
pub use crate::engine::flow::{FlowId, Relation};
pub(crate) use crate::engine::runner::{Goal, Scheduler, drive};
pub use crate::engine::runner::{
    BlockedConsumer, DependencySnapshot, Diagnostics, FlowInfo, GraphNode, TaskExecution, TaskInfo,
    UseInfo,
};
pub use crate::engine::scope::{Scope, TaskContext, TaskDef};
pub use crate::engine::task::{TaskId, TaskState};

use crate::error::UsageError;
use crate::handle::{AccessHandle, HandleId};
use crate::key::Key;
use crate::publish::Coordinator;
use crate::utils::lock;

/// State shared by every scope and task of one rank.
pub(crate) struct RankShared {
    pub(crate) rank: usize,
    pub(crate) n_ranks: usize,
    /// Whether this rank is alone with its coordinator, which makes stalls
    /// exactly detectable.
    pub(crate) standalone: bool,
    pub(crate) scheduler: Scheduler,
    pub(crate) coordinator: Arc<Coordinator>,
    variables: Mutex<HashMap<Key, Registered>>,
}

/// Registry record of one key on a rank.
struct Registered {
    variable: Weak<Variable>,
    /// Whether an initial access of the key is among the live handles.
    initial: bool,
}

impl RankShared {
    pub(crate) fn new(
        rank: usize,
        n_ranks: usize,
        coordinator: Arc<Coordinator>,
        standalone: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            rank,
            n_ranks,
            standalone,
            scheduler: Scheduler::default(),
            coordinator,
            variables: Mutex::new(HashMap::new()),
        })
    }

    /// Variable behind an initial access.
    ///
    /// A key has at most one initial access per rank while any handle of it is
    /// alive. Handles fetched earlier share their variable with it.
    pub(crate) fn initial_variable(
        &self,
        key: Key,
        type_name: &'static str,
    ) -> Result<Arc<Variable>, UsageError> {
        let mut variables = lock(&self.variables);

        if let Some(record) = variables.get_mut(&key) {
            if let Some(variable) = record.variable.upgrade() {
                if record.initial {
                    return Err(UsageError::DuplicateKey(key));
                }
                check_type(&variable, type_name)?;
                record.initial = true;
                return Ok(variable);
            }
        }

        let variable = Variable::new(key.clone(), type_name);
        variables.insert(
            key,
            Registered {
                variable: Arc::downgrade(&variable),
                initial: true,
            },
        );
        Ok(variable)
    }

    /// Variable behind a fetch, shared with every live handle of the key.
    pub(crate) fn fetched_variable(
        &self,
        key: Key,
        type_name: &'static str,
    ) -> Result<Arc<Variable>, UsageError> {
        let mut variables = lock(&self.variables);

        if let Some(variable) = variables.get(&key).and_then(|record| record.variable.upgrade()) {
            check_type(&variable, type_name)?;
            return Ok(variable);
        }

        let variable = Variable::new(key.clone(), type_name);
        variables.insert(
            key,
            Registered {
                variable: Arc::downgrade(&variable),
                initial: false,
            },
        );
        Ok(variable)
    }
}

fn check_type(variable: &Variable, type_name: &'static str) -> Result<(), UsageError> {
    if variable.type_name != type_name {
        return Err(UsageError::TypeMismatch {
            key: variable.key.clone(),
            expected: variable.type_name,
        });
    }
    Ok(())
}

/// A set of handles a task captures.
///
/// Implemented for single handles, references, slices, arrays, vectors and
/// tuples of captures, so `(&a, &b)`, `&handles` and `[&a, &b]` all work.
pub trait Captures {
    /// Calls `f` once for every captured handle.
    fn visit(&self, f: &mut dyn FnMut(HandleId, &Key));
}

impl Captures for () {
    fn visit(&self, _: &mut dyn FnMut(HandleId, &Key)) {}
}

impl<T> Captures for AccessHandle<T> {
    fn visit(&self, f: &mut dyn FnMut(HandleId, &Key)) {
        f(self.id(), self.key());
    }
}

impl<C> Captures for &C
where
    C: Captures + ?Sized,
{
    fn visit(&self, f: &mut dyn FnMut(HandleId, &Key)) {
        (**self).visit(f);
    }
}

impl<C> Captures for [C]
where
    C: Captures,
{
    fn visit(&self, f: &mut dyn FnMut(HandleId, &Key)) {
        for capture in self {
            capture.visit(f);
        }
    }
}

impl<C, const N: usize> Captures for [C; N]
where
    C: Captures,
{
    fn visit(&self, f: &mut dyn FnMut(HandleId, &Key)) {
        self.as_slice().visit(f);
    }
}

impl<C> Captures for Vec<C>
where
    C: Captures,
{
    fn visit(&self, f: &mut dyn FnMut(HandleId, &Key)) {
        self.as_slice().visit(f);
    }
}

macro_rules! impl_captures {
    ($($C:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($C),*> Captures for ($($C,)*)
        where
            $($C: Captures),* {
            fn visit(&self, f: &mut dyn FnMut(HandleId, &Key)) {
                let ($($C,)*) = self;
                $($C.visit(f);)*
            }
        }
    };
}

impl_captures!(A);
impl_captures!(A, B);
impl_captures!(A, B, C);
impl_captures!(A, B, C, D);
impl_captures!(A, B, C, D, E);
impl_captures!(A, B, C, D, E, F);
impl_captures!(A, B, C, D, E, F, G);
impl_captures!(A, B, C, D, E, F, G, H);
impl_captures!(A, B, C, D, E, F, G, H, I);
impl_captures!(A, B, C, D, E, F, G, H, I, J);
impl_captures!(A, B, C, D, E, F, G, H, I, J, K);
impl_captures!(A, B, C, D, E, F, G, H, I, J, K, L);
