use std::sync::Arc;

use crate::core::Dynamic;
use crate::engine::flow::Flow;
use crate::engine::scope::{Entry, Slot};
use crate::handle::{HandleId, Permission};

/// What a task depends on through one of its uses.
pub(crate) enum Dependency {
    /// Nothing, the body never touches the value.
    None,
    /// Readiness of the input flow.
    Ready(Arc<Flow>),
    /// Readiness of the input flow with every reader released.
    Drained(Arc<Flow>),
}

/// Where the output of a modify use gets its value from at release.
pub(crate) enum Tail {
    /// The task body produced a new value.
    Value(Dynamic),
    /// The value comes from whatever flow ended the chain inside the task.
    Flow(Arc<Flow>),
}

/// One task's claim on one handle.
///
/// A read use keeps a reader registered on its input flow for as long as it
/// lives, so later modify uses of that flow wait for it. A modify use owns a
/// fresh output flow that it satisfies when it is released.
pub(crate) struct Use {
    pub(crate) handle: HandleId,
    pub(crate) input: Arc<Flow>,
    pub(crate) output: Arc<Flow>,
    pub(crate) scheduling: Permission,
    pub(crate) immediate: Permission,
    reader: bool,
}

/// Scheduling/immediate combinations a task may request.
pub(crate) fn is_valid(scheduling: Permission, immediate: Permission) -> bool {
    scheduling != Permission::None && immediate <= scheduling
}

impl Use {
    /// Registers a new use on `entry`, moving the entry's current flow along.
    ///
    /// Pending local modifications are committed first so the new use starts
    /// from the value the enclosing body last saw.
    pub(crate) fn register(
        handle: HandleId,
        entry: &mut Entry,
        scheduling: Permission,
        immediate: Permission,
    ) -> Self {
        debug_assert!(is_valid(scheduling, immediate));
        debug_assert!(scheduling <= entry.scheduling);

        entry.commit_local();
        let input = entry.flow.clone();

        match scheduling {
            Permission::Modify => {
                let output = Flow::next(entry.variable.clone());
                let reader = immediate == Permission::Read;
                if reader {
                    input.add_reader();
                }

                entry.flow = output.clone();
                entry.slot = Slot::Unavailable;

                Self {
                    handle,
                    input,
                    output,
                    scheduling,
                    immediate,
                    reader,
                }
            }
            _ => {
                input.add_reader();

                Self {
                    handle,
                    output: input.clone(),
                    input,
                    scheduling,
                    immediate,
                    reader: true,
                }
            }
        }
    }

    pub(crate) fn dependency(&self) -> Dependency {
        match self.immediate {
            Permission::None => Dependency::None,
            Permission::Read => Dependency::Ready(self.input.clone()),
            Permission::Modify => Dependency::Drained(self.input.clone()),
        }
    }

    /// Ends the use. Consumes `self`, so a use is released exactly once.
    ///
    /// `tail` is the state the handle ended in inside the task, `None` when the
    /// body dropped it.
    ///
    /// An output that ends up carrying the input unchanged still succeeds
    /// every reader of the input, so it only becomes ready once they are gone.
    pub(crate) fn release(self, tail: Option<Tail>) {
        if self.scheduling == Permission::Modify {
            match tail {
                Some(Tail::Value(value)) => self.output.advance(Some(value)),
                Some(Tail::Flow(flow)) if flow.id != self.input.id => {
                    flow.forward_to(self.output.clone())
                }
                _ => self.input.forward_drained(self.output.clone()),
            }
        }

        if self.reader {
            self.input.release_reader();
        }
    }
}
