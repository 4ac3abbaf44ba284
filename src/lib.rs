#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod engine;
mod error;
mod handle;
mod key;
mod publish;
mod runtime;
mod utils;

pub use crate::core::{Config, Hash32, Workers};
pub use crate::engine::{
    BlockedConsumer, Captures, DependencySnapshot, Diagnostics, FlowId, FlowInfo, GraphNode,
    Relation, Scope, TaskContext, TaskDef, TaskExecution, TaskId, TaskInfo, TaskState, UseInfo,
};
pub use crate::error::*;
pub use crate::handle::{AccessHandle, FetchOpts, HandleId, Permission, PublishOpts};
pub use crate::key::{Key, KeyPart, VersionTag};
pub use crate::publish::{Coordinator, Leak, PendingFetch, PublicationStatus};
pub use crate::runtime::{Runtime, World, WorldReport};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
