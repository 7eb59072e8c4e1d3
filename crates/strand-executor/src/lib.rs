//! Core primitives for a fiber-based cooperative task scheduler.
//!
//! The crate provides the three load-bearing pieces such a scheduler rests
//! on, and nothing above them:
//!
//! - [`fiber`]: saving and restoring CPU state so a blocked task can be
//!   resumed by any worker thread, over stacks from [`stack`].
//! - [`task`]: a fixed-capacity, lock-free, generation-tagged slab that
//!   hands out stable weak handles to in-flight tasks.
//! - [`scopes`]: persistent registration of static call-site descriptors
//!   plus the per-fiber push/pop stacks that profilers and asset tracing
//!   walk after a task has suspended.
//!
//! Together they uphold the invariant the scheduler is built on: a task,
//! once admitted, has a stable identity and a valid execution stack until
//! it voluntarily completes, regardless of which worker resumes it.
//! Scheduling policy, I/O, preemption, and priorities live upstream.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod atomic;
pub mod config;
pub mod fiber;
pub mod scopes;
pub mod stack;
pub mod task;
pub mod thread;

pub use atomic::Atomic32;
pub use config::{ConfigError, ExecutorConfig};
pub use fiber::Fiber;
pub use scopes::{
    INVALID_STACK_ID, INVALID_STORAGE_ID, MAX_SCOPE_DEPTH, PersistentScopeStorage, ScopeDesc,
    ScopeSiteCell, ScopeStackEntry, SiteRecord, StackEntry, StrongScopeStack, WeakScopeStack,
};
pub use stack::{StackDesc, alloc_stack, free_stack, min_stack_size};
pub use task::{Task, TaskDesc, TaskHandle, TaskPool, UNUSED_TASK_ID, destroy_task};
pub use thread::{EntryPoint, Thread};
