// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Bounded pool of child-process service connections: per-class slot
// allocation with anti-thrash FIFO reuse, a two-phase connect/setup state
// machine per connection with three ref/bool-counted priority bindings,
// a concurrent pid registry, and a launcher orchestrating the whole flow.

pub mod binding;
pub mod process;

mod task_runner;
pub use task_runner::TaskRunner;

pub mod service;
pub use service::{
    ChildCallback, ChildService, FdMapping, ServiceEvent, ServiceEvents, ServiceFactory,
    SetupBundle,
};

mod connection;
pub use connection::{ChildProcessConnection, DeathCallback, EstablishedCallback, SetupParams};

mod slot;
pub use slot::SlotAllocator;

mod registry;
pub use registry::ProcessRegistry;

pub mod exec;
pub use exec::{exec_service_factory, ExecChildService};

mod launcher;
pub use launcher::{
    ChildProcessLauncher, DeathSink, LaunchCallback, LauncherConfig, DEFAULT_MAX_PRIVILEGED,
    DEFAULT_MAX_SANDBOXED, DEFAULT_UNBIND_DELAY, GPU_PROCESS_TYPE, TYPE_SWITCH_PREFIX,
};

pub use binding::{BindingKind, BindingSet, SandboxClass, SchedulingPriority};
