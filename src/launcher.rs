// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Orchestrates spawn requests: classifies the command line, obtains a slot
// (or consumes the pre-warmed spare), drives the connection through setup,
// records pid → connection, and routes later priority/termination requests
// by pid. Everything that touches service or binding state runs on the
// launcher's task-runner thread; the allocators and the registry carry
// their own locks and are safe from any thread.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::binding::SandboxClass;
use crate::connection::{ChildProcessConnection, SetupParams};
use crate::registry::ProcessRegistry;
use crate::service::{ChildCallback, FdMapping, ServiceFactory};
use crate::slot::SlotAllocator;
use crate::task_runner::TaskRunner;

/// Command-line switch carrying the child's process type.
pub const TYPE_SWITCH_PREFIX: &str = "--type=";
/// The one process type that runs unsandboxed.
pub const GPU_PROCESS_TYPE: &str = "gpu-process";

/// How many service identities the embedder declares per class. Fixed at
/// startup; never renegotiated.
pub const DEFAULT_MAX_SANDBOXED: usize = 13;
pub const DEFAULT_MAX_PRIVILEGED: usize = 3;

/// Grace period between the last detach and the strong-grant release, so a
/// process is not flicker-killed the instant it stops being active.
pub const DEFAULT_UNBIND_DELAY: Duration = Duration::from_secs(1);

/// Pool sizes and timing knobs, fixed at launcher construction.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub max_sandboxed: usize,
    pub max_privileged: usize,
    pub unbind_delay: Duration,
}

impl LauncherConfig {
    pub fn new() -> Self {
        Self {
            max_sandboxed: DEFAULT_MAX_SANDBOXED,
            max_privileged: DEFAULT_MAX_PRIVILEGED,
            unbind_delay: DEFAULT_UNBIND_DELAY,
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Async answer to a spawn request: the child's pid, 0 on failure.
pub type LaunchCallback = Box<dyn FnOnce(u32) + Send>;

/// Receives `pid` at most once per spawn when a child dies unexpectedly.
pub type DeathSink = Arc<dyn Fn(u32) + Send + Sync>;

// ---------------------------------------------------------------------------
// ChildProcessLauncher
// ---------------------------------------------------------------------------

pub struct ChildProcessLauncher {
    config: LauncherConfig,
    /// Self-reference for posted tasks and death callbacks; queued work
    /// must never keep a dropped launcher alive.
    weak_self: Weak<Self>,
    factory: ServiceFactory,
    death_sink: DeathSink,
    sandboxed: SlotAllocator,
    privileged: SlotAllocator,
    registry: ProcessRegistry,
    runner: TaskRunner,
    /// Connection bound ahead of demand to hide connect latency from the
    /// next sandboxed launch.
    spare: Mutex<Option<Arc<ChildProcessConnection>>>,
}

impl ChildProcessLauncher {
    pub fn new(config: LauncherConfig, factory: ServiceFactory, death_sink: DeathSink) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            sandboxed: SlotAllocator::new(SandboxClass::Sandboxed, config.max_sandboxed),
            privileged: SlotAllocator::new(SandboxClass::Privileged, config.max_privileged),
            registry: ProcessRegistry::new(),
            runner: TaskRunner::new("child-launcher"),
            spare: Mutex::new(None),
            config,
            factory,
            death_sink,
        })
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn sandboxed_allocator(&self) -> &SlotAllocator {
        &self.sandboxed
    }

    pub fn privileged_allocator(&self) -> &SlotAllocator {
        &self.privileged
    }

    /// Block until every request posted so far has been processed.
    pub fn flush(&self) {
        self.runner.flush();
    }

    fn allocator(&self, class: SandboxClass) -> &SlotAllocator {
        match class {
            SandboxClass::Sandboxed => &self.sandboxed,
            SandboxClass::Privileged => &self.privileged,
        }
    }

    /// Sandbox class and callback surface for a command line. Sandboxed by
    /// default; the GPU process runs privileged and is the only child whose
    /// callback may establish surface peers.
    pub fn classify(command_line: &[String]) -> (SandboxClass, ChildCallback) {
        let process_type = command_line
            .iter()
            .find_map(|arg| arg.strip_prefix(TYPE_SWITCH_PREFIX));
        if process_type == Some(GPU_PROCESS_TYPE) {
            (SandboxClass::Privileged, ChildCallback::Gpu)
        } else {
            (SandboxClass::Sandboxed, ChildCallback::Renderer)
        }
    }

    // -----------------------------------------------------------------------
    // Launch
    // -----------------------------------------------------------------------

    /// Spawn request. `on_complete` receives the resulting pid (0 on slot
    /// exhaustion, bind rejection, or setup failure), asynchronously, once.
    pub fn launch(
        &self,
        command_line: Vec<String>,
        files_to_map: Vec<FdMapping>,
        on_complete: LaunchCallback,
    ) {
        let weak = self.weak_self.clone();
        self.runner.post(move || match weak.upgrade() {
            Some(launcher) => launcher.do_launch(command_line, files_to_map, on_complete),
            None => on_complete(0),
        });
    }

    fn do_launch(
        self: Arc<Self>,
        command_line: Vec<String>,
        files_to_map: Vec<FdMapping>,
        on_complete: LaunchCallback,
    ) {
        let (class, callback) = Self::classify(&command_line);

        let spare = if class == SandboxClass::Sandboxed {
            self.take_spare()
        } else {
            None
        };
        let conn = match spare {
            Some(conn) => conn,
            None => match self.allocate_bound_connection(class, Some(&command_line)) {
                Some(conn) => conn,
                None => {
                    warn!(class = class.as_str(), "spawn failed: no connection");
                    on_complete(0);
                    return;
                }
            },
        };

        let weak = Arc::downgrade(&self);
        let conn_for_cb = Arc::clone(&conn);
        conn.request_setup(
            SetupParams {
                command_line,
                files_to_map,
                callback,
            },
            Box::new(move |pid, oom_binding_count| {
                if let Some(launcher) = weak.upgrade() {
                    if pid != 0 {
                        debug!(pid, oom_binding_count, "child process established");
                        launcher.registry.register(pid, Arc::clone(&conn_for_cb));
                    } else {
                        // No process materialized; reclaim the slot rather
                        // than leak it.
                        conn_for_cb.stop();
                        launcher.release_connection(&conn_for_cb);
                    }
                }
                on_complete(pid);
            }),
        );
    }

    /// Allocate a slot and bind it. `None` covers both exhaustion and an
    /// OS-level bind rejection; the two share the notify-failure path.
    fn allocate_bound_connection(
        &self,
        class: SandboxClass,
        early_command_line: Option<&[String]>,
    ) -> Option<Arc<ChildProcessConnection>> {
        let weak = self.weak_self.clone();
        let factory = Arc::clone(&self.factory);
        let conn = self.allocator(class).allocate(|slot| {
            let death_weak = weak.clone();
            ChildProcessConnection::new(
                slot,
                class,
                factory(class, slot),
                Box::new(move |pid| {
                    if let Some(launcher) = death_weak.upgrade() {
                        launcher.on_child_died(pid);
                    }
                }),
            )
        })?;
        if !conn.bind(early_command_line) {
            self.release_connection(&conn);
            return None;
        }
        Some(conn)
    }

    // -----------------------------------------------------------------------
    // Pre-warming
    // -----------------------------------------------------------------------

    /// Bind one sandboxed connection ahead of demand. Performs the blocking
    /// bind on the calling thread; keep it off latency-sensitive ones.
    pub fn prewarm(&self) {
        if self
            .spare
            .lock()
            .as_ref()
            .is_some_and(|s| s.is_usable())
        {
            debug!("spare connection already warm");
            return;
        }
        let Some(conn) = self.allocate_bound_connection(SandboxClass::Sandboxed, None) else {
            warn!("prewarm failed: no slot or bind rejected");
            return;
        };
        info!(slot = conn.slot_index(), "pre-warmed spare connection");
        let old = self.spare.lock().replace(conn);
        if let Some(old) = old {
            // The spare it replaced had already died; reclaim its slot.
            old.stop();
            self.release_connection(&old);
        }
    }

    fn take_spare(&self) -> Option<Arc<ChildProcessConnection>> {
        let taken = self.spare.lock().take()?;
        if taken.is_usable() {
            debug!(slot = taken.slot_index(), "consuming pre-warmed connection");
            Some(taken)
        } else {
            debug!(slot = taken.slot_index(), "discarding dead spare connection");
            taken.stop();
            self.release_connection(&taken);
            None
        }
    }

    // -----------------------------------------------------------------------
    // Requests routed by pid
    // -----------------------------------------------------------------------

    /// Tear down the child with `pid` and reclaim its slot. Idempotent:
    /// an unknown pid (already dead, already terminated) is a logged no-op.
    pub fn terminate(&self, pid: u32) {
        let weak = self.weak_self.clone();
        self.runner.post(move || {
            let Some(launcher) = weak.upgrade() else {
                return;
            };
            match launcher.registry.unregister(pid) {
                None => warn!(pid, "terminate for unknown pid, ignoring"),
                Some(conn) => {
                    info!(pid, slot = conn.slot_index(), "terminating child process");
                    conn.stop();
                    launcher.release_connection(&conn);
                }
            }
        });
    }

    /// Take one active attachment on the child's strong grant.
    pub fn raise_priority(&self, pid: u32) {
        let weak = self.weak_self.clone();
        self.runner.post(move || {
            let Some(launcher) = weak.upgrade() else {
                return;
            };
            match launcher.registry.lookup(pid) {
                Some(conn) => conn.attach_as_active(),
                None => warn!(pid, "raise_priority for unknown pid, ignoring"),
            }
        });
    }

    /// Drop one active attachment; the strong grant lingers for the
    /// configured delay.
    pub fn lower_priority(&self, pid: u32) {
        let weak = self.weak_self.clone();
        self.runner.post(move || {
            let Some(launcher) = weak.upgrade() else {
                return;
            };
            match launcher.registry.lookup(pid) {
                Some(conn) => {
                    conn.detach_as_active(&launcher.runner, launcher.config.unbind_delay)
                }
                None => warn!(pid, "lower_priority for unknown pid, ignoring"),
            }
        });
    }

    /// Release the child's initial grant once its real visibility is known.
    pub fn drop_initial_binding(&self, pid: u32) {
        let weak = self.weak_self.clone();
        self.runner.post(move || {
            let Some(launcher) = weak.upgrade() else {
                return;
            };
            match launcher.registry.lookup(pid) {
                Some(conn) => conn.remove_initial_binding(),
                None => warn!(pid, "drop_initial_binding for unknown pid, ignoring"),
            }
        });
    }

    // -----------------------------------------------------------------------
    // Death handling
    // -----------------------------------------------------------------------

    /// Target of every connection's death callback.
    fn on_child_died(&self, pid: u32) {
        match self.registry.unregister(pid) {
            Some(conn) => {
                info!(pid, slot = conn.slot_index(), "reclaiming slot of dead child");
                self.release_connection(&conn);
            }
            None => debug!(pid, "death notification for unregistered pid"),
        }
        (self.death_sink)(pid);
    }

    /// Exactly-once slot reclamation: the connection's released flag
    /// arbitrates between the racing cleanup paths, the allocator's own
    /// occupancy check stays strict.
    fn release_connection(&self, conn: &Arc<ChildProcessConnection>) {
        if conn.mark_released() {
            self.allocator(conn.sandbox_class()).free(conn);
        }
    }
}
