// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// fork/exec implementation of `ChildService`. The service identity is a
// name reserved at start; the child itself is spawned by the setup call,
// which carries the command line. A monitor thread turns child exit into
// the disconnect notification. Priority grants map to best-effort nice
// adjustments on POSIX.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::binding::{BindingKind, BindingSet, SandboxClass, SchedulingPriority};
use crate::process::ProcessHandle;
use crate::service::{ChildService, ServiceEvents, ServiceFactory, SetupBundle};

/// How often the monitor thread probes the child for liveness.
const MONITOR_POLL: Duration = Duration::from_millis(50);

/// Default grace given to a child between the shutdown request and the kill.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The service-identity name for a `(class, slot)` pair, e.g.
/// `sandboxed_service.3`. One OS identity per slot, reused across children.
pub fn service_identity(class: SandboxClass, slot: u32) -> String {
    format!("{}_service.{}", class.as_str(), slot)
}

/// `ChildService` over plain process spawning.
pub struct ExecChildService {
    identity: String,
    grace: Duration,
    bindings: BindingSet,
    events: Option<ServiceEvents>,
    child: Option<Arc<ProcessHandle>>,
    /// Tells the monitor thread the exit it sees is deliberate.
    quit: Arc<AtomicBool>,
}

impl ExecChildService {
    pub fn new(class: SandboxClass, slot: u32) -> Self {
        Self {
            identity: service_identity(class, slot),
            grace: DEFAULT_SHUTDOWN_GRACE,
            bindings: BindingSet::none(),
            events: None,
            child: None,
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Highest priority among the held grants, applied to the live child.
    fn apply_priority(&self) {
        let Some(child) = self.child.as_ref() else {
            return;
        };
        let effective = [BindingKind::Strong, BindingKind::Initial, BindingKind::Waived]
            .into_iter()
            .filter(|k| self.bindings.held(*k))
            .map(BindingKind::priority)
            .max()
            .unwrap_or(SchedulingPriority::Waived);

        #[cfg(unix)]
        {
            let nice = match effective {
                SchedulingPriority::High => 0,
                SchedulingPriority::Moderate => 5,
                SchedulingPriority::Waived => 10,
            };
            let rc = unsafe {
                libc::setpriority(libc::PRIO_PROCESS as _, child.pid() as libc::id_t, nice)
            };
            if rc != 0 {
                debug!(
                    identity = %self.identity,
                    pid = child.pid(),
                    nice,
                    "setpriority failed (non-fatal)"
                );
            }
        }
        #[cfg(not(unix))]
        {
            debug!(identity = %self.identity, pid = child.pid(), ?effective,
                "scheduling priority not adjustable on this platform");
        }
    }
}

impl ChildService for ExecChildService {
    fn start(&mut self, early_command_line: Option<&[String]>, events: ServiceEvents) -> bool {
        if let Some(cl) = early_command_line {
            debug!(identity = %self.identity, argv0 = cl.first().map(String::as_str),
                "early command line recorded");
        }
        self.events = Some(events.clone());
        // Reserving an exec identity cannot fail; the connect attempt
        // resolves immediately. Connections handle either arrival order.
        events.connect_complete(true);
        true
    }

    fn bind_priority(&mut self, kind: BindingKind) -> bool {
        self.bindings.set(kind, true);
        self.apply_priority();
        true
    }

    fn unbind_priority(&mut self, kind: BindingKind) {
        self.bindings.set(kind, false);
        self.apply_priority();
    }

    fn setup_connection(&mut self, bundle: SetupBundle<'_>) -> io::Result<u32> {
        // Descriptor mappings ride into the child through inheritance
        // across exec; ids are advisory here.
        for f in bundle.files_to_map {
            debug!(identity = %self.identity, id = f.id, fd = f.fd(), "inheriting descriptor");
        }

        let child = Arc::new(ProcessHandle::spawn(bundle.command_line)?);
        let pid = child.pid();
        info!(
            identity = %self.identity,
            pid,
            surface_peers = bundle.callback.allows_surface_peers(),
            "child process spawned"
        );
        self.child = Some(Arc::clone(&child));
        self.apply_priority();

        let events = self
            .events
            .clone()
            .unwrap_or_else(ServiceEvents::null);
        let quit = Arc::clone(&self.quit);
        let identity = self.identity.clone();
        thread::Builder::new()
            .name(format!("{identity}.monitor"))
            .spawn(move || {
                loop {
                    if quit.load(Ordering::Acquire) {
                        return;
                    }
                    // wait_for_exit reaps; a zombie would keep a plain
                    // liveness probe reporting alive forever.
                    let r = child.wait_for_exit(MONITOR_POLL);
                    if r.exited || r.signaled {
                        // `quit` set first during stop(): an exit observed
                        // after that is deliberate, not a crash.
                        if !quit.load(Ordering::Acquire) {
                            debug!(identity = %identity, pid, "monitor observed child exit");
                            events.disconnected();
                        }
                        return;
                    }
                }
            })
            .map_err(|e| {
                warn!(identity = %self.identity, %e, "failed to spawn monitor thread");
                e
            })?;

        Ok(pid)
    }

    fn stop(&mut self) {
        self.quit.store(true, Ordering::Release);
        self.events = None;
        if let Some(child) = self.child.take() {
            if child.is_alive() {
                let r = child.shutdown(self.grace);
                debug!(
                    identity = %self.identity,
                    pid = child.pid(),
                    exited = r.exited,
                    signaled = r.signaled,
                    "child shut down"
                );
            }
        }
        self.bindings = BindingSet::none();
    }
}

/// Factory plugging `ExecChildService` into a launcher.
pub fn exec_service_factory() -> ServiceFactory {
    Arc::new(|class, slot| Box::new(ExecChildService::new(class, slot)))
}
