// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Connection state machine for one child process.
//
// Lifecycle: bind (asynchronous OS start request) → connect-complete
// notification → setup (one synchronous remote call carrying command line,
// descriptors, and the callback handle) → established. Connect-complete and
// the setup request may arrive in either order; the setup routine runs
// exactly once, after both. A disconnect notification is a one-shot latch
// reachable from any connected state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::binding::{BindingKind, BindingSet, SandboxClass};
use crate::service::{ChildCallback, ChildService, FdMapping, ServiceEvent, ServiceEvents, SetupBundle};
use crate::task_runner::TaskRunner;

/// Invoked with the child's pid when a crash / OOM kill is detected.
pub type DeathCallback = Box<dyn Fn(u32) + Send + Sync>;

/// Completion of the setup phase: `(pid, oom_binding_count)`. `pid == 0`
/// means the spawn failed; the count is how many of {initial, strong}
/// grants were held at the moment of notification.
pub type EstablishedCallback = Box<dyn FnOnce(u32, u32) + Send>;

/// Parameters the caller assembles for the setup phase.
pub struct SetupParams {
    pub command_line: Vec<String>,
    pub files_to_map: Vec<FdMapping>,
    pub callback: ChildCallback,
}

struct PendingSetup {
    params: SetupParams,
    on_established: EstablishedCallback,
}

// ---------------------------------------------------------------------------
// ChildProcessConnection
// ---------------------------------------------------------------------------

struct ConnState {
    /// The platform service capability. Taken out for the duration of any
    /// service call so no lock is held across the OS/service layer; `None`
    /// also encodes "torn down" once `torn_down` is set.
    service: Option<Box<dyn ChildService>>,
    started: bool,
    /// The connect attempt resolved (successfully or not).
    connect_complete: bool,
    /// Connect resolved with a live service handle.
    service_connected: bool,
    /// One-shot crash latch; duplicate disconnect deliveries are dropped.
    disconnected: bool,
    /// Set by `stop()`; a service taken out for an in-flight call is
    /// discarded instead of restored.
    torn_down: bool,
    pid: u32,
    bindings: BindingSet,
    active_attach_count: u32,
    pending_setup: Option<PendingSetup>,
}

/// One service connection to one child process, occupying one pool slot.
pub struct ChildProcessConnection {
    slot_index: u32,
    sandbox_class: SandboxClass,
    death_callback: DeathCallback,
    /// Self-reference for the event sink and delayed tasks; they must not
    /// keep a freed connection alive.
    weak_self: Weak<Self>,
    /// Guards slot reclamation: the first caller of `mark_released` owns
    /// returning the slot to the allocator.
    released: AtomicBool,
    state: Mutex<ConnState>,
}

impl ChildProcessConnection {
    pub fn new(
        slot_index: u32,
        sandbox_class: SandboxClass,
        service: Box<dyn ChildService>,
        death_callback: DeathCallback,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            slot_index,
            sandbox_class,
            death_callback,
            weak_self: weak.clone(),
            released: AtomicBool::new(false),
            state: Mutex::new(ConnState {
                service: Some(service),
                started: false,
                connect_complete: false,
                service_connected: false,
                disconnected: false,
                torn_down: false,
                pid: 0,
                bindings: BindingSet::none(),
                active_attach_count: 0,
                pending_setup: None,
            }),
        })
    }

    pub fn slot_index(&self) -> u32 {
        self.slot_index
    }

    pub fn sandbox_class(&self) -> SandboxClass {
        self.sandbox_class
    }

    pub fn pid(&self) -> u32 {
        self.state.lock().pid
    }

    /// Connect resolved with a live service handle.
    pub fn is_connected(&self) -> bool {
        let st = self.state.lock();
        st.connect_complete && st.service_connected
    }

    /// Still a viable target for setup: bound, not crashed, not stopped.
    pub fn is_usable(&self) -> bool {
        let st = self.state.lock();
        st.started && !st.disconnected && !st.torn_down
    }

    pub fn bindings(&self) -> BindingSet {
        self.state.lock().bindings
    }

    pub fn active_attach_count(&self) -> u32 {
        self.state.lock().active_attach_count
    }

    /// First caller gets `true` and with it the duty to free the slot.
    pub fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    // -----------------------------------------------------------------------
    // Bind
    // -----------------------------------------------------------------------

    /// Request the OS start-and-connect for this connection's service
    /// identity. On success the initial grant is taken, with the waived
    /// grant alongside it so the process is never fully unprioritized while
    /// this connection is alive. Returns `false` if the OS rejected the
    /// request; no events will follow in that case.
    pub fn bind(&self, early_command_line: Option<&[String]>) -> bool {
        let mut svc = {
            let mut st = self.state.lock();
            assert!(
                !st.started,
                "bind() called twice on {} slot {}",
                self.sandbox_class.as_str(),
                self.slot_index
            );
            st.started = true;
            match st.service.take() {
                Some(s) => s,
                None => return false,
            }
        };

        let ok = svc.start(early_command_line, self.events());
        if ok {
            svc.bind_priority(BindingKind::Initial);
            svc.bind_priority(BindingKind::Waived);
        } else {
            warn!(
                class = self.sandbox_class.as_str(),
                slot = self.slot_index,
                "service start request rejected"
            );
        }

        let mut st = self.state.lock();
        if ok {
            st.bindings.set(BindingKind::Initial, true);
            st.bindings.set(BindingKind::Waived, true);
        }
        if st.torn_down || st.disconnected {
            drop(st);
            svc.stop();
        } else {
            st.service = Some(svc);
        }
        ok
    }

    /// Event sink handed to the service layer; holds only a weak reference
    /// so a freed connection silently drops late events.
    fn events(&self) -> ServiceEvents {
        let weak = self.weak_self.clone();
        ServiceEvents::new(move |ev| {
            if let Some(conn) = weak.upgrade() {
                match ev {
                    ServiceEvent::ConnectComplete { ok } => conn.on_connect_complete(ok),
                    ServiceEvent::Disconnected => conn.on_service_disconnected(),
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Two-phase setup
    // -----------------------------------------------------------------------

    /// Store the setup parameters; the setup routine runs now if connect has
    /// already resolved, otherwise when the notification arrives. Calling
    /// this twice without an intervening `stop()` is a contract violation.
    pub fn request_setup(&self, params: SetupParams, on_established: EstablishedCallback) {
        {
            let mut st = self.state.lock();
            assert!(
                st.pending_setup.is_none(),
                "request_setup() called twice without an intervening stop() on {} slot {}",
                self.sandbox_class.as_str(),
                self.slot_index
            );
            st.pending_setup = Some(PendingSetup {
                params,
                on_established,
            });
        }
        self.maybe_run_setup();
    }

    /// Connect-complete notification from the service layer. Idempotent:
    /// some binding APIs redeliver it.
    pub fn on_connect_complete(&self, ok: bool) {
        {
            let mut st = self.state.lock();
            if st.connect_complete || st.disconnected || st.torn_down {
                debug!(slot = self.slot_index, "redundant connect-complete ignored");
                return;
            }
            st.connect_complete = true;
            st.service_connected = ok;
        }
        self.maybe_run_setup();
    }

    /// Runs the setup routine iff both connect-complete and setup parameters
    /// are available; taking the pending parameters under the state lock is
    /// what makes the routine run exactly once for either arrival order.
    fn maybe_run_setup(&self) {
        let (params, on_established, service) = {
            let mut st = self.state.lock();
            if !st.connect_complete || st.pending_setup.is_none() {
                return;
            }
            let PendingSetup {
                params,
                on_established,
            } = st.pending_setup.take().unwrap();
            let service = if st.service_connected {
                st.service.take()
            } else {
                None
            };
            (params, on_established, service)
        };

        let mut pid = 0u32;
        if let Some(mut svc) = service {
            for f in &params.files_to_map {
                assert!(
                    f.is_valid(),
                    "negative descriptor for mapping id {} on slot {}",
                    f.id,
                    self.slot_index
                );
            }
            match svc.setup_connection(SetupBundle {
                command_line: &params.command_line,
                files_to_map: &params.files_to_map,
                callback: params.callback,
            }) {
                Ok(p) => pid = p,
                Err(err) => {
                    warn!(slot = self.slot_index, %err, "remote setup call failed");
                }
            }
            self.restore_service(svc);
        }
        // Transferred descriptor ownership ends here no matter how the
        // remote call went; FdMapping closes on drop.
        drop(params);

        let oom_count = {
            let mut st = self.state.lock();
            if st.disconnected || st.torn_down {
                // The child died under us; the registered pid must not
                // outlive the process it names.
                pid = 0;
            } else {
                st.pid = pid;
            }
            st.bindings.oom_binding_count()
        };
        on_established(pid, oom_count);
    }

    // -----------------------------------------------------------------------
    // Priority bindings
    // -----------------------------------------------------------------------

    /// Ref-counted strong grant: taken on the 0→1 edge.
    pub fn attach_as_active(&self) {
        let svc = {
            let mut st = self.state.lock();
            if st.service.is_none() {
                warn!(
                    slot = self.slot_index,
                    "attach_as_active on an unbound connection"
                );
                return;
            }
            st.active_attach_count += 1;
            if st.active_attach_count != 1 || st.bindings.held(BindingKind::Strong) {
                return;
            }
            st.bindings.set(BindingKind::Strong, true);
            st.service.take()
        };
        if let Some(mut svc) = svc {
            svc.bind_priority(BindingKind::Strong);
            self.restore_service(svc);
        }
    }

    /// Drops one active attachment. The strong grant is released only after
    /// `delay`, and only if the count is still zero at fire time; a fresh
    /// attach in the window keeps the grant. Unbalanced calls are clamped
    /// with a warning; the delayed release makes them reachable in correct
    /// programs.
    pub fn detach_as_active(&self, runner: &TaskRunner, delay: Duration) {
        {
            let mut st = self.state.lock();
            if st.active_attach_count == 0 {
                warn!(
                    slot = self.slot_index,
                    "unbalanced detach_as_active, ignoring"
                );
                return;
            }
            st.active_attach_count -= 1;
            if st.active_attach_count > 0 {
                return;
            }
        }
        let weak = self.weak_self.clone();
        runner.post_delayed(delay, move || {
            if let Some(conn) = weak.upgrade() {
                conn.release_strong_if_idle();
            }
        });
    }

    fn release_strong_if_idle(&self) {
        let svc = {
            let mut st = self.state.lock();
            if st.active_attach_count > 0 || !st.bindings.held(BindingKind::Strong) {
                return;
            }
            st.bindings.set(BindingKind::Strong, false);
            st.service.take()
        };
        if let Some(mut svc) = svc {
            svc.unbind_priority(BindingKind::Strong);
            self.restore_service(svc);
        }
    }

    /// Releases the initial grant once the embedder has determined the
    /// child's real visibility; strong and waived state are untouched.
    pub fn remove_initial_binding(&self) {
        let svc = {
            let mut st = self.state.lock();
            if !st.bindings.held(BindingKind::Initial) {
                return;
            }
            st.bindings.set(BindingKind::Initial, false);
            st.service.take()
        };
        if let Some(mut svc) = svc {
            svc.unbind_priority(BindingKind::Initial);
            self.restore_service(svc);
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Release every grant and reset the connection. Idempotent, and safe
    /// to call from the disconnect-notification path.
    pub fn stop(&self) {
        let (svc, bindings, pending) = {
            let mut st = self.state.lock();
            st.torn_down = true;
            let svc = st.service.take();
            let bindings = st.bindings;
            st.bindings = BindingSet::none();
            st.active_attach_count = 0;
            st.service_connected = false;
            st.connect_complete = false;
            st.pid = 0;
            (svc, bindings, st.pending_setup.take())
        };
        if let Some(mut svc) = svc {
            for kind in [BindingKind::Initial, BindingKind::Strong, BindingKind::Waived] {
                if bindings.held(kind) {
                    svc.unbind_priority(kind);
                }
            }
            svc.stop();
        }
        // A pending setup that never ran is dropped here; its descriptors
        // are released by FdMapping's Drop.
        drop(pending);
    }

    /// Disconnect notification from the service layer: the child terminated
    /// unexpectedly. Latched: only the first delivery acts; the service
    /// layer may re-signal while teardown is in progress.
    pub fn on_service_disconnected(&self) {
        let (pid, pending) = {
            let mut st = self.state.lock();
            if st.disconnected {
                return;
            }
            st.disconnected = true;
            (st.pid, st.pending_setup.take())
        };
        warn!(
            class = self.sandbox_class.as_str(),
            slot = self.slot_index,
            pid,
            "child process disconnected unexpectedly"
        );
        self.stop();
        if pid != 0 {
            (self.death_callback)(pid);
        }
        if let Some(p) = pending {
            // Crash while setup was still pending: the waiting caller must
            // not be left hanging.
            (p.on_established)(0, 0);
        }
    }

    /// Puts the service capability back after a call made without the lock
    /// held; if the connection was stopped in the meantime the service is
    /// shut down instead of resurrected.
    fn restore_service(&self, mut svc: Box<dyn ChildService>) {
        let mut st = self.state.lock();
        if st.torn_down || st.disconnected {
            drop(st);
            svc.stop();
            return;
        }
        debug_assert!(st.service.is_none(), "two service calls in flight");
        st.service = Some(svc);
    }
}

impl std::fmt::Debug for ChildProcessConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("ChildProcessConnection")
            .field("class", &self.sandbox_class)
            .field("slot", &self.slot_index)
            .field("pid", &st.pid)
            .field("connect_complete", &st.connect_complete)
            .field("disconnected", &st.disconnected)
            .field("bindings", &st.bindings)
            .finish()
    }
}
