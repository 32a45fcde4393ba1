// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The capability boundary between a connection and the platform's
// process/service layer. Any platform substitutes its own spawn/IPC
// primitive behind `ChildService`; `ExecChildService` (exec.rs) is the
// fork/exec implementation, tests script a mock.

use std::io;
use std::sync::Arc;

use tracing::debug;

use crate::binding::BindingKind;

// ---------------------------------------------------------------------------
// File-descriptor mappings
// ---------------------------------------------------------------------------

/// A descriptor transferred to the child during setup, keyed by the id the
/// child looks it up under.
///
/// The mapping owns the descriptor: dropping it closes the underlying fd
/// when `auto_close` is set, so every exit path from the setup routine
/// (including unwinds out of the remote call) releases it.
#[derive(Debug)]
pub struct FdMapping {
    pub id: u32,
    fd: i32,
    auto_close: bool,
}

impl FdMapping {
    pub fn new(id: u32, fd: i32, auto_close: bool) -> Self {
        Self { id, fd, auto_close }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// A mapping is transferable only if its descriptor is non-negative.
    /// A negative descriptor is a caller bug, not a runtime condition.
    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }
}

impl Drop for FdMapping {
    fn drop(&mut self) {
        if self.auto_close && self.fd >= 0 {
            #[cfg(unix)]
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

// ---------------------------------------------------------------------------
// Remote callback surface
// ---------------------------------------------------------------------------

/// Which remote-invoked operations the child may call back into.
///
/// Only the GPU process gets the surface-capable variant; a compromised
/// renderer must not be able to reach display-surface APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildCallback {
    Renderer,
    Gpu,
}

impl ChildCallback {
    pub fn allows_surface_peers(self) -> bool {
        matches!(self, ChildCallback::Gpu)
    }
}

// ---------------------------------------------------------------------------
// Setup bundle
// ---------------------------------------------------------------------------

/// Everything handed to the child in the one synchronous remote setup call.
pub struct SetupBundle<'a> {
    pub command_line: &'a [String],
    pub files_to_map: &'a [FdMapping],
    pub callback: ChildCallback,
}

// ---------------------------------------------------------------------------
// Service events
// ---------------------------------------------------------------------------

/// Notifications the service layer delivers back to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    /// The asynchronous connect attempt resolved. `ok == false` means the
    /// bind failed at the OS level; the connection proceeds to a pid=0
    /// completion without a remote call.
    ConnectComplete { ok: bool },
    /// The child terminated unexpectedly (crash / OOM kill).
    Disconnected,
}

/// Cloneable handle a `ChildService` uses to report events. The sink must
/// tolerate redundant delivery; connections latch both event kinds.
#[derive(Clone)]
pub struct ServiceEvents {
    sink: Arc<dyn Fn(ServiceEvent) + Send + Sync>,
}

impl ServiceEvents {
    pub fn new(sink: impl Fn(ServiceEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// A sink that drops all events, for teardown paths that no longer care.
    pub fn null() -> Self {
        Self::new(|ev| debug!(?ev, "service event dropped (null sink)"))
    }

    pub fn connect_complete(&self, ok: bool) {
        (self.sink)(ServiceEvent::ConnectComplete { ok });
    }

    pub fn disconnected(&self) {
        (self.sink)(ServiceEvent::Disconnected);
    }
}

impl std::fmt::Debug for ServiceEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServiceEvents")
    }
}

// ---------------------------------------------------------------------------
// ChildService
// ---------------------------------------------------------------------------

/// One OS-level service identity hosting one child process.
///
/// `start` is a request: it returns whether the OS accepted it, and actual
/// connection establishment arrives later through [`ServiceEvents`]; the
/// connection must handle either ordering of connect-complete versus its own
/// setup parameters. All calls are made by the owning connection, never
/// concurrently.
pub trait ChildService: Send {
    /// Ask the platform to start the child's service identity and connect.
    /// `early_command_line` is a hint available at bind time (absent for
    /// pre-warmed connections). Returns `false` if the request itself was
    /// rejected; no events follow a rejected request.
    fn start(&mut self, early_command_line: Option<&[String]>, events: ServiceEvents) -> bool;

    /// Grant one priority binding on the service identity.
    fn bind_priority(&mut self, kind: BindingKind) -> bool;

    /// Revoke one priority binding.
    fn unbind_priority(&mut self, kind: BindingKind);

    /// The one synchronous remote call of the protocol: deliver the setup
    /// bundle to the child and receive its pid. Errors are recoverable and
    /// reported to the caller as pid=0.
    fn setup_connection(&mut self, bundle: SetupBundle<'_>) -> io::Result<u32>;

    /// Tear down every binding and release the service identity. Idempotent.
    fn stop(&mut self);
}

/// Constructor for the service backing a `(class, slot)` identity; the
/// launcher owns one and passes it to the allocator on every allocation.
pub type ServiceFactory =
    Arc<dyn Fn(crate::binding::SandboxClass, u32) -> Box<dyn ChildService> + Send + Sync>;
