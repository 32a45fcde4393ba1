// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared test doubles: a scriptable ChildService mock recording every call,
// a per-slot mock fleet for launcher tests, and a death-notification log.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use libchild::{
    BindingKind, ChildCallback, ChildProcessLauncher, ChildService, DeathSink, FdMapping,
    SandboxClass, ServiceEvents, ServiceFactory, SetupBundle,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ---------------------------------------------------------------------------
// Scriptable mock service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCall {
    Start { with_command_line: bool },
    BindPriority(BindingKind),
    UnbindPriority(BindingKind),
    Setup { command_line: Vec<String>, fd_ids: Vec<u32>, callback: ChildCallback },
    Stop,
}

#[derive(Debug, Clone)]
enum SetupScript {
    Pid(u32),
    Fail(String),
}

struct MockState {
    calls: Vec<ServiceCall>,
    events: Option<ServiceEvents>,
    accept_start: bool,
    connect_on_start: bool,
    setup: SetupScript,
}

/// Handle shared between a test and the `MockChildService` it hands out;
/// scripts outcomes and fires service-layer events.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                calls: Vec::new(),
                events: None,
                accept_start: true,
                connect_on_start: false,
                setup: SetupScript::Pid(4242),
            })),
        }
    }

    pub fn reject_start(&self) -> &Self {
        self.state.lock().accept_start = false;
        self
    }

    /// Resolve the connect attempt synchronously from inside `start`.
    pub fn connect_on_start(&self) -> &Self {
        self.state.lock().connect_on_start = true;
        self
    }

    pub fn set_setup_pid(&self, pid: u32) -> &Self {
        self.state.lock().setup = SetupScript::Pid(pid);
        self
    }

    pub fn fail_setup(&self, message: &str) -> &Self {
        self.state.lock().setup = SetupScript::Fail(message.to_string());
        self
    }

    pub fn service(&self) -> Box<dyn ChildService> {
        Box::new(MockChildService {
            state: Arc::clone(&self.state),
        })
    }

    fn events(&self) -> ServiceEvents {
        self.state
            .lock()
            .events
            .clone()
            .expect("service not started")
    }

    pub fn fire_connect_complete(&self, ok: bool) {
        self.events().connect_complete(ok);
    }

    pub fn fire_disconnect(&self) {
        self.events().disconnected();
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.state.lock().calls.clone()
    }

    pub fn setup_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ServiceCall::Setup { .. }))
            .count()
    }

    pub fn stop_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ServiceCall::Stop))
            .count()
    }

    pub fn bind_calls(&self, kind: BindingKind) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ServiceCall::BindPriority(k) if *k == kind))
            .count()
    }

    pub fn unbind_calls(&self, kind: BindingKind) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ServiceCall::UnbindPriority(k) if *k == kind))
            .count()
    }
}

struct MockChildService {
    state: Arc<Mutex<MockState>>,
}

impl ChildService for MockChildService {
    fn start(&mut self, early_command_line: Option<&[String]>, events: ServiceEvents) -> bool {
        // Decide under the lock, fire events outside it: an event re-enters
        // the connection, which may call back into this mock.
        let (accept, connect_now) = {
            let mut st = self.state.lock();
            st.calls.push(ServiceCall::Start {
                with_command_line: early_command_line.is_some(),
            });
            st.events = Some(events.clone());
            (st.accept_start, st.connect_on_start)
        };
        if accept && connect_now {
            events.connect_complete(true);
        }
        accept
    }

    fn bind_priority(&mut self, kind: BindingKind) -> bool {
        self.state.lock().calls.push(ServiceCall::BindPriority(kind));
        true
    }

    fn unbind_priority(&mut self, kind: BindingKind) {
        self.state.lock().calls.push(ServiceCall::UnbindPriority(kind));
    }

    fn setup_connection(&mut self, bundle: SetupBundle<'_>) -> io::Result<u32> {
        let mut st = self.state.lock();
        st.calls.push(ServiceCall::Setup {
            command_line: bundle.command_line.to_vec(),
            fd_ids: bundle.files_to_map.iter().map(|f| f.id).collect(),
            callback: bundle.callback,
        });
        match st.setup.clone() {
            SetupScript::Pid(pid) => Ok(pid),
            SetupScript::Fail(msg) => Err(io::Error::new(io::ErrorKind::Other, msg)),
        }
    }

    fn stop(&mut self) {
        self.state.lock().calls.push(ServiceCall::Stop);
    }
}

// ---------------------------------------------------------------------------
// Mock fleet: one handle per (class, slot), for launcher tests
// ---------------------------------------------------------------------------

struct FleetState {
    handles: HashMap<(SandboxClass, u32), MockHandle>,
    next_pid: u32,
    accept_start: bool,
    fail_setups: bool,
}

/// Builds mock services on demand as the launcher allocates slots. Each
/// service connects synchronously and reports a distinct pid from setup.
#[derive(Clone)]
pub struct MockFleet {
    state: Arc<Mutex<FleetState>>,
}

impl MockFleet {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FleetState {
                handles: HashMap::new(),
                next_pid: 100,
                accept_start: true,
                fail_setups: false,
            })),
        }
    }

    pub fn set_next_pid(&self, pid: u32) -> &Self {
        self.state.lock().next_pid = pid;
        self
    }

    pub fn reject_starts(&self) -> &Self {
        self.state.lock().accept_start = false;
        self
    }

    pub fn fail_setups(&self) -> &Self {
        self.state.lock().fail_setups = true;
        self
    }

    pub fn factory(&self) -> ServiceFactory {
        let state = Arc::clone(&self.state);
        Arc::new(move |class, slot| {
            let mut st = state.lock();
            let pid = st.next_pid;
            st.next_pid += 1;
            let handle = MockHandle::new();
            handle.connect_on_start().set_setup_pid(pid);
            if !st.accept_start {
                handle.reject_start();
            }
            if st.fail_setups {
                handle.fail_setup("scripted setup failure");
            }
            let service = handle.service();
            st.handles.insert((class, slot), handle);
            service
        })
    }

    /// The mock backing `(class, slot)`; panics if that slot was never
    /// allocated.
    pub fn handle(&self, class: SandboxClass, slot: u32) -> MockHandle {
        self.state
            .lock()
            .handles
            .get(&(class, slot))
            .cloned()
            .unwrap_or_else(|| panic!("no service created for {:?} slot {slot}", class))
    }
}

// ---------------------------------------------------------------------------
// Death log + launch helper
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct DeathLog {
    pids: Arc<Mutex<Vec<u32>>>,
}

impl DeathLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> DeathSink {
        let pids = Arc::clone(&self.pids);
        Arc::new(move |pid| pids.lock().push(pid))
    }

    pub fn pids(&self) -> Vec<u32> {
        self.pids.lock().clone()
    }
}

/// Issue a launch and block on its completion callback.
pub fn launch_and_wait(
    launcher: &Arc<ChildProcessLauncher>,
    command_line: Vec<String>,
    files_to_map: Vec<FdMapping>,
) -> u32 {
    let (tx, rx) = mpsc::channel();
    launcher.launch(
        command_line,
        files_to_map,
        Box::new(move |pid| {
            let _ = tx.send(pid);
        }),
    );
    rx.recv_timeout(Duration::from_secs(5))
        .expect("launch completion callback never fired")
}

pub fn renderer_command_line() -> Vec<String> {
    vec!["child_host".to_string(), "--type=renderer".to_string()]
}

pub fn gpu_command_line() -> Vec<String> {
    vec!["child_host".to_string(), "--type=gpu-process".to_string()]
}
