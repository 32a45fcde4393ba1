// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// pid → connection map. Routes priority and termination requests arriving
// from arbitrary threads to the owning connection. Entries exist only
// while a pid is known: inserted after setup reports it, removed by
// termination or crash cleanup, whichever runs first; the loser of that
// race sees a miss and must treat it as a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::ChildProcessConnection;

/// Concurrent pid → connection registry.
#[derive(Default)]
pub struct ProcessRegistry {
    map: Mutex<HashMap<u32, Arc<ChildProcessConnection>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, pid: u32) -> Option<Arc<ChildProcessConnection>> {
        self.map.lock().get(&pid).cloned()
    }

    /// Record a freshly established process. Called once per successful
    /// setup; a pid collision means the caller broke that contract.
    pub fn register(&self, pid: u32, conn: Arc<ChildProcessConnection>) {
        assert!(pid != 0, "cannot register pid 0");
        let prev = self.map.lock().insert(pid, conn);
        assert!(prev.is_none(), "pid {pid} registered twice");
    }

    /// Remove and return the connection for `pid`. `None` means another
    /// cleanup path got there first; callers treat that as already done.
    pub fn unregister(&self, pid: u32) -> Option<Arc<ChildProcessConnection>> {
        self.map.lock().remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Snapshot of live pids, for diagnostics.
    pub fn pids(&self) -> Vec<u32> {
        self.map.lock().keys().copied().collect()
    }
}
