// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Demo: drive a launcher over the fork/exec backend through a full child
// lifecycle (launch, priority raise/lower, terminate), printing what the
// registry and the pools observe.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use libchild::{exec_service_factory, ChildProcessLauncher, LauncherConfig};

// A stand-in child: sleeps until terminated. The type switch rides along
// as an ignored trailing argument, the way a real child host would see it.
#[cfg(unix)]
fn child_command_line() -> Vec<String> {
    ["/bin/sh", "-c", "sleep 30", "child-host", "--type=renderer"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[cfg(windows)]
fn child_command_line() -> Vec<String> {
    ["cmd.exe", "/C", "timeout", "/T", "30"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = LauncherConfig {
        unbind_delay: Duration::from_millis(200),
        ..LauncherConfig::new()
    };
    let launcher = ChildProcessLauncher::new(
        config,
        exec_service_factory(),
        Arc::new(|pid| println!("death notification: pid {pid}")),
    );

    launcher.prewarm();
    println!(
        "pools: sandboxed {}/{} free, privileged {}/{} free",
        launcher.sandboxed_allocator().free_count(),
        launcher.sandboxed_allocator().capacity(),
        launcher.privileged_allocator().free_count(),
        launcher.privileged_allocator().capacity(),
    );

    let (tx, rx) = mpsc::channel();
    launcher.launch(
        child_command_line(),
        Vec::new(),
        Box::new(move |pid| {
            let _ = tx.send(pid);
        }),
    );
    let pid = rx.recv().expect("launch completion");
    if pid == 0 {
        eprintln!("launch failed");
        return;
    }
    println!("child established with pid {pid}");

    launcher.raise_priority(pid);
    launcher.flush();
    launcher.lower_priority(pid);
    launcher.flush();

    launcher.terminate(pid);
    launcher.flush();
    println!(
        "terminated; registry holds {} entries, sandboxed pool {} free",
        launcher.registry().len(),
        launcher.sandboxed_allocator().free_count(),
    );
}
