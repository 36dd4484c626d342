#![allow(missing_docs)]
//! A launch record made by another process must never be reused.

#[macro_use]
mod common;

use common::*;
use std::sync::atomic::{AtomicU32, Ordering};
use syncbridge::runtime::current_loop;
use syncbridge::Bridge;

static SIMULATED_PID: AtomicU32 = AtomicU32::new(1000);

fn simulated_pid() -> u32 {
    SIMULATED_PID.load(Ordering::SeqCst)
}

fn simulated_bridge() -> Bridge {
    Bridge::builder()
        .config(syncbridge::BridgeConfig::default())
        .process_id_source(simulated_pid)
        .build()
        .unwrap()
}

#[test]
fn launch_record_from_another_process_is_ignored() {
    init_test_logging();
    test_phase!("launch_record_from_another_process_is_ignored");
    let bridge = simulated_bridge();
    let inner_bridge = bridge.clone();
    let outer = bridge.sync_to_async(move |(): ()| {
        let loop_id = |()| async { current_loop().unwrap().id() };
        let before = inner_bridge.async_to_sync(loop_id).call(()).unwrap();
        SIMULATED_PID.fetch_add(1, Ordering::SeqCst);
        let after = inner_bridge.async_to_sync(loop_id).call(()).unwrap();
        (before, after)
    });
    let (outer_loop, (before, after)) = run_test(async {
        let outer_loop = current_loop().unwrap().id();
        (outer_loop, outer.call(()).await.unwrap())
    });
    assert_eq!(before, outer_loop);
    assert_ne!(after, outer_loop);
    test_complete!("launch_record_from_another_process_is_ignored");
}

#[cfg(unix)]
#[test]
fn forked_child_starts_a_private_loop() {
    use std::time::{Duration, Instant};

    let bridge = test_bridge();
    let inner_bridge = bridge.clone();
    let fork_in_callee = bridge.sync_to_async(move |parent_loop: syncbridge::LoopId| {
        // SAFETY: the child only runs the bridge and then calls `_exit`.
        let pid = unsafe { libc::fork() };
        if pid == 0 {
            let child_loop = inner_bridge
                .async_to_sync(|()| async { current_loop().unwrap().id() })
                .call(());
            let code = match child_loop {
                Ok(id) if id != parent_loop => 0,
                Ok(_) => 1,
                Err(_) => 2,
            };
            // SAFETY: terminates the child without running parent destructors.
            unsafe { libc::_exit(code) };
        }
        pid
    });

    let child = run_test(async {
        let parent_loop = current_loop().unwrap().id();
        fork_in_callee.call(parent_loop).await.unwrap()
    });
    assert!(child > 0, "fork failed");

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut status = 0;
    loop {
        // SAFETY: `child` is our own child process.
        let reaped = unsafe { libc::waitpid(child, &mut status, libc::WNOHANG) };
        if reaped == child {
            break;
        }
        if Instant::now() > deadline {
            // SAFETY: as above.
            unsafe { libc::kill(child, libc::SIGKILL) };
            panic!("forked child did not finish");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(libc::WIFEXITED(status), "child status {status}");
    assert_eq!(libc::WEXITSTATUS(status), 0);
}
