// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Two host threads standing in for the two cores.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use duet_kern::abi::{CoreId, SpinlockCategory, TaskId, TaskState};
use duet_kern::arch::SystemClock;
use duet_kern::config::KernelOptions;
use duet_kern::task::Runnable;
use duet_kern::time::SteppedClock;
use duet_kern::{Kernel, TaskContext, TaskParams};

fn leak<R: Runnable + 'static>(r: R) -> &'static dyn Runnable {
    Box::leak(Box::new(r))
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn one_lock_one_holder() {
    let clock: &'static SystemClock = Box::leak(Box::new(SystemClock::new()));
    let k: &'static Kernel =
        Box::leak(Box::new(Kernel::new(clock, KernelOptions::default()).unwrap()));
    let lock = k.spinlocks().allocate(SpinlockCategory::User, "shared").unwrap();
    let inside = AtomicBool::new(false);
    const ROUNDS: u32 = 2000;

    thread::scope(|s| {
        for core in 0..2u32 {
            let inside = &inside;
            s.spawn(move || {
                let task = TaskId(core + 1);
                for _ in 0..ROUNDS {
                    let token = k.spinlocks().acquire(lock, task);
                    assert!(
                        !inside.swap(true, Ordering::SeqCst),
                        "two holders at once"
                    );
                    std::hint::spin_loop();
                    inside.store(false, Ordering::SeqCst);
                    k.spinlocks().release(lock, token);
                }
            });
        }
    });

    let info = k.spinlocks().get_info(lock).unwrap();
    assert_eq!(info.acquisitions, 2 * ROUNDS);
    assert!(!info.locked);
    assert!(info.max_locked_us <= info.total_locked_us);
}

#[test]
fn both_cores_share_the_any_core_tasks() {
    let clock: &'static SteppedClock = Box::leak(Box::new(SteppedClock::new()));
    let k: &'static Kernel =
        Box::leak(Box::new(Kernel::new(clock, KernelOptions::default()).unwrap()));
    const TASKS: usize = 12;
    let runs: &'static [AtomicU32; TASKS] =
        Box::leak(Box::new(std::array::from_fn(|_| AtomicU32::new(0))));
    let seen_on: &'static [AtomicU32; 2] =
        Box::leak(Box::new(std::array::from_fn(|_| AtomicU32::new(0))));

    let mut ids = Vec::new();
    for i in 0..TASKS {
        let body = leak(move |cx: &TaskContext<'_>| {
            runs[i].fetch_add(1, Ordering::SeqCst);
            seen_on[cx.core().index()].fetch_add(1, Ordering::SeqCst);
            // Give the other core a chance to pick something up.
            thread::sleep(Duration::from_millis(1));
        });
        let name = format!("job{i}");
        ids.push(k.scheduler().create_task(TaskParams::new(&name, body)).unwrap());
    }

    k.scheduler().start();
    thread::scope(|s| {
        for core in CoreId::ALL {
            s.spawn(move || k.scheduler().run_core(core));
        }
        wait_for("every job to complete", || {
            ids.iter().all(|&id| {
                k.scheduler().get_task_info(id).map(|t| t.state)
                    == Some(TaskState::Completed)
            })
        });
        k.scheduler().stop();
    });

    // One-shot tasks run exactly once, whichever core took them.
    for r in runs.iter() {
        assert_eq!(r.load(Ordering::SeqCst), 1);
    }
    let total: u32 = seen_on.iter().map(|c| c.load(Ordering::SeqCst)).sum();
    assert_eq!(total, TASKS as u32);
    assert!(!k.scheduler().is_running());
}

#[test]
fn tick_from_another_thread_keeps_persistent_tasks_moving() {
    let clock: &'static SteppedClock = Box::leak(Box::new(SteppedClock::new()));
    let k: &'static Kernel =
        Box::leak(Box::new(Kernel::new(clock, KernelOptions::default()).unwrap()));
    let count: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(0)));
    let body = leak(move |_: &TaskContext<'_>| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    let a = k
        .scheduler()
        .create_task(TaskParams::new("a", body).persistent().affinity(CoreId::Core1))
        .unwrap();

    k.scheduler().start();
    thread::scope(|s| {
        s.spawn(|| k.scheduler().run_core(CoreId::Core1));
        for _ in 0..50 {
            k.scheduler().tick();
            thread::sleep(Duration::from_micros(200));
        }
        wait_for("the task to run a few times", || count.load(Ordering::SeqCst) >= 3);
        k.scheduler().stop();
    });

    let stats = k.scheduler().stats();
    assert_eq!(stats.ticks + stats.ticks_skipped, 50);
    let info = k.scheduler().get_task_info(a).unwrap();
    assert_eq!(info.state, TaskState::Ready);
    assert!(info.run_count >= 3);
}
