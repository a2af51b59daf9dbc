// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashSet;

use duet_kern::abi::{CoreId, Priority, SpinlockCategory, TaskId};
use duet_kern::config::KernelOptions;
use duet_kern::time::SteppedClock;
use duet_kern::{Kernel, TaskContext, TaskParams};
use proptest::prelude::*;

fn nop(_: &TaskContext<'_>) {}

fn kernel() -> (&'static Kernel, &'static SteppedClock) {
    let clock: &'static SteppedClock = Box::leak(Box::new(SteppedClock::new()));
    let k = Kernel::new(clock, KernelOptions::default()).unwrap();
    (Box::leak(Box::new(k)), clock)
}

#[derive(Clone, Debug)]
enum Op {
    Create,
    /// Deletes the n'th live task, modulo how many there are.
    Delete(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Create),
        1 => any::<usize>().prop_map(Op::Delete),
    ]
}

proptest! {
    #[test]
    fn task_ids_are_never_reused(ops in prop::collection::vec(op(), 1..64)) {
        let (k, _) = kernel();
        let mut live: Vec<TaskId> = Vec::new();
        let mut issued: HashSet<TaskId> = HashSet::new();
        let mut last = TaskId(0);

        for op in ops {
            match op {
                Op::Create => {
                    // A full table is an acceptable answer; reuse is not.
                    if let Ok(id) = k.scheduler().create_task(TaskParams::new("t", &nop)) {
                        prop_assert!(id.0 > last.0);
                        prop_assert!(issued.insert(id));
                        last = id;
                        live.push(id);
                    }
                }
                Op::Delete(n) => {
                    if live.is_empty() {
                        continue;
                    }
                    let id = live.remove(n % live.len());
                    prop_assert!(k.scheduler().delete_task(id).is_ok());
                    prop_assert!(k.scheduler().get_task_info(id).is_none());
                }
            }
        }
        prop_assert_eq!(k.scheduler().task_list().len(), live.len());
    }

    #[test]
    fn equal_priorities_take_turns(n in 2usize..=8, rounds in 1usize..4) {
        let (k, _) = kernel();
        let mut ids = HashSet::new();
        for i in 0..n {
            let id = k
                .scheduler()
                .create_task(
                    TaskParams::new(&format!("rr{i}"), &nop)
                        .persistent()
                        .affinity(CoreId::Core0)
                        .priority(Priority::Normal),
                )
                .unwrap();
            ids.insert(id);
        }

        for _ in 0..rounds {
            let mut seen = HashSet::new();
            for _ in 0..n {
                let id = k.scheduler().schedule_once(CoreId::Core0);
                prop_assert!(id.is_some());
                prop_assert!(seen.insert(id.unwrap()));
            }
            prop_assert_eq!(&seen, &ids);
        }
    }

    #[test]
    fn a_higher_priority_always_wins(
        prios in prop::collection::vec(0u8..5, 1..8),
    ) {
        let (k, _) = kernel();
        let prio = |p: u8| match p {
            0 => Priority::Idle,
            1 => Priority::Low,
            2 => Priority::Normal,
            3 => Priority::High,
            _ => Priority::Critical,
        };
        for (i, &p) in prios.iter().enumerate() {
            k.scheduler()
                .create_task(
                    TaskParams::new(&format!("p{i}"), &nop)
                        .persistent()
                        .affinity(CoreId::Core0)
                        .priority(prio(p)),
                )
                .unwrap();
        }
        let best = prio(*prios.iter().max().unwrap());
        for _ in 0..prios.len() {
            let id = k.scheduler().schedule_once(CoreId::Core0).unwrap();
            let info = k.scheduler().get_task_info(id).unwrap();
            prop_assert_eq!(info.priority, best);
        }
    }

    #[test]
    fn held_time_is_accounted(holds in prop::collection::vec(0u64..5_000, 1..32)) {
        let (k, clock) = kernel();
        let lock = k
            .spinlocks()
            .allocate(SpinlockCategory::Sensor, "sensor")
            .unwrap();
        for &us in &holds {
            let token = k.spinlocks().acquire(lock, TaskId(1));
            clock.advance_us(us);
            k.spinlocks().release(lock, token);
            // Time between holds doesn't count.
            clock.advance_us(17);
        }

        let info = k.spinlocks().get_info(lock).unwrap();
        prop_assert_eq!(info.acquisitions as usize, holds.len());
        prop_assert_eq!(info.total_locked_us, holds.iter().sum::<u64>());
        prop_assert_eq!(info.max_locked_us, *holds.iter().max().unwrap());
        prop_assert!(!info.locked);
    }
}
