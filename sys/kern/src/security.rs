// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Security state configurator.
//!
//! Works alongside the MPU configurator: each task has a desired security
//! state, and `apply_task_settings` switches the core into that state before
//! the task runs, with the same per-core cache of the last task applied. A
//! task nobody configured runs `Secure`, which is where the kernel itself
//! runs, so unconfigured tasks never cost a transition.
//!
//! This module also keeps the registry of secure functions callable from the
//! non-secure side. Each gets an 8-byte veneer slot in the non-secure-callable
//! region. The registry only grows.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use abi::{CoreId, LockId, SecurityState, TaskId, NUM_CORES};

use crate::arch;
use crate::cell::{KernCell, KernRef};
use crate::config::{
    bounded_name, Name, NSC_BASE, NSC_SIZE, SECURE_FNS_PER_TASK,
    SECURE_FN_CAPACITY, SECURITY_TABLE_SIZE, VENEER_SIZE,
};
use crate::err::KernError;
use crate::idtable::IdTable;
use crate::klog::KernEvent;
use crate::startup::Kernel;

/// Index of a registered secure function.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SecureFnId(pub u16);

impl fmt::Display for SecureFnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecureFunction {
    pub id: SecureFnId,
    pub name: Name,
    pub secure_addr: u32,
    /// Address non-secure code calls to reach `secure_addr`.
    pub veneer: u32,
}

pub type SecureFnList = heapless::Vec<SecureFnId, SECURE_FNS_PER_TASK>;

/// A task's requested security settings.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityConfig {
    pub task: TaskId,
    pub state: SecurityState,
    /// Secure functions the task may call.
    pub functions: SecureFnList,
}

impl SecurityConfig {
    pub fn new(task: TaskId, state: SecurityState) -> Self {
        Self {
            task,
            state,
            functions: SecureFnList::new(),
        }
    }

    pub fn with_function(mut self, id: SecureFnId) -> Result<Self, KernError> {
        self.functions
            .push(id)
            .map_err(|_| KernError::NoFreeRecord)?;
        Ok(self)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskSecurity {
    pub state: SecurityState,
    pub functions: SecureFnList,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SecurityStats {
    pub transitions: u32,
    /// Applies that checked the core's state.
    pub apply_settings_count: u32,
    pub cache_hits: u32,
}

#[derive(Copy, Clone)]
struct CoreSecurity {
    last_applied: Option<TaskId>,
    current: SecurityState,
}

pub(crate) struct SecurityTable {
    tasks: IdTable<TaskSecurity, SECURITY_TABLE_SIZE>,
    cores: [CoreSecurity; NUM_CORES],
    functions: heapless::Vec<SecureFunction, SECURE_FN_CAPACITY>,
    stats: SecurityStats,
}

impl SecurityTable {
    fn invalidate(&mut self, task: TaskId) {
        for c in &mut self.cores {
            if c.last_applied == Some(task) {
                c.last_applied = None;
            }
        }
    }

    fn find(&self, name: &str) -> Option<&SecureFunction> {
        self.functions.iter().find(|f| f.name.as_str() == name)
    }

    /// Moves `core` to `to`, returning the state it left if that was a
    /// change.
    fn transition(
        &mut self,
        core: CoreId,
        to: SecurityState,
    ) -> Option<SecurityState> {
        let c = &mut self.cores[core.index()];
        if c.current == to {
            return None;
        }
        let from = c.current;
        arch::enter_security_state(to);
        c.current = to;
        self.stats.transitions = self.stats.transitions.wrapping_add(1);
        Some(from)
    }
}

pub(crate) struct SecurityTables {
    state: KernCell<SecurityTable>,
    enabled: AtomicBool,
}

impl SecurityTables {
    pub(crate) fn new(lock: LockId, enabled: bool) -> Self {
        Self {
            state: KernCell::new(
                lock,
                SecurityTable {
                    tasks: IdTable::new(),
                    cores: [CoreSecurity {
                        last_applied: None,
                        current: SecurityState::Secure,
                    }; NUM_CORES],
                    functions: heapless::Vec::new(),
                    stats: SecurityStats::default(),
                },
            ),
            enabled: AtomicBool::new(enabled),
        }
    }
}

/// Handle on the security configurator of a `Kernel`.
pub struct Security<'a> {
    kernel: &'a Kernel,
}

impl<'a> Security<'a> {
    pub(crate) fn new(kernel: &'a Kernel) -> Self {
        Self { kernel }
    }

    fn lock(&self) -> KernRef<'a, SecurityTable> {
        self.kernel.security_tables.state.lock(&self.kernel.locks)
    }

    pub fn is_enabled(&self) -> bool {
        self.kernel.security_tables.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.kernel
            .security_tables
            .enabled
            .store(enabled, Ordering::Release);
        let mut st = self.lock();
        for c in &mut st.cores {
            c.last_applied = None;
        }
    }

    /// Stores a task's desired state and function associations.
    pub fn configure_task(&self, config: &SecurityConfig) -> Result<(), KernError> {
        let mut st = self.lock();
        let known = st.functions.len();
        if config.functions.iter().any(|f| usize::from(f.0) >= known) {
            return Err(KernError::NoSuchFunction);
        }
        let entry = st.tasks.get_or_insert_with(config.task, TaskSecurity::default)?;
        entry.state = config.state;
        entry.functions = config.functions.clone();
        st.invalidate(config.task);
        Ok(())
    }

    /// Lets `task` call the secure function called `name`.
    pub fn associate(&self, task: TaskId, name: &str) -> Result<SecureFnId, KernError> {
        let mut st = self.lock();
        let id = st.find(name).ok_or(KernError::NoSuchFunction)?.id;
        let entry = st.tasks.get_or_insert_with(task, TaskSecurity::default)?;
        if !entry.functions.contains(&id) {
            entry
                .functions
                .push(id)
                .map_err(|_| KernError::NoFreeRecord)?;
        }
        Ok(id)
    }

    /// Adds a secure function to the registry and returns its veneer address.
    pub fn register_secure_function(
        &self,
        name: &str,
        secure_addr: u32,
    ) -> Result<u32, KernError> {
        let in_nsc = (NSC_BASE..NSC_BASE + NSC_SIZE).contains(&secure_addr);
        if secure_addr == 0 || in_nsc {
            return Err(KernError::BadAddress);
        }
        let name = bounded_name(name);
        let mut st = self.lock();
        if st.find(&name).is_some() {
            return Err(KernError::DuplicateName);
        }
        let index = st.functions.len();
        let veneer = NSC_BASE + index as u32 * VENEER_SIZE;
        st.functions
            .push(SecureFunction {
                id: SecureFnId(index as u16),
                name,
                secure_addr,
                veneer,
            })
            .map_err(|_| KernError::NoFreeSecureSlot)?;
        Ok(veneer)
    }

    pub fn lookup_secure_function(&self, name: &str) -> Option<SecureFunction> {
        self.lock().find(name).cloned()
    }

    pub fn secure_functions(&self) -> heapless::Vec<SecureFunction, SECURE_FN_CAPACITY> {
        self.lock().functions.clone()
    }

    /// Switches `core` (the calling core) to `task`'s security state, unless
    /// it has already been applied there.
    pub fn apply_task_settings(&self, core: CoreId, task: TaskId) {
        if !self.is_enabled() {
            return;
        }
        let from = {
            let mut st = self.lock();
            if st.cores[core.index()].last_applied == Some(task) {
                st.stats.cache_hits = st.stats.cache_hits.wrapping_add(1);
                return;
            }
            let want = st.tasks.get(task).map_or(SecurityState::Secure, |t| t.state);
            st.stats.apply_settings_count =
                st.stats.apply_settings_count.wrapping_add(1);
            st.cores[core.index()].last_applied = Some(task);
            st.transition(core, want).map(|from| (from, want))
        };
        if let Some((from, to)) = from {
            klog!(
                self.kernel.locks,
                KernEvent::SecurityTransition { core, task, from, to }
            );
        }
    }

    /// Returns `core` to the kernel's secure state and forgets what was
    /// applied there.
    pub fn reset_task_settings(&self, core: CoreId, task: TaskId) {
        let from = {
            let mut st = self.lock();
            st.cores[core.index()].last_applied = None;
            if self.is_enabled() {
                st.transition(core, SecurityState::Secure)
            } else {
                None
            }
        };
        if let Some(from) = from {
            klog!(
                self.kernel.locks,
                KernEvent::SecurityTransition {
                    core,
                    task,
                    from,
                    to: SecurityState::Secure
                }
            );
        }
    }

    pub(crate) fn forget_task(&self, task: TaskId) {
        let mut st = self.lock();
        st.tasks.remove(task);
        st.invalidate(task);
    }

    pub fn task_settings(&self, task: TaskId) -> Option<TaskSecurity> {
        self.lock().tasks.get(task).cloned()
    }

    /// The state `task` runs in.
    pub fn effective_state(&self, task: TaskId) -> SecurityState {
        self.lock()
            .tasks
            .get(task)
            .map_or(SecurityState::Secure, |t| t.state)
    }

    pub fn current_state(&self, core: CoreId) -> SecurityState {
        self.lock().cores[core.index()].current
    }

    pub fn stats(&self) -> SecurityStats {
        self.lock().stats
    }

    pub fn status(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let (stats, cores, functions, tasks) = {
            let st = self.lock();
            let mut tasks: heapless::Vec<(TaskId, TaskSecurity), SECURITY_TABLE_SIZE> =
                heapless::Vec::new();
            for (id, t) in st.tasks.iter() {
                let _ = tasks.push((id, t.clone()));
            }
            (st.stats, st.cores, st.functions.clone(), tasks)
        };
        writeln!(
            out,
            "security: {}, {} transitions, {} applies ({} cache hits)",
            if self.is_enabled() { "enabled" } else { "disabled" },
            stats.transitions,
            stats.apply_settings_count,
            stats.cache_hits,
        )?;
        for core in CoreId::ALL {
            let c = &cores[core.index()];
            write!(out, "{core}: {}", c.current.name())?;
            match c.last_applied {
                Some(t) => writeln!(out, ", task {t} applied")?,
                None => writeln!(out)?,
            }
        }
        writeln!(
            out,
            "secure functions: {} of {}",
            functions.len(),
            SECURE_FN_CAPACITY
        )?;
        for f in &functions {
            writeln!(
                out,
                "  [{}] {:<24} {:#010x} -> veneer {:#010x}",
                f.id, f.name, f.secure_addr, f.veneer
            )?;
        }
        for (id, t) in &tasks {
            write!(out, "task {id}: {}", t.state.name())?;
            for f in &t.functions {
                write!(out, " {f}")?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelOptions;
    use crate::time::SteppedClock;

    fn kernel() -> Kernel {
        let clock: &'static SteppedClock = Box::leak(Box::new(SteppedClock::new()));
        Kernel::new(clock, KernelOptions::default()).unwrap()
    }

    #[test]
    fn veneers_are_allocated_in_order() {
        let k = kernel();
        let sec = k.security();
        assert_eq!(sec.register_secure_function("crypto_init", 0x1000_1000), Ok(NSC_BASE));
        assert_eq!(
            sec.register_secure_function("crypto_hash", 0x1000_2000),
            Ok(NSC_BASE + VENEER_SIZE)
        );
        let f = sec.lookup_secure_function("crypto_hash").unwrap();
        assert_eq!(f.id, SecureFnId(1));
        assert_eq!(f.secure_addr, 0x1000_2000);
        assert!(sec.lookup_secure_function("missing").is_none());
    }

    #[test]
    fn registry_rejects_bad_entries() {
        let k = kernel();
        let sec = k.security();
        assert_eq!(sec.register_secure_function("f", 0), Err(KernError::BadAddress));
        assert_eq!(
            sec.register_secure_function("f", NSC_BASE + 4),
            Err(KernError::BadAddress)
        );
        sec.register_secure_function("f", 0x1000_0000).unwrap();
        assert_eq!(
            sec.register_secure_function("f", 0x1000_0100),
            Err(KernError::DuplicateName)
        );
    }

    #[test]
    fn registry_fills_up() {
        let k = kernel();
        let sec = k.security();
        for i in 0..SECURE_FN_CAPACITY {
            let name = format!("fn{i}");
            sec.register_secure_function(&name, 0x1000_0000 + i as u32 * 4)
                .unwrap();
        }
        assert_eq!(
            sec.register_secure_function("one_more", 0x1000_0000),
            Err(KernError::NoFreeSecureSlot)
        );
    }

    #[test]
    fn apply_transitions_only_on_change() {
        let k = kernel();
        let sec = k.security();
        let ns = SecurityConfig::new(TaskId(1), SecurityState::NonSecure);
        sec.configure_task(&ns).unwrap();

        // Unconfigured tasks run secure, which is where we start.
        sec.apply_task_settings(CoreId::Core0, TaskId(2));
        assert_eq!(sec.stats().transitions, 0);

        sec.apply_task_settings(CoreId::Core0, TaskId(1));
        assert_eq!(sec.current_state(CoreId::Core0), SecurityState::NonSecure);
        assert_eq!(sec.stats().transitions, 1);

        // Cache hit.
        sec.apply_task_settings(CoreId::Core0, TaskId(1));
        assert_eq!(sec.stats().cache_hits, 1);
        assert_eq!(sec.stats().transitions, 1);

        // Core 1 is separate.
        assert_eq!(sec.current_state(CoreId::Core1), SecurityState::Secure);

        sec.reset_task_settings(CoreId::Core0, TaskId(1));
        assert_eq!(sec.current_state(CoreId::Core0), SecurityState::Secure);
        assert_eq!(sec.stats().transitions, 2);
    }

    #[test]
    fn configure_checks_function_ids() {
        let k = kernel();
        let sec = k.security();
        let cfg = SecurityConfig::new(TaskId(1), SecurityState::NonSecure)
            .with_function(SecureFnId(0))
            .unwrap();
        assert_eq!(sec.configure_task(&cfg), Err(KernError::NoSuchFunction));
        sec.register_secure_function("f", 0x1000_0000).unwrap();
        sec.configure_task(&cfg).unwrap();
        assert_eq!(sec.associate(TaskId(1), "f"), Ok(SecureFnId(0)));
        assert_eq!(sec.task_settings(TaskId(1)).unwrap().functions.len(), 1);
        assert_eq!(sec.associate(TaskId(1), "g"), Err(KernError::NoSuchFunction));
    }

    #[test]
    fn disabled_configurator_never_transitions() {
        let k = kernel();
        let sec = k.security();
        sec.set_enabled(false);
        sec.configure_task(&SecurityConfig::new(TaskId(1), SecurityState::NonSecure))
            .unwrap();
        sec.apply_task_settings(CoreId::Core0, TaskId(1));
        assert_eq!(sec.current_state(CoreId::Core0), SecurityState::Secure);
        assert_eq!(sec.stats(), SecurityStats::default());
    }
}
