//! Preemptive round-robin scheduler.
//!
//! Process records live in an arena keyed by PID; the round-robin "list" is a
//! vector of PIDs walked circularly from the current task. The timer
//! interrupt and the voluntary primitives (`yield_now`, `sleep`, `waitpid`)
//! all funnel into [`schedule`].
//!
//! Locking: one spinlock guards the arena and run order, always taken with
//! interrupts disabled so the timer cannot re-enter it, and never held across
//! the context switch itself. The switch runs with interrupts still masked;
//! the incoming task's RFLAGS image decides when they come back on.

mod context;

pub use context::prepare_initial_stack;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::{debug, info};
use spinning_top::Spinlock;
use x86_64::instructions::interrupts;

use crate::memory::AddressSpace;
use crate::process::{FpuArea, Pid, Process, ProcessState, TaskStack};
use crate::time;

static SCHEDULER: Spinlock<Option<Scheduler>> = Spinlock::new(None);

/// Raw handles for one switch, captured under the lock and consumed after it
/// is released. Valid because interrupts stay disabled from capture to use.
struct SwitchHandles {
    prev_sp: *mut u64,
    prev_fpu: *mut FpuArea,
    next_sp: u64,
}

pub struct Scheduler {
    table: BTreeMap<Pid, Process>,
    /// Round-robin order; PIDs are appended at creation and removed at reap.
    run_order: Vec<Pid>,
    current: Pid,
    next_pid: u64,
}

impl Scheduler {
    pub fn new(initial: Process) -> Self {
        let pid = initial.pid;
        let mut table = BTreeMap::new();
        table.insert(pid, initial);
        let mut run_order = Vec::new();
        run_order.push(pid);
        Self {
            table,
            run_order,
            current: pid,
            next_pid: 1,
        }
    }

    pub fn current_pid(&self) -> Pid {
        self.current
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Create a kernel task that will start in `entry`.
    pub fn spawn(&mut self, entry: extern "C" fn()) -> Option<Pid> {
        let mut stack = TaskStack::alloc()?;
        let sp = context::prepare_initial_stack(&mut stack, entry);

        let pid = self.allocate_pid();
        let parent = self.current;
        let page_table = self.table[&parent].page_table;
        let process = Process {
            pid,
            parent,
            state: ProcessState::Ready,
            sp,
            stack: Some(stack),
            page_table,
            exit_status: 0,
            wait_for: Pid::ANY,
            wake_tick: 0,
            fpu: FpuArea::initialised(),
            fpu_initialized: true,
        };
        self.table.insert(pid, process);
        self.run_order.push(pid);
        debug!("created task {:?}", pid);
        Some(pid)
    }

    /// Duplicate the current task: fresh stack holding a byte copy of the
    /// parent's, stack pointer at the same relative offset, copied FPU state,
    /// shared page-table root.
    pub fn fork_current(&mut self) -> Option<Pid> {
        let pid = self.allocate_pid();
        let parent = self.table.get(&self.current).expect("current process in table");

        let mut stack = TaskStack::alloc()?;
        let sp = match &parent.stack {
            Some(parent_stack) => {
                stack.as_mut_slice().copy_from_slice(parent_stack.as_slice());
                stack.base() + (parent.sp - parent_stack.base())
            }
            // The initial task runs on the boot stack; the child inherits the
            // saved pointer verbatim.
            None => parent.sp,
        };

        let mut fpu = FpuArea::initialised();
        fpu.copy_from(&parent.fpu);

        let child = Process {
            pid,
            parent: parent.pid,
            state: ProcessState::Ready,
            sp,
            stack: Some(stack),
            page_table: parent.page_table,
            exit_status: 0,
            wait_for: Pid::ANY,
            wake_tick: 0,
            fpu,
            fpu_initialized: parent.fpu_initialized,
        };
        debug!("forked {:?} -> {:?}", child.parent, pid);
        self.table.insert(pid, child);
        self.run_order.push(pid);
        Some(pid)
    }

    /// Move due sleepers back to Ready.
    pub fn wake_sleepers(&mut self, now: u64) {
        for process in self.table.values_mut() {
            if process.state == ProcessState::Sleeping && now >= process.wake_tick {
                process.state = ProcessState::Ready;
            }
        }
    }

    /// Pick the next runnable task after the current one in round-robin
    /// order. `None` when the current task should keep running (or nothing is
    /// runnable at all).
    pub fn select_next(&self) -> Option<Pid> {
        let len = self.run_order.len();
        let start = self
            .run_order
            .iter()
            .position(|&pid| pid == self.current)
            .unwrap_or(0);

        for step in 1..=len {
            let pid = self.run_order[(start + step) % len];
            let process = &self.table[&pid];
            if process.is_runnable() {
                return if pid == self.current { None } else { Some(pid) };
            }
        }
        None
    }

    /// Demote the outgoing task, promote `next` and capture the raw switch
    /// handles.
    fn commit_switch(&mut self, next: Pid) -> SwitchHandles {
        let prev = self.current;
        let (prev_sp, prev_fpu) = {
            let process = self.table.get_mut(&prev).expect("current process in table");
            if process.state == ProcessState::Running {
                process.state = ProcessState::Ready;
            }
            (&mut process.sp as *mut u64, &mut *process.fpu as *mut FpuArea)
        };

        let incoming = self.table.get_mut(&next).expect("selected process in table");
        incoming.state = ProcessState::Running;
        self.current = next;
        SwitchHandles {
            prev_sp,
            prev_fpu,
            next_sp: incoming.sp,
        }
    }

    /// Transition the current task to Sleeping until `wake_tick`.
    pub fn mark_sleeping(&mut self, wake_tick: u64) {
        let process = self.table.get_mut(&self.current).expect("current process in table");
        process.wake_tick = wake_tick;
        process.state = ProcessState::Sleeping;
    }

    /// Transition the current task to Waiting for `filter` (-1 = any child).
    pub fn mark_waiting(&mut self, filter: i64) {
        let process = self.table.get_mut(&self.current).expect("current process in table");
        process.wait_for = if filter == -1 { Pid::ANY } else { Pid(filter as u64) };
        process.state = ProcessState::Waiting;
    }

    /// Turn the current task into a zombie and wake its parent if the parent
    /// is waiting for it.
    pub fn do_exit(&mut self, status: i32) {
        let me = self.current;
        let parent_pid = {
            let process = self.table.get_mut(&me).expect("current process in table");
            process.state = ProcessState::Zombie;
            process.exit_status = status;
            process.parent
        };

        if let Some(parent) = self.table.get_mut(&parent_pid) {
            if parent.state == ProcessState::Waiting
                && (parent.wait_for == Pid::ANY || parent.wait_for == me)
            {
                parent.state = ProcessState::Ready;
            }
        }
    }

    /// Reap one zombie child of `parent` matching `filter` (-1 = any).
    /// The child leaves the scheduler and its record is reclaimed.
    pub fn try_reap(&mut self, parent: Pid, filter: i64) -> Option<(Pid, i32)> {
        let victim = self.table.values().find(|p| {
            p.parent == parent
                && p.state == ProcessState::Zombie
                && (filter == -1 || p.pid.0 == filter as u64)
        })?;
        let pid = victim.pid;

        let process = self.table.get_mut(&pid).expect("victim still in table");
        process.state = ProcessState::Blocked;
        let status = process.exit_status;

        self.run_order.retain(|&p| p != pid);
        self.table.remove(&pid);
        debug!("reaped {:?} (status {})", pid, status);
        Some((pid, status))
    }

    #[cfg(test)]
    fn state_of(&self, pid: Pid) -> Option<ProcessState> {
        self.table.get(&pid).map(|p| p.state)
    }
}

/// Run `f` against the scheduler with interrupts masked for the duration.
fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    let were_enabled = interrupts::are_enabled();
    interrupts::disable();
    let result = {
        let mut guard = SCHEDULER.lock();
        guard.as_mut().map(f)
    };
    if were_enabled {
        interrupts::enable();
    }
    result
}

/// Create the record for the already-running boot task (PID 0).
pub fn init() {
    let page_table = AddressSpace::current().root();
    let mut guard = SCHEDULER.lock();
    assert!(guard.is_none(), "scheduler already initialized");
    *guard = Some(Scheduler::new(Process::initial(page_table)));
    info!("scheduler: initial task is PID 0");
}

/// PID of the task calling this.
pub fn current_pid() -> Pid {
    with_scheduler(|s| s.current_pid()).expect("scheduler not initialized")
}

/// Create a kernel task; it becomes runnable immediately.
pub fn spawn(entry: extern "C" fn()) -> Option<Pid> {
    with_scheduler(|s| s.spawn(entry)).flatten()
}

/// Duplicate the current task. Returns the child PID, or `None` when memory
/// is exhausted.
pub fn fork() -> Option<Pid> {
    with_scheduler(|s| s.fork_current()).flatten()
}

/// Preempt the current task: wake due sleepers, pick the next runnable task
/// and switch to it. Returns (much later) when this task is scheduled again,
/// or immediately when nothing else is runnable.
pub fn schedule() {
    let were_enabled = interrupts::are_enabled();
    interrupts::disable();

    let handles = {
        let mut guard = SCHEDULER.lock();
        match guard.as_mut() {
            Some(sched) => {
                sched.wake_sleepers(time::ticks());
                sched.select_next().map(|next| sched.commit_switch(next))
            }
            None => None,
        }
    };
    // Lock released; interrupts stay off until after the switch.

    if let Some(handles) = handles {
        unsafe {
            (*handles.prev_fpu).save();
            context::context_switch(handles.prev_sp, handles.next_sp);
            // Running again: reload this task's FPU state.
            (*handles.prev_fpu).restore();
        }
    }

    if were_enabled {
        interrupts::enable();
    }
}

/// Voluntarily give up the CPU.
pub fn yield_now() {
    schedule();
}

/// Block the current task for `ticks` timer ticks.
pub fn sleep(ticks: u64) {
    let deadline = time::ticks() + ticks;
    with_scheduler(|s| s.mark_sleeping(deadline));
    schedule();
}

/// Block the current task for `ms` milliseconds (rounded up to a tick).
pub fn sleep_ms(ms: u64) {
    sleep(time::ms_to_ticks(ms));
}

/// Terminate the current task. Wakes a waiting parent, then schedules away
/// forever; the record is reclaimed when the parent reaps it.
pub fn exit(status: i32) -> ! {
    with_scheduler(|s| s.do_exit(status));
    loop {
        schedule();
        core::hint::spin_loop();
    }
}

/// Wait for a child to exit. `filter` is a PID or -1 for any child. Blocks
/// until a matching child is reaped and returns its PID and exit status.
pub fn waitpid(filter: i64) -> (Pid, i32) {
    loop {
        let reaped = with_scheduler(|s| {
            let me = s.current_pid();
            s.try_reap(me, filter)
        })
        .flatten();
        if let Some(result) = reaped {
            return result;
        }

        with_scheduler(|s| s.mark_waiting(filter));
        schedule();
    }
}

/// Load the current task's FPU state; used on a task's very first entry.
pub(crate) fn restore_current_fpu() {
    let fpu = with_scheduler(|s| {
        let process = s.table.get(&s.current).expect("current process in table");
        &*process.fpu as *const FpuArea
    });
    if let Some(fpu) = fpu {
        unsafe { (*fpu).restore() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::PhysAddr;

    extern "C" fn entry_a() {}
    extern "C" fn entry_b() {}

    fn scheduler() -> Scheduler {
        Scheduler::new(Process::initial(PhysAddr::new(0x1000)))
    }

    #[test]
    fn init_builds_a_single_running_task() {
        let sched = scheduler();
        assert_eq!(sched.current_pid(), Pid(0));
        assert_eq!(sched.state_of(Pid(0)), Some(ProcessState::Running));
        assert_eq!(sched.run_order, alloc::vec![Pid(0)]);
    }

    #[test]
    fn spawned_tasks_join_in_creation_order() {
        let mut sched = scheduler();
        let a = sched.spawn(entry_a).unwrap();
        let b = sched.spawn(entry_b).unwrap();
        assert_eq!((a, b), (Pid(1), Pid(2)));
        assert_eq!(sched.run_order, alloc::vec![Pid(0), a, b]);
        assert_eq!(sched.state_of(a), Some(ProcessState::Ready));
    }

    #[test]
    fn round_robin_walks_from_the_current_task() {
        let mut sched = scheduler();
        let a = sched.spawn(entry_a).unwrap();
        let b = sched.spawn(entry_b).unwrap();

        assert_eq!(sched.select_next(), Some(a));
        sched.commit_switch(a);
        assert_eq!(sched.current_pid(), a);
        assert_eq!(sched.state_of(a), Some(ProcessState::Running));
        assert_eq!(sched.state_of(Pid(0)), Some(ProcessState::Ready));

        assert_eq!(sched.select_next(), Some(b));
        sched.commit_switch(b);
        assert_eq!(sched.select_next(), Some(Pid(0)));
    }

    #[test]
    fn exactly_one_task_runs_after_a_switch() {
        let mut sched = scheduler();
        sched.spawn(entry_a).unwrap();
        sched.spawn(entry_b).unwrap();
        let next = sched.select_next().unwrap();
        sched.commit_switch(next);

        let running = sched
            .table
            .values()
            .filter(|p| p.state == ProcessState::Running)
            .count();
        assert_eq!(running, 1);
        assert_eq!(sched.state_of(next), Some(ProcessState::Running));
    }

    #[test]
    fn lone_task_keeps_the_cpu() {
        let sched = scheduler();
        assert_eq!(sched.select_next(), None);
    }

    #[test]
    fn sleepers_are_skipped_until_their_deadline() {
        let mut sched = scheduler();
        let a = sched.spawn(entry_a).unwrap();

        sched.commit_switch(a);
        sched.mark_sleeping(1005);
        // Tick 1004: the sleeper stays asleep, PID 0 takes over.
        sched.wake_sleepers(1004);
        assert_eq!(sched.state_of(a), Some(ProcessState::Sleeping));
        assert_eq!(sched.select_next(), Some(Pid(0)));
        sched.commit_switch(Pid(0));

        // Tick 1005: the deadline passed, the sleeper becomes ready again.
        sched.wake_sleepers(1005);
        assert_eq!(sched.state_of(a), Some(ProcessState::Ready));
        assert_eq!(sched.select_next(), Some(a));
    }

    #[test]
    fn fork_copies_the_stack_at_the_same_relative_offset() {
        let mut sched = scheduler();
        let parent = sched.spawn(entry_a).unwrap();
        sched.commit_switch(parent);

        // Scribble a recognisable value into the parent's stack.
        let (parent_sp, marker_offset) = {
            let p = sched.table.get_mut(&parent).unwrap();
            let stack = p.stack.as_mut().unwrap();
            let offset = p.sp - stack.base();
            stack.as_mut_slice()[16] = 0x5a;
            (p.sp, offset)
        };

        let child = sched.fork_current().unwrap();
        let c = &sched.table[&child];
        let child_stack = c.stack.as_ref().unwrap();
        assert_eq!(c.parent, parent);
        assert_eq!(c.state, ProcessState::Ready);
        assert_eq!(child_stack.as_slice()[16], 0x5a);
        assert_eq!(c.sp - child_stack.base(), marker_offset);
        assert_ne!(c.sp, parent_sp);
        assert_eq!(c.page_table, sched.table[&parent].page_table);
    }

    #[test]
    fn fork_exit_wait_round_trip() {
        // Scenario: PID 0 forks, the child exits with 42, waitpid(-1)
        // observes it.
        let mut sched = scheduler();
        let child = sched.fork_current().unwrap();
        assert_eq!(child, Pid(1));

        // Parent starts waiting before the child dies.
        sched.mark_waiting(-1);
        assert_eq!(sched.state_of(Pid(0)), Some(ProcessState::Waiting));

        sched.commit_switch(child);
        sched.do_exit(42);
        assert_eq!(sched.state_of(child), Some(ProcessState::Zombie));
        // The waiting parent was woken.
        assert_eq!(sched.state_of(Pid(0)), Some(ProcessState::Ready));

        sched.commit_switch(Pid(0));
        let (reaped, status) = sched.try_reap(Pid(0), -1).unwrap();
        assert_eq!(reaped, child);
        assert_eq!(status, 42);
        // The record was reclaimed, not parked.
        assert!(sched.state_of(child).is_none());
        assert!(!sched.run_order.contains(&child));
    }

    #[test]
    fn reap_honours_the_pid_filter() {
        let mut sched = scheduler();
        let first = sched.fork_current().unwrap();
        let second = sched.fork_current().unwrap();

        sched.commit_switch(first);
        sched.do_exit(1);
        sched.commit_switch(second);
        sched.do_exit(2);
        sched.commit_switch(Pid(0));

        // Filtering for the second child skips the first zombie.
        assert_eq!(sched.try_reap(Pid(0), second.0 as i64), Some((second, 2)));
        assert_eq!(sched.try_reap(Pid(0), -1), Some((first, 1)));
        assert_eq!(sched.try_reap(Pid(0), -1), None);
    }

    #[test]
    fn exit_does_not_wake_a_parent_waiting_for_someone_else() {
        let mut sched = scheduler();
        let first = sched.fork_current().unwrap();
        let second = sched.fork_current().unwrap();

        sched.mark_waiting(second.0 as i64);
        sched.commit_switch(first);
        sched.do_exit(0);
        // Parent waits for `second`; `first` exiting must not wake it.
        assert_eq!(sched.state_of(Pid(0)), Some(ProcessState::Waiting));

        sched.commit_switch(second);
        sched.do_exit(0);
        assert_eq!(sched.state_of(Pid(0)), Some(ProcessState::Ready));
    }

    #[test]
    fn zombies_are_never_selected() {
        let mut sched = scheduler();
        let a = sched.spawn(entry_a).unwrap();
        sched.commit_switch(a);
        sched.do_exit(0);
        // Only PID 0 is runnable now.
        assert_eq!(sched.select_next(), Some(Pid(0)));
    }
}
