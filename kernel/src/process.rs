//! Process records.
//!
//! A process here is an in-kernel task: a 16 KiB stack, a saved stack
//! pointer, an FPU save area and scheduling bookkeeping. All tasks share the
//! kernel page table; the page-table root is carried per record so the
//! scheduler does not care.

use core::alloc::Layout;
use core::arch::asm;
use core::ptr::NonNull;

use x86_64::PhysAddr;

/// Kernel task stack size. Sized for deep call chains.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Unique process identifier. PID 0 is the initial kernel task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u64);

impl Pid {
    /// Wait-filter wildcard: matches any child.
    pub const ANY: Pid = Pid(0);
}

/// Process execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Sleeping,
    Waiting,
    Zombie,
    /// Off-scheduler: reaped and about to be reclaimed.
    Blocked,
}

/// A heap-allocated, 16-byte-aligned kernel stack.
pub struct TaskStack {
    base: NonNull<u8>,
}

// The stack is exclusively owned by its process record.
unsafe impl Send for TaskStack {}

impl TaskStack {
    const LAYOUT: Layout = unsafe { Layout::from_size_align_unchecked(KERNEL_STACK_SIZE, 16) };

    /// Allocate a zeroed stack. `None` when the heap is exhausted.
    pub fn alloc() -> Option<Self> {
        let ptr = unsafe { alloc::alloc::alloc_zeroed(Self::LAYOUT) };
        NonNull::new(ptr).map(|base| Self { base })
    }

    /// Lowest address of the stack buffer.
    pub fn base(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    /// One past the highest address; the initial stack pointer grows down
    /// from here.
    pub fn top(&self) -> u64 {
        self.base() + KERNEL_STACK_SIZE as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), KERNEL_STACK_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.base.as_ptr(), KERNEL_STACK_SIZE) }
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        unsafe {
            alloc::alloc::dealloc(self.base.as_ptr(), Self::LAYOUT);
        }
    }
}

/// 512-byte FXSAVE area.
#[repr(C, align(16))]
pub struct FpuArea([u8; 512]);

impl FpuArea {
    /// A save area capturing a freshly initialised FPU.
    pub fn initialised() -> alloc::boxed::Box<Self> {
        let mut area = alloc::boxed::Box::new(FpuArea([0; 512]));
        unsafe {
            asm!("fninit");
        }
        area.save();
        area
    }

    /// Capture the current FPU/SSE state.
    pub fn save(&mut self) {
        unsafe {
            asm!("fxsave64 [{}]", in(reg) self.0.as_mut_ptr(), options(nostack));
        }
    }

    /// Load this saved state into the FPU.
    pub fn restore(&self) {
        unsafe {
            asm!("fxrstor64 [{}]", in(reg) self.0.as_ptr(), options(nostack, readonly));
        }
    }

    pub fn copy_from(&mut self, other: &FpuArea) {
        self.0.copy_from_slice(&other.0);
    }
}

/// One schedulable task.
pub struct Process {
    pub pid: Pid,
    pub parent: Pid,
    pub state: ProcessState,
    /// Stack pointer saved at the last switch-out.
    pub sp: u64,
    /// Owned stack buffer. The initial task runs on the boot stack and owns
    /// none.
    pub stack: Option<TaskStack>,
    /// Page-table root, shared with the kernel for kernel tasks.
    pub page_table: PhysAddr,
    pub exit_status: i32,
    /// PID filter while `Waiting`; [`Pid::ANY`] matches any child.
    pub wait_for: Pid,
    /// Absolute tick deadline while `Sleeping`.
    pub wake_tick: u64,
    pub fpu: alloc::boxed::Box<FpuArea>,
    pub fpu_initialized: bool,
}

impl Process {
    /// The record for the already-running boot task.
    pub fn initial(page_table: PhysAddr) -> Self {
        Self {
            pid: Pid(0),
            parent: Pid(0),
            state: ProcessState::Running,
            sp: 0,
            stack: None,
            page_table,
            exit_status: 0,
            wait_for: Pid::ANY,
            wake_tick: 0,
            fpu: FpuArea::initialised(),
            fpu_initialized: true,
        }
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self.state, ProcessState::Ready | ProcessState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_is_aligned_and_sized() {
        let stack = TaskStack::alloc().unwrap();
        assert_eq!(stack.base() % 16, 0);
        assert_eq!(stack.top() - stack.base(), KERNEL_STACK_SIZE as u64);
        assert!(stack.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn fpu_area_round_trips() {
        let a = FpuArea::initialised();
        let mut b = alloc::boxed::Box::new(FpuArea([0; 512]));
        b.copy_from(&a);
        a.restore();
        b.save();
        // Legacy x87 state (control word etc.) must survive the round trip.
        assert_eq!(a.0[0], b.0[0]);
        assert_eq!(a.0[1], b.0[1]);
    }

    #[test]
    fn initial_task_has_no_owned_stack() {
        let process = Process::initial(PhysAddr::new(0x1000));
        assert_eq!(process.pid, Pid(0));
        assert_eq!(process.state, ProcessState::Running);
        assert!(process.stack.is_none());
        assert!(process.fpu_initialized);
    }
}
