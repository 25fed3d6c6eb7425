//! The process-wide open-file table.
//!
//! Slots 0/1/2 are the console descriptors; slots 3 and up hold files opened
//! from UniFS or pipe endpoints. The table sits behind a spinlock even
//! though the current design is effectively single-user; `is_file_open` is
//! the hook the filesystem layer calls before it would ever delete a file.

use spinning_top::Spinlock;

use crate::vfs::FileHandle;

/// Total descriptor slots per the process-wide table.
pub const MAX_OPEN_FILES: usize = 16;

/// Lowest descriptor available to `open`.
pub const FIRST_FILE_FD: usize = 3;

pub const STDIN_FD: usize = 0;
pub const STDOUT_FD: usize = 1;
pub const STDERR_FD: usize = 2;

static FD_TABLE: Spinlock<FdTable> = Spinlock::new(FdTable::new());

/// One descriptor slot.
#[derive(Clone, Copy)]
pub enum Descriptor {
    Free,
    /// stdin/stdout/stderr.
    Console,
    /// An open UniFS file with a read cursor.
    File { handle: FileHandle, position: u64 },
    /// One end of an in-kernel pipe.
    Pipe { id: usize },
}

pub struct FdTable {
    slots: [Descriptor; MAX_OPEN_FILES],
}

impl FdTable {
    const fn new() -> Self {
        Self {
            slots: [Descriptor::Free; MAX_OPEN_FILES],
        }
    }

    fn reserve_std(&mut self) {
        self.slots[STDIN_FD] = Descriptor::Console;
        self.slots[STDOUT_FD] = Descriptor::Console;
        self.slots[STDERR_FD] = Descriptor::Console;
    }

    /// First free slot at or above [`FIRST_FILE_FD`].
    pub fn find_free(&self) -> Option<usize> {
        (FIRST_FILE_FD..MAX_OPEN_FILES)
            .find(|&fd| matches!(self.slots[fd], Descriptor::Free))
    }

    pub fn get(&self, fd: usize) -> Option<Descriptor> {
        let slot = *self.slots.get(fd)?;
        match slot {
            Descriptor::Free => None,
            _ => Some(slot),
        }
    }

    pub fn install(&mut self, fd: usize, descriptor: Descriptor) {
        self.slots[fd] = descriptor;
    }

    pub fn close(&mut self, fd: usize) -> bool {
        if fd < FIRST_FILE_FD || fd >= MAX_OPEN_FILES {
            return false;
        }
        match self.slots[fd] {
            Descriptor::Free => false,
            _ => {
                self.slots[fd] = Descriptor::Free;
                true
            }
        }
    }

    /// Advance a file descriptor's cursor by `amount`, clamped to the size.
    pub fn advance(&mut self, fd: usize, amount: u64) {
        if let Descriptor::File { handle, position } = &mut self.slots[fd] {
            *position = (*position + amount).min(handle.size());
        }
    }

    pub fn is_file_open(&self, name: &str) -> bool {
        self.slots.iter().any(|slot| match slot {
            Descriptor::File { handle, .. } => handle.name == name,
            _ => false,
        })
    }
}

/// Reserve the console descriptors. Called once at boot.
pub fn init() {
    FD_TABLE.lock().reserve_std();
}

/// Run `f` with the table locked.
pub fn with_table<R>(f: impl FnOnce(&mut FdTable) -> R) -> R {
    f(&mut FD_TABLE.lock())
}

/// Whether any descriptor currently names the given file. The filesystem
/// layer consults this before destructive operations.
pub fn is_file_open(name: &str) -> bool {
    FD_TABLE.lock().is_file_open(name)
}
