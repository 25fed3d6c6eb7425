//! The syscall boundary.
//!
//! A software interrupt (`int 0x80`) lands in `entry::syscall_entry`, which
//! forwards `{rax=number, rdi, rsi, rdx}` to [`dispatch`]. Every handler
//! validates its user pointers before touching them and flattens all errors
//! to `u64::MAX` (−1); success values are handler-specific. The dispatch
//! table binds numbers to typed handlers in one place.

pub mod entry;
pub mod fd;
pub mod user_ptr;

use log::warn;

use crate::devices::display;
use crate::devices::hid;
use crate::pipe;
use crate::scheduler;
use crate::vfs::unifs;
use fd::Descriptor;
use user_ptr::{UserSlice, read_user_string};

/// Syscall numbers.
pub mod nr {
    pub const READ: u64 = 0;
    pub const WRITE: u64 = 1;
    pub const OPEN: u64 = 2;
    pub const CLOSE: u64 = 3;
    pub const PIPE: u64 = 22;
    pub const GETPID: u64 = 39;
    pub const FORK: u64 = 57;
    pub const EXIT: u64 = 60;
    pub const WAIT4: u64 = 61;
}

/// Returned for every failure at this boundary.
pub const SYSCALL_ERROR: u64 = u64::MAX;

/// Longest accepted path argument, including the terminator.
const MAX_PATH: usize = 256;

type Handler = fn(u64, u64, u64) -> u64;

/// Number → handler binding.
static SYSCALL_TABLE: &[(u64, Handler)] = &[
    (nr::READ, sys_read),
    (nr::WRITE, sys_write),
    (nr::OPEN, sys_open),
    (nr::CLOSE, sys_close),
    (nr::PIPE, sys_pipe),
    (nr::GETPID, sys_getpid),
    (nr::FORK, sys_fork),
    (nr::EXIT, sys_exit),
    (nr::WAIT4, sys_wait4),
];

/// Install the syscall gate.
pub fn init() {
    entry::init();
}

/// Route one syscall. Unknown numbers return −1.
pub extern "C" fn dispatch(number: u64, arg1: u64, arg2: u64, arg3: u64) -> u64 {
    match SYSCALL_TABLE.iter().find(|(n, _)| *n == number) {
        Some((_, handler)) => handler(arg1, arg2, arg3),
        None => {
            warn!("unknown syscall {}", number);
            SYSCALL_ERROR
        }
    }
}

/// read(fd, buf, count): stdin drains the keyboard ring (non-blocking),
/// file descriptors copy from the cursor, pipes drain their ring.
fn sys_read(fd: u64, buf: u64, count: u64) -> u64 {
    let fd = fd as usize;
    let user = UserSlice::new(buf, count);
    if count > 0 && user.validate().is_err() {
        return SYSCALL_ERROR;
    }

    let Some(descriptor) = fd::with_table(|t| t.get(fd)) else {
        return SYSCALL_ERROR;
    };

    match descriptor {
        Descriptor::Console => {
            if fd != fd::STDIN_FD {
                return SYSCALL_ERROR;
            }
            let mut bytes = alloc::vec::Vec::new();
            while (bytes.len() as u64) < count {
                match hid::keyboard_get_char() {
                    Some(c) => bytes.push(c),
                    None => break,
                }
            }
            match user.write(&bytes) {
                Ok(n) => n as u64,
                Err(_) => SYSCALL_ERROR,
            }
        }
        Descriptor::File { handle, position } => {
            let remaining = handle.size() - position;
            let to_read = count.min(remaining) as usize;
            let start = position as usize;
            match user.write(&handle.data[start..start + to_read]) {
                Ok(n) => {
                    fd::with_table(|t| t.advance(fd, n as u64));
                    n as u64
                }
                Err(_) => SYSCALL_ERROR,
            }
        }
        Descriptor::Pipe { id } => {
            let mut buffer = alloc::vec![0u8; (count as usize).min(pipe::PIPE_CAPACITY)];
            let read = pipe::read(id, &mut buffer);
            match user.write(&buffer[..read]) {
                Ok(n) => n as u64,
                Err(_) => SYSCALL_ERROR,
            }
        }
        Descriptor::Free => SYSCALL_ERROR,
    }
}

/// write(fd, buf, count): the console descriptors render through the display
/// collaborator; file descriptors are read-only; pipes fill their ring.
fn sys_write(fd: u64, buf: u64, count: u64) -> u64 {
    let fd = fd as usize;
    let user = UserSlice::new(buf, count);
    if count > 0 && user.validate().is_err() {
        return SYSCALL_ERROR;
    }

    let Some(descriptor) = fd::with_table(|t| t.get(fd)) else {
        return SYSCALL_ERROR;
    };

    match descriptor {
        Descriptor::Console => {
            if fd == fd::STDIN_FD {
                return SYSCALL_ERROR;
            }
            let Ok(bytes) = user.read() else {
                return SYSCALL_ERROR;
            };
            // Render up to the first NUL; the return value covers the
            // requested count either way.
            let visible = match bytes.iter().position(|&b| b == 0) {
                Some(end) => &bytes[..end],
                None => &bytes[..],
            };
            display::write(visible);
            count
        }
        Descriptor::File { .. } => SYSCALL_ERROR,
        Descriptor::Pipe { id } => {
            let Ok(bytes) = user.read() else {
                return SYSCALL_ERROR;
            };
            match pipe::write(id, &bytes) {
                Some(written) => written as u64,
                None => SYSCALL_ERROR,
            }
        }
        Descriptor::Free => SYSCALL_ERROR,
    }
}

/// open(name): UniFS lookup via the copy-out variant, then bind the lowest
/// free descriptor.
fn sys_open(name_ptr: u64, _arg2: u64, _arg3: u64) -> u64 {
    let Ok(name) = read_user_string(name_ptr, MAX_PATH) else {
        return SYSCALL_ERROR;
    };

    let mut handle = crate::vfs::FileHandle { name: "", data: &[] };
    if !unifs::open_into(&name, &mut handle) {
        return SYSCALL_ERROR;
    }

    fd::with_table(|table| match table.find_free() {
        Some(fd) => {
            table.install(fd, Descriptor::File { handle, position: 0 });
            fd as u64
        }
        None => SYSCALL_ERROR,
    })
}

/// close(fd): reserved descriptors cannot be closed.
fn sys_close(fd: u64, _arg2: u64, _arg3: u64) -> u64 {
    if fd::with_table(|t| t.close(fd as usize)) {
        0
    } else {
        SYSCALL_ERROR
    }
}

/// pipe(): create a pipe and bind it to a descriptor.
fn sys_pipe(_arg1: u64, _arg2: u64, _arg3: u64) -> u64 {
    let Some(id) = pipe::create() else {
        return SYSCALL_ERROR;
    };
    fd::with_table(|table| match table.find_free() {
        Some(fd) => {
            table.install(fd, Descriptor::Pipe { id });
            fd as u64
        }
        None => {
            pipe::destroy(id);
            SYSCALL_ERROR
        }
    })
}

fn sys_getpid(_arg1: u64, _arg2: u64, _arg3: u64) -> u64 {
    scheduler::current_pid().0
}

fn sys_fork(_arg1: u64, _arg2: u64, _arg3: u64) -> u64 {
    match scheduler::fork() {
        Some(pid) => pid.0,
        None => SYSCALL_ERROR,
    }
}

fn sys_exit(status: u64, _arg2: u64, _arg3: u64) -> u64 {
    scheduler::exit(status as i32);
}

/// wait4(pid, status_ptr): blocks until a matching child is reaped; writes
/// the exit status out when a pointer was supplied.
fn sys_wait4(pid: u64, status_ptr: u64, _arg3: u64) -> u64 {
    let status_out = UserSlice::new(status_ptr, core::mem::size_of::<i32>() as u64);
    if status_ptr != 0 && status_out.validate().is_err() {
        return SYSCALL_ERROR;
    }

    let (child, status) = scheduler::waitpid(pid as i64);
    if status_ptr != 0 && status_out.write(&status.to_ne_bytes()).is_err() {
        return SYSCALL_ERROR;
    }
    child.0
}

#[cfg(test)]
mod tests {
    use super::*;

    // The scheduler-backed calls (getpid/fork/exit/wait4) need a live kernel;
    // everything else is exercised hosted, with test buffers standing in for
    // user memory (hosted addresses sit in the lower half, so they validate).

    fn mount_test_image() {
        let files: &[(&str, &[u8])] = &[("README", b"hello\n")];
        let mut image = Vec::new();
        image.extend_from_slice(unifs::MAGIC);
        image.extend_from_slice(&(files.len() as u64).to_le_bytes());
        let mut offset = 16u64 + 80 * files.len() as u64;
        for (name, contents) in files {
            let mut entry = [0u8; 80];
            entry[..name.len()].copy_from_slice(name.as_bytes());
            entry[64..72].copy_from_slice(&offset.to_le_bytes());
            entry[72..80].copy_from_slice(&(contents.len() as u64).to_le_bytes());
            image.extend_from_slice(&entry);
            offset += contents.len() as u64;
        }
        for (_, contents) in files {
            image.extend_from_slice(contents);
        }
        unifs::mount(Vec::leak(image));
        fd::init();
    }

    #[test]
    fn write_rejects_kernel_pointers_without_side_effects() {
        fd::init();
        assert_eq!(
            sys_write(1, 0xffff_8000_0000_0000, 1),
            SYSCALL_ERROR
        );
        // Crossing from the last user byte into the kernel half.
        assert_eq!(sys_write(1, 0x0000_7fff_ffff_ffff, 2), SYSCALL_ERROR);
    }

    #[test]
    fn write_accepts_a_valid_user_buffer() {
        fd::init();
        let message = *b"hello";
        assert_eq!(sys_write(1, message.as_ptr() as u64, 5), 5);
    }

    #[test]
    fn write_to_a_file_descriptor_fails_read_only() {
        mount_test_image();
        let name = *b"README\0";
        let fd = sys_open(name.as_ptr() as u64, 0, 0);
        assert!(fd >= 3);
        let data = *b"x";
        assert_eq!(sys_write(fd, data.as_ptr() as u64, 1), SYSCALL_ERROR);
        assert_eq!(sys_close(fd, 0, 0), 0);
    }

    #[test]
    fn open_read_close_moves_the_cursor() {
        mount_test_image();
        let name = *b"README\0";
        let fd = sys_open(name.as_ptr() as u64, 0, 0);
        assert!(fd >= 3);

        let mut buffer = [0u8; 3];
        assert_eq!(sys_read(fd, buffer.as_mut_ptr() as u64, 3), 3);
        assert_eq!(&buffer, b"hel");
        assert_eq!(sys_read(fd, buffer.as_mut_ptr() as u64, 3), 3);
        assert_eq!(&buffer, b"lo\n");
        // Cursor at end of file: nothing left.
        assert_eq!(sys_read(fd, buffer.as_mut_ptr() as u64, 3), 0);
        assert_eq!(sys_close(fd, 0, 0), 0);
    }

    #[test]
    fn open_rejects_bad_names() {
        mount_test_image();
        let missing = *b"missing\0";
        assert_eq!(sys_open(missing.as_ptr() as u64, 0, 0), SYSCALL_ERROR);
        assert_eq!(sys_open(0, 0, 0), SYSCALL_ERROR);
        assert_eq!(sys_open(0xffff_9000_0000_0000, 0, 0), SYSCALL_ERROR);
    }

    #[test]
    fn close_rejects_reserved_descriptors() {
        fd::init();
        assert_eq!(sys_close(0, 0, 0), SYSCALL_ERROR);
        assert_eq!(sys_close(1, 0, 0), SYSCALL_ERROR);
        assert_eq!(sys_close(2, 0, 0), SYSCALL_ERROR);
    }

    #[test]
    fn unknown_syscalls_return_minus_one() {
        assert_eq!(dispatch(0xdead, 0, 0, 0), SYSCALL_ERROR);
    }

    #[test]
    fn pipe_round_trips_bytes() {
        fd::init();
        let fd = sys_pipe(0, 0, 0);
        assert!(fd >= 3);

        let message = *b"ping";
        assert_eq!(sys_write(fd, message.as_ptr() as u64, 4), 4);
        let mut buffer = [0u8; 4];
        assert_eq!(sys_read(fd, buffer.as_mut_ptr() as u64, 4), 4);
        assert_eq!(&buffer, b"ping");
        // Empty pipe reads nothing.
        assert_eq!(sys_read(fd, buffer.as_mut_ptr() as u64, 4), 0);
        assert_eq!(sys_close(fd, 0, 0), 0);
    }
}
