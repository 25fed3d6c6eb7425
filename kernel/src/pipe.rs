//! In-kernel pipes.
//!
//! A pipe is a fixed-capacity byte queue addressed by a small id; the syscall
//! layer binds ids to file descriptors. Both ends are non-blocking: reading
//! an empty pipe returns zero bytes, writing a full one reports failure.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spinning_top::Spinlock;

/// Bytes a single pipe can hold.
pub const PIPE_CAPACITY: usize = 512;

static PIPES: Spinlock<Vec<Option<VecDeque<u8>>>> = Spinlock::new(Vec::new());

/// Allocate a pipe and return its id.
pub fn create() -> Option<usize> {
    let mut pipes = PIPES.lock();
    let queue = VecDeque::with_capacity(PIPE_CAPACITY);
    match pipes.iter().position(Option::is_none) {
        Some(id) => {
            pipes[id] = Some(queue);
            Some(id)
        }
        None => {
            pipes.push(Some(queue));
            Some(pipes.len() - 1)
        }
    }
}

/// Release a pipe id. Pending bytes are discarded.
pub fn destroy(id: usize) {
    let mut pipes = PIPES.lock();
    if let Some(slot) = pipes.get_mut(id) {
        *slot = None;
    }
}

/// Drain up to `buf.len()` bytes. Returns how many were read.
pub fn read(id: usize, buf: &mut [u8]) -> usize {
    let mut pipes = PIPES.lock();
    let Some(Some(queue)) = pipes.get_mut(id) else {
        return 0;
    };
    let mut count = 0;
    while count < buf.len() {
        match queue.pop_front() {
            Some(byte) => {
                buf[count] = byte;
                count += 1;
            }
            None => break,
        }
    }
    count
}

/// Append `data` if it fits in the remaining capacity. `None` when it does
/// not; a pipe write is all-or-nothing.
pub fn write(id: usize, data: &[u8]) -> Option<usize> {
    let mut pipes = PIPES.lock();
    let Some(Some(queue)) = pipes.get_mut(id) else {
        return None;
    };
    if queue.len() + data.len() > PIPE_CAPACITY {
        return None;
    }
    queue.extend(data.iter().copied());
    Some(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_flow_first_in_first_out() {
        let id = create().unwrap();
        assert_eq!(write(id, b"abc"), Some(3));
        assert_eq!(write(id, b"de"), Some(2));

        let mut buf = [0u8; 4];
        assert_eq!(read(id, &mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(read(id, &mut buf), 1);
        assert_eq!(buf[0], b'e');
        assert_eq!(read(id, &mut buf), 0);
        destroy(id);
    }

    #[test]
    fn writes_beyond_capacity_are_refused() {
        let id = create().unwrap();
        let filler = [0u8; PIPE_CAPACITY];
        assert_eq!(write(id, &filler), Some(PIPE_CAPACITY));
        assert_eq!(write(id, b"x"), None);

        let mut drain = [0u8; 1];
        assert_eq!(read(id, &mut drain), 1);
        assert_eq!(write(id, b"x"), Some(1));
        destroy(id);
    }

    #[test]
    fn destroyed_pipes_reject_io() {
        let id = create().unwrap();
        destroy(id);
        assert_eq!(write(id, b"a"), None);
        let mut buf = [0u8; 1];
        assert_eq!(read(id, &mut buf), 0);
    }
}
