use std::ffi::CString;
use std::mem::MaybeUninit;
use std::ptr;
use std::time::Duration;

use tierfs_core::{TierError, TierResult};

/// Longest accepted shared-memory object name, terminator excluded.
const SHM_NAME_MAX: usize = 255;

/// Mapped queue header. Lives at the start of the memory region, padded out
/// to a page boundary; the record buffer follows it. The layout must be
/// identical in every process that maps the region, hence `repr(C)` and
/// offset-based addressing throughout.
#[repr(C)]
struct Header {
    /// Maximum number of records.
    capacity: usize,
    /// Current number of records; guarded by `size_mutex`.
    cur_size: usize,
    /// Maximum record length in bytes.
    record_max: usize,
    /// Byte index of the head slot within the buffer; guarded by `head_mutex`.
    head: usize,
    /// Byte index of the tail slot within the buffer; guarded by `tail_mutex`.
    tail: usize,
    /// Buffer length in bytes (`slot_size * capacity`).
    buf_size: usize,
    /// Total mapped length including header padding.
    total_size: usize,
    /// NUL-terminated name of the backing shared-memory object; empty for
    /// private queues.
    shm_name: [u8; SHM_NAME_MAX + 1],
    /// Serializes consumers.
    head_mutex: libc::pthread_mutex_t,
    /// Serializes producers.
    tail_mutex: libc::pthread_mutex_t,
    /// Guards `cur_size`; the condition variables wait on this one.
    size_mutex: libc::pthread_mutex_t,
    /// Signaled on the empty -> non-empty edge.
    emptiness_cond: libc::pthread_cond_t,
    /// Signaled on the full -> not-full edge.
    fullness_cond: libc::pthread_cond_t,
}

/// Bounded FIFO of byte records in private or shared memory.
///
/// `push`/`pop` block on a full/empty queue; the `try_` variants return
/// [`TierError::WouldBlock`] instead. All operations take `&self`: internal
/// state is guarded by the mutexes embedded in the mapped header.
///
/// Dropping the handle unmaps the region and, if this handle created a named
/// shared-memory object, unlinks the name. Dropping while another thread is
/// inside an operation is a contract violation, same as for the explicit
/// [`Queue::destroy`].
pub struct Queue {
    header: *mut Header,
    buf: *mut u8,
    /// Name to unlink on drop; only set on the creating handle.
    owned_name: Option<CString>,
}

// The raw pointers target a region whose mutable state is fully guarded by
// the in-header pthread mutexes.
unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

impl Queue {
    /// Allocates and initializes a queue.
    ///
    /// With `shm_name` the backing region is a freshly created (exclusive)
    /// POSIX shared-memory object of that name, mode `0666` masked by the
    /// process umask, and the mutexes and condition variables carry
    /// process-shared attributes. Without it the region is private anonymous
    /// memory.
    ///
    /// # Errors
    ///
    /// - `Invalid` if `capacity` or `record_max` is zero, or the name is not
    ///   of the form `/name` within the length limit.
    /// - `ResourceExhausted` if the mapping or shared-memory creation fails.
    pub fn init(capacity: usize, record_max: usize, shm_name: Option<&str>) -> TierResult<Self> {
        if capacity == 0 || record_max == 0 {
            return Err(TierError::invalid(
                "queue capacity and record_max must be non-zero",
            ));
        }

        let page = page_size()?;
        let header_size = round_up(std::mem::size_of::<Header>(), page);
        let buf_size = slot_size(record_max)
            .checked_mul(capacity)
            .ok_or_else(|| TierError::invalid("queue dimensions overflow"))?;
        let total_size = header_size + round_up(buf_size, page);

        let (base, owned_name) = match shm_name {
            None => (map_private(total_size)?, None),
            Some(name) => {
                let cname = validate_shm_name(name)?;
                let base = create_shared(&cname, total_size)?;
                (base, Some(cname))
            }
        };

        let header = base.cast::<Header>();
        let shared = owned_name.is_some();
        unsafe {
            (*header).capacity = capacity;
            (*header).cur_size = 0;
            (*header).record_max = record_max;
            (*header).head = 0;
            (*header).tail = 0;
            (*header).buf_size = buf_size;
            (*header).total_size = total_size;
            (*header).shm_name = [0; SHM_NAME_MAX + 1];
            if let Some(name) = &owned_name {
                let bytes = name.as_bytes();
                (&mut (*header).shm_name)[..bytes.len()].copy_from_slice(bytes);
            }
            init_sync(header, shared);
        }

        Ok(Self {
            header,
            buf: unsafe { base.cast::<u8>().add(header_size) },
            owned_name,
        })
    }

    /// Maps an existing shared queue created by another process with
    /// [`Queue::init`]. The returned handle never unlinks the name.
    ///
    /// # Errors
    ///
    /// - `Invalid` if the name is malformed or the mapped region does not
    ///   look like an initialized queue.
    /// - `ResourceExhausted` if the object cannot be opened or mapped.
    pub fn attach(shm_name: &str) -> TierResult<Self> {
        let cname = validate_shm_name(shm_name)?;
        let page = page_size()?;

        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(TierError::resource_exhausted(format!(
                "shm_open(`{shm_name}`): {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut st = MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, st.as_mut_ptr()) } != 0 {
            let err = TierError::last_os_error("fstat");
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let mapped_size = unsafe { st.assume_init() }.st_size as usize;
        if mapped_size < std::mem::size_of::<Header>() {
            unsafe { libc::close(fd) };
            return Err(TierError::invalid(format!(
                "shared object `{shm_name}` is too small to hold a queue"
            )));
        }

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if base == libc::MAP_FAILED {
            return Err(TierError::resource_exhausted(format!(
                "mmap(`{shm_name}`): {}",
                std::io::Error::last_os_error()
            )));
        }

        let header = base.cast::<Header>();
        let (total, capacity, record_max, buf_size) = unsafe {
            (
                (*header).total_size,
                (*header).capacity,
                (*header).record_max,
                (*header).buf_size,
            )
        };
        let padded_buf = round_up(buf_size, page);
        if total != mapped_size
            || capacity == 0
            || record_max == 0
            || buf_size != slot_size(record_max) * capacity
            || padded_buf + std::mem::size_of::<Header>() > mapped_size
        {
            unsafe { libc::munmap(base, mapped_size) };
            return Err(TierError::invalid(format!(
                "shared object `{shm_name}` does not contain a valid queue"
            )));
        }

        let header_size = mapped_size - padded_buf;
        Ok(Self {
            header,
            buf: unsafe { base.cast::<u8>().add(header_size) },
            owned_name: None,
        })
    }

    /// Maximum number of records.
    #[must_use]
    pub fn capacity(&self) -> usize {
        unsafe { (*self.header).capacity }
    }

    /// Maximum record length in bytes.
    #[must_use]
    pub fn record_max(&self) -> usize {
        unsafe { (*self.header).record_max }
    }

    /// Current number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        let header = self.header;
        unsafe {
            lock(ptr::addr_of_mut!((*header).size_mutex));
            let n = (*header).cur_size;
            unlock(ptr::addr_of_mut!((*header).size_mutex));
            n
        }
    }

    /// True if no record is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a record, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// `Invalid` if the record is empty or longer than `record_max`.
    pub fn push(&self, record: &[u8]) -> TierResult<()> {
        self.push_inner(record, true)
    }

    /// Appends a record without blocking.
    ///
    /// # Errors
    ///
    /// `WouldBlock` if the queue is full; `Invalid` as for [`Queue::push`].
    pub fn try_push(&self, record: &[u8]) -> TierResult<()> {
        self.push_inner(record, false)
    }

    /// Removes the head record into `buf`, blocking while the queue is
    /// empty, and returns the record length.
    ///
    /// # Errors
    ///
    /// `Invalid` if `buf` is shorter than the head record; the record is not
    /// removed in that case.
    pub fn pop(&self, buf: &mut [u8]) -> TierResult<usize> {
        self.pop_inner(buf, Wait::Block)
    }

    /// Removes the head record into `buf` without blocking.
    ///
    /// # Errors
    ///
    /// `WouldBlock` if the queue is empty; `Invalid` as for [`Queue::pop`].
    pub fn try_pop(&self, buf: &mut [u8]) -> TierResult<usize> {
        self.pop_inner(buf, Wait::NonBlock)
    }

    /// Like [`Queue::pop`], but waits at most `timeout` for a record.
    ///
    /// # Errors
    ///
    /// `WouldBlock` if no record arrived within the timeout; `Invalid` as
    /// for [`Queue::pop`].
    pub fn pop_timeout(&self, buf: &mut [u8], timeout: Duration) -> TierResult<usize> {
        self.pop_inner(buf, Wait::Deadline(timeout))
    }

    /// Unmaps the queue and unlinks its shared name if this handle created
    /// it. Must not race with concurrent operations on any handle.
    pub fn destroy(self) {
        drop(self);
    }

    fn push_inner(&self, record: &[u8], wait: bool) -> TierResult<()> {
        let header = self.header;
        let record_max = unsafe { (*header).record_max };
        if record.is_empty() {
            return Err(TierError::invalid("cannot push an empty record"));
        }
        if record.len() > record_max {
            return Err(TierError::invalid(format!(
                "record of {} bytes exceeds record_max {record_max}",
                record.len()
            )));
        }

        unsafe {
            lock(ptr::addr_of_mut!((*header).tail_mutex));
            lock(ptr::addr_of_mut!((*header).size_mutex));
            while (*header).cur_size == (*header).capacity {
                if !wait {
                    unlock(ptr::addr_of_mut!((*header).size_mutex));
                    unlock(ptr::addr_of_mut!((*header).tail_mutex));
                    return Err(TierError::WouldBlock);
                }
                libc::pthread_cond_wait(
                    ptr::addr_of_mut!((*header).fullness_cond),
                    ptr::addr_of_mut!((*header).size_mutex),
                );
            }
            unlock(ptr::addr_of_mut!((*header).size_mutex));

            let slot = self.buf.add((*header).tail);
            ptr::write_unaligned(slot.cast::<usize>(), record.len());
            ptr::copy_nonoverlapping(
                record.as_ptr(),
                slot.add(std::mem::size_of::<usize>()),
                record.len(),
            );
            (*header).tail = ((*header).tail + slot_size(record_max)) % (*header).buf_size;

            lock(ptr::addr_of_mut!((*header).size_mutex));
            (*header).cur_size += 1;
            if (*header).cur_size == 1 {
                libc::pthread_cond_broadcast(ptr::addr_of_mut!((*header).emptiness_cond));
            }
            unlock(ptr::addr_of_mut!((*header).size_mutex));
            unlock(ptr::addr_of_mut!((*header).tail_mutex));
        }

        Ok(())
    }

    fn pop_inner(&self, buf: &mut [u8], wait: Wait) -> TierResult<usize> {
        let header = self.header;

        unsafe {
            lock(ptr::addr_of_mut!((*header).head_mutex));
            lock(ptr::addr_of_mut!((*header).size_mutex));
            let deadline = wait.deadline();
            while (*header).cur_size == 0 {
                let timed_out = match (&wait, &deadline) {
                    (Wait::NonBlock, _) => true,
                    (Wait::Block, _) => {
                        libc::pthread_cond_wait(
                            ptr::addr_of_mut!((*header).emptiness_cond),
                            ptr::addr_of_mut!((*header).size_mutex),
                        );
                        false
                    }
                    (Wait::Deadline(_), Some(ts)) => {
                        libc::pthread_cond_timedwait(
                            ptr::addr_of_mut!((*header).emptiness_cond),
                            ptr::addr_of_mut!((*header).size_mutex),
                            ts,
                        ) == libc::ETIMEDOUT
                            && (*header).cur_size == 0
                    }
                    (Wait::Deadline(_), None) => true,
                };
                if timed_out {
                    unlock(ptr::addr_of_mut!((*header).size_mutex));
                    unlock(ptr::addr_of_mut!((*header).head_mutex));
                    return Err(TierError::WouldBlock);
                }
            }
            unlock(ptr::addr_of_mut!((*header).size_mutex));

            let record_max = (*header).record_max;
            let slot = self.buf.add((*header).head);
            let len = ptr::read_unaligned(slot.cast::<usize>());
            if buf.len() < len {
                unlock(ptr::addr_of_mut!((*header).head_mutex));
                return Err(TierError::invalid(format!(
                    "pop buffer of {} bytes cannot hold the {len}-byte head record",
                    buf.len()
                )));
            }
            ptr::copy_nonoverlapping(
                slot.add(std::mem::size_of::<usize>()),
                buf.as_mut_ptr(),
                len,
            );
            (*header).head = ((*header).head + slot_size(record_max)) % (*header).buf_size;

            lock(ptr::addr_of_mut!((*header).size_mutex));
            if (*header).cur_size == (*header).capacity {
                libc::pthread_cond_broadcast(ptr::addr_of_mut!((*header).fullness_cond));
            }
            (*header).cur_size -= 1;
            unlock(ptr::addr_of_mut!((*header).size_mutex));
            unlock(ptr::addr_of_mut!((*header).head_mutex));

            Ok(len)
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        unsafe {
            if let Some(name) = &self.owned_name {
                if libc::shm_unlink(name.as_ptr()) != 0 {
                    tracing::warn!(
                        name = %name.to_string_lossy(),
                        error = %std::io::Error::last_os_error(),
                        "failed to unlink shared-memory object"
                    );
                }
            }
            let total = (*self.header).total_size;
            if libc::munmap(self.header.cast(), total) != 0 {
                tracing::warn!(
                    error = %std::io::Error::last_os_error(),
                    "failed to unmap queue region"
                );
            }
        }
    }
}

enum Wait {
    Block,
    NonBlock,
    Deadline(Duration),
}

impl Wait {
    /// Absolute CLOCK_REALTIME deadline for the timed variant.
    fn deadline(&self) -> Option<libc::timespec> {
        let Wait::Deadline(timeout) = self else {
            return None;
        };
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
            return None;
        }
        let nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        Some(libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + nanos / 1_000_000_000,
            tv_nsec: nanos % 1_000_000_000,
        })
    }
}

fn slot_size(record_max: usize) -> usize {
    std::mem::size_of::<usize>() + record_max
}

fn round_up(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

fn page_size() -> TierResult<usize> {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
        return Err(TierError::last_os_error("sysconf"));
    }
    Ok(page as usize)
}

fn validate_shm_name(name: &str) -> TierResult<CString> {
    if !name.starts_with('/') || name.len() < 2 || name[1..].contains('/') {
        return Err(TierError::invalid(format!(
            "shared-memory name `{name}` must be of the form `/name`"
        )));
    }
    if name.len() > SHM_NAME_MAX {
        return Err(TierError::invalid(format!(
            "shared-memory name `{name}` exceeds {SHM_NAME_MAX} bytes"
        )));
    }
    CString::new(name).map_err(|_| TierError::invalid("shared-memory name contains NUL"))
}

fn map_private(total_size: usize) -> TierResult<*mut libc::c_void> {
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            total_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(TierError::resource_exhausted(format!(
            "mmap of {total_size} bytes: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(base)
}

fn create_shared(name: &CString, total_size: usize) -> TierResult<*mut libc::c_void> {
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o666,
        )
    };
    if fd < 0 {
        return Err(TierError::resource_exhausted(format!(
            "shm_open(`{}`): {}",
            name.to_string_lossy(),
            std::io::Error::last_os_error()
        )));
    }

    if unsafe { libc::ftruncate(fd, total_size as libc::off_t) } != 0 {
        let err = TierError::resource_exhausted(format!(
            "ftruncate of shared object to {total_size} bytes: {}",
            std::io::Error::last_os_error()
        ));
        unsafe {
            libc::close(fd);
            libc::shm_unlink(name.as_ptr());
        }
        return Err(err);
    }

    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            total_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        let err = TierError::resource_exhausted(format!(
            "mmap of shared object: {}",
            std::io::Error::last_os_error()
        ));
        unsafe {
            libc::close(fd);
            libc::shm_unlink(name.as_ptr());
        }
        return Err(err);
    }

    unsafe { libc::close(fd) };
    Ok(base)
}

/// Initializes the header's mutexes and condition variables in place, with
/// process-shared attributes when the region is a shared mapping.
unsafe fn init_sync(header: *mut Header, shared: bool) {
    let mut mutex_attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    let mut cond_attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
    libc::pthread_mutexattr_init(mutex_attr.as_mut_ptr());
    libc::pthread_condattr_init(cond_attr.as_mut_ptr());
    if shared {
        libc::pthread_mutexattr_setpshared(mutex_attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_condattr_setpshared(cond_attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
    }

    libc::pthread_mutex_init(ptr::addr_of_mut!((*header).head_mutex), mutex_attr.as_ptr());
    libc::pthread_mutex_init(ptr::addr_of_mut!((*header).tail_mutex), mutex_attr.as_ptr());
    libc::pthread_mutex_init(ptr::addr_of_mut!((*header).size_mutex), mutex_attr.as_ptr());
    libc::pthread_cond_init(ptr::addr_of_mut!((*header).emptiness_cond), cond_attr.as_ptr());
    libc::pthread_cond_init(ptr::addr_of_mut!((*header).fullness_cond), cond_attr.as_ptr());

    libc::pthread_mutexattr_destroy(mutex_attr.as_mut_ptr());
    libc::pthread_condattr_destroy(cond_attr.as_mut_ptr());
}

unsafe fn lock(mutex: *mut libc::pthread_mutex_t) {
    libc::pthread_mutex_lock(mutex);
}

unsafe fn unlock(mutex: *mut libc::pthread_mutex_t) {
    libc::pthread_mutex_unlock(mutex);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn round_trip_in_fifo_order() {
        let queue = Queue::init(3, 20, None).unwrap();

        queue.push(b"Hello, World!").unwrap();
        queue.push(b"This is me.").unwrap();
        queue.push(b"Let's play a game.").unwrap();

        let err = queue.try_push(b"Don't be so shy.").unwrap_err();
        assert!(err.is_would_block());

        let mut buf = [0u8; 20];
        let n = queue.pop(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello, World!");
        let n = queue.pop(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"This is me.");
        let n = queue.pop(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Let's play a game.");

        assert!(queue.try_pop(&mut buf).unwrap_err().is_would_block());
    }

    #[test]
    fn record_of_exactly_record_max_fits() {
        let queue = Queue::init(2, 8, None).unwrap();
        queue.push(&[7u8; 8]).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(queue.pop(&mut buf).unwrap(), 8);
        assert_eq!(buf, [7u8; 8]);
    }

    #[test]
    fn oversized_record_is_rejected() {
        let queue = Queue::init(2, 8, None).unwrap();
        let err = queue.push(&[0u8; 9]).unwrap_err();
        assert!(matches!(err, TierError::Invalid { .. }));
        assert!(queue.is_empty());
    }

    #[test]
    fn empty_record_is_rejected() {
        let queue = Queue::init(2, 8, None).unwrap();
        assert!(matches!(
            queue.push(b"").unwrap_err(),
            TierError::Invalid { .. }
        ));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(Queue::init(0, 8, None).is_err());
        assert!(Queue::init(8, 0, None).is_err());
    }

    #[test]
    fn short_pop_buffer_keeps_the_record() {
        let queue = Queue::init(2, 32, None).unwrap();
        queue.push(b"twelve bytes").unwrap();

        let mut small = [0u8; 4];
        assert!(matches!(
            queue.pop(&mut small).unwrap_err(),
            TierError::Invalid { .. }
        ));

        // The record must still be there, intact.
        let mut buf = [0u8; 32];
        let n = queue.try_pop(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"twelve bytes");
    }

    #[test]
    fn wraps_around_the_circular_buffer() {
        let queue = Queue::init(2, 16, None).unwrap();
        let mut buf = [0u8; 16];

        for round in 0u8..10 {
            queue.push(&[round; 5]).unwrap();
            queue.push(&[round; 7]).unwrap();
            assert_eq!(queue.pop(&mut buf).unwrap(), 5);
            assert_eq!(&buf[..5], &[round; 5]);
            assert_eq!(queue.pop(&mut buf).unwrap(), 7);
            assert_eq!(&buf[..7], &[round; 7]);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn size_stays_within_bounds_under_concurrency() {
        let queue = Arc::new(Queue::init(4, 16, None).unwrap());
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 0u16..500 {
                    queue.push(&i.to_le_bytes()).unwrap();
                    let n = queue.len();
                    assert!(n <= queue.capacity());
                }
            })
        };
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let mut buf = [0u8; 16];
                for i in 0u16..500 {
                    let n = queue.pop(&mut buf).unwrap();
                    assert_eq!(n, 2);
                    assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), i);
                }
            })
        };
        producer.join().unwrap();
        consumer.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn blocking_push_resumes_after_pop() {
        let queue = Arc::new(Queue::init(1, 8, None).unwrap());
        queue.push(b"first").unwrap();

        let blocked = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.push(b"second"))
        };
        std::thread::sleep(Duration::from_millis(50));

        let mut buf = [0u8; 8];
        assert_eq!(queue.pop(&mut buf).unwrap(), 5);
        blocked.join().unwrap().unwrap();
        assert_eq!(queue.pop(&mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"second");
    }

    #[test]
    fn pop_timeout_expires_on_an_empty_queue() {
        let queue = Queue::init(1, 8, None).unwrap();
        let mut buf = [0u8; 8];

        let started = Instant::now();
        let err = queue
            .pop_timeout(&mut buf, Duration::from_millis(100))
            .unwrap_err();
        assert!(err.is_would_block());
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn pop_timeout_returns_early_when_a_record_arrives() {
        let queue = Arc::new(Queue::init(1, 8, None).unwrap());
        let popper = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let mut buf = [0u8; 8];
                queue.pop_timeout(&mut buf, Duration::from_secs(5)).unwrap()
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        queue.push(b"wake").unwrap();
        assert_eq!(popper.join().unwrap(), 4);
    }

    #[test]
    fn shared_queue_create_attach_and_unlink() {
        let name = format!("/tierfs-test-{}", std::process::id());
        let queue = Queue::init(4, 64, Some(&name)).unwrap();

        let attached = Queue::attach(&name).unwrap();
        attached.push(b"/mnt/data/cold").unwrap();

        let mut buf = [0u8; 64];
        let n = queue.try_pop(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"/mnt/data/cold");

        drop(attached);
        queue.destroy();

        // The name is gone once the creator drops.
        assert!(Queue::attach(&name).is_err());
    }

    #[test]
    fn duplicate_shared_name_is_rejected() {
        let name = format!("/tierfs-test-dup-{}", std::process::id());
        let queue = Queue::init(2, 16, Some(&name)).unwrap();
        assert!(Queue::init(2, 16, Some(&name)).is_err());
        queue.destroy();
    }

    #[test]
    fn malformed_shared_names_are_rejected() {
        assert!(Queue::init(2, 16, Some("missing-slash")).is_err());
        assert!(Queue::init(2, 16, Some("/nested/name")).is_err());
        assert!(Queue::init(2, 16, Some("/")).is_err());
    }

    #[test]
    fn destroy_while_idle_is_safe() {
        let queue = Queue::init(2, 16, None).unwrap();
        queue.push(b"leftover").unwrap();
        queue.destroy();
    }
}
