//! The asynchronous block reader: one `io_uring` ring per opened file, driven by a single
//! dedicated worker thread, fed by a cross-thread pending queue.
//!
//! One file, fixed-size reads keyed by a block number, a buffer handed to the kernel and handed
//! back on completion: `O_DIRECT`-friendly page-aligned buffers, an offset computed as
//! `block_no * BLOCK_SIZE`, the kernel filling the buffer in place. This module drives the raw
//! `io-uring` crate directly rather than through an async wrapper, because the worker loop needs
//! manual control over submission-queue-full retries, fixed-file registration, and partial-read
//! resubmission that an async wrapper would hide.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use io_uring::{opcode, types, IoUring};
use tracing::{debug, error, warn};

use crate::buffer::BlockBuf;
use crate::config::defaults::BLOCK_SIZE;
use crate::error::PagerError;
use crate::metrics::{error_inc, ErrorKind};

pub type ReadResult = Result<BlockBuf, PagerError>;

/// Typed callback interface invoked exactly once per [`BlockReader::read`]. `user_data` is an
/// opaque, caller-assigned tag identifying which request this is.
pub trait OnComplete: Send + Sync {
    fn on_complete(&self, result: ReadResult, user_data: u64);
}

/// A boxed closure also implements [`OnComplete`], for callers that don't want to name a type.
impl<F> OnComplete for F
where
    F: Fn(ReadResult, u64) + Send + Sync,
{
    fn on_complete(&self, result: ReadResult, user_data: u64) {
        self(result, user_data)
    }
}

enum Doorbell {
    Work,
    Shutdown,
}

struct PendingRequest {
    offset: u64,
    length: u32,
    filled: u32,
    buf: BlockBuf,
    callback: Arc<dyn OnComplete>,
    user_data: u64,
    iovec: libc::iovec,
}

impl PendingRequest {
    fn remaining_iovec(&mut self) -> libc::iovec {
        // SAFETY: `buf` outlives the iovec; `filled` is always <= `length` <= `buf.len()`.
        let base = unsafe { self.buf.as_mut_slice().as_mut_ptr().add(self.filled as usize) };
        libc::iovec {
            iov_base: base as *mut libc::c_void,
            iov_len: (self.length - self.filled) as usize,
        }
    }
}

/// One instance per opened file.
pub struct BlockReader {
    file: File,
    doorbell_tx: mpsc::Sender<Doorbell>,
    pending: Arc<Mutex<VecDeque<PendingRequest>>>,
    closed: Arc<AtomicBool>,
    fatal_error: Arc<Mutex<Option<String>>>,
    tag_counter: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl BlockReader {
    /// Open `path` read-only and spawn the worker thread that owns the ring.
    pub fn open(path: &Path, ring_queue_size: u32) -> Result<Self, PagerError> {
        let file = File::open(path)?;
        let fd = file.as_raw_fd();

        let mut ring = IoUring::new(ring_queue_size).map_err(PagerError::from)?;
        ring.submitter()
            .register_files(&[fd])
            .map_err(PagerError::from)?;

        let (doorbell_tx, doorbell_rx) = mpsc::channel();
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let fatal_error = Arc::new(Mutex::new(None));

        let worker_pending = Arc::clone(&pending);
        let worker_closed = Arc::clone(&closed);
        let worker_fatal = Arc::clone(&fatal_error);
        let worker_doorbell_tx = doorbell_tx.clone();

        let worker = std::thread::Builder::new()
            .name("blockpager-reader".to_string())
            .spawn(move || {
                worker_loop(
                    ring,
                    doorbell_rx,
                    worker_doorbell_tx,
                    worker_pending,
                    worker_closed,
                    worker_fatal,
                );
            })
            .expect("spawning the block reader worker thread should not fail");

        Ok(BlockReader {
            file,
            doorbell_tx,
            pending,
            closed,
            fatal_error,
            tag_counter: Arc::new(AtomicU64::new(1)),
            worker: Some(worker),
        })
    }

    /// Enqueue a read of `length` bytes at `offset`. `callback` fires exactly once, from the
    /// worker thread, with either the filled buffer or the error that ended the read.
    pub fn read(
        &self,
        offset: u64,
        length: u32,
        callback: Arc<dyn OnComplete>,
        user_data: u64,
    ) -> Result<(), PagerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PagerError::InvalidFileDescriptor);
        }

        let tag = self.tag_counter.fetch_add(1, Ordering::Relaxed);
        let mut buf = BlockBuf::alloc(length as usize);
        let iovec = {
            // SAFETY: exclusive access, buffer was just allocated.
            let slice = unsafe { buf.as_mut_slice() };
            libc::iovec {
                iov_base: slice.as_mut_ptr() as *mut libc::c_void,
                iov_len: slice.len(),
            }
        };
        let request = PendingRequest {
            offset,
            length,
            filled: 0,
            buf,
            callback,
            user_data,
            iovec,
        };

        self.pending
            .lock()
            .expect("pending queue mutex is never held across a panic")
            .push_back(RequestEntry { tag, request });

        let _ = self.doorbell_tx.send(Doorbell::Work);
        Ok(())
    }

    /// Convenience for the pager's same-block load path: read exactly one [`BLOCK_SIZE`]-sized
    /// block at `block_no`.
    pub fn read_block(
        &self,
        block_no: u64,
        callback: Arc<dyn OnComplete>,
        user_data: u64,
    ) -> Result<(), PagerError> {
        self.read(block_no * BLOCK_SIZE, BLOCK_SIZE as u32, callback, user_data)
    }

    /// Signal the worker to drain in-flight work and shut down, then join it.
    pub fn close(mut self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.doorbell_tx.send(Doorbell::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    /// The fatal error recorded by the worker, if it has terminated abnormally.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal_error.lock().unwrap().clone()
    }
}

impl Drop for BlockReader {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.doorbell_tx.send(Doorbell::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        let _ = &self.file;
    }
}

/// A pending request tagged with the `user_data` value installed on its `io_uring` SQE, used to
/// correlate completions back to the right request.
struct RequestEntry {
    tag: u64,
    request: PendingRequest,
}

fn worker_loop(
    mut ring: IoUring,
    doorbell_rx: mpsc::Receiver<Doorbell>,
    doorbell_tx: mpsc::Sender<Doorbell>,
    pending: Arc<Mutex<VecDeque<RequestEntry>>>,
    closed: Arc<AtomicBool>,
    fatal_error: Arc<Mutex<Option<String>>>,
) {
    // Boxed so the iovec's address stays stable across HashMap resizes: the SQE built in
    // `drain_pending_into_ring` points at `request.iovec`, and that pointer must stay valid until
    // the kernel processes the submission.
    let mut in_flight: HashMap<u64, Box<PendingRequest>> = HashMap::new();
    let mut shutting_down = false;

    loop {
        if in_flight.is_empty() && pending.lock().unwrap().is_empty() {
            if shutting_down {
                break;
            }
            match doorbell_rx.recv() {
                Ok(Doorbell::Work) => {}
                Ok(Doorbell::Shutdown) => {
                    shutting_down = true;
                    continue;
                }
                Err(_) => break,
            }
        } else {
            while let Ok(msg) = doorbell_rx.try_recv() {
                if matches!(msg, Doorbell::Shutdown) {
                    shutting_down = true;
                }
            }
        }

        drain_pending_into_ring(&mut ring, &pending, &mut in_flight, &doorbell_tx);

        let want = if in_flight.is_empty() { 0 } else { 1 };
        match ring.submit_and_wait(want) {
            Ok(_) => {}
            Err(e) if is_transient(&e) => {
                warn!(error = %e, "transient io_uring submission error, retrying");
                error_inc(ErrorKind::RingSubmit);
                let _ = doorbell_tx.send(Doorbell::Work);
                continue;
            }
            Err(e) => {
                error!(error = %e, "fatal io_uring submission error, worker terminating");
                *fatal_error.lock().unwrap() = Some(e.to_string());
                fail_all_in_flight(&mut in_flight, PagerError::from(e));
                break;
            }
        }

        process_completions(&mut ring, &mut in_flight, &mut pending.lock().unwrap(), &doorbell_tx);
    }

    fail_all_in_flight(&mut in_flight, PagerError::InvalidFileDescriptor);
    let mut queue = pending.lock().unwrap();
    while let Some(entry) = queue.pop_front() {
        entry
            .request
            .callback
            .on_complete(Err(PagerError::InvalidFileDescriptor), entry.request.user_data);
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::EINTR)
    )
}

fn drain_pending_into_ring(
    ring: &mut IoUring,
    pending: &Arc<Mutex<VecDeque<RequestEntry>>>,
    in_flight: &mut HashMap<u64, Box<PendingRequest>>,
    doorbell_tx: &mpsc::Sender<Doorbell>,
) {
    let mut queue = pending.lock().unwrap();
    while let Some(entry) = queue.pop_front() {
        // Box first, so the SQE's pointer targets the final, stable heap address: once built,
        // that pointer must stay valid until the kernel processes this submission, and a plain
        // `HashMap<u64, PendingRequest>` value can be relocated by a later insert's resize.
        let mut boxed = Box::new(entry.request);
        boxed.iovec = boxed.remaining_iovec();
        let sqe = opcode::Readv::new(types::Fixed(0), &boxed.iovec as *const libc::iovec, 1)
            .offset(boxed.offset + boxed.filled as u64)
            .build()
            .user_data(entry.tag);

        // SAFETY: `boxed.iovec` lives at a stable heap address for as long as `boxed` (or the
        // `in_flight` entry it becomes) is alive, which outlasts this submission.
        let push_result = unsafe { ring.submission().push(&sqe) };

        match push_result {
            Ok(()) => {
                in_flight.insert(entry.tag, boxed);
            }
            Err(_queue_full) => {
                debug!("submission queue full, deferring request");
                queue.push_front(RequestEntry {
                    tag: entry.tag,
                    request: *boxed,
                });
                let _ = doorbell_tx.send(Doorbell::Work);
                break;
            }
        }
    }
}

fn process_completions(
    ring: &mut IoUring,
    in_flight: &mut HashMap<u64, Box<PendingRequest>>,
    pending: &mut VecDeque<RequestEntry>,
    doorbell_tx: &mpsc::Sender<Doorbell>,
) {
    let completed: Vec<(u64, i32)> = ring
        .completion()
        .map(|cqe| (cqe.user_data(), cqe.result()))
        .collect();

    for (tag, result) in completed {
        let Some(request) = in_flight.remove(&tag) else {
            continue;
        };
        // Unbox: the kernel is done with this request's iovec the moment its completion queue
        // entry appears, so the address no longer needs to be pinned.
        let mut request = *request;

        if result < 0 {
            let err = PagerError::from_errno(-result);
            error_inc(ErrorKind::Io);
            request.callback.on_complete(Err(err), request.user_data);
            continue;
        }

        if result == 0 {
            request.callback.on_complete(Err(PagerError::EndOfFile), request.user_data);
            continue;
        }

        request.filled += result as u32;
        if request.filled < request.length {
            // Short read: resubmit the remainder.
            pending.push_back(RequestEntry {
                tag,
                request,
            });
            let _ = doorbell_tx.send(Doorbell::Work);
            continue;
        }

        request.buf.mark_read_only();
        request.callback.on_complete(Ok(request.buf), request.user_data);
    }
}

fn fail_all_in_flight(in_flight: &mut HashMap<u64, Box<PendingRequest>>, err: PagerError) {
    for (_, request) in in_flight.drain() {
        request.callback.on_complete(Err(err), request.user_data);
    }
}
