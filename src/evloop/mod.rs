//! The event-thread runtime: lifecycle, cross-thread hand-off, the
//! subscription protocol and the main loop.
//!
//! Each loop owns one OS thread that blocks in the multiplexer, wakes
//! on readiness or on a self-signal byte, dispatches readiness
//! callbacks, drains work submitted from other threads, and runs due
//! tasks. Data is partitioned into a mutex-guarded inbox (the only
//! shared-mutable state) and a thread-private region touched by the
//! event thread alone while the loop runs.

use std::cell::{Cell, UnsafeCell};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use std::{cmp, fmt, io, mem, ptr, thread};

use indexmap::IndexMap;
use log::{debug, trace, warn};
use slab::Slab;

use crate::awakener::Awakener;
use crate::poller::{Change, Filter, Multiplex, PollEvent, Poller, Receipt};
use crate::ready::Ready;
use crate::scheduler::{Scheduler, Task, TaskStatus};
use crate::token::Token;

/// Token reserved for the self-signal pipe's read end.
const WAKER: Token = Token(usize::MAX);

/// Upper bound on kernel events handled per loop iteration.
const MAX_EVENTS: usize = 256;

/// Poll timeout when the scheduler holds nothing due.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(100);

type EventCallback = Box<dyn FnMut(&Handle, RawFd, Ready) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ready,
    Running,
    Stopping,
}

struct Inbox {
    thread_signaled: bool,
    pending: VecDeque<Task>,
    state: State,
}

/// Per-handle bookkeeping tying a descriptor to its callback and its
/// kernel registrations. The slab key doubles as the kernel token, so
/// a live registration always resolves to a live record.
struct Subscription {
    fd: RawFd,
    interest: Ready,
    events_this_loop: Ready,
    kernel_registered: bool,
    /// `None` exactly while the callback is running, which keeps a
    /// reentrant dispatch from entering the same record twice.
    callback: Option<EventCallback>,
}

struct ThreadPrivate {
    mux: Box<dyn Multiplex>,
    scheduler: Scheduler,
    subs: Slab<Subscription>,
    tokens: IndexMap<RawFd, usize>,
    connected_handles: usize,
    state: State,
}

struct Shared {
    inbox: Mutex<Inbox>,
    awakener: Awakener,
    origin: Instant,
    private: UnsafeCell<ThreadPrivate>,
}

// The private region is only reached through `Shared::private`, whose
// callers uphold the single-toucher discipline below; everything in it
// is Send.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    /// The thread-private region.
    ///
    /// # Safety
    ///
    /// The caller must be the event thread while the loop runs, or any
    /// thread while the loop is `Ready` with its thread joined. Borrows
    /// must not be held across user callbacks, which may reenter here.
    #[allow(clippy::mut_from_ref)]
    unsafe fn private(&self) -> &mut ThreadPrivate {
        &mut *self.private.get()
    }
}

thread_local! {
    static CURRENT_LOOP: Cell<*const Shared> = const { Cell::new(ptr::null()) };
}

struct CurrentGuard;

impl CurrentGuard {
    fn enter(shared: &Arc<Shared>) -> CurrentGuard {
        CURRENT_LOOP.with(|current| current.set(Arc::as_ptr(shared)));
        CurrentGuard
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|current| current.set(ptr::null()));
    }
}

/// Cloneable reference to an event loop, usable from any thread,
/// including the loop's own callbacks.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Hands a task to the loop. Tasks submitted by one thread run in
    /// submission order; timed tasks run at or after their deadline.
    pub fn schedule(&self, task: Task) {
        if self.on_event_thread() {
            // Already on the event thread: feed the private scheduler
            // directly. The loop is mid-iteration, so no wake is
            // needed.
            let private = unsafe { self.shared.private() };
            private.scheduler.schedule(task);
            return;
        }

        let wake = {
            let mut inbox = self.shared.inbox.lock().unwrap();
            inbox.pending.push_back(task);
            !mem::replace(&mut inbox.thread_signaled, true)
        };

        if wake {
            self.wake();
        }
    }

    /// Requests termination. Idempotent, non-blocking, and a no-op
    /// unless the loop is running; the thread exits at its next
    /// iteration. Use [`EventLoop::join`] to wait for it.
    pub fn stop(&self) {
        let wake = {
            let mut inbox = self.shared.inbox.lock().unwrap();
            if inbox.state != State::Running {
                return;
            }
            inbox.state = State::Stopping;
            !mem::replace(&mut inbox.thread_signaled, true)
        };

        if wake {
            self.wake();
        }
    }

    /// Watches `fd` for the readiness in `interest` (readable and/or
    /// writable). The callback runs on the event thread, once per loop
    /// iteration with every flag that fired folded into one `Ready`
    /// value.
    ///
    /// Registration happens asynchronously on the event thread. If the
    /// kernel refuses it, the callback fires once with
    /// [`Ready::error`] and the subscription stays inert until
    /// [`unsubscribe`] releases it.
    ///
    /// [`unsubscribe`]: #method.unsubscribe
    pub fn subscribe<F>(&self, fd: RawFd, interest: Ready, callback: F) -> io::Result<()>
    where
        F: FnMut(&Handle, RawFd, Ready) + Send + 'static,
    {
        let interest = interest & (Ready::readable() | Ready::writable());
        if interest.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interest must include readable or writable",
            ));
        }

        let sub = Subscription {
            fd,
            interest,
            events_this_loop: Ready::empty(),
            kernel_registered: false,
            callback: Some(Box::new(callback)),
        };

        let shared = self.shared.clone();
        self.schedule(Task::new(move |status| run_subscribe(&shared, status, sub)));

        Ok(())
    }

    /// Detaches the subscription for `fd` and releases its record on
    /// the event thread. The callback may still fire once more for
    /// events already delivered in the current iteration.
    pub fn unsubscribe(&self, fd: RawFd) {
        let shared = self.shared.clone();
        self.schedule(Task::new(move |status| run_unsubscribe(&shared, status, fd)));
    }

    /// True when the caller is on this loop's event thread.
    pub fn on_event_thread(&self) -> bool {
        CURRENT_LOOP.with(|current| ptr::eq(current.get(), Arc::as_ptr(&self.shared)))
    }

    /// Nanoseconds on the loop's monotonic clock; the base for
    /// [`Task::at`] deadlines.
    pub fn now(&self) -> u64 {
        self.shared.origin.elapsed().as_nanos() as u64
    }

    fn wake(&self) {
        // A full pipe is forgiven inside the awakener (queued bytes
        // already guarantee a wake); anything else breaks the
        // signalling protocol.
        self.shared
            .awakener
            .wake()
            .expect("self-signal pipe write failed");
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Handle")
    }
}

/// A single-threaded I/O event loop.
///
/// The loop owns one OS thread, started by [`run`] and joined by
/// [`join`] after a [`stop`]. All I/O and task callbacks execute on
/// that thread and must not block it. Work is submitted from any
/// thread through a [`Handle`].
///
/// Dropping the loop stops and joins the thread, then invokes every
/// task still held - queued, immediate or timed - exactly once with
/// [`TaskStatus::Canceled`].
///
/// [`run`]: #method.run
/// [`join`]: #method.join
/// [`stop`]: #method.stop
pub struct EventLoop {
    handle: Handle,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Creates a loop over the system multiplexer.
    pub fn new() -> io::Result<EventLoop> {
        EventLoop::with_multiplexer(Box::new(Poller::new()?))
    }

    /// Creates a loop over a caller-supplied multiplexer.
    pub fn with_multiplexer(mut mux: Box<dyn Multiplex>) -> io::Result<EventLoop> {
        is_send::<EventLoop>();
        is_send::<Handle>();
        is_sync::<Handle>();

        let awakener = Awakener::new()?;

        let receipts = mux.submit(&[Change::add(
            awakener.reader_fd(),
            Filter::Readable,
            WAKER,
        )])?;
        if let Some(errno) = receipts.first().and_then(|receipt| receipt.error) {
            return Err(io::Error::from_raw_os_error(errno));
        }

        Ok(EventLoop {
            handle: Handle {
                shared: Arc::new(Shared {
                    inbox: Mutex::new(Inbox {
                        thread_signaled: false,
                        pending: VecDeque::new(),
                        state: State::Ready,
                    }),
                    awakener,
                    origin: Instant::now(),
                    private: UnsafeCell::new(ThreadPrivate {
                        mux,
                        scheduler: Scheduler::new(),
                        subs: Slab::new(),
                        tokens: IndexMap::new(),
                        connected_handles: 0,
                        state: State::Ready,
                    }),
                }),
            },
            thread: None,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Starts the event thread. Fails if the loop is not idle, or if
    /// the thread cannot be spawned (in which case the loop stays
    /// idle).
    pub fn run(&mut self) -> io::Result<()> {
        {
            let mut inbox = self.handle.shared.inbox.lock().unwrap();
            if inbox.state != State::Ready {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "event loop is already running",
                ));
            }
            inbox.state = State::Running;
        }

        {
            // No thread exists yet, so the private region is ours.
            let private = unsafe { self.handle.shared.private() };
            private.state = State::Running;
        }

        let shared = self.handle.shared.clone();
        let spawned = thread::Builder::new()
            .name("event-loop".into())
            .spawn(move || run_loop(&shared));

        match spawned {
            Ok(thread) => {
                self.thread = Some(thread);
                Ok(())
            }
            Err(err) => {
                self.handle.shared.inbox.lock().unwrap().state = State::Ready;
                unsafe { self.handle.shared.private() }.state = State::Ready;
                Err(err)
            }
        }
    }

    /// See [`Handle::stop`].
    pub fn stop(&self) {
        self.handle.stop()
    }

    /// Joins the event thread and returns the loop to idle, after
    /// which it may be run again. Call [`stop`] first: joining a loop
    /// that has not been asked to stop would block forever, so it is
    /// refused.
    ///
    /// [`stop`]: #method.stop
    pub fn join(&mut self) -> io::Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        if self.handle.shared.inbox.lock().unwrap().state == State::Running {
            self.thread = Some(thread);
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "stop the loop before joining it",
            ));
        }

        thread
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "event thread panicked"))?;

        self.handle.shared.inbox.lock().unwrap().state = State::Ready;
        unsafe { self.handle.shared.private() }.state = State::Ready;

        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
        if self.join().is_err() {
            // The event thread panicked; skip the orderly teardown and
            // let the queues drop.
            return;
        }

        // The thread is joined, so the private region is ours again.
        let tasks = {
            let private = unsafe { self.handle.shared.private() };
            private.scheduler.drain_all()
        };
        for task in tasks {
            task.run(TaskStatus::Canceled);
        }

        // Cancelled tasks may schedule follow-ups; with no thread
        // running those land in the inbox, so it drains last, until it
        // stays empty.
        loop {
            let pending = mem::take(&mut self.handle.shared.inbox.lock().unwrap().pending);
            if pending.is_empty() {
                break;
            }
            for task in pending {
                task.run(TaskStatus::Canceled);
            }
        }

        let connected = unsafe { self.handle.shared.private() }.connected_handles;
        assert!(
            connected == 0,
            "subscriptions leaked across event loop teardown"
        );
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "EventLoop")
    }
}

fn run_loop(shared: &Arc<Shared>) {
    let _current = CurrentGuard::enter(shared);
    let handle = Handle {
        shared: shared.clone(),
    };

    let mut events: Vec<PollEvent> = Vec::with_capacity(MAX_EVENTS);
    let mut folded: Vec<usize> = Vec::with_capacity(MAX_EVENTS);
    let mut timeout = DEFAULT_TIMEOUT;

    trace!("event thread running");

    loop {
        {
            // Termination test on the private state copy; only the
            // inbox drain below refreshes it.
            let private = unsafe { shared.private() };
            if private.state != State::Running {
                break;
            }
        }

        let wait_result = {
            let private = unsafe { shared.private() };
            private.mux.wait(&mut events, Some(timeout))
        };

        let mut drain = false;

        if let Err(err) = wait_result {
            // Not fatal; fall through to the inbox in case the wake we
            // missed carried a stop request.
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("multiplexer wait interrupted");
            } else {
                warn!("multiplexer wait failed: {}", err);
            }
            events.clear();
            drain = true;
        }

        folded.clear();

        {
            let private = unsafe { shared.private() };
            for event in &events {
                if event.token == WAKER {
                    drain = true;
                    shared.awakener.drain();
                    continue;
                }

                let ready = event.readiness();
                if ready.is_empty() {
                    continue;
                }

                // A record freed in an earlier iteration had its
                // registrations deleted first, so a stale token cannot
                // reach a reused slab slot.
                let Some(sub) = private.subs.get_mut(event.token.0) else {
                    continue;
                };

                if sub.events_this_loop.is_empty() {
                    folded.push(event.token.0);
                }
                sub.events_this_loop |= ready;
            }
        }

        // One callback per handle, however many filters fired for it.
        for &token in &folded {
            let ready = {
                let private = unsafe { shared.private() };
                match private.subs.get_mut(token) {
                    Some(sub) => mem::replace(&mut sub.events_this_loop, Ready::empty()),
                    None => continue,
                }
            };
            dispatch(&handle, token, ready);
        }

        // Callbacks ran first, so registration changes and tasks they
        // produced are observed by the next iteration's drain, not this
        // one.
        if drain {
            drain_inbox(shared);
        }

        let now = handle.now();

        let due = {
            let private = unsafe { shared.private() };
            private.scheduler.take_due(now)
        };
        for task in due {
            task.run(TaskStatus::RunReady);
        }

        timeout = {
            let private = unsafe { shared.private() };
            next_timeout(private.scheduler.next_deadline(), now)
        };
    }

    trace!("event thread exiting");
}

fn drain_inbox(shared: &Arc<Shared>) {
    let (tasks, state) = {
        let mut inbox = shared.inbox.lock().unwrap();
        // Clearing the flag inside the lock means a write landing after
        // the swap raises a fresh wake.
        inbox.thread_signaled = false;
        (mem::take(&mut inbox.pending), inbox.state)
    };

    let private = unsafe { shared.private() };
    private.state = state;

    for task in tasks {
        private.scheduler.schedule(task);
    }
}

fn next_timeout(deadline: Option<u64>, now: u64) -> Duration {
    match deadline {
        Some(at) => cmp::min(Duration::from_nanos(at.saturating_sub(now)), DEFAULT_TIMEOUT),
        None => DEFAULT_TIMEOUT,
    }
}

/// Invokes a subscription's callback with the callback slot emptied
/// for the duration, so the callback may call back into the loop.
fn dispatch(handle: &Handle, token: usize, ready: Ready) {
    let taken = {
        let private = unsafe { handle.shared.private() };
        private
            .subs
            .get_mut(token)
            .and_then(|sub| sub.callback.take().map(|callback| (callback, sub.fd)))
    };

    let Some((mut callback, fd)) = taken else {
        return;
    };

    callback(handle, fd, ready);

    let private = unsafe { handle.shared.private() };
    if let Some(sub) = private.subs.get_mut(token) {
        sub.callback = Some(callback);
    }
}

/// The deferred half of [`Handle::subscribe`]; runs on the event
/// thread so that installing both filters is atomic with respect to
/// event delivery.
fn run_subscribe(shared: &Arc<Shared>, status: TaskStatus, sub: Subscription) {
    {
        let private = unsafe { shared.private() };
        private.connected_handles += 1;
    }

    if status == TaskStatus::Canceled {
        // Cancelled before it reached the kernel: the record drops
        // here, and the paired unsubscribe only rebalances the count.
        return;
    }

    let failed = {
        let private = unsafe { shared.private() };

        let fd = sub.fd;
        let interest = sub.interest;
        let token = private.subs.insert(sub);
        private.tokens.insert(fd, token);

        let mut changes = Vec::with_capacity(2);
        if interest.is_readable() {
            changes.push(Change::add(fd, Filter::Readable, Token(token)));
        }
        if interest.is_writable() {
            changes.push(Change::add(fd, Filter::Writable, Token(token)));
        }

        match private.mux.submit(&changes) {
            Ok(receipts)
                if receipts.len() == changes.len() && receipts.iter().all(Receipt::is_ok) =>
            {
                private.subs[token].kernel_registered = true;
                trace!("subscribed fd {} for {:?}", fd, interest);
                None
            }
            Ok(receipts) => {
                // Delete whichever filter made it in, so the kernel
                // never holds half of a subscription.
                let rollback: Vec<Change> = changes
                    .iter()
                    .zip(receipts.iter())
                    .filter(|(_, receipt)| receipt.is_ok())
                    .map(|(change, _)| Change::delete(fd, change.filter, Token(token)))
                    .collect();

                if !rollback.is_empty() {
                    if let Err(err) = private.mux.submit(&rollback) {
                        warn!("rollback for fd {} failed: {}", fd, err);
                    }
                }

                warn!("registration failed for fd {}", fd);
                Some((token, fd))
            }
            Err(err) => {
                warn!("registration failed for fd {}: {}", fd, err);
                Some((token, fd))
            }
        }
    };

    if let Some((token, _fd)) = failed {
        // The record stays installed but unregistered; the subscriber
        // hears about it through its own callback and must unsubscribe
        // to release the record.
        let handle = Handle {
            shared: shared.clone(),
        };
        dispatch(&handle, token, Ready::error());
    }
}

/// The deferred half of [`Handle::unsubscribe`].
fn run_unsubscribe(shared: &Arc<Shared>, status: TaskStatus, fd: RawFd) {
    let sub = remove_subscription(shared, status, fd);

    // The record, and the user callback it owns, drops with no borrow
    // of the private region held.
    drop(sub);
}

fn remove_subscription(
    shared: &Arc<Shared>,
    status: TaskStatus,
    fd: RawFd,
) -> Option<Subscription> {
    let private = unsafe { shared.private() };

    debug_assert!(
        private.connected_handles > 0,
        "unsubscribe without a subscribe"
    );
    private.connected_handles -= 1;

    // No entry means the paired subscribe task was itself cancelled
    // and never installed anything.
    let token = private.tokens.swap_remove(&fd)?;
    let sub = private.subs.remove(token);

    if status == TaskStatus::RunReady && sub.kernel_registered {
        let mut changes = Vec::with_capacity(2);
        if sub.interest.is_readable() {
            changes.push(Change::delete(fd, Filter::Readable, Token(token)));
        }
        if sub.interest.is_writable() {
            changes.push(Change::delete(fd, Filter::Writable, Token(token)));
        }

        match private.mux.submit(&changes) {
            Ok(receipts) => {
                for receipt in receipts.iter().filter(|receipt| !receipt.is_ok()) {
                    debug!(
                        "deregistering fd {} ({:?}) failed: errno {}",
                        fd,
                        receipt.filter,
                        receipt.error.unwrap_or(0)
                    );
                }
            }
            Err(err) => debug!("deregistering fd {} failed: {}", fd, err),
        }
    }

    trace!("unsubscribed fd {}", fd);

    Some(sub)
}

fn is_send<T: Send>() {}
fn is_sync<T: Sync>() {}
