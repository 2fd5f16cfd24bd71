//! A single-threaded I/O event loop for Rust, built on the operating
//! system's readiness facility: kqueue on BSD-family platforms, epoll
//! on Linux.
//!
//! Each [`EventLoop`] owns one OS thread. That thread blocks in the
//! kernel multiplexer, wakes on I/O readiness or on a self-signal
//! pipe, and runs every callback: readiness callbacks for subscribed
//! descriptors, and task callbacks for work handed over from other
//! threads through a cloneable [`Handle`].
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! kestrel-io = "0.1"
//! ```
//!
//! # Example
//!
//! ```
//! use kestrel_io::{EventLoop, Task};
//! use std::sync::mpsc;
//!
//! let mut event_loop = EventLoop::new().unwrap();
//! event_loop.run().unwrap();
//!
//! let handle = event_loop.handle();
//! let (tx, rx) = mpsc::channel();
//!
//! // Runs on the event thread.
//! handle.schedule(Task::new(move |_status| {
//!     tx.send("hello").unwrap();
//! }));
//!
//! assert_eq!(rx.recv().unwrap(), "hello");
//!
//! // Timed work: fire ~10ms from now on the loop's clock.
//! let (tx, rx) = mpsc::channel();
//! handle.schedule(Task::at(handle.now() + 10_000_000, move |_status| {
//!     tx.send(()).unwrap();
//! }));
//!
//! rx.recv().unwrap();
//!
//! // Dropping the loop stops the thread and cancels leftover tasks.
//! drop(event_loop);
//! ```
//!
//! I/O subscriptions deliver readable and writable readiness for a raw
//! descriptor as a single folded callback per loop iteration; see
//! [`Handle::subscribe`].

mod sys;

mod awakener;
mod evloop;
mod poller;
mod ready;
mod scheduler;
mod token;

pub use evloop::{EventLoop, Handle};

pub use poller::{Change, ChangeKind, Filter, Multiplex, PollEvent, Poller, Receipt};

pub use ready::Ready;

pub use scheduler::{Task, TaskStatus};

pub use token::Token;
