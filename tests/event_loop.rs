use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use kestrel_io::{EventLoop, Task, TaskStatus};

#[test]
fn signal_wake() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();

    let handle = event_loop.handle();
    let buf = Arc::new(Mutex::new(String::new()));
    let (tx, rx) = mpsc::channel();

    let worker = {
        let buf = buf.clone();
        thread::spawn(move || {
            handle.schedule(Task::new(move |_| {
                buf.lock().unwrap().push_str("hello");
                tx.send(()).unwrap();
            }));
        })
    };

    rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(*buf.lock().unwrap(), "hello");

    worker.join().unwrap();
}

#[test]
fn tasks_run_in_submission_order() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();

    let handle = event_loop.handle();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    for i in 0..100 {
        let order = order.clone();
        let tx = tx.clone();

        handle.schedule(Task::new(move |status| {
            assert_eq!(status, TaskStatus::RunReady);
            order.lock().unwrap().push(i);
            if i == 99 {
                tx.send(()).unwrap();
            }
        }));
    }

    rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
}

#[test]
fn tasks_queued_before_run_execute_after_start() {
    let mut event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let (tx, rx) = mpsc::channel();

    handle.schedule(Task::new(move |_| {
        tx.send(()).unwrap();
    }));

    event_loop.run().unwrap();

    rx.recv_timeout(Duration::from_secs(1)).unwrap();
}

#[test]
fn timers_fire_in_deadline_order() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();

    let handle = event_loop.handle();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    let base = handle.now();

    // Deliberately out of order: 50ms, 10ms, 30ms.
    for &delay in &[50_000_000u64, 10_000_000, 30_000_000] {
        let fired = fired.clone();
        let tx = tx.clone();
        let handle_in_task = handle.clone();

        handle.schedule(Task::at(base + delay, move |status| {
            assert_eq!(status, TaskStatus::RunReady);
            assert!(handle_in_task.now() >= base + delay);

            let mut fired = fired.lock().unwrap();
            fired.push(delay);
            if fired.len() == 3 {
                tx.send(()).unwrap();
            }
        }));
    }

    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(
        *fired.lock().unwrap(),
        vec![10_000_000, 30_000_000, 50_000_000]
    );
}

#[test]
fn stop_exits_within_one_wake() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();

    // Give the thread time to park inside the multiplexer.
    thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    event_loop.stop();
    event_loop.join().unwrap();

    // The default poll timeout is 100s; anything close to immediate
    // proves the self-signal wake worked.
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn stop_from_another_thread() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();

    let handle = event_loop.handle();
    let stopper = thread::spawn(move || {
        handle.stop();
    });

    stopper.join().unwrap();
    event_loop.join().unwrap();
}

#[test]
fn stop_from_a_task_callback() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();

    let handle = event_loop.handle();
    let in_task = handle.clone();
    let (tx, rx) = mpsc::channel();

    handle.schedule(Task::new(move |_| {
        in_task.stop();
        tx.send(()).unwrap();
    }));

    rx.recv_timeout(Duration::from_secs(1)).unwrap();
    event_loop.join().unwrap();
}

#[test]
fn stop_is_idempotent() {
    let mut event_loop = EventLoop::new().unwrap();

    // Not running yet: a no-op.
    event_loop.stop();

    event_loop.run().unwrap();
    event_loop.stop();
    event_loop.stop();
    event_loop.join().unwrap();

    // Already joined: a no-op again.
    event_loop.stop();
}

#[test]
fn run_twice_is_refused_but_restart_works() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();
    assert!(event_loop.run().is_err());

    event_loop.stop();
    event_loop.join().unwrap();

    // A joined loop is idle again and may be restarted.
    event_loop.run().unwrap();

    let (tx, rx) = mpsc::channel();
    event_loop.handle().schedule(Task::new(move |_| {
        tx.send(()).unwrap();
    }));
    rx.recv_timeout(Duration::from_secs(1)).unwrap();

    event_loop.stop();
    event_loop.join().unwrap();
}

#[test]
fn join_requires_stop() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();

    assert!(event_loop.join().is_err());

    event_loop.stop();
    event_loop.join().unwrap();
}

#[test]
fn on_event_thread_detection() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();

    let handle = event_loop.handle();
    assert!(!handle.on_event_thread());

    let in_task = handle.clone();
    let (tx, rx) = mpsc::channel();

    handle.schedule(Task::new(move |_| {
        tx.send(in_task.on_event_thread()).unwrap();
    }));

    assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
}

#[test]
fn destroy_cancels_queued_tasks() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();
    event_loop.stop();
    event_loop.join().unwrap();

    // The loop is down; these pile up in the inbox.
    let handle = event_loop.handle();
    let canceled = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let canceled = canceled.clone();
        handle.schedule(Task::new(move |status| {
            assert_eq!(status, TaskStatus::Canceled);
            canceled.fetch_add(1, Ordering::SeqCst);
        }));
    }

    drop(event_loop);

    assert_eq!(canceled.load(Ordering::SeqCst), 100);
}

#[test]
fn destroy_cancels_pending_timers() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();

    let handle = event_loop.handle();
    let canceled = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    {
        let canceled = canceled.clone();
        handle.schedule(Task::at(handle.now() + 3_600_000_000_000, move |status| {
            assert_eq!(status, TaskStatus::Canceled);
            canceled.store(true, Ordering::SeqCst);
        }));
    }

    // A marker task proves the timer reached the scheduler.
    handle.schedule(Task::new(move |_| {
        tx.send(()).unwrap();
    }));
    rx.recv_timeout(Duration::from_secs(1)).unwrap();

    drop(event_loop);

    assert!(canceled.load(Ordering::SeqCst));
}

#[test]
fn canceled_task_may_schedule_a_follow_up() {
    let mut event_loop = EventLoop::new().unwrap();
    event_loop.run().unwrap();
    event_loop.stop();
    event_loop.join().unwrap();

    let handle = event_loop.handle();
    let follow_up_canceled = Arc::new(AtomicBool::new(false));

    {
        let handle = handle.clone();
        let follow_up_canceled = follow_up_canceled.clone();

        event_loop.handle().schedule(Task::new(move |status| {
            assert_eq!(status, TaskStatus::Canceled);

            handle.schedule(Task::new(move |status| {
                assert_eq!(status, TaskStatus::Canceled);
                follow_up_canceled.store(true, Ordering::SeqCst);
            }));
        }));
    }

    drop(event_loop);

    assert!(follow_up_canceled.load(Ordering::SeqCst));
}
