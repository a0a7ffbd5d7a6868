//! Private event loop on a dedicated thread.
//!
//! Each [`EventLoopRunner`] owns one single-threaded Tokio runtime driven by a
//! background thread. Synchronous callers hand it units of async work through
//! [`LoopHandle::run_in_loop`] and get back a [`LoopFuture`], which they can
//! block on (with a timeout), poll without blocking, or cancel. Callers never
//! touch loop-internal state; results only cross threads through the future.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::LoopError;

/// How long the loop thread waits for blocking-pool work when shutting down.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);

enum Slot<T> {
    Pending,
    Ready(Result<T, LoopError>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    fired: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, result: Result<T, LoopError>) {
        let mut slot = self.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Ready(result);
            self.fired.notify_all();
        }
    }
}

/// Publishes the unit's result; if the unit is dropped before finishing
/// (aborted, or the loop shut down), publishes `Cancelled` instead.
struct Completion<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Completion<T> {
    fn complete(&mut self, result: Result<T, LoopError>) {
        if let Some(shared) = self.shared.take() {
            shared.complete(result);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Err(LoopError::Cancelled));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// Result of a unit of loop work, retrievable from any thread.
pub struct LoopFuture<T> {
    shared: Arc<Shared<T>>,
    abort: Option<AbortHandle>,
}

impl<T> LoopFuture<T> {
    /// Whether the unit has finished (successfully, with an error, or cancelled).
    pub fn is_fired(&self) -> bool {
        !matches!(*self.shared.lock(), Slot::Pending)
    }

    fn take(slot: &mut Slot<T>) -> Result<T, LoopError> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(result) => result,
            Slot::Taken => Err(LoopError::AlreadyTaken),
            Slot::Pending => {
                *slot = Slot::Pending;
                Err(LoopError::NotFired)
            }
        }
    }

    /// Take the result without blocking. Fails with `NotFired` if the unit is
    /// still running.
    pub fn extract(&self) -> Result<T, LoopError> {
        Self::take(&mut self.shared.lock())
    }

    /// Block the calling thread until the unit finishes or `timeout` passes.
    ///
    /// On timeout the unit keeps running; call [`cancel`](Self::cancel) to
    /// stop it.
    pub fn wait(&self, timeout: Duration) -> Result<T, LoopError> {
        // Too far out to represent: no limit.
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.join();
        };
        let mut slot = self.shared.lock();
        while matches!(*slot, Slot::Pending) {
            let now = Instant::now();
            if now >= deadline {
                return Err(LoopError::WaitTimedOut(timeout));
            }
            slot = self
                .shared
                .fired
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Self::take(&mut slot)
    }

    /// Block until the unit finishes, however long that takes.
    pub fn join(&self) -> Result<T, LoopError> {
        let mut slot = self.shared.lock();
        while matches!(*slot, Slot::Pending) {
            slot = self.shared.fired.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
        Self::take(&mut slot)
    }

    /// Abort the unit at its next suspension point. It then resolves to
    /// `Cancelled` unless it already finished.
    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

impl<T> std::fmt::Debug for LoopFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.shared.lock() {
            Slot::Pending => "pending",
            Slot::Ready(Ok(_)) => "succeeded",
            Slot::Ready(Err(_)) => "failed",
            Slot::Taken => "taken",
        };
        f.debug_struct("LoopFuture").field("state", &state).finish()
    }
}

/// Cheap, cloneable handle for scheduling work on a running loop.
#[derive(Clone)]
pub struct LoopHandle {
    name: Arc<str>,
    runtime: Handle,
    closed: Arc<AtomicBool>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Schedule `fut` on the loop thread.
    ///
    /// `fut` is built on the calling thread, which has no runtime: pass a lazy
    /// `async` block, not a future that registers with a reactor when
    /// constructed (`tokio::time::sleep(..)` called directly panics here).
    pub fn run_in_loop<F>(&self, fut: F) -> Result<LoopFuture<F::Output>, LoopError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_closed() {
            return Err(LoopError::Stopped(self.name.to_string()));
        }

        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending),
            fired: Condvar::new(),
        });
        let mut completion = Completion {
            shared: Some(shared.clone()),
        };

        let task = self.runtime.spawn(async move {
            let outcome = AssertUnwindSafe(fut).catch_unwind().await;
            completion.complete(outcome.map_err(|p| LoopError::Panicked(panic_message(&*p))));
        });

        Ok(LoopFuture {
            shared,
            abort: Some(task.abort_handle()),
        })
    }

    /// Run `fut` on the loop and block for its result; cancels it if
    /// `timeout` passes first.
    pub fn call<F>(&self, fut: F, timeout: Duration) -> Result<F::Output, LoopError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let pending = self.run_in_loop(fut)?;
        match pending.wait(timeout) {
            Err(LoopError::WaitTimedOut(d)) => {
                pending.cancel();
                Err(LoopError::WaitTimedOut(d))
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct LoopThread {
    handle: LoopHandle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Owner of one private event loop and its thread.
pub struct EventLoopRunner {
    name: String,
    running: Option<LoopThread>,
}

impl EventLoopRunner {
    /// A runner that is not started yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: None,
        }
    }

    /// Create and start a runner.
    pub fn started(name: impl Into<String>) -> Result<Self, LoopError> {
        let mut runner = Self::new(name);
        runner.start()?;
        Ok(runner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bring the loop thread up. No-op when already running.
    pub fn start(&mut self) -> Result<(), LoopError> {
        if self.running.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let loop_name = self.name.clone();

        let thread = thread::Builder::new()
            .name(format!("loop-{}", self.name))
            .spawn(move || {
                let rt = match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(rt.handle().clone()));

                rt.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!(event_loop = %loop_name, "shutting down; dropping pending work");
                // Dropping the runtime drops every unfinished unit.
                rt.shutdown_timeout(SHUTDOWN_DRAIN);
            })?;

        let runtime = match ready_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(LoopError::Io(e));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(LoopError::Stopped(self.name.clone()));
            }
        };

        info!(event_loop = %self.name, "event loop started");
        self.running = Some(LoopThread {
            handle: LoopHandle {
                name: Arc::from(self.name.as_str()),
                runtime,
                closed: Arc::new(AtomicBool::new(false)),
            },
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        });
        Ok(())
    }

    pub fn handle(&self) -> Result<LoopHandle, LoopError> {
        self.running
            .as_ref()
            .map(|t| t.handle.clone())
            .ok_or_else(|| LoopError::NotStarted(self.name.clone()))
    }

    pub fn run_in_loop<F>(&self, fut: F) -> Result<LoopFuture<F::Output>, LoopError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle()?.run_in_loop(fut)
    }

    /// Stop the loop, cancelling pending units, and wait for its thread to
    /// exit. No-op when not running.
    pub fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };

        running.handle.closed.store(true, Ordering::Release);
        if let Some(tx) = running.shutdown.take() {
            let _ = tx.send(());
        }

        if let Some(thread) = running.thread.take() {
            if thread.thread().id() == thread::current().id() {
                warn!(event_loop = %self.name, "stop called from the loop thread; not joining");
                return;
            }
            if thread.join().is_err() {
                warn!(event_loop = %self.name, "event loop thread panicked");
            }
        }
        info!(event_loop = %self.name, "event loop stopped");
    }
}

impl Drop for EventLoopRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for EventLoopRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopRunner")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_work_on_the_loop_thread() {
        let runner = EventLoopRunner::started("unit").unwrap();
        let caller = thread::current().id();

        let fut = runner
            .run_in_loop(async move { thread::current().id() })
            .unwrap();
        let loop_thread = fut.wait(Duration::from_secs(5)).unwrap();

        assert_ne!(loop_thread, caller);
    }

    #[test]
    fn units_share_one_thread() {
        let runner = EventLoopRunner::started("unit").unwrap();
        let a = runner.run_in_loop(async { thread::current().id() }).unwrap();
        let b = runner.run_in_loop(async { thread::current().id() }).unwrap();
        assert_eq!(
            a.wait(Duration::from_secs(5)).unwrap(),
            b.wait(Duration::from_secs(5)).unwrap()
        );
    }

    #[test]
    fn extract_before_and_after_firing() {
        let runner = EventLoopRunner::started("unit").unwrap();
        let (tx, rx) = oneshot::channel::<u32>();
        let fut = runner.run_in_loop(async move { rx.await.unwrap_or(0) + 1 }).unwrap();

        assert!(!fut.is_fired());
        assert!(matches!(fut.extract(), Err(LoopError::NotFired)));

        tx.send(41).unwrap();
        assert_eq!(fut.wait(Duration::from_secs(5)).unwrap(), 42);
        assert!(matches!(fut.extract(), Err(LoopError::AlreadyTaken)));
    }

    #[test]
    fn wait_times_out_and_cancel_resolves() {
        let runner = EventLoopRunner::started("unit").unwrap();
        let fut = runner
            .run_in_loop(async { tokio::time::sleep(Duration::from_secs(60)).await })
            .unwrap();

        let started = Instant::now();
        assert!(matches!(
            fut.wait(Duration::from_millis(100)),
            Err(LoopError::WaitTimedOut(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));

        fut.cancel();
        assert!(matches!(fut.wait(Duration::from_secs(5)), Err(LoopError::Cancelled)));
    }

    #[test]
    fn unrepresentable_timeout_waits_for_the_result() {
        let runner = EventLoopRunner::started("unit").unwrap();
        let fut = runner
            .run_in_loop(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                "done"
            })
            .unwrap();
        assert_eq!(fut.wait(Duration::MAX).unwrap(), "done");

        let handle = runner.handle().unwrap();
        assert_eq!(handle.call(async { 3 }, Duration::MAX).unwrap(), 3);
    }

    #[test]
    fn stop_cancels_pending_units() {
        let mut runner = EventLoopRunner::started("unit").unwrap();
        let fut = runner
            .run_in_loop(async { tokio::time::sleep(Duration::from_secs(60)).await })
            .unwrap();

        runner.stop();
        assert!(!runner.is_running());
        assert!(matches!(fut.wait(Duration::from_secs(5)), Err(LoopError::Cancelled)));
        assert!(matches!(
            runner.run_in_loop(async {}),
            Err(LoopError::NotStarted(_))
        ));
    }

    #[test]
    fn stale_handle_is_rejected_after_stop() {
        let mut runner = EventLoopRunner::started("unit").unwrap();
        let handle = runner.handle().unwrap();
        runner.stop();
        assert!(handle.is_closed());
        assert!(matches!(handle.run_in_loop(async {}), Err(LoopError::Stopped(_))));
    }

    #[test]
    fn panics_are_reported_not_propagated() {
        let runner = EventLoopRunner::started("unit").unwrap();
        let fut = runner
            .run_in_loop(async {
                panic!("boom");
            })
            .unwrap();
        match fut.wait(Duration::from_secs(5)) {
            Err(LoopError::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }

        // The loop keeps serving work afterwards.
        let ok = runner.run_in_loop(async { 7 }).unwrap();
        assert_eq!(ok.wait(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn restart_after_stop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut runner = EventLoopRunner::new("unit");
        assert!(matches!(runner.handle(), Err(LoopError::NotStarted(_))));

        for _ in 0..2 {
            runner.start().unwrap();
            let c = counter.clone();
            let h = runner
                .handle()
                .unwrap()
                .call(async move { c.fetch_add(1, Ordering::SeqCst) }, Duration::from_secs(5));
            assert!(h.is_ok());
            runner.stop();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
