//! Execution contexts.
//!
//! Every capability agent owns one [`Executor`]: a dedicated thread that owns
//! the agent's mutable state and runs posted jobs strictly in FIFO order.
//! Nothing else ever touches that state, so agents need no locks of their own.
//! The [`Scheduler`] runs timers as tokio tasks; timer jobs only post back
//! into a [`Mailbox`].

use crate::error::{AgentError, AgentResult};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::runtime::{self, Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time;
use tracing::{debug, error};

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S> {
    Run(Job<S>),
    Shutdown,
}

/// Posting handle into an executor.
pub struct Mailbox<S> {
    name: Arc<str>,
    tx: Sender<Message<S>>,
    thread_id: Arc<OnceLock<ThreadId>>,
}

impl<S> Clone for Mailbox<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            thread_id: self.thread_id.clone(),
        }
    }
}

impl<S: 'static> Mailbox<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a job. Returns `false` once the executor has shut down.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx.send(Message::Run(Box::new(job))).is_ok()
    }

    /// Runs a job on the executor and waits for its result.
    ///
    /// Must not be used from the executor's own thread: the job could never
    /// run while its caller blocks the queue.
    pub fn call<R, F>(&self, job: F, timeout: Duration) -> AgentResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        if self.is_current() {
            return Err(AgentError::Reentrant(self.name.to_string()));
        }
        let (gate, signal) = Gate::pair();
        if !self.post(move |state| signal.fire(job(state))) {
            return Err(AgentError::ExecutorClosed(self.name.to_string()));
        }
        gate.wait(timeout, "executor call")
    }

    /// True when called from the executor thread itself.
    pub fn is_current(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown);
    }
}

/// Single-threaded FIFO execution context owning a state value `S`.
pub struct Executor<S> {
    mailbox: Mailbox<S>,
}

impl<S: Send + 'static> Executor<S> {
    /// Spawns the executor thread. `init` receives the executor's own mailbox so
    /// the state can post follow-up work to itself.
    pub fn spawn_with<F>(name: &str, init: F) -> AgentResult<Self>
    where
        F: FnOnce(Mailbox<S>) -> S,
    {
        let (tx, rx) = channel::<Message<S>>();
        let mailbox = Mailbox {
            name: Arc::from(name),
            tx,
            thread_id: Arc::new(OnceLock::new()),
        };
        let state = init(mailbox.clone());
        let thread_id = mailbox.thread_id.clone();
        let thread_name = name.to_string();

        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _ = thread_id.set(thread::current().id());
                run_loop(&thread_name, state, rx);
            })?;

        Ok(Self { mailbox })
    }

    pub fn spawn(name: &str, state: S) -> AgentResult<Self> {
        Self::spawn_with(name, |_| state)
    }

    pub fn mailbox(&self) -> Mailbox<S> {
        self.mailbox.clone()
    }
}

impl<S> Drop for Executor<S> {
    fn drop(&mut self) {
        let _ = self.mailbox.tx.send(Message::Shutdown);
    }
}

fn run_loop<S>(name: &str, mut state: S, rx: Receiver<Message<S>>) {
    debug!(executor = name, "executor started");
    while let Ok(message) = rx.recv() {
        match message {
            Message::Run(job) => {
                if catch_unwind(AssertUnwindSafe(|| job(&mut state))).is_err() {
                    error!(executor = name, "job panicked; executor keeps running");
                }
            }
            Message::Shutdown => break,
        }
    }
    debug!(executor = name, "executor stopped");
}

/// Receiving half of a oneshot completion bridge.
///
/// Used where a public entry point must look synchronous to its caller while
/// the work completes asynchronously on an executor.
pub struct Gate<T> {
    rx: oneshot::Receiver<T>,
}

/// Sending half of a [`Gate`]; consumed on fire so it can only signal once.
pub struct Signal<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Gate<T> {
    pub fn pair() -> (Gate<T>, Signal<T>) {
        let (tx, rx) = oneshot::channel();
        (Gate { rx }, Signal { tx })
    }

    /// Blocks the calling thread until the signal fires.
    ///
    /// Must not be called from inside an async task.
    pub fn wait(self, timeout: Duration, what: &'static str) -> AgentResult<T> {
        let waiter = runtime::Builder::new_current_thread().enable_time().build()?;
        match waiter.block_on(time::timeout(timeout, self.rx)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(AgentError::Abandoned(what)),
            Err(_) => Err(AgentError::Timeout(what)),
        }
    }
}

impl<T> Signal<T> {
    pub fn fire(self, value: T) {
        let _ = self.tx.send(value);
    }
}

/// Timer pool shared by all agents, backed by a tokio runtime.
pub struct Scheduler {
    handle: Handle,
    owned: Option<Runtime>,
    armed: Arc<AtomicUsize>,
}

/// Handle to a scheduled timer.
pub struct TimerHandle {
    claimed: Arc<AtomicBool>,
    armed: Arc<AtomicUsize>,
    task: AbortHandle,
}

impl TimerHandle {
    /// Cancels the timer. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&self) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.armed.fetch_sub(1, Ordering::AcqRel);
        self.task.abort();
        true
    }
}

impl Scheduler {
    /// Starts a private single-worker runtime named `name`.
    pub fn new(name: &str) -> AgentResult<Self> {
        let owned = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(name)
            .enable_time()
            .build()?;
        Ok(Self {
            handle: owned.handle().clone(),
            owned: Some(owned),
            armed: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Runs timers on an existing runtime, such as the daemon's own.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            owned: None,
            armed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Runs `job` once `delay` has passed. Jobs run on a runtime worker, so
    /// they must only post into a [`Mailbox`] or do other non-blocking work.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let claimed = Arc::new(AtomicBool::new(false));
        self.armed.fetch_add(1, Ordering::AcqRel);

        let flag = claimed.clone();
        let armed = self.armed.clone();
        let task = self.handle.spawn(async move {
            time::sleep(delay).await;
            if flag.swap(true, Ordering::AcqRel) {
                return;
            }
            armed.fetch_sub(1, Ordering::AcqRel);
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("timer job panicked");
            }
        });

        TimerHandle {
            claimed,
            armed: self.armed.clone(),
            task: task.abort_handle(),
        }
    }

    /// Runs blocking work on the runtime's blocking pool.
    pub fn spawn_blocking<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        drop(self.handle.spawn_blocking(work));
    }

    /// Number of timers that are still armed.
    pub fn pending(&self) -> usize {
        self.armed.load(Ordering::Acquire)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(owned) = self.owned.take() {
            owned.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_run_in_order() {
        let executor = Executor::spawn("test-order", Vec::<u32>::new()).unwrap();
        let mailbox = executor.mailbox();
        for i in 0..100 {
            mailbox.post(move |v| v.push(i));
        }
        let seen = mailbox
            .call(|v| v.clone(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_job_does_not_kill_executor() {
        let executor = Executor::spawn("test-panic", 0u32).unwrap();
        let mailbox = executor.mailbox();
        mailbox.post(|_| panic!("boom"));
        mailbox.post(|n| *n += 1);
        assert_eq!(mailbox.call(|n| *n, Duration::from_secs(1)).unwrap(), 1);
    }

    #[test]
    fn test_reentrant_call_is_refused() {
        let executor = Executor::spawn("test-reentrant", ()).unwrap();
        let mailbox = executor.mailbox();
        let inner = mailbox.clone();
        let result = mailbox
            .call(
                move |_| inner.call(|_| (), Duration::from_millis(10)),
                Duration::from_secs(1),
            )
            .unwrap();
        assert!(matches!(result, Err(AgentError::Reentrant(_))));
    }

    #[test]
    fn test_call_after_shutdown_fails() {
        let executor = Executor::spawn("test-shutdown", ()).unwrap();
        let mailbox = executor.mailbox();
        drop(executor);
        thread::sleep(Duration::from_millis(50));
        let result = mailbox.call(|_| (), Duration::from_millis(100));
        assert!(result.is_err());
    }

    #[test]
    fn test_gate_times_out() {
        let (gate, _signal) = Gate::<u32>::pair();
        assert!(matches!(
            gate.wait(Duration::from_millis(10), "nothing"),
            Err(AgentError::Timeout("nothing"))
        ));
    }

    #[test]
    fn test_gate_abandoned() {
        let (gate, signal) = Gate::<u32>::pair();
        drop(signal);
        assert!(matches!(
            gate.wait(Duration::from_millis(10), "dropped"),
            Err(AgentError::Abandoned("dropped"))
        ));
    }

    #[test]
    fn test_gate_fired_from_another_thread() {
        let (gate, signal) = Gate::pair();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signal.fire("done");
        });
        assert_eq!(gate.wait(Duration::from_secs(1), "worker").unwrap(), "done");
    }

    #[test]
    fn test_scheduler_fires_in_deadline_order() {
        let scheduler = Scheduler::new("test-timers").unwrap();
        let (tx, rx) = channel();
        for (delay, tag) in [(60u64, 3u32), (20, 1), (40, 2)] {
            let tx = tx.clone();
            scheduler.schedule(Duration::from_millis(delay), move || {
                let _ = tx.send(tag);
            });
        }
        let order: Vec<u32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let scheduler = Scheduler::new("test-cancel").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = scheduler.schedule(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.cancel());
        assert!(!handle.cancel());
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scheduler_on_existing_runtime() {
        let scheduler = Scheduler::with_handle(Handle::current());
        let (tx, rx) = oneshot::channel();
        scheduler.schedule(Duration::from_millis(10), move || {
            let _ = tx.send(7u32);
        });
        assert_eq!(scheduler.pending(), 1);
        let fired = time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(fired, 7);
        assert_eq!(scheduler.pending(), 0);
    }
}
