//! Service: the reactor pool
//!
//! The service is the backbone of every server and client in riptide. It
//! owns one or more I/O loops and the worker threads that drive them, and
//! offers a uniform dispatch/post interface for user tasks.
//!
//! Two threading models exist and are fixed at construction:
//!
//! 1. Per-loop affinity (default): each worker thread drives its own
//!    loop. Handlers for a connection are naturally single-threaded
//!    because all of its operations bind to the loop chosen at
//!    construction via round robin.
//! 2. Shared loop: all worker threads drive one loop and a single-writer
//!    serializer orders every user callback.
//!
//! A service may also wrap an externally driven runtime handle, or be
//! built with zero threads and driven by the caller through
//! [`Service::drive_once`].

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::Result;

/// A boxed task routed through `dispatch` / `post`.
pub type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle and worker-thread hooks for a [`Service`].
pub trait ServiceEvents: Send + Sync + 'static {
    /// Called on each worker thread before it starts driving its loop.
    fn on_thread_init(&self) {}
    /// Called on each worker thread after its loop has stopped.
    fn on_thread_cleanup(&self) {}
    /// Fired once on a loop when the service has started.
    fn on_started(&self) {}
    /// Fired once on a loop when the service has stopped.
    fn on_stopped(&self) {}
    /// Fired between poll turns when the service runs in polling mode.
    fn on_idle(&self) {
        std::thread::yield_now();
    }
    /// Service-level failures (worker spawn, task submission after stop).
    fn on_error(&self, _err: &Error) {}
}

/// Default no-op event sink.
pub struct NoopServiceEvents;

impl ServiceEvents for NoopServiceEvents {}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_LOOP: Cell<u64> = const { Cell::new(0) };
}

enum LoopKind {
    /// Current-thread runtime driven by service worker threads (or the
    /// caller, for zero-thread services).
    Owned,
    /// Multi-thread runtime that drives itself; used by the shared-loop
    /// configuration.
    Threaded,
    /// Externally supplied handle; the caller owns the runtime.
    External,
}

/// One event loop of a service.
pub struct IoLoop {
    id: u64,
    kind: LoopKind,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl IoLoop {
    fn owned() -> Result<Arc<Self>> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self::wrap(LoopKind::Owned, runtime))
    }

    fn threaded(threads: usize, events: Arc<dyn ServiceEvents>) -> Result<Arc<Self>> {
        let init = events.clone();
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("riptide-io")
            .on_thread_start(move || init.on_thread_init())
            .on_thread_stop(move || events.on_thread_cleanup())
            .enable_all()
            .build()?;
        Ok(Self::wrap(LoopKind::Threaded, runtime))
    }

    fn external(handle: Handle) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            kind: LoopKind::External,
            handle,
            runtime: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
        })
    }

    fn wrap(kind: LoopKind, runtime: Runtime) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Runtime handle for spawning futures onto this loop.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a future onto this loop.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Enqueue a task onto this loop. Always deferred.
    pub fn post(&self, task: TaskFn) {
        self.handle.spawn(async move { task() });
    }

    /// Run a task inline when the caller is already on this loop,
    /// otherwise enqueue it.
    pub fn dispatch(&self, task: TaskFn) {
        if self.is_current() {
            task();
        } else {
            self.post(task);
        }
    }

    /// Is the calling thread currently driving this loop?
    pub fn is_current(&self) -> bool {
        CURRENT_LOOP.with(|current| current.get()) == self.id
    }

    fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run one turn of an owned loop from the calling thread. Used by
    /// zero-thread services whose caller is the driver.
    pub fn drive_once(&self) {
        let guard = self.runtime.lock();
        if let Some(runtime) = guard.as_ref() {
            let previous = CURRENT_LOOP.with(|current| current.replace(self.id));
            runtime.block_on(tokio::task::yield_now());
            CURRENT_LOOP.with(|current| current.set(previous));
        }
    }
}

/// FIFO serializer: no two of its tasks ever run concurrently.
struct Serializer {
    tx: mpsc::UnboundedSender<TaskFn>,
}

impl Serializer {
    fn spawn_on(io: &IoLoop) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskFn>();
        io.spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
        });
        Self { tx }
    }

    fn enqueue(&self, task: TaskFn) -> bool {
        self.tx.send(task).is_ok()
    }
}

enum Shape {
    /// `threads` workers, one owned loop each (zero threads leaves a
    /// single undriven loop).
    PerLoop { threads: usize },
    /// One self-driving loop shared by `threads` runtime workers.
    Shared { threads: usize },
    /// Externally driven loop.
    External { handle: Handle },
}

/// The reactor pool.
pub struct Service {
    id: Uuid,
    this: Weak<Service>,
    events: Arc<dyn ServiceEvents>,
    shape: Shape,
    loops: Mutex<Vec<Arc<IoLoop>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    serializer: Mutex<Option<Serializer>>,
    strand_needed: bool,
    started: AtomicBool,
    stopping: AtomicBool,
    polling: AtomicBool,
    round_robin: AtomicUsize,
}

impl Service {
    /// Service with per-loop affinity: `threads` workers, each driving
    /// its own loop. Zero threads builds a single loop the caller drives.
    pub fn new(events: Arc<dyn ServiceEvents>, threads: usize) -> Result<Arc<Self>> {
        let shape = Shape::PerLoop { threads };
        let loops = Self::build_loops(&shape, &events)?;
        Ok(Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            this: this.clone(),
            events,
            shape,
            loops: Mutex::new(loops),
            threads: Mutex::new(Vec::new()),
            serializer: Mutex::new(None),
            strand_needed: false,
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            polling: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
        }))
    }

    /// Service with one shared loop and a serializer ordering every user
    /// callback.
    pub fn shared(events: Arc<dyn ServiceEvents>, threads: usize) -> Result<Arc<Self>> {
        let shape = Shape::Shared { threads };
        let loops = Self::build_loops(&shape, &events)?;
        Ok(Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            this: this.clone(),
            events,
            shape,
            loops: Mutex::new(loops),
            threads: Mutex::new(Vec::new()),
            serializer: Mutex::new(None),
            strand_needed: true,
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            polling: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
        }))
    }

    /// Service around an externally driven runtime handle.
    pub fn from_handle(
        events: Arc<dyn ServiceEvents>,
        handle: Handle,
        serialize: bool,
    ) -> Arc<Self> {
        let shape = Shape::External {
            handle: handle.clone(),
        };
        Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            this: this.clone(),
            events,
            shape,
            loops: Mutex::new(vec![IoLoop::external(handle)]),
            threads: Mutex::new(Vec::new()),
            serializer: Mutex::new(None),
            strand_needed: serialize,
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            polling: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
        })
    }

    /// Service built from a [`crate::config::ServiceConfig`].
    pub fn from_config(
        events: Arc<dyn ServiceEvents>,
        config: &crate::config::ServiceConfig,
    ) -> Result<Arc<Self>> {
        if config.shared_loop {
            Self::shared(events, config.threads)
        } else {
            Self::new(events, config.threads)
        }
    }

    fn build_loops(shape: &Shape, events: &Arc<dyn ServiceEvents>) -> Result<Vec<Arc<IoLoop>>> {
        match shape {
            Shape::PerLoop { threads } => {
                let count = (*threads).max(1);
                (0..count).map(|_| IoLoop::owned()).collect()
            }
            Shape::Shared { threads } => Ok(vec![IoLoop::threaded(*threads, events.clone())?]),
            Shape::External { handle, .. } => Ok(vec![IoLoop::external(handle.clone())]),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    pub fn strand_needed(&self) -> bool {
        self.strand_needed
    }

    pub fn threads(&self) -> usize {
        match &self.shape {
            Shape::PerLoop { threads } | Shape::Shared { threads } => *threads,
            Shape::External { .. } => 0,
        }
    }

    /// Next loop by round robin, used to spread new connections.
    pub fn next_io(&self) -> Arc<IoLoop> {
        let loops = self.loops.lock();
        let index = self.round_robin.fetch_add(1, Ordering::Relaxed);
        loops[index % loops.len()].clone()
    }

    fn primary(&self) -> Arc<IoLoop> {
        self.loops.lock()[0].clone()
    }

    /// Start the service. Returns false when already started.
    pub fn start(&self, polling: bool) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug_assert!(false, "service is already running");
            return false;
        }
        self.polling.store(polling, Ordering::SeqCst);
        self.round_robin.store(0, Ordering::SeqCst);

        if self.strand_needed {
            *self.serializer.lock() = Some(Serializer::spawn_on(&self.primary()));
        }

        let events = self.events.clone();
        self.post(Box::new(move || {
            events.on_started();
        }));

        if let Shape::PerLoop { threads } = &self.shape {
            let Some(this) = self.this.upgrade() else {
                return false;
            };
            let loops = self.loops.lock().clone();
            let mut workers = self.threads.lock();
            for index in 0..*threads {
                let io = loops[index % loops.len()].clone();
                let service = this.clone();
                let spawned = thread::Builder::new()
                    .name(format!("riptide-io-{index}"))
                    .spawn(move || worker_main(service, io));
                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(err) => {
                        self.events.on_error(&Error::Io(err));
                        break;
                    }
                }
            }
        }

        info!(service = %self.id, polling, threads = self.threads(), "service started");
        true
    }

    /// Stop the service: run `on_stopped` on a loop, halt every loop and
    /// join the workers. Returns false when not started.
    pub fn stop(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        if self.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }

        let events = self.events.clone();
        let (done_tx, done_rx) = std_mpsc::channel::<()>();
        self.post(Box::new(move || {
            events.on_stopped();
            let _ = done_tx.send(());
        }));
        self.wait_for_completion(&done_rx, Duration::from_secs(5));

        self.started.store(false, Ordering::SeqCst);

        let loops = self.loops.lock().clone();
        for io in &loops {
            io.signal_shutdown();
        }
        for io in &loops {
            if matches!(io.kind, LoopKind::Threaded) {
                if let Some(runtime) = io.runtime.lock().take() {
                    runtime.shutdown_timeout(Duration::from_secs(5));
                }
            }
        }

        let workers: Vec<_> = self.threads.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }

        *self.serializer.lock() = None;
        self.polling.store(false, Ordering::SeqCst);
        self.stopping.store(false, Ordering::SeqCst);
        info!(service = %self.id, "service stopped");
        true
    }

    /// Wait for the posted stop handler, driving undriven loops ourselves
    /// when the service has no workers.
    fn wait_for_completion(&self, done: &std_mpsc::Receiver<()>, timeout: Duration) {
        let self_driven = self.threads.lock().is_empty()
            && matches!(self.shape, Shape::PerLoop { .. });
        if self_driven {
            let deadline = Instant::now() + timeout;
            while done.try_recv().is_err() && Instant::now() < deadline {
                self.primary().drive_once();
            }
        } else if done.recv_timeout(timeout).is_err() {
            warn!(service = %self.id, "stop handler did not complete in time");
        }
    }

    /// Stop, rebuild every loop, and start again with the same polling
    /// mode.
    pub fn restart(&self) -> bool {
        let polling = self.is_polling();
        if !self.stop() {
            return false;
        }
        match Self::build_loops(&self.shape, &self.events) {
            Ok(loops) => *self.loops.lock() = loops,
            Err(err) => {
                self.events.on_error(&err);
                return false;
            }
        }
        self.start(polling)
    }

    /// Enqueue a task. Routed through the serializer when one is
    /// configured, otherwise onto the primary loop.
    pub fn post(&self, task: TaskFn) {
        if self.strand_needed {
            let guard = self.serializer.lock();
            if let Some(serializer) = guard.as_ref() {
                if !serializer.enqueue(task) {
                    drop(guard);
                    self.events.on_error(&Error::NotRunning);
                }
                return;
            }
        }
        self.primary().post(task);
    }

    /// Dispatch a task: may run inline when the caller is already on the
    /// primary loop; serialized configurations always enqueue to preserve
    /// FIFO order.
    pub fn dispatch(&self, task: TaskFn) {
        if self.strand_needed {
            self.post(task);
        } else {
            self.primary().dispatch(task);
        }
    }

    /// Run one turn of the primary loop. Only meaningful for zero-thread
    /// services whose caller is the driver.
    pub fn drive_once(&self) {
        self.primary().drive_once();
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        // Best-effort teardown so worker threads never outlive the pool.
        let loops = self.loops.lock().clone();
        for io in &loops {
            io.signal_shutdown();
            if matches!(io.kind, LoopKind::Threaded) {
                if let Some(runtime) = io.runtime.lock().take() {
                    runtime.shutdown_background();
                }
            }
        }
        self.started.store(false, Ordering::SeqCst);
        let me = thread::current().id();
        let workers: Vec<_> = self.threads.lock().drain(..).collect();
        for worker in workers {
            if worker.thread().id() != me {
                let _ = worker.join();
            }
        }
    }
}

fn worker_main(service: Arc<Service>, io: Arc<IoLoop>) {
    service.events.on_thread_init();
    CURRENT_LOOP.with(|current| current.set(io.id));

    let runtime = io.runtime.lock().take();
    if let Some(runtime) = runtime {
        if service.is_polling() {
            let mut shutdown = io.shutdown_rx.clone();
            while service.is_started() && !*shutdown.borrow_and_update() {
                runtime.block_on(tokio::task::yield_now());
                service.events.on_idle();
            }
        } else {
            let mut shutdown = io.shutdown_rx.clone();
            runtime.block_on(async move {
                while !*shutdown.borrow_and_update() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            });
        }
        // Dropping the runtime here releases any remaining tasks on this
        // thread.
        drop(runtime);
    } else {
        warn!("io loop already claimed by another worker");
    }

    CURRENT_LOOP.with(|current| current.set(0));
    service.events.on_thread_cleanup();
    debug!("worker thread finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::channel;

    #[derive(Default)]
    struct ProbeEvents {
        thread_init: AtomicUsize,
        thread_cleanup: AtomicUsize,
        started: AtomicBool,
        stopped: AtomicBool,
        idle: AtomicBool,
        errors: AtomicBool,
    }

    impl ServiceEvents for ProbeEvents {
        fn on_thread_init(&self) {
            self.thread_init.fetch_add(1, Ordering::SeqCst);
        }
        fn on_thread_cleanup(&self) {
            self.thread_cleanup.fetch_add(1, Ordering::SeqCst);
        }
        fn on_started(&self) {
            self.started.store(true, Ordering::SeqCst);
        }
        fn on_stopped(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
        fn on_idle(&self) {
            self.idle.store(true, Ordering::SeqCst);
            std::thread::yield_now();
        }
        fn on_error(&self, _err: &Error) {
            self.errors.store(true, Ordering::SeqCst);
        }
    }

    fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn lifecycle_fires_hooks_once() {
        let events = Arc::new(ProbeEvents::default());
        let service = Service::new(events.clone(), 2).unwrap();

        assert!(service.start(false));
        assert!(!service.start(false), "double start must fail");
        wait_until(|| events.started.load(Ordering::SeqCst));
        assert!(service.is_started());

        assert!(service.stop());
        assert!(!service.stop(), "double stop must fail");
        assert!(events.stopped.load(Ordering::SeqCst));
        assert_eq!(events.thread_init.load(Ordering::SeqCst), 2);
        assert_eq!(events.thread_cleanup.load(Ordering::SeqCst), 2);
        assert!(!events.errors.load(Ordering::SeqCst));
    }

    #[test]
    fn post_runs_tasks_on_a_worker() {
        let service = Service::new(Arc::new(NoopServiceEvents), 1).unwrap();
        assert!(service.start(false));

        let (tx, rx) = channel();
        service.post(Box::new(move || {
            let _ = tx.send(thread::current().name().map(str::to_owned));
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("riptide-io-0"));

        assert!(service.stop());
    }

    #[test]
    fn dispatch_runs_inline_on_the_loop_thread() {
        let service = Service::new(Arc::new(NoopServiceEvents), 1).unwrap();
        assert!(service.start(false));

        let (tx, rx) = channel();
        let inner = service.clone();
        service.post(Box::new(move || {
            // Already on the primary loop: dispatch must not defer.
            let ran = Arc::new(AtomicBool::new(false));
            let flag = ran.clone();
            inner.dispatch(Box::new(move || flag.store(true, Ordering::SeqCst)));
            let _ = tx.send(ran.load(Ordering::SeqCst));
        }));
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

        assert!(service.stop());
    }

    #[test]
    fn round_robin_cycles_every_loop() {
        let service = Service::new(Arc::new(NoopServiceEvents), 3).unwrap();
        let first = service.next_io();
        let second = service.next_io();
        let third = service.next_io();
        let wrapped = service.next_io();
        assert_ne!(first.id, second.id);
        assert_ne!(second.id, third.id);
        assert_eq!(first.id, wrapped.id);
    }

    #[test]
    fn serialized_service_preserves_fifo_order() {
        let service = Service::shared(Arc::new(NoopServiceEvents), 4).unwrap();
        assert!(service.start(false));

        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = channel();
        for index in 0..100usize {
            let log = log.clone();
            let tx = tx.clone();
            service.post(Box::new(move || {
                log.lock().push(index);
                if index == 99 {
                    let _ = tx.send(());
                }
            }));
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let seen = log.lock().clone();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());

        assert!(service.stop());
    }

    #[test]
    fn polling_mode_reports_idle() {
        let events = Arc::new(ProbeEvents::default());
        let service = Service::new(events.clone(), 1).unwrap();
        assert!(service.start(true));
        assert!(service.is_polling());
        wait_until(|| events.idle.load(Ordering::SeqCst));
        assert!(service.stop());
        assert!(!service.is_polling());
    }

    #[test]
    fn restart_rebuilds_the_loops() {
        let events = Arc::new(ProbeEvents::default());
        let service = Service::new(events.clone(), 1).unwrap();
        assert!(service.start(false));
        wait_until(|| events.started.load(Ordering::SeqCst));

        assert!(service.restart());
        assert!(service.is_started());

        let (tx, rx) = channel();
        service.post(Box::new(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(service.stop());
    }

    #[test]
    fn external_handle_service_uses_the_callers_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let service = Service::from_handle(
            Arc::new(NoopServiceEvents),
            runtime.handle().clone(),
            true,
        );
        assert!(service.strand_needed());
        assert_eq!(service.threads(), 0);
        assert!(service.start(false));

        let (tx, rx) = channel();
        service.post(Box::new(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(service.stop());
    }

    #[test]
    fn zero_thread_service_is_caller_driven() {
        let service = Service::new(Arc::new(NoopServiceEvents), 0).unwrap();
        assert!(service.start(false));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        service.post(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(!ran.load(Ordering::SeqCst));
        service.drive_once();
        assert!(ran.load(Ordering::SeqCst));

        assert!(service.stop());
    }
}
