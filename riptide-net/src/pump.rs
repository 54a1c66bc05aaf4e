//! Per-connection I/O engine
//!
//! Sessions and clients share this engine: a double-buffered send path
//! with at most one write in flight, an adaptive receive loop with at
//! most one read in flight, synchronous send/receive commands raced
//! against a timer, and a teardown path that can interpose a graceful
//! TLS shutdown before the socket closes.
//!
//! The send path keeps two buffers. Writers append to *main* under a
//! short lock; the write task owns *flush*. A campaign swaps main into
//! flush only when flush has fully drained, so staged bytes keep their
//! order and the swap is O(1).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::trace;

use riptide_core::{end_of_stream, Error, HandlerSlab, IoLoop, SlabBuf};

use crate::transport::SessionStream;

type StreamBox = Box<dyn SessionStream>;

/// Connection-side view the engine drives hooks and counters through.
pub(crate) trait Endpoint: Send + Sync + 'static {
    fn pump(&self) -> &Pump;
    /// Connected, and handshaked for secured transports.
    fn is_ready(&self) -> bool;
    fn fire_receive(&self, data: &[u8]);
    fn fire_send(&self, sent: usize, pending: u64);
    fn fire_empty(&self);
    /// Route an error to the hooks unless it is benign.
    fn report(&self, err: &Error);
    /// Schedule an asynchronous disconnect on the endpoint's loop.
    fn schedule_disconnect(self: Arc<Self>);
    /// Aggregate counters beyond the endpoint (server totals).
    fn record_sent(&self, _n: u64) {}
    fn record_received(&self, _n: u64) {}
}

pub(crate) enum WriteCmd {
    /// Start or continue a send campaign.
    Kick,
    /// Synchronous send: write `data` directly, optionally bounded by a
    /// timer; reply with the byte count.
    Direct {
        data: SlabBuf,
        timeout: Duration,
        reply: oneshot::Sender<usize>,
    },
}

pub(crate) enum ReadCmd {
    /// Arm the continuous receive loop.
    Arm,
    /// Synchronous receive into a staged buffer of `len` bytes.
    Direct {
        len: usize,
        timeout: Duration,
        reply: oneshot::Sender<(SlabBuf, usize)>,
    },
}

/// Writers append to `main`; the write task drains `flush`. The flush
/// buffer is an `Arc` so the write task can hold a snapshot across its
/// await without keeping the lock: nothing mutates a flush buffer in
/// place, teardown replaces it wholesale.
#[derive(Default)]
struct SendBuffers {
    main: Vec<u8>,
    flush: Arc<Vec<u8>>,
    flush_offset: usize,
}

/// Shared I/O state of one connection.
pub(crate) struct Pump {
    send: Mutex<SendBuffers>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<WriteCmd>>>,
    read_tx: Mutex<Option<mpsc::UnboundedSender<ReadCmd>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,

    pub(crate) sending: AtomicBool,
    pub(crate) receiving: AtomicBool,
    pub(crate) bytes_pending: AtomicU64,
    pub(crate) bytes_sending: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) send_limit: AtomicUsize,
    pub(crate) receive_limit: AtomicUsize,

    /// Initial receive buffer capacity, sized from the kernel buffer.
    recv_chunk: AtomicUsize,
    /// Interpose a TLS shutdown before the socket closes.
    graceful: AtomicBool,

    send_slab: Mutex<HandlerSlab>,
    recv_slab: Mutex<HandlerSlab>,
}

const FALLBACK_RECV_CHUNK: usize = 8192;

impl Pump {
    pub(crate) fn new() -> Self {
        Self {
            send: Mutex::new(SendBuffers::default()),
            write_tx: Mutex::new(None),
            read_tx: Mutex::new(None),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            sending: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            bytes_pending: AtomicU64::new(0),
            bytes_sending: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            send_limit: AtomicUsize::new(0),
            receive_limit: AtomicUsize::new(0),
            recv_chunk: AtomicUsize::new(FALLBACK_RECV_CHUNK),
            graceful: AtomicBool::new(false),
            send_slab: Mutex::new(HandlerSlab::new()),
            recv_slab: Mutex::new(HandlerSlab::new()),
        }
    }

    pub(crate) fn set_recv_chunk(&self, size: usize) {
        self.recv_chunk
            .store(size.max(1), Ordering::SeqCst);
    }

    pub(crate) fn main_is_empty(&self) -> bool {
        self.send.lock().main.is_empty()
    }

    pub(crate) fn reset_counters(&self) {
        self.bytes_pending.store(0, Ordering::SeqCst);
        self.bytes_sending.store(0, Ordering::SeqCst);
        self.bytes_sent.store(0, Ordering::SeqCst);
        self.bytes_received.store(0, Ordering::SeqCst);
    }

    pub(crate) fn clear_buffers(&self) {
        let mut buffers = self.send.lock();
        buffers.main.clear();
        buffers.flush = Arc::new(Vec::new());
        buffers.flush_offset = 0;
        self.bytes_pending.store(0, Ordering::SeqCst);
        self.bytes_sending.store(0, Ordering::SeqCst);
    }

    /// Signal both I/O tasks to stop. `graceful` asks the write task to
    /// send a TLS close_notify before the socket drops.
    pub(crate) fn signal_shutdown(&self, graceful: bool) {
        self.graceful.store(graceful, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.lock().as_ref() {
            let _ = tx.send(true);
        }
    }

    /// Await both I/O tasks. Runs on the connection's loop, which keeps
    /// interleaving with the tasks it waits for.
    pub(crate) async fn join_tasks(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub(crate) fn drop_channels(&self) {
        *self.write_tx.lock() = None;
        *self.read_tx.lock() = None;
        *self.shutdown.lock() = None;
        self.sending.store(false, Ordering::SeqCst);
        self.receiving.store(false, Ordering::SeqCst);
    }

    /// Arm the continuous receive loop.
    pub(crate) fn arm(&self) {
        arm_receive(self);
    }

    fn write_sender(&self) -> Option<mpsc::UnboundedSender<WriteCmd>> {
        self.write_tx.lock().clone()
    }

    fn read_sender(&self) -> Option<mpsc::UnboundedSender<ReadCmd>> {
        self.read_tx.lock().clone()
    }
}

/// Split the stream and spawn the read/write tasks on the endpoint's
/// loop. The receive loop starts unarmed; arm it through
/// [`Pump::arm`] once the connect hooks have run.
pub(crate) fn start_io<E: Endpoint>(ep: &Arc<E>, io: &IoLoop, stream: StreamBox) {
    let (reader, writer) = tokio::io::split(stream);
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let (read_tx, read_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pump = ep.pump();
    *pump.write_tx.lock() = Some(write_tx);
    *pump.read_tx.lock() = Some(read_tx);
    *pump.shutdown.lock() = Some(shutdown_tx);
    pump.graceful.store(false, Ordering::SeqCst);

    let mut tasks = pump.tasks.lock();
    tasks.push(io.spawn(write_loop(ep.clone(), writer, write_rx, shutdown_rx.clone())));
    tasks.push(io.spawn(read_loop(ep.clone(), reader, read_rx, shutdown_rx)));
}

/// Append to the main send buffer and kick a campaign when one has to be
/// started. Returns false on pre-check failure (not ready, empty input,
/// limit exceeded).
pub(crate) fn send_async<E: Endpoint>(ep: &E, data: &[u8]) -> bool {
    if !ep.is_ready() || data.is_empty() {
        return false;
    }
    let pump = ep.pump();
    let kick = {
        let mut buffers = pump.send.lock();
        let limit = pump.send_limit.load(Ordering::SeqCst);
        if limit > 0 && buffers.main.len() + data.len() > limit {
            drop(buffers);
            ep.report(&Error::SendBufferFull { limit });
            return false;
        }
        let campaign_needed = buffers.main.is_empty() || buffers.flush.is_empty();
        buffers.main.extend_from_slice(data);
        pump.bytes_pending
            .store(buffers.main.len() as u64, Ordering::SeqCst);
        campaign_needed
    };
    if kick {
        if let Some(tx) = pump.write_sender() {
            let _ = tx.send(WriteCmd::Kick);
        }
    }
    true
}

/// Synchronous send. Blocks the calling thread until the write (or its
/// timer) completes; must not be called from a service worker thread.
pub(crate) fn send_blocking<E: Endpoint>(ep: &E, data: &[u8], timeout: Duration) -> usize {
    if !ep.is_ready() || data.is_empty() {
        return 0;
    }
    let pump = ep.pump();
    let Some(tx) = pump.write_sender() else {
        return 0;
    };
    let staged = pump.send_slab.lock().acquire(data);
    let (reply_tx, reply_rx) = oneshot::channel();
    if let Err(failed) = tx.send(WriteCmd::Direct {
        data: staged,
        timeout,
        reply: reply_tx,
    }) {
        if let WriteCmd::Direct { data, .. } = failed.0 {
            pump.send_slab.lock().release(data);
        }
        return 0;
    }
    reply_rx.blocking_recv().unwrap_or(0)
}

/// Synchronous receive into `out`. Blocks the calling thread until the
/// read (or its timer) completes; must not be called from a service
/// worker thread.
pub(crate) fn receive_blocking<E: Endpoint>(ep: &E, out: &mut [u8], timeout: Duration) -> usize {
    if !ep.is_ready() || out.is_empty() {
        return 0;
    }
    let pump = ep.pump();
    let Some(tx) = pump.read_sender() else {
        return 0;
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    if tx
        .send(ReadCmd::Direct {
            len: out.len(),
            timeout,
            reply: reply_tx,
        })
        .is_err()
    {
        return 0;
    }
    match reply_rx.blocking_recv() {
        Ok((staged, count)) => {
            out[..count].copy_from_slice(&staged[..count]);
            pump.recv_slab.lock().release(staged);
            count
        }
        Err(_) => 0,
    }
}

/// Arm the continuous receive loop.
pub(crate) fn arm_receive(pump: &Pump) {
    if let Some(tx) = pump.read_sender() {
        let _ = tx.send(ReadCmd::Arm);
    }
}

async fn write_loop<E: Endpoint>(
    ep: Arc<E>,
    mut writer: WriteHalf<StreamBox>,
    mut commands: mpsc::UnboundedReceiver<WriteCmd>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            command = commands.recv() => match command {
                None => break,
                Some(WriteCmd::Kick) => {
                    let fatal = run_campaign(&ep, &mut writer, &mut shutdown).await.is_err();
                    // The campaign may have consumed the shutdown signal
                    // from inside its own select.
                    if fatal || *shutdown.borrow() {
                        break;
                    }
                }
                Some(WriteCmd::Direct { data, timeout, reply }) => {
                    let (count, fatal) =
                        write_direct(&ep, &mut writer, &data, timeout, &mut shutdown).await;
                    ep.pump().send_slab.lock().release(data);
                    let _ = reply.send(count);
                    if fatal || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
    if *shutdown.borrow() && ep.pump().graceful.load(Ordering::SeqCst) {
        // TLS close_notify; failures here are downgraded by design of the
        // teardown path.
        let _ = writer.shutdown().await;
    }
    trace!("write task finished");
}

/// Drain the flush buffer, swapping main in whenever flush runs dry.
/// Returns Err only on a fatal stream error (disconnect already
/// scheduled).
async fn run_campaign<E: Endpoint>(
    ep: &Arc<E>,
    writer: &mut WriteHalf<StreamBox>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ()> {
    let pump = ep.pump();
    loop {
        if !ep.is_ready() {
            return Ok(());
        }

        // Swap only when flush has fully drained.
        let (snapshot, offset) = {
            let mut buffers = pump.send.lock();
            if buffers.flush.is_empty() {
                let staged = std::mem::take(&mut buffers.main);
                pump.bytes_pending.store(0, Ordering::SeqCst);
                pump.bytes_sending
                    .fetch_add(staged.len() as u64, Ordering::SeqCst);
                buffers.flush = Arc::new(staged);
                buffers.flush_offset = 0;
            }
            if buffers.flush.is_empty() {
                drop(buffers);
                ep.fire_empty();
                return Ok(());
            }
            (buffers.flush.clone(), buffers.flush_offset)
        };

        pump.sending.store(true, Ordering::SeqCst);
        let result = tokio::select! {
            _ = shutdown.changed() => {
                pump.sending.store(false, Ordering::SeqCst);
                return Ok(());
            }
            result = writer.write(&snapshot[offset..]) => result,
        };
        pump.sending.store(false, Ordering::SeqCst);

        if !ep.is_ready() {
            // Disconnected while the write was in flight; the teardown
            // already cleared the buffers.
            return Ok(());
        }

        match result {
            Ok(0) => {
                let err = Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "stream rejected the write",
                ));
                ep.report(&err);
                Arc::clone(ep).schedule_disconnect();
                return Err(());
            }
            Ok(count) => {
                {
                    let mut buffers = pump.send.lock();
                    // Teardown may have replaced the flush buffer while
                    // the write was in flight.
                    if Arc::ptr_eq(&buffers.flush, &snapshot) {
                        buffers.flush_offset = offset + count;
                        if buffers.flush_offset == buffers.flush.len() {
                            buffers.flush = Arc::new(Vec::new());
                            buffers.flush_offset = 0;
                        }
                    }
                }
                pump.bytes_sending.fetch_sub(count as u64, Ordering::SeqCst);
                pump.bytes_sent.fetch_add(count as u64, Ordering::SeqCst);
                ep.record_sent(count as u64);
                ep.fire_send(count, pump.bytes_pending.load(Ordering::SeqCst));
            }
            Err(err) => {
                let err = Error::Io(err);
                ep.report(&err);
                Arc::clone(ep).schedule_disconnect();
                return Err(());
            }
        }
    }
}

/// One synchronous write, optionally raced against a timer. A timeout
/// cancels the write and reports nothing; any other failure reports and
/// disconnects. Returns (bytes written, fatal).
async fn write_direct<E: Endpoint>(
    ep: &Arc<E>,
    writer: &mut WriteHalf<StreamBox>,
    data: &[u8],
    timeout: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> (usize, bool) {
    let pump = ep.pump();
    pump.sending.store(true, Ordering::SeqCst);
    // None means the timer won the race; the write itself was cancelled.
    let outcome = tokio::select! {
        _ = shutdown.changed() => {
            pump.sending.store(false, Ordering::SeqCst);
            return (0, true);
        }
        outcome = async {
            if timeout.is_zero() {
                Some(writer.write_all(data).await.map(|_| data.len()))
            } else {
                tokio::time::timeout(timeout, writer.write(data)).await.ok()
            }
        } => outcome,
    };
    pump.sending.store(false, Ordering::SeqCst);

    match outcome {
        None => (0, false),
        Some(Ok(count)) => {
            if count > 0 {
                pump.bytes_sent.fetch_add(count as u64, Ordering::SeqCst);
                ep.record_sent(count as u64);
                ep.fire_send(count, pump.bytes_pending.load(Ordering::SeqCst));
            }
            (count, false)
        }
        Some(Err(err)) => {
            let err = Error::Io(err);
            ep.report(&err);
            Arc::clone(ep).schedule_disconnect();
            (0, true)
        }
    }
}

async fn read_loop<E: Endpoint>(
    ep: Arc<E>,
    mut reader: ReadHalf<StreamBox>,
    mut commands: mpsc::UnboundedReceiver<ReadCmd>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut armed = false;
    let pump = ep.pump();
    let chunk = pump.recv_chunk.load(Ordering::SeqCst);
    let mut buf = BytesMut::zeroed(chunk);

    'outer: loop {
        if armed {
            pump.receiving.store(true, Ordering::SeqCst);
            tokio::select! {
                _ = shutdown.changed() => break,
                command = commands.recv() => {
                    match command {
                        None => break,
                        Some(ReadCmd::Arm) => {}
                        Some(ReadCmd::Direct { len, timeout, reply }) => {
                            if read_direct(&ep, &mut reader, len, timeout, reply, &mut shutdown).await {
                                break;
                            }
                        }
                    }
                }
                result = reader.read(&mut buf[..]) => {
                    pump.receiving.store(false, Ordering::SeqCst);
                    match result {
                        Ok(0) => {
                            // Peer closed its half; benign, tear down.
                            ep.report(&end_of_stream());
                            Arc::clone(&ep).schedule_disconnect();
                            break;
                        }
                        Ok(count) => {
                            pump.bytes_received.fetch_add(count as u64, Ordering::SeqCst);
                            ep.record_received(count as u64);
                            ep.fire_receive(&buf[..count]);
                            if count == buf.len() {
                                // Filled the buffer exactly: grow, unless
                                // doubling would cross the limit.
                                let limit = pump.receive_limit.load(Ordering::SeqCst);
                                if limit > 0 && count * 2 > limit {
                                    ep.report(&Error::ReceiveBufferFull { limit });
                                    Arc::clone(&ep).schedule_disconnect();
                                    break 'outer;
                                }
                                buf.resize(count * 2, 0);
                            }
                        }
                        Err(err) => {
                            ep.report(&Error::Io(err));
                            Arc::clone(&ep).schedule_disconnect();
                            break;
                        }
                    }
                }
            }
        } else {
            tokio::select! {
                _ = shutdown.changed() => break,
                command = commands.recv() => match command {
                    None => break,
                    Some(ReadCmd::Arm) => armed = true,
                    Some(ReadCmd::Direct { len, timeout, reply }) => {
                        if read_direct(&ep, &mut reader, len, timeout, reply, &mut shutdown).await {
                            break;
                        }
                    }
                }
            }
        }
    }
    pump.receiving.store(false, Ordering::SeqCst);
    trace!("read task finished");
}

/// One synchronous read, optionally raced against a timer. Returns true
/// when the read loop should stop.
async fn read_direct<E: Endpoint>(
    ep: &Arc<E>,
    reader: &mut ReadHalf<StreamBox>,
    len: usize,
    timeout: Duration,
    reply: oneshot::Sender<(SlabBuf, usize)>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let pump = ep.pump();
    let mut staged = pump.recv_slab.lock().acquire_zeroed(len);
    pump.receiving.store(true, Ordering::SeqCst);
    // None means the timer won the race; the read itself was cancelled.
    let outcome = tokio::select! {
        _ = shutdown.changed() => {
            pump.receiving.store(false, Ordering::SeqCst);
            staged.truncate(0);
            let _ = reply.send((staged, 0));
            return true;
        }
        outcome = async {
            if timeout.is_zero() {
                Some(reader.read(staged.as_mut_slice()).await)
            } else {
                tokio::time::timeout(timeout, reader.read(staged.as_mut_slice())).await.ok()
            }
        } => outcome,
    };
    pump.receiving.store(false, Ordering::SeqCst);

    match outcome {
        None => {
            staged.truncate(0);
            let _ = reply.send((staged, 0));
            false
        }
        Some(Ok(0)) => {
            staged.truncate(0);
            let _ = reply.send((staged, 0));
            ep.report(&end_of_stream());
            Arc::clone(ep).schedule_disconnect();
            true
        }
        Some(Ok(count)) => {
            pump.bytes_received.fetch_add(count as u64, Ordering::SeqCst);
            ep.record_received(count as u64);
            staged.truncate(count);
            ep.fire_receive(&staged[..]);
            let _ = reply.send((staged, count));
            false
        }
        Some(Err(err)) => {
            staged.truncate(0);
            let _ = reply.send((staged, 0));
            ep.report(&Error::Io(err));
            Arc::clone(ep).schedule_disconnect();
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use riptide_core::{NoopServiceEvents, Service};
    use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt as _};

    struct MockEndpoint {
        pump: Pump,
        ready: AtomicBool,
        received: Mutex<Vec<u8>>,
        send_events: AtomicUsize,
        empty_events: AtomicUsize,
        errors: Mutex<Vec<String>>,
        disconnects: AtomicUsize,
    }

    impl MockEndpoint {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                pump: Pump::new(),
                ready: AtomicBool::new(true),
                received: Mutex::new(Vec::new()),
                send_events: AtomicUsize::new(0),
                empty_events: AtomicUsize::new(0),
                errors: Mutex::new(Vec::new()),
                disconnects: AtomicUsize::new(0),
            })
        }
    }

    impl Endpoint for MockEndpoint {
        fn pump(&self) -> &Pump {
            &self.pump
        }
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
        fn fire_receive(&self, data: &[u8]) {
            self.received.lock().extend_from_slice(data);
        }
        fn fire_send(&self, _sent: usize, _pending: u64) {
            self.send_events.fetch_add(1, Ordering::SeqCst);
        }
        fn fire_empty(&self) {
            self.empty_events.fetch_add(1, Ordering::SeqCst);
        }
        fn report(&self, err: &Error) {
            if !err.is_benign() {
                self.errors.lock().push(err.to_string());
            }
        }
        fn schedule_disconnect(self: Arc<Self>) {
            self.ready.store(false, Ordering::SeqCst);
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.pump.signal_shutdown(false);
        }
    }

    fn current_loop() -> Arc<IoLoop> {
        Service::from_handle(
            Arc::new(NoopServiceEvents),
            tokio::runtime::Handle::current(),
            false,
        )
        .next_io()
    }

    async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn campaign_preserves_append_order_across_partial_writes() {
        // Tiny pipe capacity forces many partial writes per campaign.
        let (local, mut remote) = duplex(8);
        let ep = MockEndpoint::new();
        let io = current_loop();
        start_io(&ep, &io, Box::new(local));

        assert!(send_async(ep.as_ref(), b"hello "));
        assert!(send_async(ep.as_ref(), b"world"));

        let mut got = vec![0u8; 11];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello world");

        wait_for("counters settle", || {
            ep.pump.bytes_sent.load(Ordering::SeqCst) == 11
                && ep.pump.bytes_pending.load(Ordering::SeqCst) == 0
                && ep.empty_events.load(Ordering::SeqCst) >= 1
        })
        .await;
        assert!(ep.send_events.load(Ordering::SeqCst) >= 1);
        assert!(ep.errors.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_limit_refuses_the_append() {
        let (local, _remote) = duplex(64);
        let ep = MockEndpoint::new();
        ep.pump.send_limit.store(4, Ordering::SeqCst);
        let io = current_loop();
        start_io(&ep, &io, Box::new(local));

        assert!(!send_async(ep.as_ref(), b"too big"));
        assert_eq!(ep.pump.bytes_pending.load(Ordering::SeqCst), 0);
        assert!(ep
            .errors
            .lock()
            .iter()
            .any(|message| message.contains("send buffer limit")));
        // The endpoint itself stays up.
        assert_eq!(ep.disconnects.load(Ordering::SeqCst), 0);
        assert!(send_async(ep.as_ref(), b"ok"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn receive_buffer_grows_to_absorb_bursts() {
        let (local, mut remote) = duplex(256);
        let ep = MockEndpoint::new();
        ep.pump.set_recv_chunk(4);
        let io = current_loop();
        start_io(&ep, &io, Box::new(local));
        ep.pump.arm();

        remote.write_all(&[7u8; 64]).await.unwrap();
        wait_for("all bytes surfaced", || {
            ep.pump.bytes_received.load(Ordering::SeqCst) == 64
        })
        .await;
        assert_eq!(ep.received.lock().len(), 64);
        assert!(ep.errors.lock().is_empty());
        assert_eq!(ep.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn receive_limit_tears_the_connection_down() {
        let (local, mut remote) = duplex(256);
        let ep = MockEndpoint::new();
        ep.pump.set_recv_chunk(4);
        ep.pump.receive_limit.store(7, Ordering::SeqCst);
        let io = current_loop();
        start_io(&ep, &io, Box::new(local));
        ep.pump.arm();

        // Enough backlog that a read fills the 4-byte buffer; doubling
        // to 8 would cross the limit of 7.
        remote.write_all(&[1u8; 32]).await.unwrap();
        wait_for("exhaustion disconnect", || {
            ep.disconnects.load(Ordering::SeqCst) == 1
        })
        .await;
        assert!(ep
            .errors
            .lock()
            .iter()
            .any(|message| message.contains("receive buffer limit")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peer_close_is_a_benign_disconnect() {
        let (local, remote) = duplex(64);
        let ep = MockEndpoint::new();
        let io = current_loop();
        start_io(&ep, &io, Box::new(local));
        ep.pump.arm();

        drop(remote);
        wait_for("eof disconnect", || {
            ep.disconnects.load(Ordering::SeqCst) == 1
        })
        .await;
        assert!(ep.errors.lock().is_empty(), "eof must stay silent");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn teardown_clears_buffers_and_flags() {
        let (local, _remote) = duplex(4);
        let ep = MockEndpoint::new();
        let io = current_loop();
        start_io(&ep, &io, Box::new(local));

        // More than the pipe holds, so bytes stay pending.
        assert!(send_async(ep.as_ref(), &[9u8; 64]));
        ep.pump.signal_shutdown(false);
        ep.pump.join_tasks().await;
        ep.pump.drop_channels();
        ep.pump.clear_buffers();

        assert_eq!(ep.pump.bytes_pending.load(Ordering::SeqCst), 0);
        assert_eq!(ep.pump.bytes_sending.load(Ordering::SeqCst), 0);
        assert!(!ep.pump.sending.load(Ordering::SeqCst));
        assert!(!ep.pump.receiving.load(Ordering::SeqCst));
        assert!(ep.pump.main_is_empty());
    }
}
