//! The NBD request engine.
//!
//! Three-stage pipeline over the kernel command socket:
//!
//! ```text
//!   socket ──> reader ──> request queue ──> workers ──> response queue ──> writer ──> socket
//! ```
//!
//! One reader decodes framed requests and classifies them, a pool of workers
//! executes them against the [`Device`], and one writer frames replies back.
//! Replies may be reordered relative to arrival; the kernel correlates them
//! by the opaque request handle.
//!
//! ## Write/flush ordering
//!
//! The engine maintains a "current epoch" `RwLock`. Every write and trim
//! takes an owned read guard on the current epoch at decode time and releases
//! it when its device op completes. A flush swaps in a fresh epoch and
//! carries the old one; its worker acquires (and immediately drops) the old
//! epoch's write side before calling `Device::flush`, which blocks until
//! every previously received write has finished. That is exactly the NBD
//! contract: a successful flush reply implies durability of every write that
//! preceded the flush on the wire.
//!
//! ## Shutdown
//!
//! A disconnect request, a framing error, or a socket error cancels the
//! session: the reader stops and drops the request queue, workers drain it
//! and exit, the writer drains the response queue and flushes, and finally
//! the device is closed exactly once.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Mutex, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, error, info, warn};
use vblk_proto::{Request, RequestKind, Response, VbdResult};

use crate::device::Device;

const REQUEST_QUEUE_DEPTH: usize = 64;
const RESPONSE_QUEUE_DEPTH: usize = 32;
/// Socket buffering on both directions; large enough to absorb a burst of
/// maximum-size requests without syscalls per frame.
const STREAM_BUF_BYTES: usize = 16 * 1024 * 1024;

/// Empirically derived heuristic for the total worker budget on this
/// machine; the engine subtracts the reader and writer from it.
pub fn recommended_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus * 6
}

/// Epoch lock used by the flush barrier.
type Epoch = Arc<RwLock<()>>;

/// A decoded request traveling from the reader to a worker, carrying its
/// flush-barrier role.
struct Job {
    req: Request,
    /// Held by writes and trims; released once the device op returns.
    write_guard: Option<OwnedRwLockReadGuard<()>>,
    /// Carried by flushes: the epoch whose writes must drain first.
    flush_epoch: Option<Epoch>,
}

/// Service NBD requests from `stream` against `device` until disconnect or a
/// fatal session error, then close the device.
///
/// `worker_count` of 0 selects [`recommended_worker_count`]. Two slots are
/// reserved for the reader and writer; at least one I/O worker always runs.
pub async fn serve<S>(stream: S, device: Arc<dyn Device>, worker_count: usize) -> VbdResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let requested = if worker_count == 0 {
        recommended_worker_count()
    } else {
        worker_count
    };
    let worker_count = requested.saturating_sub(2).max(1);
    let block_size = device.block_size();

    let (rd, wr) = tokio::io::split(stream);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (req_tx, req_rx) = mpsc::channel::<Job>(REQUEST_QUEUE_DEPTH);
    let (resp_tx, resp_rx) = mpsc::channel::<Response>(RESPONSE_QUEUE_DEPTH);
    // Recycled request/response shells; their payload buffers grow on demand
    // and are retained across uses.
    let (req_pool_tx, req_pool_rx) = mpsc::unbounded_channel::<Request>();
    let (resp_pool_tx, resp_pool_rx) = mpsc::unbounded_channel::<Response>();

    let reader = tokio::spawn(read_loop(
        rd,
        req_tx,
        req_pool_rx,
        cancel_tx.clone(),
        cancel_rx,
    ));
    let writer = tokio::spawn(write_loop(wr, resp_rx, resp_pool_tx, cancel_tx));

    let shared_req_rx = Arc::new(Mutex::new(req_rx));
    let shared_resp_pool = Arc::new(std::sync::Mutex::new(resp_pool_rx));
    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        workers.push(tokio::spawn(worker_loop(
            Arc::clone(&device),
            block_size,
            Arc::clone(&shared_req_rx),
            resp_tx.clone(),
            req_pool_tx.clone(),
            Arc::clone(&shared_resp_pool),
        )));
    }
    drop(resp_tx);
    drop(req_pool_tx);

    let _ = reader.await;
    for worker in workers {
        let _ = worker.await;
    }
    let _ = writer.await;

    debug!("engine: session over, closing device");
    device.close().await?;
    Ok(())
}

async fn read_loop<R>(
    rd: R,
    req_tx: mpsc::Sender<Job>,
    mut pool_rx: mpsc::UnboundedReceiver<Request>,
    cancel_tx: watch::Sender<bool>,
    mut cancel_rx: watch::Receiver<bool>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut strm = BufReader::with_capacity(STREAM_BUF_BYTES, rd);
    let mut epoch: Epoch = Arc::new(RwLock::new(()));

    loop {
        if *cancel_rx.borrow() {
            return;
        }

        let mut req = pool_rx.try_recv().unwrap_or_default();
        let decoded = tokio::select! {
            _ = cancel_rx.changed() => return,
            res = req.decode(&mut strm) => res,
        };
        if let Err(err) = decoded {
            if !*cancel_rx.borrow() {
                error!("engine: request decode failed: {err}");
                let _ = cancel_tx.send(true);
            }
            return;
        }

        let mut job = Job {
            req,
            write_guard: None,
            flush_epoch: None,
        };
        match job.req.kind {
            Some(RequestKind::Write) | Some(RequestKind::Trim) => {
                job.write_guard = Some(Arc::clone(&epoch).read_owned().await);
            }
            Some(RequestKind::Flush) => {
                // Swap in a fresh epoch; the flush drains the old one.
                job.flush_epoch = Some(std::mem::replace(&mut epoch, Arc::new(RwLock::new(()))));
            }
            Some(RequestKind::Disconnect) => {
                info!("engine: disconnect requested");
                let _ = cancel_tx.send(true);
                return;
            }
            _ => {}
        }

        if req_tx.send(job).await.is_err() {
            return;
        }
    }
}

async fn worker_loop(
    device: Arc<dyn Device>,
    block_size: u64,
    req_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    resp_tx: mpsc::Sender<Response>,
    req_pool_tx: mpsc::UnboundedSender<Request>,
    resp_pool: Arc<std::sync::Mutex<mpsc::UnboundedReceiver<Response>>>,
) {
    loop {
        let job = req_rx.lock().await.recv().await;
        let Some(mut job) = job else { return };

        let mut resp = resp_pool
            .lock()
            .expect("response pool lock")
            .try_recv()
            .unwrap_or_default();
        execute(&device, block_size, &mut job, &mut resp).await;

        let _ = req_pool_tx.send(job.req);
        if resp_tx.send(resp).await.is_err() {
            return;
        }
    }
}

fn is_aligned(req: &Request, block_size: u64) -> bool {
    req.pos % block_size == 0 && u64::from(req.len) % block_size == 0
}

/// Run one request against the device and fill in the reply.
async fn execute(device: &Arc<dyn Device>, block_size: u64, job: &mut Job, resp: &mut Response) {
    let code = match job.req.kind {
        Some(RequestKind::Read) => {
            if !is_aligned(&job.req, block_size) {
                warn!(
                    "engine: unaligned read rejected (pos={}, len={})",
                    job.req.pos, job.req.len
                );
                vblk_proto::NBD_EINVAL
            } else {
                let pos = job.req.pos;
                let buf = resp.read_buffer(&job.req);
                match device.read_at(buf, pos).await {
                    Ok(_) => vblk_proto::NBD_OK,
                    Err(err) => {
                        warn!("engine: read at {pos} failed: {err}");
                        err.nbd_code()
                    }
                }
            }
        }

        Some(RequestKind::Write) => {
            let code = if !is_aligned(&job.req, block_size) {
                warn!(
                    "engine: unaligned write rejected (pos={}, len={})",
                    job.req.pos, job.req.len
                );
                vblk_proto::NBD_EINVAL
            } else {
                match device.write_at(&job.req.payload, job.req.pos).await {
                    Ok(_) => vblk_proto::NBD_OK,
                    Err(err) => {
                        warn!("engine: write at {} failed: {err}", job.req.pos);
                        err.nbd_code()
                    }
                }
            };
            // Release the flush barrier now that the device op is done.
            job.write_guard.take();
            code
        }

        Some(RequestKind::Trim) => {
            let code = match device.trim(job.req.pos, u64::from(job.req.len)).await {
                Ok(()) => vblk_proto::NBD_OK,
                Err(err) => {
                    warn!("engine: trim at {} failed: {err}", job.req.pos);
                    err.nbd_code()
                }
            };
            job.write_guard.take();
            code
        }

        Some(RequestKind::Flush) => {
            if let Some(old_epoch) = job.flush_epoch.take() {
                // Blocks until every write received before this flush has
                // completed; the guard itself is not needed afterwards.
                drop(old_epoch.write().await);
            }
            match device.flush().await {
                Ok(()) => vblk_proto::NBD_OK,
                Err(err) => {
                    warn!("engine: flush failed: {err}");
                    err.nbd_code()
                }
            }
        }

        Some(RequestKind::Unknown(raw)) => {
            warn!("engine: unsupported request type {raw}");
            vblk_proto::NBD_ENOTSUP
        }

        // Disconnects never reach a worker; None means an undecoded shell,
        // which would be an engine bug.
        Some(RequestKind::Disconnect) | None => vblk_proto::NBD_EINVAL,
    };

    resp.set(&job.req, code);
}

async fn write_loop<W>(
    wr: W,
    mut resp_rx: mpsc::Receiver<Response>,
    resp_pool_tx: mpsc::UnboundedSender<Response>,
    cancel_tx: watch::Sender<bool>,
) where
    W: AsyncWrite + Send + Unpin,
{
    let mut strm = BufWriter::with_capacity(STREAM_BUF_BYTES, wr);

    loop {
        // Drain eagerly; flush the socket only when the queue goes idle.
        let resp = match resp_rx.try_recv() {
            Ok(resp) => resp,
            Err(TryRecvError::Empty) => {
                if let Err(err) = strm.flush().await {
                    error!("engine: reply flush failed: {err}");
                    let _ = cancel_tx.send(true);
                }
                match resp_rx.recv().await {
                    Some(resp) => resp,
                    None => break,
                }
            }
            Err(TryRecvError::Disconnected) => break,
        };

        if let Err(err) = resp.write(&mut strm).await {
            error!("engine: reply write failed: {err}");
            let _ = cancel_tx.send(true);
        }
        let _ = resp_pool_tx.send(resp);
    }

    let _ = strm.flush().await;
}
