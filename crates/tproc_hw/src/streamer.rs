use crate::{HwError, Soc, split_iq};
use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Failures of a readout run.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("a readout is already running")]
    AlreadyRunning,

    /// The buffer wrapped before it was drained. Data since `last_drained`
    /// is lost and the run cannot be resumed.
    #[error(
        "accumulation buffer overflow: {unread} unread samples after count {last_drained} \
         (capacity {capacity}), lower the stride or poll faster"
    )]
    Overflow {
        last_drained: u64,
        unread: u64,
        capacity: usize,
    },

    #[error("hardware transfer did not complete within {0:?}")]
    HardwareTimeout(Duration),

    #[error(transparent)]
    Hardware(HwError),

    #[error("readout worker panicked")]
    WorkerPanicked,

    #[error("failed to spawn readout worker: {0}")]
    Spawn(std::io::Error),
}

impl From<HwError> for StreamError {
    fn from(err: HwError) -> Self {
        match err {
            HwError::Timeout(t) => StreamError::HardwareTimeout(t),
            other => StreamError::Hardware(other),
        }
    }
}

/// Tuning of the readout worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Unread samples that trigger a transfer. `None` uses a tenth of the
    /// buffer capacity.
    pub stride: Option<usize>,
    /// Sleep between counter polls. Zero busy-polls.
    pub poll_interval: Duration,
    /// Deadline of every single transfer.
    pub transfer_timeout: Duration,
    /// Samples accumulated per counter increment.
    pub reads_per_count: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stride: None,
            poll_interval: Duration::from_millis(1),
            transfer_timeout: Duration::from_secs(1),
            reads_per_count: 1,
        }
    }
}

impl StreamConfig {
    /// Effective stride for a buffer of `capacity` samples.
    ///
    /// The stride stays below the capacity: waiting for a full buffer would
    /// report an overflow on every window.
    pub fn stride_for(&self, capacity: usize) -> usize {
        self.stride
            .unwrap_or(capacity / 10)
            .clamp(1, capacity.saturating_sub(1).max(1))
    }
}

/// Samples of one readout channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IqData {
    pub i: Vec<i32>,
    pub q: Vec<i32>,
}

impl IqData {
    fn from_words(words: &[u64]) -> Self {
        let (i, q) = words.iter().map(|w| split_iq(*w)).unzip();
        Self { i, q }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStats {
    /// Time since the readout started.
    pub elapsed: Duration,
    /// Counter value that triggered the transfer.
    pub count: u64,
    /// Buffer address of the first sample.
    pub address: usize,
    pub length: usize,
}

/// One drained window, one [`IqData`] per requested channel in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<IqData>,
    pub stats: ChunkStats,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.stats.length
    }

    pub fn is_empty(&self) -> bool {
        self.stats.length == 0
    }
}

type Message = Result<Chunk, StreamError>;

/// Drains accumulation buffers in the background while a program runs.
///
/// At most one readout is alive at a time. Chunks and the terminal error, if
/// any, arrive in order through an unbounded channel; the caller collects
/// them with [`DataStreamer::poll_data`]. The caller must not reconfigure the
/// board while a readout is alive.
pub struct DataStreamer<S: Soc + 'static> {
    soc: Arc<S>,
    config: StreamConfig,
    stop: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    rx: Option<Receiver<Message>>,
    worker: Option<JoinHandle<()>>,
    pending: Option<StreamError>,
}

impl<S: Soc + 'static> DataStreamer<S> {
    pub fn new(soc: Arc<S>, config: StreamConfig) -> Self {
        Self {
            soc,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            done: Arc::new(AtomicBool::new(true)),
            rx: None,
            worker: None,
            pending: None,
        }
    }

    pub fn soc(&self) -> &Arc<S> {
        &self.soc
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Starts a readout of `total_count` samples on every channel of
    /// `channels`.
    ///
    /// The worker zeroes the counter word at `counter_addr`, starts the
    /// processor, then polls the counter. Leftovers of a finished previous
    /// run are discarded.
    ///
    /// # Arguments
    ///
    /// * `total_count` - Samples the program produces before it ends
    /// * `counter_addr` - Data memory word the program publishes its count to
    /// * `channels` - Readout channels drained on every transfer
    ///
    /// # Returns
    ///
    /// `StreamError::AlreadyRunning` while the previous readout is alive.
    pub fn start_readout(
        &mut self,
        total_count: u64,
        counter_addr: u32,
        channels: &[usize],
    ) -> Result<(), StreamError> {
        if self.readout_alive() {
            return Err(StreamError::AlreadyRunning);
        }
        self.join_worker();
        self.rx = None;
        self.pending = None;

        let stop = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let (tx, rx) = unbounded();
        let worker = Worker {
            soc: Arc::clone(&self.soc),
            config: self.config.clone(),
            stop: Arc::clone(&stop),
            tx,
            total_count,
            counter_addr,
            channels: channels.to_vec(),
        };

        let done_flag = Arc::clone(&done);
        let handle = thread::Builder::new()
            .name("tproc-readout".into())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.run()));
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err),
                    Err(_) => Some(StreamError::WorkerPanicked),
                };
                if let Some(err) = failure {
                    warn!(error = %err, "readout failed");
                    let _ = worker.tx.send(Err(err));
                }
                done_flag.store(true, Ordering::Release);
            })
            .map_err(StreamError::Spawn)?;

        info!(total_count, counter_addr, ?channels, "readout started");
        self.stop = stop;
        self.done = done;
        self.rx = Some(rx);
        self.worker = Some(handle);
        Ok(())
    }

    /// Asks the worker to exit at its next poll. An in-flight transfer
    /// completes first. Already delivered chunks stay queued.
    pub fn stop_readout(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// True while a started worker has not finished.
    pub fn readout_alive(&self) -> bool {
        self.worker.is_some() && !self.done.load(Ordering::Acquire)
    }

    /// True once the latest worker has finished, for any reason, and before
    /// the first readout.
    pub fn readout_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Returns the chunks queued so far, oldest first, without blocking.
    ///
    /// A worker error is returned after all chunks that preceded it: if
    /// chunks are queued ahead of the error, they are returned now and the
    /// error on the next call.
    pub fn poll_data(&mut self) -> Result<Vec<Chunk>, StreamError> {
        if let Some(err) = self.pending.take() {
            return Err(err);
        }
        let mut chunks = Vec::new();
        let Some(rx) = &self.rx else {
            return Ok(chunks);
        };
        loop {
            match rx.try_recv() {
                Ok(Ok(chunk)) => chunks.push(chunk),
                Ok(Err(err)) if chunks.is_empty() => return Err(err),
                Ok(Err(err)) => {
                    self.pending = Some(err);
                    break;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        Ok(chunks)
    }

    /// Collects chunks until the worker finishes.
    ///
    /// If the worker is still running after `deadline`, it is stopped and the
    /// chunks delivered up to that point are returned.
    pub fn drain_until_done(&mut self, deadline: Duration) -> Result<Vec<Chunk>, StreamError> {
        let started = Instant::now();
        let mut chunks = Vec::new();
        loop {
            let finished = self.readout_done() || self.worker.is_none();
            chunks.extend(self.poll_data()?);
            if finished {
                chunks.extend(self.poll_data()?);
                return Ok(chunks);
            }
            if started.elapsed() >= deadline && !self.stop.load(Ordering::Acquire) {
                warn!(?deadline, "readout still running, stopping it");
                self.stop_readout();
            }
            thread::sleep(self.config.poll_interval.max(Duration::from_micros(100)));
        }
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("readout worker exited abnormally");
            }
        }
    }
}

impl<S: Soc + 'static> Drop for DataStreamer<S> {
    fn drop(&mut self) {
        self.stop_readout();
        self.join_worker();
    }
}

struct Worker<S> {
    soc: Arc<S>,
    config: StreamConfig,
    stop: Arc<AtomicBool>,
    tx: Sender<Message>,
    total_count: u64,
    counter_addr: u32,
    channels: Vec<usize>,
}

impl<S: Soc> Worker<S> {
    fn run(&self) -> Result<(), StreamError> {
        let capacity = self.soc.buffer_capacity();
        let stride = self.config.stride_for(capacity) as u64;
        let total = self.total_count;

        self.soc.write_mem(self.counter_addr, 0)?;
        self.soc.start()?;
        let started = Instant::now();

        let mut last = 0u64;
        while last < total {
            if self.stop.load(Ordering::Acquire) {
                warn!(delivered = last, total, "readout stopped early");
                return Ok(());
            }

            let raw = u64::from(self.soc.read_mem(self.counter_addr)?);
            let count = raw.saturating_mul(self.config.reads_per_count).min(total);
            if count < (last + stride).min(total) {
                self.idle();
                continue;
            }

            let unread = count - last;
            if unread >= capacity as u64 {
                warn!(last_drained = last, unread, capacity, "accumulation buffer overflow");
                return Err(StreamError::Overflow {
                    last_drained: last,
                    unread,
                    capacity,
                });
            }

            // Transfers move I/Q pairs, so lengths are even. The final
            // window reads one padding sample instead of leaving a tail.
            let is_final = count == total;
            let length = if is_final { unread } else { unread & !1 };
            if length == 0 {
                self.idle();
                continue;
            }
            let fetch = (length + (length & 1)) as usize;
            let length = length as usize;
            let address = (last % capacity as u64) as usize;

            let mut data = Vec::with_capacity(self.channels.len());
            for &ch in &self.channels {
                let words = self.fetch(ch, address, fetch, capacity)?;
                data.push(IqData::from_words(&words[..length]));
            }

            let stats = ChunkStats {
                elapsed: started.elapsed(),
                count,
                address,
                length,
            };
            debug!(count, address, length, "drained chunk");
            if self.tx.send(Ok(Chunk { data, stats })).is_err() {
                // receiver dropped, nobody is listening
                return Ok(());
            }
            last += length as u64;
        }

        info!(total, elapsed = ?started.elapsed(), "readout finished");
        Ok(())
    }

    /// Reads a window that may cross the end of the circular buffer, as two
    /// transfers when it does.
    fn fetch(
        &self,
        ch: usize,
        address: usize,
        length: usize,
        capacity: usize,
    ) -> Result<Vec<u64>, HwError> {
        let timeout = self.config.transfer_timeout;
        if address + length <= capacity {
            return self.soc.transfer(ch, address, length, timeout);
        }
        let tail = capacity - address;
        let mut words = self.soc.transfer(ch, address, tail, timeout)?;
        words.extend(self.soc.transfer(ch, 0, length - tail, timeout)?);
        Ok(words)
    }

    fn idle(&self) {
        if self.config.poll_interval.is_zero() {
            std::hint::spin_loop();
        } else {
            thread::sleep(self.config.poll_interval);
        }
    }
}
