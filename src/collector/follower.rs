use crate::{
    config::CollectorConfig,
    error::CollectorError,
    events::{self, MetricEvent, QUERY_MARKER},
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use interprocess::local_socket::{GenericFilePath, prelude::*};
use parking_lot::Mutex;
use std::{
    fmt,
    io::{self, Read, Write},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

const BLOCK_SIZE: usize = 16384;

#[derive(Debug)]
struct State {
    running: AtomicBool,
    drain: AtomicBool,
    broken: AtomicBool,
    reported: AtomicBool,
}

/// In-process handle to a follower: an unbounded outbound queue plus the leader connection
/// used for synchronous queries.
pub struct Follower {
    tx: Sender<Vec<u8>>,
    stream: Arc<Mutex<LocalSocketStream>>,
    state: Arc<State>,
}

impl fmt::Debug for Follower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Follower")
            .field("queued", &self.tx.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Drains the outbound queue onto the leader connection.
pub struct Forwarder {
    rx: Receiver<Vec<u8>>,
    stream: Arc<Mutex<LocalSocketStream>>,
    state: Arc<State>,
    poll_interval: Duration,
}

/// Connects to the leader socket, retrying with exponential backoff.
///
/// Gives up with [`CollectorError::StartFailed`] once `connect_attempts` are exhausted, or
/// with [`CollectorError::Stopped`] as soon as `stop_requested` is observed.
pub fn connect(
    config: &CollectorConfig,
    stop_requested: &AtomicBool,
) -> Result<(Follower, Forwarder), CollectorError> {
    let mut attempt = 0;
    let stream = loop {
        log::debug!(
            "Connecting to collector leader at {}",
            config.socket_path.display()
        );
        match dial(&config.socket_path) {
            Ok(stream) => break stream,
            Err(e) if attempt + 1 >= config.connect_attempts => {
                return Err(CollectorError::StartFailed(format!(
                    "could not connect to {} after {} attempts: {e}",
                    config.socket_path.display(),
                    attempt + 1
                )));
            }
            Err(e) => {
                log::warn!("Failed to connect to collector leader ({e}). Retrying...");
                if !sleep_unless_stopped(
                    config.backoff_for(attempt),
                    config.poll_interval,
                    stop_requested,
                ) {
                    return Err(CollectorError::Stopped);
                }
                attempt += 1;
            }
        }
    };

    let (tx, rx) = unbounded();
    let stream = Arc::new(Mutex::new(stream));
    let state = Arc::new(State {
        running: AtomicBool::new(true),
        drain: AtomicBool::new(true),
        broken: AtomicBool::new(false),
        reported: AtomicBool::new(false),
    });
    let follower = Follower {
        tx,
        stream: Arc::clone(&stream),
        state: Arc::clone(&state),
    };
    let forwarder = Forwarder {
        rx,
        stream,
        state,
        poll_interval: config.poll_interval,
    };
    Ok((follower, forwarder))
}

fn dial(path: &Path) -> io::Result<LocalSocketStream> {
    LocalSocketStream::connect(path.to_fs_name::<GenericFilePath>()?)
}

/// Sleeps for `total` in `slice`-sized steps. Returns `false` if a stop was requested.
fn sleep_unless_stopped(total: Duration, slice: Duration, stop_requested: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if stop_requested.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(slice.min(deadline - now));
    }
}

impl Follower {
    /// Queues `event` for the forwarding worker. Never blocks.
    ///
    /// # Errors
    /// Returns [`CollectorError::Disconnected`] once the leader connection has failed; the
    /// event is dropped.
    pub fn send(&self, event: &MetricEvent) -> Result<(), CollectorError> {
        if !self.state.broken.load(Ordering::Acquire) && self.tx.send(event.encode()).is_ok() {
            return Ok(());
        }
        if self.state.reported.swap(true, Ordering::AcqRel) {
            log::trace!("Dropping {event:?}: leader connection is closed");
        } else {
            log::warn!("Leader connection is closed; dropping {event:?} and later metrics");
        }
        Err(CollectorError::Disconnected)
    }

    /// Asks the leader for the exposition text and waits for the full response.
    ///
    /// A malformed or truncated response is logged and yields an empty string.
    pub fn query(&self) -> Result<String, CollectorError> {
        request_exposition(&mut self.stream.lock())
    }

    /// Asks the forwarder to exit, after emptying the queue when `drain` is set.
    pub fn stop(&self, drain: bool) {
        log::debug!("Stopping collector follower...");
        if drain {
            log::debug!("Waiting for metrics queue to be drained...");
        }
        self.state.drain.store(drain, Ordering::Release);
        self.state.running.store(false, Ordering::Release);
    }
}

fn request_exposition(stream: &mut LocalSocketStream) -> Result<String, CollectorError> {
    stream.write_all(&[QUERY_MARKER])?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; BLOCK_SIZE];
    loop {
        match events::decode_response(&buf) {
            Ok(Some((text, _))) => return Ok(text),
            Ok(None) => log::trace!("Waiting for more data from leader..."),
            Err(e) => {
                log::warn!("Malformed response from leader: {e}");
                return Ok(String::new());
            }
        }

        let n = stream.read(&mut chunk)?;
        if n == 0 {
            log::warn!("Leader closed the connection before answering a query");
            return Ok(String::new());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

impl Forwarder {
    pub fn run(self) {
        loop {
            match self.rx.recv_timeout(self.poll_interval) {
                Ok(message) => {
                    // `write_all` retries short writes until the whole frame is on the wire.
                    if let Err(e) = self.stream.lock().write_all(&message) {
                        log::error!("Failed to forward metrics to collector leader: {e}");
                        self.state.broken.store(true, Ordering::Release);
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if !self.state.running.load(Ordering::Acquire)
                && (!self.state.drain.load(Ordering::Acquire) || self.rx.is_empty())
            {
                break;
            }
        }

        let dropped = self.rx.len();
        if dropped > 0 {
            log::debug!("Discarded {dropped} queued metric messages");
        } else if self.state.drain.load(Ordering::Acquire)
            && !self.state.broken.load(Ordering::Acquire)
        {
            // Queries are answered in order, so a reply means every earlier frame was applied.
            if let Err(e) = request_exposition(&mut self.stream.lock()) {
                log::warn!("Leader did not confirm drained metrics: {e}");
            }
        }
        log::debug!("Collector follower stopped.");
    }
}
