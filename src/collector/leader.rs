use crate::{
    error::{CollectorError, FrameError},
    events::{self, Frame, MetricEvent},
    registry::Registry,
};
use mio::{
    Events, Interest, Poll, Registry as PollRegistry, Token, Waker,
    net::{UnixListener, UnixStream},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

const WAKER: Token = Token(0);
const LISTENER: Token = Token(1);
const START_TOKEN: Token = Token(2);
const BLOCK_SIZE: usize = 16384;

/// In-process handle to the leader.
///
/// Local writes go straight into the registry under the same lock the event loop
/// takes for each remote operation.
#[derive(Debug)]
pub struct Leader {
    registry: Arc<Mutex<Registry>>,
    running: Arc<AtomicBool>,
    waker: Waker,
}

impl Leader {
    pub fn send(&self, event: &MetricEvent) {
        self.registry.lock().apply(event);
    }

    pub fn query(&self) -> String {
        self.registry.lock().serialize()
    }

    pub fn stop(&self) {
        log::debug!("Stopping collector leader...");
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            log::warn!("Failed to wake leader event loop: {e}");
        }
    }
}

/// The leader's single-threaded readiness loop over the listener and every follower connection.
pub struct EventLoop {
    poll: Poll,
    listener: UnixListener,
    connections: HashMap<Token, Connection>,
    next_token: Token,
    registry: Arc<Mutex<Registry>>,
    running: Arc<AtomicBool>,
    socket_path: PathBuf,
    poll_interval: Duration,
}

/// Binds the leader socket, replacing any stale socket file left at `socket_path`.
pub fn bind(
    socket_path: &Path,
    poll_interval: Duration,
) -> Result<(Leader, EventLoop), CollectorError> {
    match fs::remove_file(socket_path) {
        Ok(()) => log::debug!("Removed stale socket file {}", socket_path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut listener = UnixListener::bind(socket_path)?;
    let poll = Poll::new()?;
    let waker = Waker::new(poll.registry(), WAKER)?;
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;
    log::debug!("Listening on {}", socket_path.display());

    let registry = Arc::new(Mutex::new(Registry::new()));
    let running = Arc::new(AtomicBool::new(true));
    let leader = Leader {
        registry: Arc::clone(&registry),
        running: Arc::clone(&running),
        waker,
    };
    let event_loop = EventLoop {
        poll,
        listener,
        connections: HashMap::new(),
        next_token: START_TOKEN,
        registry,
        running,
        socket_path: socket_path.to_path_buf(),
        poll_interval,
    };
    Ok((leader, event_loop))
}

impl EventLoop {
    /// Runs until [`Leader::stop`] is called, then closes every socket and removes the
    /// socket file.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(128);
        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_interval)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("Error during poll: {e}");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    LISTENER => self.accept_connections(),
                    token => self.drive(
                        token,
                        event.is_readable() || event.is_read_closed(),
                        event.is_writable(),
                    ),
                }
            }
        }
        self.shutdown();
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _)) => {
                    let token = next(&mut self.next_token);
                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        log::warn!("Failed to register connection: {e}");
                        continue;
                    }
                    log::debug!("Accepted connection {}", token.0);
                    self.connections.insert(token, Connection::new(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("Failed to accept connection: {e}");
                    break;
                }
            }
        }
    }

    fn drive(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let keep = conn.on_ready(token, readable, writable, &self.registry, self.poll.registry());
        if !keep {
            self.close(token);
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            log::debug!("Closing connection {}", token.0);
            if !conn.inbox.is_empty() {
                log::debug!(
                    "Discarding {} unparsed bytes from connection {}",
                    conn.inbox.len(),
                    token.0
                );
            }
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }

    fn shutdown(mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close(token);
        }

        log::debug!("Closing server socket...");
        let _ = self.poll.registry().deregister(&mut self.listener);
        match fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {e}", self.socket_path.display()),
        }
        log::debug!("Collector leader stopped.");
    }
}

/// Per-follower state: bytes read but not yet framed, and reply bytes not yet written.
struct Connection {
    stream: UnixStream,
    inbox: Vec<u8>,
    outbox: Vec<u8>,
    wants_write: bool,
}

impl Connection {
    const fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            inbox: Vec::new(),
            outbox: Vec::new(),
            wants_write: false,
        }
    }

    /// Returns `false` once the connection should be torn down.
    fn on_ready(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        registry: &Mutex<Registry>,
        poll: &PollRegistry,
    ) -> bool {
        let mut open = true;
        if readable {
            open = self.read_available();
            if let Err(e) = self.process_frames(registry) {
                log::warn!("Malformed message from connection {}: {e}", token.0);
                return false;
            }
        }

        if writable || !self.outbox.is_empty() {
            if let Err(e) = self.flush() {
                log::debug!("Write to connection {} failed: {e}", token.0);
                return false;
            }
        }

        if open {
            if let Err(e) = self.update_interest(poll, token) {
                log::warn!("Failed to update interest for connection {}: {e}", token.0);
                return false;
            }
        }
        open
    }

    /// Reads until the socket would block. Returns `false` on EOF or a read error.
    fn read_available(&mut self) -> bool {
        let mut chunk = [0u8; BLOCK_SIZE];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.inbox.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("Read failed: {e}");
                    return false;
                }
            }
        }
    }

    fn process_frames(&mut self, registry: &Mutex<Registry>) -> Result<(), FrameError> {
        let mut consumed = 0;
        let result = loop {
            match events::decode(&self.inbox[consumed..]) {
                Ok(Some((frame, used))) => {
                    consumed += used;
                    match frame {
                        Frame::Query => {
                            let text = registry.lock().serialize();
                            self.outbox.extend_from_slice(&events::encode_response(&text));
                        }
                        Frame::Event(event) => {
                            log::trace!("Applying {event:?}");
                            registry.lock().apply(&event);
                        }
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.inbox.drain(..consumed);
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn update_interest(&mut self, poll: &PollRegistry, token: Token) -> io::Result<()> {
        let wants_write = !self.outbox.is_empty();
        if wants_write != self.wants_write {
            let interest = if wants_write {
                Interest::READABLE.add(Interest::WRITABLE)
            } else {
                Interest::READABLE
            };
            poll.reregister(&mut self.stream, token, interest)?;
            self.wants_write = wants_write;
        }
        Ok(())
    }
}

fn next(current: &mut Token) -> Token {
    let next = *current;
    current.0 += 1;
    next
}
