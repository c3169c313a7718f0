mod flock;
mod follower;
mod leader;
mod readiness;

use crate::{
    config::CollectorConfig, counter::Counter, error::CollectorError, events::MetricEvent,
};
use flock::LockGuard;
use follower::Follower;
use leader::Leader;
use parking_lot::Mutex;
use readiness::Readiness;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Which side of the IPC channel this process ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Holds the lock, the listening socket and the authoritative registry.
    Leader,
    /// Forwards every operation to the leader.
    Follower,
}

#[derive(Debug)]
enum Endpoint {
    Leader(Leader),
    Follower(Follower),
}

impl Endpoint {
    const fn role(&self) -> Role {
        match self {
            Self::Leader(_) => Role::Leader,
            Self::Follower(_) => Role::Follower,
        }
    }

    fn send(&self, event: &MetricEvent) -> Result<(), CollectorError> {
        match self {
            Self::Leader(leader) => {
                leader.send(event);
                Ok(())
            }
            Self::Follower(follower) => follower.send(event),
        }
    }

    fn query(&self) -> Result<String, CollectorError> {
        match self {
            Self::Leader(leader) => Ok(leader.query()),
            Self::Follower(follower) => follower.query(),
        }
    }

    fn stop(&self, drain: bool) {
        match self {
            Self::Leader(leader) => leader.stop(),
            Self::Follower(follower) => follower.stop(drain),
        }
    }
}

#[derive(Debug)]
enum Task {
    NotStarted,
    Running(JoinHandle<()>),
    Finished,
}

#[derive(Debug)]
struct Inner {
    config: CollectorConfig,
    readiness: Readiness,
    task: Mutex<Task>,
    stop_requested: AtomicBool,
    drain_on_stop: AtomicBool,
}

impl Inner {
    fn publish(&self, endpoint: Endpoint) {
        let endpoint = Arc::new(endpoint);
        self.readiness.set_ready(Arc::clone(&endpoint));
        // `stop` may have run before the endpoint existed; honour it now.
        if self.stop_requested.load(Ordering::SeqCst) {
            endpoint.stop(self.drain_on_stop.load(Ordering::SeqCst));
        }
    }

    fn fail(&self, reason: String) {
        log::error!("Metrics collector failed to start: {reason}");
        self.readiness.set_failed(reason);
    }
}

/// A per-process metrics collector.
///
/// Every process sharing the same lock and socket paths constructs one `Collector` and calls
/// [`Collector::start`]. Exactly one of them wins the lock and serves the registry; the
/// others forward their operations to it. Which one a given process became is invisible to
/// callers apart from [`Collector::role`].
///
/// # Example
/// ```no_run
/// use multiproc_metrics::{Collector, CollectorConfig, LabelSet};
///
/// let collector = Collector::new(CollectorConfig::from_env().namespace("app"));
/// collector.start().unwrap();
///
/// let requests = collector.counter("requests_total", Some("Requests served.")).unwrap();
/// requests.inc_by(1.0, &LabelSet::new().with("pid", std::process::id())).unwrap();
///
/// let exposition = collector.query().unwrap();
/// collector.stop().unwrap();
/// ```
#[derive(Clone)]
pub struct Collector {
    inner: Arc<Inner>,
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("role", &self.role())
            .field("socket_path", &self.inner.config.socket_path)
            .finish_non_exhaustive()
    }
}

impl Collector {
    #[must_use]
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                readiness: Readiness::new(),
                task: Mutex::new(Task::NotStarted),
                stop_requested: AtomicBool::new(false),
                drain_on_stop: AtomicBool::new(true),
            }),
        }
    }

    /// Spawns the background task that decides this process's role and drives its endpoint.
    ///
    /// Returns immediately; operations issued before the role is decided wait for it.
    ///
    /// # Errors
    /// Returns [`CollectorError::AlreadyStarted`] on a second call, or an IO error if the
    /// task cannot be spawned.
    pub fn start(&self) -> Result<(), CollectorError> {
        let mut task = self.inner.task.lock();
        if !matches!(*task, Task::NotStarted) {
            return Err(CollectorError::AlreadyStarted);
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("metrics-collector".into())
            .spawn(move || run_role(&inner))?;
        *task = Task::Running(handle);
        Ok(())
    }

    /// The role this process was elected to, once decided.
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.inner.readiness.current().map(|endpoint| endpoint.role())
    }

    /// Blocks until the role is decided and its endpoint is bound or connected.
    ///
    /// # Errors
    /// Returns [`CollectorError::Timeout`] if `timeout` elapses first, or the startup failure
    /// that prevented the endpoint from coming up.
    pub fn wait_ready(&self, timeout: Option<Duration>) -> Result<Role, CollectorError> {
        self.endpoint_within(timeout).map(|endpoint| endpoint.role())
    }

    /// Creates a counter named `<namespace>_<name>` and registers it with the leader.
    ///
    /// # Errors
    /// Returns [`CollectorError::InvalidName`] for names outside `[a-zA-Z_:][a-zA-Z0-9_:]*`,
    /// or any error from waiting on the collector.
    pub fn counter(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<Counter, CollectorError> {
        let name = match &self.inner.config.namespace {
            Some(namespace) => format!("{namespace}_{name}"),
            None => name.to_string(),
        };
        Counter::register(self.clone(), name, description)
    }

    /// Hands one operation to the active endpoint.
    ///
    /// On a follower this only enqueues the message; it reaches the leader later.
    ///
    /// # Errors
    /// Returns the error from [`MetricEvent::validate`] for events that could not be framed or
    /// applied, [`CollectorError::Disconnected`] once a follower has lost the leader, or an
    /// error if the collector is not started, not ready within the configured timeout, failed
    /// to start, or has been stopped.
    pub fn send(&self, event: &MetricEvent) -> Result<(), CollectorError> {
        event.validate()?;
        self.endpoint()?.send(event)
    }

    /// Returns the shared registry in the Prometheus text exposition format
    /// (`text/plain; version=0.0.4`).
    ///
    /// # Errors
    /// Returns an error if the collector is unavailable or the leader connection fails.
    pub fn query(&self) -> Result<String, CollectorError> {
        self.endpoint()?.query()
    }

    /// Stops the collector, first flushing every queued message to the leader.
    ///
    /// # Errors
    /// Returns [`CollectorError::NotStarted`] if [`Collector::start`] was never called.
    pub fn stop(&self) -> Result<(), CollectorError> {
        self.shutdown(true)
    }

    /// Stops the collector, discarding messages not yet written to the leader.
    ///
    /// # Errors
    /// Returns [`CollectorError::NotStarted`] if [`Collector::start`] was never called.
    pub fn stop_without_drain(&self) -> Result<(), CollectorError> {
        self.shutdown(false)
    }

    fn shutdown(&self, drain: bool) -> Result<(), CollectorError> {
        let handle = {
            let mut task = self.inner.task.lock();
            match std::mem::replace(&mut *task, Task::Finished) {
                Task::Running(handle) => handle,
                Task::Finished => return Ok(()),
                Task::NotStarted => {
                    *task = Task::NotStarted;
                    return Err(CollectorError::NotStarted);
                }
            }
        };

        log::debug!("Stopping metrics collector...");
        self.inner.drain_on_stop.store(drain, Ordering::SeqCst);
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        if let Some(endpoint) = self.inner.readiness.current() {
            endpoint.stop(drain);
        }
        if handle.join().is_err() {
            log::error!("Metrics collector task panicked");
        }
        self.inner.readiness.set_stopped();
        Ok(())
    }

    fn endpoint(&self) -> Result<Arc<Endpoint>, CollectorError> {
        self.endpoint_within(self.inner.config.ready_timeout)
    }

    fn endpoint_within(&self, timeout: Option<Duration>) -> Result<Arc<Endpoint>, CollectorError> {
        if let Some(endpoint) = self.inner.readiness.current() {
            return Ok(endpoint);
        }
        if matches!(*self.inner.task.lock(), Task::NotStarted) {
            return Err(CollectorError::NotStarted);
        }
        log::debug!("Waiting for collector to become available...");
        self.inner.readiness.wait(timeout)
    }
}

/// Body of the role task: elect, then run the chosen endpoint until stopped.
fn run_role(inner: &Inner) {
    let config = &inner.config;
    let lock = match LockGuard::try_acquire(&config.lock_path) {
        Ok(lock) => lock,
        Err(e) => {
            inner.fail(format!(
                "could not open lock file {}: {e}",
                config.lock_path.display()
            ));
            return;
        }
    };

    if let Some(lock) = lock {
        log::debug!("Lock acquired. Running in leader mode.");
        match leader::bind(&config.socket_path, config.poll_interval) {
            Ok((leader, event_loop)) => {
                inner.publish(Endpoint::Leader(leader));
                event_loop.run();
            }
            Err(e) => inner.fail(format!(
                "could not listen on {}: {e}",
                config.socket_path.display()
            )),
        }
        drop(lock);
    } else {
        log::debug!("Could not acquire lock. Running in follower mode.");
        match follower::connect(config, &inner.stop_requested) {
            Ok((follower, forwarder)) => {
                inner.publish(Endpoint::Follower(follower));
                forwarder.run();
            }
            Err(CollectorError::Stopped) => log::debug!("Stopped before connecting to leader."),
            Err(e) => inner.fail(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> CollectorConfig {
        CollectorConfig::default()
            .lock_path(dir.join("collector.lock"))
            .socket_path(dir.join("collector.sock"))
            .poll_interval(Duration::from_millis(10))
            .ready_timeout(Some(Duration::from_secs(5)))
    }

    #[test]
    fn operations_before_start_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let collector = Collector::new(config(dir.path()));
        assert!(matches!(collector.query(), Err(CollectorError::NotStarted)));
        assert!(matches!(collector.stop(), Err(CollectorError::NotStarted)));
        assert_eq!(collector.role(), None);
    }

    #[test]
    fn lone_collector_leads_and_serves_itself() {
        let dir = tempfile::tempdir().unwrap();
        let collector = Collector::new(config(dir.path()).namespace("app"));
        collector.start().unwrap();
        assert!(matches!(collector.start(), Err(CollectorError::AlreadyStarted)));

        let counter = collector.counter("hits_total", Some("Hits.")).unwrap();
        counter.inc().unwrap();
        counter.inc_by(2.0, &crate::LabelSet::new().with("path", "/")).unwrap();

        assert_eq!(collector.role(), Some(Role::Leader));
        let text = collector.query().unwrap();
        assert!(text.starts_with("# TYPE app_hits_total counter\n# HELP app_hits_total Hits.\n"));
        assert!(text.contains("\napp_hits_total 1 "));
        assert!(text.contains("\napp_hits_total{path=\"/\"} 2 "));

        collector.stop().unwrap();
        collector.stop().unwrap();
        assert!(matches!(collector.query(), Err(CollectorError::Stopped)));
        assert!(!dir.path().join("collector.sock").exists());
    }

    #[test]
    fn follower_without_leader_reports_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path())
            .connect_retry(2, Duration::from_millis(5), Duration::from_millis(5));
        let holder = LockGuard::try_acquire(&config.lock_path).unwrap().unwrap();

        let collector = Collector::new(config);
        collector.start().unwrap();
        assert!(matches!(
            collector.wait_ready(None),
            Err(CollectorError::StartFailed(_))
        ));
        collector.stop().unwrap();
        drop(holder);
    }

    #[test]
    fn stop_while_connecting_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path())
            .connect_retry(1000, Duration::from_millis(50), Duration::from_millis(50));
        let holder = LockGuard::try_acquire(&config.lock_path).unwrap().unwrap();

        let collector = Collector::new(config);
        collector.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        collector.stop().unwrap();
        assert!(matches!(
            collector.wait_ready(Some(Duration::ZERO)),
            Err(CollectorError::Stopped)
        ));
        drop(holder);
    }
}
