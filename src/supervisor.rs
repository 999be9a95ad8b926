//! Supervisor for a backend HTTP service embedded in the host process.
//!
//! [`EmbeddedBackend::start`] spawns one worker thread which prepares the
//! application-data directory, builds the backend router against the
//! resolved paths, flips the readiness latch and then serves on
//! `127.0.0.1:<port>` until asked to exit. Failures are logged and end the
//! worker; they never reach the host except as "never became ready".

use axum::Router;
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::BackendConfig;
use crate::environment::{self, ServicePaths};
use crate::error::{BackendError, Result};
use crate::port;

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the backend router once its storage paths are known.
pub type AppFactory = Arc<dyn Fn(&ServicePaths) -> Result<Router> + Send + Sync>;

/// A flag that is set once and can be waited on.
#[derive(Debug, Default)]
pub struct Latch {
    set: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    // Returns true only for the call that flipped it
    pub fn set(&self) -> bool {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        let flipped = !*set;
        *set = true;
        self.cv.notify_all();
        flipped
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

// State the worker publishes to the host
#[derive(Default)]
struct Shared {
    ready: Latch,
    shutdown: Latch,
    // set only by the worker itself on the way out
    exited: Latch,
    paths: OnceLock<ServicePaths>,
    overrides: OnceLock<BTreeMap<String, PathBuf>>,
    bound: OnceLock<SocketAddr>,
}

// The single live service instance of a supervisor
struct ServiceHandle {
    shared: Arc<Shared>,
    exit: watch::Sender<bool>,
    worker: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

pub struct EmbeddedBackend {
    config: BackendConfig,
    port: u16,
    make_app: AppFactory,
    join_timeout: Duration,
    handle: Option<ServiceHandle>,
}

impl EmbeddedBackend {
    /// Resolve the port (allocating one if none is pinned). Nothing runs
    /// until [`start`](Self::start).
    pub fn new<F>(config: BackendConfig, make_app: F) -> Result<Self>
    where
        F: Fn(&ServicePaths) -> Result<Router> + Send + Sync + 'static,
    {
        let port = match config.port {
            Some(port) => port,
            None => port::allocate().map_err(|source| BackendError::Bind { port: 0, source })?,
        };
        tracing::info!(port, app_support = %config.app_support.display(), "embedded backend configured");
        Ok(Self {
            config,
            port,
            make_app: Arc::new(make_app),
            join_timeout: JOIN_TIMEOUT,
            handle: None,
        })
    }

    /// How long [`stop`](Self::stop) waits for the worker (default 10s).
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Spawn the worker unless one is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.as_ref().is_some_and(ServiceHandle::is_running) {
            tracing::debug!(port = self.port, "backend already running");
            return Ok(());
        }

        let shared = Arc::new(Shared::default());
        let (exit, exit_rx) = watch::channel(false);

        let worker = {
            let shared = Arc::clone(&shared);
            let config = self.config.clone();
            let make_app = Arc::clone(&self.make_app);
            let port = self.port;
            std::thread::Builder::new()
                .name("embedded-backend".into())
                .spawn(move || run_worker(port, config, make_app, shared, exit_rx))
                .map_err(BackendError::Spawn)?
        };

        self.handle = Some(ServiceHandle {
            shared,
            exit,
            worker: Some(worker),
        });
        Ok(())
    }

    /// Wait until environment setup finished. This does not mean the
    /// listener accepts connections yet; poll the health endpoint for that.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        match &self.handle {
            Some(handle) => handle.shared.ready.wait(timeout),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(ServiceHandle::is_running)
    }

    pub fn is_shut_down(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.shared.shutdown.is_set())
    }

    pub fn paths(&self) -> Option<&ServicePaths> {
        self.handle.as_ref().and_then(|h| h.shared.paths.get())
    }

    /// Address the listener is bound to, once it is serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.as_ref().and_then(|h| h.shared.bound.get().copied())
    }

    /// Storage variables the backend was configured with.
    pub fn env_overrides(&self) -> Option<&BTreeMap<String, PathBuf>> {
        self.handle.as_ref().and_then(|h| h.shared.overrides.get())
    }

    /// Ask the server to exit and join the worker for a bounded time. Safe
    /// before `start` and when repeated. The shutdown flag is set either
    /// way. A worker that outlives the timeout stays attached: `is_running`
    /// keeps reporting it, `start` will not spawn a second one, and calling
    /// `stop` again waits once more.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            tracing::debug!("stop called before start");
            return;
        };

        handle.exit.send_replace(true);

        if handle.worker.is_some() {
            let started = Instant::now();
            if handle.shared.exited.wait(self.join_timeout) {
                if let Some(worker) = handle.worker.take() {
                    if worker.join().is_err() {
                        tracing::error!("backend worker panicked");
                    }
                }
                tracing::info!(port = self.port, "backend stopped");
            } else {
                // the thread lingers until it notices the exit flag
                tracing::warn!(waited = ?started.elapsed(), "backend worker did not exit in time");
            }
        }

        handle.shared.shutdown.set();
    }
}

impl Drop for EmbeddedBackend {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.exit.send_replace(true);
        }
    }
}

// Marks the shutdown latch however the worker ends, panics included
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.shutdown.set();
        self.0.exited.set();
        tracing::info!("backend thread exiting");
    }
}

fn run_worker(
    port: u16,
    config: BackendConfig,
    make_app: AppFactory,
    shared: Arc<Shared>,
    exit: watch::Receiver<bool>,
) {
    let _guard = ExitGuard(Arc::clone(&shared));
    if let Err(e) = serve(port, &config, &make_app, &shared, exit) {
        tracing::error!(error = %e, "backend crashed");
    }
}

fn serve(
    port: u16,
    config: &BackendConfig,
    make_app: &AppFactory,
    shared: &Shared,
    mut exit: watch::Receiver<bool>,
) -> Result<()> {
    let prepared = environment::prepare(&config.app_support, &config.env, &config.seeds)?;
    let app = make_app(&prepared.paths)?;
    tracing::info!(app_dir = %prepared.paths.app_dir.display(), "backend APP_DIR redirected");

    let _ = shared.paths.set(prepared.paths);
    let _ = shared.overrides.set(prepared.overrides);
    shared.ready.set();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(BackendError::Runtime)?;

    runtime.block_on(async move {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|source| BackendError::Bind { port, source })?;
        if let Ok(addr) = listener.local_addr() {
            let _ = shared.bound.set(addr);
        }
        tracing::info!(port, "starting backend");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                // a dropped sender also means exit
                let _ = exit.wait_for(|should_exit| *should_exit).await;
            })
            .await
            .map_err(BackendError::Serve)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::routing::get;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::{IpAddr, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const READY: Duration = Duration::from_secs(5);

    fn health_app(_: &ServicePaths) -> Result<Router> {
        Ok(Router::new().route("/api/health", get(|| async { Json(json!({"ok": true})) })))
    }

    // keeps graceful shutdown waiting while a request is in flight
    fn slow_app(_: &ServicePaths) -> Result<Router> {
        Ok(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                "done"
            }),
        ))
    }

    fn counting_backend(dir: &TempDir, builds: Arc<AtomicUsize>) -> EmbeddedBackend {
        let config = BackendConfig::new(dir.path().join("app"));
        EmbeddedBackend::new(config, move |paths| {
            builds.fetch_add(1, Ordering::SeqCst);
            health_app(paths)
        })
        .unwrap()
    }

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + READY;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        false
    }

    fn accepts(port: u16) -> bool {
        TcpStream::connect((Ipv4Addr::LOCALHOST, port)).is_ok()
    }

    #[test]
    fn latch_flips_once_and_wakes_waiters() {
        let latch = Arc::new(Latch::new());
        assert!(!latch.wait(Duration::from_millis(10)));

        let waiter = {
            let latch = Arc::clone(&latch);
            std::thread::spawn(move || latch.wait(READY))
        };
        assert!(latch.set());
        assert!(!latch.set());
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_ready_is_false_before_start() {
        let dir = TempDir::new().unwrap();
        let backend = counting_backend(&dir, Arc::default());
        let started = Instant::now();
        assert!(!backend.wait_ready(Duration::from_secs(2)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!backend.is_shut_down());
    }

    #[test]
    fn stop_is_safe_before_start_and_when_repeated() {
        let dir = TempDir::new().unwrap();
        let mut backend = counting_backend(&dir, Arc::default());
        backend.stop();
        backend.stop();

        backend.start().unwrap();
        assert!(backend.wait_ready(READY));
        backend.stop();
        assert!(backend.is_shut_down());
        assert!(!backend.is_running());
        backend.stop();
        assert!(backend.is_shut_down());
    }

    #[test]
    fn start_twice_runs_a_single_worker() {
        let dir = TempDir::new().unwrap();
        let builds = Arc::new(AtomicUsize::new(0));
        let mut backend = counting_backend(&dir, Arc::clone(&builds));

        backend.start().unwrap();
        backend.start().unwrap();
        assert!(backend.wait_ready(READY));
        backend.start().unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(eventually(|| accepts(backend.port())));
        backend.stop();
        assert!(eventually(|| !accepts(backend.port())));
    }

    #[test]
    fn ready_exposes_resolved_paths_and_overrides() {
        let dir = TempDir::new().unwrap();
        let mut config = BackendConfig::new(dir.path().join("app"));
        config.env.insert(environment::DOCSTORE_ENV.into(), "/custom/docs.db".into());
        let mut backend = EmbeddedBackend::new(config, health_app).unwrap();

        assert!(backend.paths().is_none());
        backend.start().unwrap();
        assert!(backend.wait_ready(READY));

        let paths = backend.paths().unwrap();
        assert_eq!(paths.app_dir, dir.path().join("app"));
        assert_eq!(paths.docstore_db, PathBuf::from("/custom/docs.db"));
        let overrides = backend.env_overrides().unwrap();
        assert_eq!(overrides[environment::APP_SUPPORT_ENV], dir.path().join("app"));
        backend.stop();
    }

    #[test]
    fn failed_preparation_never_becomes_ready() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let mut backend = EmbeddedBackend::new(BackendConfig::new(&blocker), health_app).unwrap();

        backend.start().unwrap();
        assert!(!backend.wait_ready(Duration::from_millis(300)));
        assert!(eventually(|| backend.is_shut_down()));
        assert!(!backend.is_running());
    }

    #[test]
    fn failed_app_factory_never_becomes_ready() {
        let dir = TempDir::new().unwrap();
        let mut backend = EmbeddedBackend::new(BackendConfig::new(dir.path()), |_: &ServicePaths| {
            Err(BackendError::App("no backend module".into()))
        })
        .unwrap();

        backend.start().unwrap();
        assert!(!backend.wait_ready(Duration::from_millis(300)));
        assert!(eventually(|| backend.is_shut_down()));
    }

    #[test]
    fn port_in_use_is_ready_but_exits() {
        let taken = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let dir = TempDir::new().unwrap();
        let mut config = BackendConfig::new(dir.path());
        config.port = Some(taken.local_addr().unwrap().port());
        let mut backend = EmbeddedBackend::new(config, health_app).unwrap();

        backend.start().unwrap();
        // readiness only covers environment setup
        assert!(backend.wait_ready(READY));
        assert!(eventually(|| backend.is_shut_down()));
        backend.stop();
    }

    #[test]
    fn restart_after_stop_serves_again() {
        let dir = TempDir::new().unwrap();
        let builds = Arc::new(AtomicUsize::new(0));
        let mut backend = counting_backend(&dir, Arc::clone(&builds));

        backend.start().unwrap();
        assert!(backend.wait_ready(READY));
        backend.stop();

        backend.start().unwrap();
        assert!(backend.wait_ready(READY));
        assert!(!backend.is_shut_down());
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(eventually(|| accepts(backend.port())));
        backend.stop();
    }

    #[test]
    fn listener_binds_loopback_only() {
        let dir = TempDir::new().unwrap();
        let mut backend = counting_backend(&dir, Arc::default());
        assert!(backend.local_addr().is_none());

        backend.start().unwrap();
        assert!(backend.wait_ready(READY));
        assert!(eventually(|| backend.local_addr().is_some()));

        let addr = backend.local_addr().unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(addr.port(), backend.port());
        backend.stop();
    }

    #[test]
    fn lingering_worker_blocks_a_second_start() {
        let dir = TempDir::new().unwrap();
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let mut backend = EmbeddedBackend::new(BackendConfig::new(dir.path().join("app")), move |paths: &ServicePaths| {
            counter.fetch_add(1, Ordering::SeqCst);
            slow_app(paths)
        })
        .unwrap()
        .with_join_timeout(Duration::from_millis(200));

        backend.start().unwrap();
        assert!(backend.wait_ready(READY));
        assert!(eventually(|| accepts(backend.port())));

        let port = backend.port();
        let request = std::thread::spawn(move || {
            let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
            stream
                .write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .unwrap();
            let mut response = String::new();
            let _ = stream.read_to_string(&mut response);
            response
        });
        std::thread::sleep(Duration::from_millis(300));

        // times out while /slow is still being answered
        backend.stop();
        assert!(backend.is_shut_down());
        assert!(backend.is_running());

        backend.start().unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        assert!(request.join().unwrap().contains("done"));
        assert!(eventually(|| {
            backend.stop();
            !backend.is_running()
        }));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }
}
