//! Local Listener (4.E).
//!
//! One per forwarding rule. Binds the local endpoint, then runs a
//! dedicated accept-loop worker that dispatches each accepted connection
//! to the forward handler — on a fresh OS thread when the rule runs
//! `threaded`, or serialized within the accept loop otherwise.

use crate::local_stream::LocalStream;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tunnelfwd_core::{constants, Endpoint, ForwardingRule, ListenerState, ShutdownFlag, TunnelError};

#[cfg(unix)]
use std::os::unix::net::UnixListener;

enum InnerListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl InnerListener {
    fn bind(endpoint: &Endpoint) -> std::io::Result<(Self, Endpoint)> {
        match endpoint {
            Endpoint::Socket { host, port } => {
                let bind_host = if host.is_empty() { "127.0.0.1" } else { host };
                let listener = TcpListener::bind((bind_host, *port))?;
                let bound_port = listener.local_addr()?.port();
                Ok((
                    Self::Tcp(listener),
                    Endpoint::socket(host.clone(), bound_port),
                ))
            }
            #[cfg(unix)]
            Endpoint::Path(path) => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)?;
                Ok((Self::Unix(listener), Endpoint::Path(path.clone())))
            }
            #[cfg(not(unix))]
            Endpoint::Path(_) => unreachable!("path binds are rejected by validation on this platform"),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        match self {
            Self::Tcp(l) => l.set_nonblocking(nonblocking),
            #[cfg(unix)]
            Self::Unix(l) => l.set_nonblocking(nonblocking),
        }
    }

    fn accept(&self) -> std::io::Result<LocalStream> {
        match self {
            Self::Tcp(l) => l.accept().map(|(s, _addr)| LocalStream::Tcp(s)),
            #[cfg(unix)]
            Self::Unix(l) => l.accept().map(|(s, _addr)| LocalStream::Unix(s)),
        }
    }
}

/// One running (or failed) rule.
pub struct Listener {
    pub rule: ForwardingRule,
    pub bound_endpoint: Option<Endpoint>,
    state: Arc<Mutex<ListenerState>>,
    shutdown: ShutdownFlag,
    accept_thread: Option<JoinHandle<()>>,
    active_connections: Arc<AtomicUsize>,
    active_sockets: Arc<Mutex<HashMap<u64, LocalStream>>>,
}

impl Listener {
    /// Binds the rule's local endpoint and starts its accept loop.
    /// Per 4.E, this never returns in `Pending`: either `Active`
    /// (bind succeeded) or `Failed` (bind error recorded).
    pub fn start(
        rule: ForwardingRule,
        session: ssh2::Session,
        session_lock: Arc<Mutex<()>>,
        threaded: bool,
        shutdown: ShutdownFlag,
    ) -> std::result::Result<Self, (Self, TunnelError)> {
        let bind_key = rule.bind_key();
        match InnerListener::bind(&rule.local_bind) {
            Ok((inner, bound_endpoint)) => {
                let state = Arc::new(Mutex::new(ListenerState::Active));
                let active_connections = Arc::new(AtomicUsize::new(0));
                let active_sockets = Arc::new(Mutex::new(HashMap::new()));

                let _ = inner.set_nonblocking(true);

                let remote_target = rule.remote_target.clone();
                let worker_state = state.clone();
                let worker_shutdown = shutdown.clone();
                let worker_active_connections = active_connections.clone();
                let worker_active_sockets = active_sockets.clone();
                let worker_bind_key = bind_key.clone();

                let accept_thread = std::thread::spawn(move || {
                    accept_loop(
                        inner,
                        session,
                        session_lock,
                        remote_target,
                        worker_shutdown,
                        worker_active_connections,
                        worker_active_sockets,
                        threaded,
                        worker_bind_key,
                    );
                    *worker_state.lock().unwrap() = ListenerState::Stopped;
                });

                info!("listener for {bind_key} active on {bound_endpoint}");
                Ok(Self {
                    rule,
                    bound_endpoint: Some(bound_endpoint),
                    state,
                    shutdown,
                    accept_thread: Some(accept_thread),
                    active_connections,
                    active_sockets,
                })
            }
            Err(e) => {
                error!("listener for {bind_key} failed to bind: {e}");
                let state = Arc::new(Mutex::new(ListenerState::Failed));
                let failed = Self {
                    rule,
                    bound_endpoint: None,
                    state,
                    shutdown: ShutdownFlag::new(),
                    accept_thread: None,
                    active_connections: Arc::new(AtomicUsize::new(0)),
                    active_sockets: Arc::new(Mutex::new(HashMap::new())),
                };
                Err((failed, TunnelError::listener(bind_key, e.to_string())))
            }
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock().unwrap()
    }

    pub fn is_up(&self) -> bool {
        matches!(self.state(), ListenerState::Active)
    }

    /// Signals the accept loop and all in-flight handlers to stop. If
    /// `force`, open connections are shut down immediately instead of
    /// being given a chance to drain, and this returns as soon as the
    /// flag is set rather than waiting for the accept thread to exit.
    pub fn stop(&mut self, force: bool) {
        self.shutdown.cancel(force);
        if force {
            for socket in self.active_sockets.lock().unwrap().values() {
                let _ = socket.shutdown_both();
            }
        }
        if let Some(handle) = self.accept_thread.take() {
            if force {
                // Don't block the caller: the accept loop observes the
                // cancellation flag on its own short poll cadence and
                // will exit; the thread is daemon-like and the process
                // does not need to wait for it (§5, §9).
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }
        *self.state.lock().unwrap() = ListenerState::Stopped;
    }

    /// Waits for in-flight connections to finish, up to `timeout`.
    /// Returns `false` if the timeout elapsed first.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        tunnelfwd_core::shutdown::wait_until(
            || self.active_connections.load(Ordering::SeqCst) == 0,
            timeout,
            constants::SSH_TIMEOUT,
        )
    }

    /// Connects to and immediately closes the bound address, for
    /// diagnostics (`check_tunnels`). Does not affect listener state.
    pub fn probe(&self) -> bool {
        let Some(endpoint) = &self.bound_endpoint else {
            return false;
        };
        match endpoint {
            Endpoint::Socket { host, port } => {
                let host = if host.is_empty() { "127.0.0.1" } else { host.as_str() };
                std::net::TcpStream::connect_timeout(
                    &format!("{host}:{port}")
                        .parse()
                        .unwrap_or_else(|_| "127.0.0.1:0".parse().unwrap()),
                    constants::SSH_TIMEOUT,
                )
                .is_ok()
            }
            #[cfg(unix)]
            Endpoint::Path(path) => std::os::unix::net::UnixStream::connect(path).is_ok(),
            #[cfg(not(unix))]
            Endpoint::Path(_) => false,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn accept_loop(
    listener: InnerListener,
    session: ssh2::Session,
    session_lock: Arc<Mutex<()>>,
    remote_target: (String, u16),
    shutdown: ShutdownFlag,
    active_connections: Arc<AtomicUsize>,
    active_sockets: Arc<Mutex<HashMap<u64, LocalStream>>>,
    threaded: bool,
    bind_key: String,
) {
    let next_id = AtomicU64::new(0);

    while !shutdown.is_cancelled() {
        match listener.accept() {
            Ok(local) => {
                debug!("accepted connection for {bind_key}");
                let conn_id = next_id.fetch_add(1, Ordering::SeqCst);
                if let Ok(clone) = local.try_clone() {
                    active_sockets.lock().unwrap().insert(conn_id, clone);
                }
                active_connections.fetch_add(1, Ordering::SeqCst);

                let session = session.clone();
                let session_lock = session_lock.clone();
                let remote_target = remote_target.clone();
                let shutdown = shutdown.clone();
                let active_connections = active_connections.clone();
                let active_sockets = active_sockets.clone();
                let bind_key = bind_key.clone();

                let run_one = move || {
                    if let Err(e) = crate::handler::run(
                        local,
                        session,
                        session_lock,
                        remote_target,
                        None,
                        shutdown,
                        constants::SSH_TIMEOUT,
                        &bind_key,
                    ) {
                        warn!("{e}");
                    }
                    active_sockets.lock().unwrap().remove(&conn_id);
                    active_connections.fetch_sub(1, Ordering::SeqCst);
                };

                if threaded {
                    std::thread::spawn(run_one);
                } else {
                    run_one();
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(constants::SSH_TIMEOUT);
            }
            Err(e) => {
                error!("accept failed for {bind_key}: {e}");
                std::thread::sleep(constants::SSH_TIMEOUT);
            }
        }
    }
}
