//! Forward Handler (4.D).
//!
//! Runs the two byte shuttles for one accepted local connection. The SSH
//! session is kept in non-blocking mode (following the teacher's
//! `run_tunnel_loop` approach) and every channel call is serialized
//! through the rule's `session_lock`, since libssh2 is not safe to drive
//! concurrently from multiple threads. Each attempt is brief, so the
//! lock is never held across a real wait — only across one non-blocking
//! syscall — which is what keeps one connection from stalling another.

use crate::local_stream::LocalStream;
use log::{debug, warn};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tunnelfwd_core::constants::SHUTTLE_BUFFER_SIZE;
use tunnelfwd_core::{Endpoint, ShutdownFlag, TunnelError};

/// Runs both directions of one connection until EOF, error, or shutdown.
/// Errors are returned to the caller (the listener), which logs them as
/// a `HandlerError` against the rule — they never propagate further.
pub fn run(
    mut local: LocalStream,
    session: ssh2::Session,
    session_lock: Arc<Mutex<()>>,
    remote_target: (String, u16),
    origin: Option<Endpoint>,
    shutdown: ShutdownFlag,
    poll_interval: Duration,
    bind_key: &str,
) -> Result<(), TunnelError> {
    let channel = {
        let _guard = session_lock.lock().unwrap();
        crate::session::open_direct_tcpip(&session, &remote_target, origin.as_ref())?
    };

    local.set_nonblocking(true).map_err(|e| {
        TunnelError::handler(bind_key, format!("failed to set local socket non-blocking: {e}"))
    })?;

    let mut local_to_channel = local.try_clone().map_err(|e| {
        TunnelError::handler(bind_key, format!("failed to clone local socket: {e}"))
    })?;
    let channel = Arc::new(Mutex::new(channel));

    let mut local_buf = vec![0u8; SHUTTLE_BUFFER_SIZE];
    let mut channel_buf = vec![0u8; SHUTTLE_BUFFER_SIZE];
    let mut local_eof = false;
    let mut channel_eof = false;

    // A graceful cancellation (is_cancelled but not is_forced) lets an
    // in-flight connection keep shuttling until it drains naturally or
    // the forwarder escalates to a forced stop; only is_forced() below
    // tears it down immediately.
    while !shutdown.is_forced() && !(local_eof && channel_eof) {
        let mut activity = false;

        if !local_eof {
            match local_to_channel.read(&mut local_buf) {
                Ok(0) => local_eof = true,
                Ok(n) => {
                    let guard = session_lock.lock().unwrap();
                    let mut chan = channel.lock().unwrap();
                    if let Err(e) = write_all_nonblocking(&mut *chan, &local_buf[..n], &shutdown) {
                        drop(guard);
                        return Err(TunnelError::handler(bind_key, format!("local->remote write failed: {e}")));
                    }
                    activity = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("local read closed on {bind_key}: {e}");
                    local_eof = true;
                }
            }
        }

        if !channel_eof {
            let read_result = {
                let _guard = session_lock.lock().unwrap();
                let mut chan = channel.lock().unwrap();
                chan.read(&mut channel_buf)
            };
            match read_result {
                Ok(0) => channel_eof = true,
                Ok(n) => {
                    if let Err(e) = local.write_all(&channel_buf[..n]) {
                        return Err(TunnelError::handler(bind_key, format!("remote->local write failed: {e}")));
                    }
                    activity = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("channel read closed on {bind_key}: {e}");
                    channel_eof = true;
                }
            }
        }

        if shutdown.is_forced() {
            let _ = local.shutdown_both();
            let _guard = session_lock.lock().unwrap();
            let _ = channel.lock().unwrap().close();
            break;
        }

        if !activity {
            std::thread::sleep(poll_interval);
        }
    }

    let _ = local.shutdown_both();
    {
        let _guard = session_lock.lock().unwrap();
        let _ = channel.lock().unwrap().close();
    }
    Ok(())
}

fn write_all_nonblocking<W: Write>(writer: &mut W, mut buf: &[u8], shutdown: &ShutdownFlag) -> io::Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => buf = &buf[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if shutdown.is_forced() {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "shutdown requested"));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => {
                warn!("write failed: {e}");
                return Err(e);
            }
        }
    }
    Ok(())
}
