//! Multi-hop Gateway Chain (4.H).
//!
//! Given gateways `G1 .. Gn`, opens `S1` directly, then for each
//! subsequent hop opens a direct-tcpip channel on the previous session
//! to the next gateway's address and relays it onto a loopback
//! `TcpStream` pair, since `ssh2::Session::set_tcp_stream` requires a
//! concrete `TcpStream` and cannot take a `Channel` directly. Rules
//! attach only to the final session, `Sn`.

use crate::auth::Credential;
use log::{debug, warn};
use std::net::{TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::Duration;
use tunnelfwd_core::{Endpoint, GatewaySpec, Result, ShutdownFlag, TunnelError};

struct Relay {
    shutdown: ShutdownFlag,
    thread: JoinHandle<()>,
}

/// One already-opened, already-authenticated hop, kept alive only to
/// carry the next hop's transport and to be closed in order on stop.
struct Hop {
    session: ssh2::Session,
    relay: Option<Relay>,
}

/// The result of building a chain: the final session rules attach to,
/// plus everything needed to tear the earlier hops down in order.
pub struct GatewayChain {
    hops: Vec<Hop>,
    pub terminal_session: ssh2::Session,
}

impl GatewayChain {
    /// Opens `S1 .. Sn` in order. `credentials[i]` authenticates
    /// `gateways[i]`. On any failure, every session opened so far is
    /// closed (`Sn` first) before the error is returned.
    pub fn build(
        gateways: &[GatewaySpec],
        credentials: &[Vec<Credential>],
        known_hosts_paths: &[std::path::PathBuf],
        connect_timeout: Duration,
    ) -> Result<Self> {
        assert!(!gateways.is_empty(), "a chain needs at least one gateway");
        assert_eq!(gateways.len(), credentials.len());

        let mut hops: Vec<Hop> = Vec::new();
        let mut current_session = match open_first_hop(
            &gateways[0],
            &credentials[0],
            known_hosts_paths,
            connect_timeout,
        ) {
            Ok(session) => session,
            Err(e) => return Err(e),
        };

        for (i, gateway) in gateways.iter().enumerate().skip(1) {
            match open_relayed_hop(&current_session, gateway, &credentials[i], known_hosts_paths) {
                Ok((next_session, relay)) => {
                    hops.push(Hop {
                        session: current_session,
                        relay: Some(relay),
                    });
                    current_session = next_session;
                }
                Err(e) => {
                    hops.push(Hop {
                        session: current_session,
                        relay: None,
                    });
                    unwind(hops);
                    return Err(e);
                }
            }
        }

        Ok(Self {
            hops,
            terminal_session: current_session,
        })
    }

    /// Closes `Sn` through `S1` in that order, per 4.H.
    pub fn close(self) {
        debug!("closing gateway chain terminal session");
        crate::session::close(&self.terminal_session);
        unwind(self.hops);
    }
}

/// Closes hops most-recently-opened first, matching the `Sn .. S1`
/// stop order required whether unwinding a failed `build` or tearing
/// down a completed chain.
fn unwind(hops: Vec<Hop>) {
    for hop in hops.into_iter().rev() {
        if let Some(relay) = hop.relay {
            relay.shutdown.cancel(true);
        }
        crate::session::close(&hop.session);
        if let Some(relay) = hop.relay {
            let _ = relay.thread.join();
        }
    }
}

fn socket_parts(endpoint: &Endpoint) -> Result<(&str, u16)> {
    match endpoint {
        Endpoint::Socket { host, port } => {
            Ok((if host.is_empty() { "127.0.0.1" } else { host }, *port))
        }
        Endpoint::Path(_) => Err(TunnelError::config(
            "a gateway in a chain must be a host:port address",
        )),
    }
}

fn open_first_hop(
    gateway: &GatewaySpec,
    credentials: &[Credential],
    known_hosts_paths: &[std::path::PathBuf],
    connect_timeout: Duration,
) -> Result<ssh2::Session> {
    let (host, port) = socket_parts(&gateway.address)?;
    let session = crate::session::connect_transport(host, port, connect_timeout)?;
    authenticate_hop(&session, gateway, credentials, host, port, known_hosts_paths)?;
    Ok(session)
}

/// Opens a direct-tcpip channel on `carrier` to `gateway`'s address,
/// relays it onto a loopback socket pair, and hands one end of that
/// pair to a freshly handshaked session for `gateway`.
fn open_relayed_hop(
    carrier: &ssh2::Session,
    gateway: &GatewaySpec,
    credentials: &[Credential],
    known_hosts_paths: &[std::path::PathBuf],
) -> Result<(ssh2::Session, Relay)> {
    let (host, port) = socket_parts(&gateway.address)?;

    // `open_direct_tcpip` leaves `carrier` in non-blocking mode on return,
    // which is what `relay_loop` below needs for its poll-and-sleep reads.
    let channel = crate::session::open_direct_tcpip(carrier, &(host.to_string(), port), None)?;

    let relay_listener = TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| TunnelError::session(format!("loopback relay bind failed: {e}")))?;
    let relay_port = relay_listener
        .local_addr()
        .map_err(|e| TunnelError::session(format!("loopback relay addr failed: {e}")))?
        .port();

    let client_side = TcpStream::connect(("127.0.0.1", relay_port))
        .map_err(|e| TunnelError::session(format!("loopback relay connect failed: {e}")))?;
    let (server_side, _) = relay_listener
        .accept()
        .map_err(|e| TunnelError::session(format!("loopback relay accept failed: {e}")))?;

    let shutdown = ShutdownFlag::new();
    let relay_shutdown = shutdown.clone();
    let thread = std::thread::spawn(move || relay_loop(channel, server_side, relay_shutdown));

    let mut session = ssh2::Session::new()
        .map_err(|e| TunnelError::session(format!("session init for {host}:{port} failed: {e}")))?;
    session.set_tcp_stream(client_side);
    session.handshake().map_err(|e| {
        shutdown.cancel(true);
        TunnelError::session(format!("handshake through chain to {host}:{port} failed: {e}"))
    })?;

    authenticate_hop(&session, gateway, credentials, host, port, known_hosts_paths)?;

    Ok((session, Relay { shutdown, thread }))
}

fn authenticate_hop(
    session: &ssh2::Session,
    gateway: &GatewaySpec,
    credentials: &[Credential],
    host: &str,
    port: u16,
    known_hosts_paths: &[std::path::PathBuf],
) -> Result<()> {
    crate::session::verify_host_key(session, host, port, &gateway.host_key_policy, known_hosts_paths)?;
    let username = gateway
        .username
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .ok_or_else(|| TunnelError::config("no username configured for gateway and $USER is unset"))?;
    crate::session::authenticate(session, &username, credentials)?;
    crate::session::set_keepalive(session, gateway.keepalive_interval);
    if gateway.compression {
        session.set_compress(true);
    }
    Ok(())
}

/// Shuttles bytes between one hop's carrier channel and the loopback
/// socket feeding the next hop's session, until either side closes or
/// `shutdown` is raised.
fn relay_loop(mut channel: ssh2::Channel, mut local: TcpStream, shutdown: ShutdownFlag) {
    use std::io::{Read, Write};

    let _ = local.set_nonblocking(true);

    let mut channel_buf = vec![0u8; tunnelfwd_core::constants::SHUTTLE_BUFFER_SIZE];
    let mut local_buf = vec![0u8; tunnelfwd_core::constants::SHUTTLE_BUFFER_SIZE];

    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let mut activity = false;

        match channel.read(&mut channel_buf) {
            Ok(0) => break,
            Ok(n) => {
                if local.write_all(&channel_buf[..n]).is_err() {
                    break;
                }
                activity = true;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        match local.read(&mut local_buf) {
            Ok(0) => break,
            Ok(n) => {
                if channel.write_all(&local_buf[..n]).is_err() {
                    break;
                }
                activity = true;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        if !activity {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    if let Err(e) = channel.close() {
        warn!("relay channel close failed: {e}");
    }
    let _ = local.shutdown(std::net::Shutdown::Both);
}
