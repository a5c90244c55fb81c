//! Exercises the local listener (4.E) without a live SSH server: these
//! only cover bind/state/stop behavior, since a real accepted
//! connection needs an authenticated session to open a channel on.

use std::sync::{Arc, Mutex};
use tunnelfwd::listener::Listener;
use tunnelfwd_core::{Endpoint, ForwardingRule, ListenerState, ShutdownFlag};

fn throwaway_session() -> ssh2::Session {
    ssh2::Session::new().expect("session init never touches the network")
}

#[test]
fn ephemeral_port_resolves_to_a_real_port() {
    let rule = ForwardingRule::new(Endpoint::socket("127.0.0.1", 0), "127.0.0.1", 9000);
    let listener = Listener::start(
        rule,
        throwaway_session(),
        Arc::new(Mutex::new(())),
        true,
        ShutdownFlag::new(),
    )
    .expect("bind on an ephemeral port never fails");

    assert_eq!(listener.state(), ListenerState::Active);
    match listener.bound_endpoint.as_ref().unwrap() {
        Endpoint::Socket { port, .. } => assert_ne!(*port, 0),
        Endpoint::Path(_) => panic!("expected a socket endpoint"),
    }
}

#[test]
fn stop_is_observed_promptly() {
    let rule = ForwardingRule::new(Endpoint::socket("127.0.0.1", 0), "127.0.0.1", 9000);
    let mut listener = Listener::start(
        rule,
        throwaway_session(),
        Arc::new(Mutex::new(())),
        true,
        ShutdownFlag::new(),
    )
    .expect("bind succeeds");

    listener.stop(true);
    assert_eq!(listener.state(), ListenerState::Stopped);
}

#[test]
fn binding_an_already_bound_port_fails_with_listener_error() {
    let holder = std::net::TcpListener::bind("127.0.0.1:0").expect("bind a throwaway port");
    let port = holder.local_addr().unwrap().port();

    let rule = ForwardingRule::new(Endpoint::socket("127.0.0.1", port), "127.0.0.1", 9000);
    let result = Listener::start(
        rule,
        throwaway_session(),
        Arc::new(Mutex::new(())),
        true,
        ShutdownFlag::new(),
    );

    match result {
        Err((listener, e)) => {
            assert_eq!(listener.state(), ListenerState::Failed);
            assert_eq!(e.kind(), "ListenerError");
        }
        Ok(_) => panic!("expected the already-bound port to fail"),
    }
}
