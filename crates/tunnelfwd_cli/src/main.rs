//! Thin CLI shell (4.G) over the `tunnelfwd` library: parse flags,
//! install the interrupt handler, build a `TunnelForwarder`, start it,
//! print the assigned local ports, then block until a termination
//! signal arrives and stop it. The handler is installed before `start`
//! so a signal raised during the handshake/auth exchange isn't missed.

use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tunnelfwd::{
    AuthConfig, Endpoint, FileConfigLookup, ForwardingRule, GatewaySpec, HostKeyPolicy,
    SshConfigLookup, TunnelForwarder, TunnelForwarderConfig, TunnelError,
};

/// Matches the usage line in §6:
/// `tunnelfwd [-U user] [-p port] [-P password] [-k host_key] [-K keyfile]
///  [-S keypass] [-t] [-v...] [-x bind_host:bind_port] [-c sshconfig] [-z]
///  [-n] [-d dir...] -L local:port -R remote:port <gateway>`
#[derive(Parser, Debug)]
#[command(name = "tunnelfwd", version, about = "SSH-based TCP port forwarding tunnels")]
struct Cli {
    /// Gateway host, `host:port`, or an alias from `--config`.
    gateway: String,

    /// SSH username (default: $USER, or the config file's entry).
    #[arg(short = 'U', long = "username")]
    username: Option<String>,

    /// Gateway SSH port, if not given as `host:port` in `<gateway>`.
    #[arg(short = 'p', long = "server-port", default_value_t = 22)]
    server_port: u16,

    /// SSH password.
    #[arg(short = 'P', long = "password")]
    password: Option<String>,

    /// Pin the gateway's host key fingerprint (hex, colons optional).
    #[arg(short = 'k', long = "ssh-host-key")]
    ssh_host_key: Option<String>,

    /// Private key file.
    #[arg(short = 'K', long = "key-file")]
    key_file: Option<PathBuf>,

    /// Passphrase for `-K`.
    #[arg(short = 'S', long = "key-password")]
    key_password: Option<String>,

    /// One worker thread per accepted connection (default: serialized
    /// per rule).
    #[arg(short = 't', long)]
    threaded: bool,

    /// Raise verbosity: -v=error, -vv=warn, -vvv=info, -vvvv=debug,
    /// -vvvvv=trace.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Default bind host applied to any `-L` entry given as a bare port.
    #[arg(short = 'x', long = "bind-address", value_name = "HOST:PORT")]
    bind_address: Option<String>,

    /// Path to an OpenSSH-style config file (default: `~/.ssh/config`).
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Enable SSH compression.
    #[arg(short = 'z', long)]
    compression: bool,

    /// Disable SSH agent lookup.
    #[arg(short = 'n', long = "no-agent")]
    no_agent: bool,

    /// Directory to scan for private keys (default: `~/.ssh`), repeatable.
    #[arg(short = 'd', long = "host-pkey-directory")]
    host_pkey_directories: Vec<PathBuf>,

    /// Local bind: `[host:]port` or an absolute socket path. Repeatable;
    /// pairs positionally with `-R`.
    #[arg(short = 'L', long = "local", value_name = "[HOST:]PORT", required = true)]
    local: Vec<String>,

    /// Remote target reachable from the gateway: `host:port`. Repeatable;
    /// pairs positionally with `-L`.
    #[arg(short = 'R', long = "remote", value_name = "HOST:PORT", required = true)]
    remote: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("ERROR: ConfigError: {msg}");
            std::process::exit(1);
        }
    };

    let forwarder = TunnelForwarder::new(config);

    // Installed before start() (not after) so a SIGINT raised while start()
    // is blocked in the SSH handshake/auth exchange is still observed: the
    // handler only flips a flag (cheap, signal-safe), and the flag is
    // checked as soon as control returns to this thread, before start()'s
    // own outcome is acted on.
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        }) {
            warn!("failed to install signal handler: {e}");
        }
    }

    let start_result = forwarder.start();

    if !running.load(Ordering::SeqCst) {
        info!("interrupt received during start, stopping");
        forwarder.stop(true);
        std::process::exit(130);
    }

    if let Err(e) = start_result {
        eprintln!("ERROR: {}: {e}", e.kind());
        std::process::exit(exit_code_for(&e));
    }

    for bind_key in forwarder.tunnel_is_up().keys() {
        match forwarder.bound_endpoint(bind_key) {
            Some(endpoint) => println!("listening on {endpoint}"),
            None => println!("listening on {bind_key}"),
        }
    }

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("interrupt received, stopping");
    forwarder.stop(true);
    std::process::exit(130);
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Off,
        1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.to_string()))
        .format_timestamp_millis()
        .init();
}

fn exit_code_for(error: &TunnelError) -> i32 {
    match error.kind() {
        "ConfigError" | "NoAuthMethodsError" => 1,
        "AuthenticationError" | "HostKeyError" => 2,
        "ListenerError" => 3,
        _ => 1,
    }
}

fn build_config(cli: &Cli) -> Result<TunnelForwarderConfig, String> {
    let (gateway_host, gateway_port) = split_host_port(&cli.gateway, cli.server_port);

    let config_path = cli
        .config
        .clone()
        .or_else(default_ssh_config_path)
        .filter(|p| p.exists());
    let config_entry = config_path
        .as_deref()
        .and_then(|path| FileConfigLookup::open(path).ok())
        .and_then(|lookup| lookup.lookup(&cli.gateway));

    let resolved_host = config_entry
        .as_ref()
        .and_then(|e| e.host_name.clone())
        .filter(|_| gateway_host == cli.gateway) // only defer to config if the positional arg looked like a bare alias
        .unwrap_or(gateway_host);
    let resolved_port = config_entry
        .as_ref()
        .and_then(|e| e.port)
        .filter(|_| gateway_port == cli.server_port)
        .unwrap_or(gateway_port);
    let resolved_user = cli
        .username
        .clone()
        .or_else(|| config_entry.as_ref().and_then(|e| e.user.clone()))
        .or_else(|| std::env::var("USER").ok());

    let host_key_policy = match &cli.ssh_host_key {
        Some(fp) => HostKeyPolicy::RequireSpecific(fp.clone()),
        None => HostKeyPolicy::RequireKnown,
    };

    let mut gateway = GatewaySpec::new(Endpoint::socket(resolved_host, resolved_port));
    gateway.username = resolved_user;
    gateway.host_key_policy = host_key_policy;
    gateway.compression = cli.compression;

    let mut pkey_files: Vec<PathBuf> = cli.key_file.iter().cloned().collect();
    if let Some(entry) = &config_entry {
        if pkey_files.is_empty() {
            pkey_files.extend(entry.identity_files.iter().cloned());
        }
    }

    let host_pkey_directories = if cli.host_pkey_directories.is_empty() {
        dirs::home_dir().map(|h| vec![h.join(".ssh")]).unwrap_or_default()
    } else {
        cli.host_pkey_directories.clone()
    };

    let auth = AuthConfig {
        password: cli.password.clone(),
        pkey: None,
        pkey_files,
        pkey_password: cli.key_password.clone(),
        allow_agent: !cli.no_agent,
        host_pkey_directories,
    };

    if cli.local.len() != cli.remote.len() {
        return Err(format!(
            "-L and -R must be given the same number of times ({} vs {})",
            cli.local.len(),
            cli.remote.len()
        ));
    }
    if cli.local.is_empty() {
        return Err("at least one -L/-R pair is required".to_string());
    }

    let mut rules = Vec::with_capacity(cli.local.len());
    for (local, remote) in cli.local.iter().zip(cli.remote.iter()) {
        let local_bind = parse_local_bind(local, cli.bind_address.as_deref())?;
        let remote_target = parse_remote_target(remote)?;
        rules.push(ForwardingRule {
            local_bind,
            remote_target,
        });
    }

    Ok(TunnelForwarderConfig {
        gateways: vec![gateway],
        rules,
        auth,
        mute_exceptions: false,
        threaded: cli.threaded,
        known_hosts_paths: None,
        connect_timeout: tunnelfwd_core::constants::SSH_TIMEOUT * 50,
    })
}

fn default_ssh_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".ssh/config"))
}

fn split_host_port(raw: &str, default_port: u16) -> (String, u16) {
    match raw.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (raw.to_string(), default_port),
        },
        _ => (raw.to_string(), default_port),
    }
}

fn parse_local_bind(raw: &str, default_bind_address: Option<&str>) -> Result<Endpoint, String> {
    if raw.starts_with('/') {
        return Ok(Endpoint::path(raw));
    }
    if let Some((host, port)) = raw.rsplit_once(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| format!("-L {raw:?}: {port:?} is not a valid port"))?;
        return Ok(Endpoint::socket(host, port));
    }
    let port: u16 = raw
        .parse()
        .map_err(|_| format!("-L {raw:?} is neither host:port, an absolute path, nor a bare port"))?;
    let host = default_bind_address
        .and_then(|b| b.rsplit_once(':').map(|(h, _)| h.to_string()))
        .unwrap_or_default();
    Ok(Endpoint::socket(host, port))
}

fn parse_remote_target(raw: &str) -> Result<(String, u16), String> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| format!("-R {raw:?} must be host:port"))?;
    if host.is_empty() {
        return Err(format!("-R {raw:?} must specify a host"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| format!("-R {raw:?}: {port:?} is not a valid port"))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_defaults_when_no_colon() {
        assert_eq!(split_host_port("gateway.example.com", 22), ("gateway.example.com".to_string(), 22));
    }

    #[test]
    fn split_host_port_parses_explicit_port() {
        assert_eq!(split_host_port("gateway.example.com:2222", 22), ("gateway.example.com".to_string(), 2222));
    }

    #[test]
    fn parse_local_bind_accepts_bare_port() {
        let endpoint = parse_local_bind("8080", None).unwrap();
        assert_eq!(endpoint, Endpoint::socket("", 8080));
    }

    #[test]
    fn parse_local_bind_accepts_host_port() {
        let endpoint = parse_local_bind("127.0.0.1:8080", None).unwrap();
        assert_eq!(endpoint, Endpoint::socket("127.0.0.1", 8080));
    }

    #[test]
    fn parse_local_bind_accepts_socket_path() {
        let endpoint = parse_local_bind("/tmp/tunnel.sock", None).unwrap();
        assert_eq!(endpoint, Endpoint::path("/tmp/tunnel.sock"));
    }

    #[test]
    fn parse_remote_target_requires_host_and_port() {
        assert!(parse_remote_target("9000").is_err());
        assert_eq!(parse_remote_target("db.internal:5432").unwrap(), ("db.internal".to_string(), 5432));
    }
}
