//! CLI entry point (SPEC_FULL §6). One current-thread runtime, one process,
//! concurrent engines sharing a single [`relayd6::mux::Shutdown`].

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};

use relayd6::config::Config;
use relayd6::dhcp::DhcpEngine;
use relayd6::error::RelayError;
use relayd6::mux::{spawn_signal_listener, RaRefresh, Shutdown};
use relayd6::ndp::NdpEngine;
use relayd6::rd::RdEngine;
use relayd6::socket_io::{IcmpSocket, PacketSocket};
use relayd6::sysctl;
use relayd6::Registry;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relayd6=debug".parse().unwrap()),
        )
        .init();
}

/// Fork into the background and detach from the controlling terminal
/// (SPEC_FULL §6 "daemonization mechanics beyond a fork/setsid helper" is
/// out of scope beyond exactly this). Not covered by `nix`'s enabled
/// feature set, so built directly on `libc` as the AF_PACKET plumbing is.
fn daemonize() -> std::io::Result<()> {
    // SAFETY: fork() is safe to call here — stdout/stderr haven't been
    // touched yet and no other thread exists (current-thread runtime hasn't
    // started).
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if pid > 0 {
        std::process::exit(0);
    }
    // SAFETY: child process, single-threaded, no prior fork side effects to
    // worry about.
    if unsafe { libc::setsid() } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn write_pidfile(path: &std::path::Path) -> std::io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

fn exit_code_for(err: &RelayError) -> u8 {
    match err {
        RelayError::Usage(_) => 1,
        RelayError::InterfaceNotFound(_) => 3,
        RelayError::Socket { source, .. }
            if source.kind() == std::io::ErrorKind::PermissionDenied =>
        {
            2
        }
        RelayError::Socket { .. } => 3,
        RelayError::NothingEnabled => 5,
        RelayError::Daemonize(_) => 6,
        RelayError::Other(_) => 4,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match Config::from_args(args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("relayd6: {e}");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    if config.daemonize {
        if let Err(e) = daemonize() {
            error!(error = %e, "daemonize failed");
            return ExitCode::from(exit_code_for(&RelayError::Daemonize(e)));
        }
    }

    if let Some(path) = &config.pidfile {
        if let Err(e) = write_pidfile(path) {
            warn!(error = %e, path = %path.display(), "failed to write pidfile");
        }
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal error");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(config: Config) -> Result<(), RelayError> {
    info!(master = %config.master, slaves = config.slaves.len(), "relayd6 starting");
    if config.verbosity > 0 {
        if let Ok(snapshot) = serde_json::to_string(&config) {
            info!(config = %snapshot, "configuration snapshot");
        }
    }

    let registry = Arc::new(Registry::discover(&config)?);
    let config = Arc::new(config);

    if config.forwarding {
        sysctl::set_forwarding(&registry.master.name, true);
        for slave in &registry.slaves {
            sysctl::set_forwarding(&slave.name, true);
        }
    }
    if config.ndp_relay {
        for iface in registry.all() {
            sysctl::set_proxy_ndp(&iface.name, true);
        }
    }

    let shutdown = Shutdown::new();
    let ra_refresh = RaRefresh::new();
    let _signal_task = spawn_signal_listener(shutdown.clone(), ra_refresh.clone())
        .map_err(RelayError::Other)?;

    let mut tasks = Vec::new();

    if config.rd_relay || config.rd_server {
        let icmp = Arc::new(IcmpSocket::new().map_err(|e| RelayError::Socket {
            iface: registry.master.name.clone(),
            source: e,
        })?);
        let rd = RdEngine::new(config.clone(), registry.clone(), icmp).map_err(|e| RelayError::Socket {
            iface: registry.master.name.clone(),
            source: e,
        })?;
        let shutdown = shutdown.clone();
        let ra_refresh = ra_refresh.clone();
        tasks.push(tokio::spawn(async move { rd.run(shutdown, ra_refresh).await }));

        if config.send_initial_rs && config.rd_relay {
            info!("initial RS requested, relaying one immediately");
            ra_refresh.trigger();
        }
    }

    if config.dhcpv6_relay || config.dhcpv6_server {
        let dhcp = DhcpEngine::new(config.clone(), registry.clone()).map_err(|e| RelayError::Socket {
            iface: registry.master.name.clone(),
            source: e,
        })?;
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { dhcp.run(shutdown).await }));
    }

    if config.ndp_relay {
        let packet_socket = Arc::new(PacketSocket::open_all_interfaces().map_err(|e| RelayError::Socket {
            iface: registry.master.name.clone(),
            source: e,
        })?);
        let ndp = NdpEngine::new(config.clone(), registry.clone(), packet_socket);
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { ndp.run(shutdown).await }));
    }

    if tasks.is_empty() {
        return Err(RelayError::NothingEnabled);
    }

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "engine task panicked");
        }
    }

    info!("relayd6 shut down cleanly");
    Ok(())
}
