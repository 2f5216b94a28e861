use thiserror::Error;

/// Fatal startup/engine-init failures. Anything that reaches `main` as one of
/// these maps straight to an exit code (see `main::exit_code_for`).
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("socket error on {iface}: {source}")]
    Socket {
        iface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no relay function enabled (pass -A, -S, -R or -D)")]
    NothingEnabled,

    #[error("usage error: {0}")]
    Usage(String),

    #[error("daemonize failed: {0}")]
    Daemonize(std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Standard-mandated error kinds raised while parsing attacker-controlled
/// wire data. These never propagate past the engine that produced them —
/// every call site turns them into a dropped packet plus a `debug!`/`trace!`
/// log line, never a `warn!` (see SPEC_FULL §7).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("malformed option (length would overrun buffer)")]
    Truncated,
    #[error("unexpected message type: {0}")]
    UnexpectedType(u8),
    #[error("relay hop count exceeded")]
    HopCountExceeded,
    #[error("missing required option: {0}")]
    MissingOption(&'static str),
}
