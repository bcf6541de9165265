use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to establish interface: {0}")]
    InterfaceEstablish(String),

    #[error("failed to spawn tunnel process: {0}")]
    SubprocessSpawn(String),

    #[error("tunnel process crashed: {0}")]
    SubprocessCrash(String),

    #[error("tunnel process restarted {attempts} times, giving up")]
    RetryExhausted { attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TunnelError {
    /// Fatal errors leave the tunnel down until an explicit start.
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    pub fn counts_against_restart_cap(&self) -> bool {
        self.kind().counts_against_restart_cap()
    }

    pub fn kind(&self) -> TunnelErrorKind {
        match self {
            TunnelError::Configuration(_) => TunnelErrorKind::Configuration,
            TunnelError::InterfaceEstablish(_) => TunnelErrorKind::InterfaceEstablish,
            TunnelError::SubprocessSpawn(_) => TunnelErrorKind::SubprocessSpawn,
            TunnelError::SubprocessCrash(_) => TunnelErrorKind::SubprocessCrash,
            TunnelError::RetryExhausted { .. } => TunnelErrorKind::RetryExhausted,
            TunnelError::Io(_) => TunnelErrorKind::Io,
            TunnelError::Other(_) => TunnelErrorKind::Other,
        }
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelErrorKind {
    Configuration,
    InterfaceEstablish,
    SubprocessSpawn,
    SubprocessCrash,
    RetryExhausted,
    Io,
    Other,
}

impl TunnelErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            TunnelErrorKind::Configuration
                | TunnelErrorKind::InterfaceEstablish
                | TunnelErrorKind::RetryExhausted
        )
    }

    pub fn counts_against_restart_cap(self) -> bool {
        matches!(
            self,
            TunnelErrorKind::SubprocessSpawn | TunnelErrorKind::SubprocessCrash
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelErrorKind::Configuration => "CONFIGURATION",
            TunnelErrorKind::InterfaceEstablish => "INTERFACE_ESTABLISH",
            TunnelErrorKind::SubprocessSpawn => "SUBPROCESS_SPAWN",
            TunnelErrorKind::SubprocessCrash => "SUBPROCESS_CRASH",
            TunnelErrorKind::RetryExhausted => "RETRY_EXHAUSTED",
            TunnelErrorKind::Io => "IO",
            TunnelErrorKind::Other => "OTHER",
        }
    }
}

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;
