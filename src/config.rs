//! Command-line and environment configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args};

use crate::protocol::Visibility;
use crate::sandbox::{default_languages, Isolation, SandboxSettings};

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory holding persisted rooms and users
    #[arg(long, env = "DB_ROOT", default_value = "state")]
    pub db_root: PathBuf,

    /// Maximum number of sandbox runs at once, across all rooms
    #[arg(long, env = "PARALLEL_RUNS", default_value_t = 32)]
    pub parallel_runs: usize,

    /// Whether new rooms are public
    #[arg(long, env = "DEFAULT_PUBLIC", default_value_t = true, action = ArgAction::Set)]
    pub default_public: bool,

    /// Google OAuth client id used to verify logins
    #[arg(long, env = "GAPI_CLIENT_ID", default_value = "")]
    pub gapi_client_id: String,

    /// Seconds without an auth heartbeat before a connection loses authorization
    #[arg(long, env = "AUTH_TIMEOUT_SECS", default_value_t = 30)]
    pub auth_timeout_secs: u64,

    #[command(flatten)]
    pub sandbox: SandboxArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SandboxArgs {
    /// Where per-run workspaces are created
    #[arg(long, env = "WORKSPACE_ROOT", default_value = "/tmp")]
    pub workspace_root: PathBuf,

    /// Wall-clock limit for one run, in seconds
    #[arg(long, env = "COMPILE_TIMEOUT_SECS", default_value_t = 20)]
    pub compile_timeout_secs: u64,

    /// bubblewrap binary
    #[arg(long, env = "BWRAP", default_value = "bwrap")]
    pub bwrap: PathBuf,

    /// Run without bubblewrap. Never use this with untrusted code.
    #[arg(long, env = "UNCONFINED", default_value_t = false)]
    pub unconfined: bool,
}

impl SandboxArgs {
    pub fn settings(&self) -> SandboxSettings {
        let isolation = if self.unconfined {
            Isolation::Unconfined
        } else {
            Isolation::bubblewrap(&self.bwrap)
        };
        SandboxSettings {
            workspace_root: self.workspace_root.clone(),
            timeout: Duration::from_secs(self.compile_timeout_secs),
            isolation,
            languages: default_languages(),
        }
    }
}

/// Resolved server settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub addr: SocketAddr,
    pub db_root: PathBuf,
    pub parallel_runs: usize,
    pub default_visibility: Visibility,
    pub gapi_client_id: String,
    pub auth_timeout: Duration,
    pub sandbox: SandboxSettings,
}

impl From<&ServeArgs> for Settings {
    fn from(args: &ServeArgs) -> Self {
        Self {
            addr: SocketAddr::new(args.host, args.port),
            db_root: args.db_root.clone(),
            parallel_runs: args.parallel_runs,
            default_visibility: if args.default_public {
                Visibility::Public
            } else {
                Visibility::Private
            },
            gapi_client_id: args.gapi_client_id.clone(),
            auth_timeout: Duration::from_secs(args.auth_timeout_secs),
            sandbox: args.sandbox.settings(),
        }
    }
}
