//! stratus-remote — running commands on cluster hosts.
//!
//! ```text
//!   RemoteExecutor  (retry policy, error classification)
//!        │
//!        ▼
//!   dyn RemoteShell ──► SshTransport   (ssh child processes)
//!                   └─► ScriptedShell  (recorded, scripted; tests)
//! ```
//!
//! The transport only spawns and reports exit status. Retry counts,
//! delays and the mapping of exit status 255 to an authentication
//! failure live in [`RemoteExecutor`].

use std::future::Future;
use std::io;
use std::pin::Pin;

pub mod executor;
pub mod scripted;
pub mod ssh;

pub use executor::{RemoteExecutor, RetryPolicy};
pub use scripted::{ScriptedShell, ShellCall};
pub use ssh::SshTransport;

/// Boxed future returned by transport calls.
pub type ShellFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// Exit status 255 is what ssh reports when it could not connect or
/// authenticate.
pub const SSH_CONNECT_FAILURE: i32 = 255;

/// Result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    /// Exit status; `-1` when the process was killed by a signal.
    pub status: i32,
    pub stdout: Vec<u8>,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Transport for running commands on a remote host.
pub trait RemoteShell: Send + Sync {
    /// Run `command`, optionally with a forced pseudo-terminal.
    fn exec<'a>(&'a self, host: &'a str, command: &'a str, tty: bool)
    -> ShellFuture<'a, ShellOutput>;

    /// Run `command` with `input` streamed to its stdin, then closed.
    fn exec_with_input<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        input: &'a [u8],
    ) -> ShellFuture<'a, ShellOutput>;

    /// Cheap reachability check with a short connect timeout.
    fn probe<'a>(&'a self, host: &'a str) -> ShellFuture<'a, bool>;

    /// Interactive session attached to the local terminal, with an
    /// optional dynamic (SOCKS) forward.
    fn interactive<'a>(&'a self, host: &'a str, forward: Option<&'a str>)
    -> ShellFuture<'a, i32>;
}
