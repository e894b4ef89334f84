//! Scripted in-process shell.
//!
//! Records every call and answers from a queue of exit statuses, so the
//! executor and the lifecycle scenarios can be exercised without ssh.

use std::collections::{HashSet, VecDeque};
use std::future;
use std::sync::{Mutex, MutexGuard};

use crate::{RemoteShell, ShellFuture, ShellOutput};

/// A call observed by [`ScriptedShell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCall {
    Exec { host: String, command: String, tty: bool },
    ExecWithInput { host: String, command: String, input: Vec<u8> },
    Probe { host: String },
    Interactive { host: String, forward: Option<String> },
}

impl ShellCall {
    pub fn host(&self) -> &str {
        match self {
            ShellCall::Exec { host, .. }
            | ShellCall::ExecWithInput { host, .. }
            | ShellCall::Probe { host }
            | ShellCall::Interactive { host, .. } => host,
        }
    }
}

#[derive(Default)]
struct Script {
    statuses: VecDeque<i32>,
    stdout: Vec<u8>,
    unreachable: HashSet<String>,
    calls: Vec<ShellCall>,
}

impl Script {
    fn next_status(&mut self) -> i32 {
        self.statuses.pop_front().unwrap_or(0)
    }
}

/// Shell that answers from a script instead of spawning processes.
///
/// Commands exit with the next queued status, or 0 once the queue is
/// empty. Probes succeed unless the host was marked unreachable.
#[derive(Default)]
pub struct ScriptedShell {
    script: Mutex<Script>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue exit statuses for the next commands, in order.
    pub fn push_statuses(&self, statuses: impl IntoIterator<Item = i32>) {
        self.lock().statuses.extend(statuses);
    }

    /// Stdout returned by every command.
    pub fn set_stdout(&self, stdout: impl Into<Vec<u8>>) {
        self.lock().stdout = stdout.into();
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        let mut script = self.lock();
        if reachable {
            script.unreachable.remove(host);
        } else {
            script.unreachable.insert(host.to_string());
        }
    }

    pub fn calls(&self) -> Vec<ShellCall> {
        self.lock().calls.clone()
    }

    fn record<T: Send + 'static>(
        &self,
        call: ShellCall,
        answer: impl FnOnce(&mut Script) -> T,
    ) -> ShellFuture<'_, T> {
        let mut script = self.lock();
        script.calls.push(call);
        let result = answer(&mut script);
        Box::pin(future::ready(Ok(result)))
    }
}

impl RemoteShell for ScriptedShell {
    fn exec<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        tty: bool,
    ) -> ShellFuture<'a, ShellOutput> {
        let call = ShellCall::Exec {
            host: host.to_string(),
            command: command.to_string(),
            tty,
        };
        self.record(call, |script| ShellOutput {
            status: script.next_status(),
            stdout: script.stdout.clone(),
        })
    }

    fn exec_with_input<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        input: &'a [u8],
    ) -> ShellFuture<'a, ShellOutput> {
        let call = ShellCall::ExecWithInput {
            host: host.to_string(),
            command: command.to_string(),
            input: input.to_vec(),
        };
        self.record(call, |script| ShellOutput {
            status: script.next_status(),
            stdout: Vec::new(),
        })
    }

    fn probe<'a>(&'a self, host: &'a str) -> ShellFuture<'a, bool> {
        let call = ShellCall::Probe {
            host: host.to_string(),
        };
        self.record(call, |script| !script.unreachable.contains(host))
    }

    fn interactive<'a>(
        &'a self,
        host: &'a str,
        forward: Option<&'a str>,
    ) -> ShellFuture<'a, i32> {
        let call = ShellCall::Interactive {
            host: host.to_string(),
            forward: forward.map(str::to_string),
        };
        self.record(call, Script::next_status)
    }
}
