//! `ssh` process transport.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::{RemoteShell, ShellFuture, ShellOutput};

/// Connect timeout used by reachability probes, in seconds.
const PROBE_CONNECT_TIMEOUT: u32 = 3;

/// Runs commands through the local `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshTransport {
    user: String,
    identity_file: Option<PathBuf>,
}

impl SshTransport {
    pub fn new(user: impl Into<String>, identity_file: Option<PathBuf>) -> Self {
        Self {
            user: user.into(),
            identity_file,
        }
    }

    /// Common leading arguments: host key checking off, identity file.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "StrictHostKeyChecking=no".to_string()];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args
    }

    fn target(&self, host: &str) -> String {
        format!("{}@{}", self.user, host)
    }

    fn command(&self, args: &[String]) -> Command {
        debug!(command = %render("ssh", args), "spawning");
        let mut cmd = Command::new("ssh");
        cmd.args(args).kill_on_drop(true);
        cmd
    }
}

/// Shell-quoted rendering of an argument vector for logs.
fn render(program: &str, args: &[String]) -> String {
    let mut out = shell_words::quote(program).into_owned();
    for arg in args {
        out.push(' ');
        out.push_str(&shell_words::quote(arg));
    }
    out
}

/// Write `input` to the child's stdin while collecting its stdout, so a
/// child that echoes more than a pipe buffer never stalls on a full pipe.
async fn feed(mut child: Child, input: &[u8]) -> io::Result<Output> {
    let stdin = child.stdin.take();
    let write = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(input).await?;
            stdin.shutdown().await?;
        }
        Ok::<_, io::Error>(())
    };
    let (written, output) = tokio::join!(write, child.wait_with_output());
    let output = output?;
    match written {
        // The remote side may exit without reading everything; its status says why.
        Err(err) if err.kind() != io::ErrorKind::BrokenPipe => Err(err),
        _ => Ok(output),
    }
}

fn code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

impl RemoteShell for SshTransport {
    fn exec<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        tty: bool,
    ) -> ShellFuture<'a, ShellOutput> {
        Box::pin(async move {
            let mut args = self.base_args();
            if tty {
                args.extend(["-t".to_string(), "-t".to_string()]);
            }
            args.push(self.target(host));
            args.push(command.to_string());

            let start = Instant::now();
            let output = self
                .command(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()?
                .wait_with_output()
                .await?;
            debug!(%host, status = %output.status, elapsed = ?start.elapsed(), "ssh exited");
            Ok(ShellOutput {
                status: code(output.status),
                stdout: output.stdout,
            })
        })
    }

    fn exec_with_input<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        input: &'a [u8],
    ) -> ShellFuture<'a, ShellOutput> {
        Box::pin(async move {
            let mut args = self.base_args();
            args.push(self.target(host));
            args.push(command.to_string());

            let child = self
                .command(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .spawn()?;
            let output = feed(child, input).await?;
            Ok(ShellOutput {
                status: code(output.status),
                stdout: output.stdout,
            })
        })
    }

    fn probe<'a>(&'a self, host: &'a str) -> ShellFuture<'a, bool> {
        Box::pin(async move {
            let mut args = self.base_args();
            args.push("-o".to_string());
            args.push(format!("ConnectTimeout={PROBE_CONNECT_TIMEOUT}"));
            args.push(self.target(host));
            args.push("true".to_string());

            let status = self
                .command(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await?;
            Ok(status.success())
        })
    }

    fn interactive<'a>(
        &'a self,
        host: &'a str,
        forward: Option<&'a str>,
    ) -> ShellFuture<'a, i32> {
        Box::pin(async move {
            let mut args = self.base_args();
            args.extend(["-t".to_string(), "-t".to_string()]);
            if let Some(forward) = forward {
                args.push("-D".to_string());
                args.push(forward.to_string());
            }
            args.push(self.target(host));

            let status = self
                .command(&args)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .await?;
            Ok(code(status))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_args_include_identity_when_set() {
        let ssh = SshTransport::new("root", Some(PathBuf::from("/keys/ops.pem")));
        assert_eq!(
            ssh.base_args(),
            vec!["-o", "StrictHostKeyChecking=no", "-i", "/keys/ops.pem"]
        );
        let bare = SshTransport::new("root", None);
        assert_eq!(bare.base_args(), vec!["-o", "StrictHostKeyChecking=no"]);
    }

    #[test]
    fn target_joins_user_and_host() {
        let ssh = SshTransport::new("ubuntu", None);
        assert_eq!(ssh.target("ec2-1.compute.example"), "ubuntu@ec2-1.compute.example");
    }

    #[tokio::test]
    async fn large_input_is_written_while_output_drains() {
        let input = vec![b'x'; 1 << 20];
        let child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();

        let output = feed(child, &input).await.unwrap();

        assert!(output.status.success());
        assert_eq!(output.stdout.len(), input.len());
    }

    #[tokio::test]
    async fn child_that_ignores_stdin_reports_its_status() {
        let child = Command::new("sh")
            .args(["-c", "exit 3"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();

        let output = feed(child, &vec![b'y'; 1 << 20]).await.unwrap();
        assert_eq!(code(output.status), 3);
    }

    #[test]
    fn render_quotes_arguments_with_spaces() {
        let args = vec!["-t".to_string(), "cat > ~/env file".to_string()];
        assert_eq!(render("ssh", &args), "ssh -t 'cat > ~/env file'");
    }
}
