//! Bounded, cancellable subprocess execution.

use std::{
    collections::BTreeMap,
    path::Path,
    process::Stdio,
    time::{Duration, Instant},
};

use {
    mememo_common::{Error, Result},
    tokio::{
        io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
        process::Command,
    },
    tokio_util::sync::CancellationToken,
    tracing::debug,
};

/// Runs shell and git commands with a timeout, racing a cancellation token.
///
/// Children are spawned with `kill_on_drop`, so a timeout or cancellation
/// kills the process instead of leaking it.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
    cancel: CancellationToken,
}

impl CommandRunner {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    /// Run `command` through `sh -c` and return its stdout.
    ///
    /// Stdout is collected line by line; invalid UTF-8 is replaced.
    pub async fn shell(
        &self,
        command: &str,
        cwd: &Path,
        env: &BTreeMap<String, String>,
        stdin: Option<&str>,
    ) -> Result<String> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(cwd).envs(env);
        self.run(cmd, command, stdin).await
    }

    /// Run `git <args>` in `cwd` with interactive prompts disabled.
    pub async fn git(&self, args: &[&str], cwd: &Path) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0");
        self.run(cmd, &format!("git {}", args.join(" ")), None).await
    }

    async fn run(&self, mut cmd: Command, label: &str, stdin: Option<&str>) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let started = Instant::now();
        debug!(command = %label, "spawning");

        let mut child = cmd
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::external(format!("failed to spawn `{label}`"), e))?;

        let child_stdin = child.stdin.take();
        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();

        let write_in = async {
            if let (Some(mut pipe), Some(input)) = (child_stdin, stdin)
                && let Err(e) = pipe.write_all(input.as_bytes()).await
                && e.kind() != std::io::ErrorKind::BrokenPipe
            {
                return Err(e);
            }
            Ok(())
        };
        let read_out = async {
            let mut out = String::new();
            if let Some(pipe) = child_stdout {
                let mut lines = BufReader::new(pipe).split(b'\n');
                while let Some(line) = lines.next_segment().await? {
                    out.push_str(&String::from_utf8_lossy(&line));
                    out.push('\n');
                }
            }
            Ok::<_, std::io::Error>(out)
        };
        let read_err = async {
            let mut buf = Vec::new();
            if let Some(mut pipe) = child_stderr {
                pipe.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(String::from_utf8_lossy(&buf).into_owned())
        };
        let work = async {
            let ((), stdout, stderr, status) =
                tokio::try_join!(write_in, read_out, read_err, child.wait())?;
            Ok::<_, std::io::Error>((stdout, stderr, status))
        };

        let (stdout, stderr, status) = tokio::select! {
            () = self.cancel.cancelled() => {
                debug!(command = %label, "cancelled");
                return Err(Error::Cancelled);
            },
            res = tokio::time::timeout(self.timeout, work) => match res {
                Ok(done) => done?,
                Err(_) => {
                    return Err(Error::Timeout {
                        command: label.to_string(),
                        timeout: self.timeout,
                    });
                },
            },
        };

        let code = status.code().unwrap_or(-1);
        debug!(
            command = %label,
            exit_code = code,
            stdout_len = stdout.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "command finished"
        );
        if !status.success() {
            return Err(Error::ExternalCommand {
                command: label.to_string(),
                code,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn runner(timeout: Duration) -> CommandRunner {
        CommandRunner::new(timeout, CancellationToken::new())
    }

    #[tokio::test]
    async fn captures_stdout_lines() {
        let dir = tempfile::tempdir().unwrap();
        let out = runner(Duration::from_secs(10))
            .shell("echo hello; printf 'no newline'", dir.path(), &BTreeMap::new(), None)
            .await
            .unwrap();
        assert_eq!(out, "hello\nno newline\n");
    }

    #[tokio::test]
    async fn passes_env_cwd_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::from([("GREETING".to_string(), "hi".to_string())]);
        let out = runner(Duration::from_secs(10))
            .shell(
                "printf '%s ' \"$GREETING\"; basename \"$PWD\"; tr a-z A-Z",
                dir.path(),
                &env,
                Some("piped\n"),
            )
            .await
            .unwrap();
        let name = dir.path().file_name().unwrap().to_string_lossy();
        assert_eq!(out, format!("hi {name}\nPIPED\n"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_external_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = runner(Duration::from_secs(10))
            .shell("echo oops >&2; exit 3", dir.path(), &BTreeMap::new(), None)
            .await
            .unwrap_err();
        match err {
            Error::ExternalCommand { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "oops");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills() {
        let dir = tempfile::tempdir().unwrap();
        let err = runner(Duration::from_millis(200))
            .shell("sleep 30", dir.path(), &BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn cancellation_stops_running_command() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let runner = CommandRunner::new(Duration::from_secs(30), cancel.clone());
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let started = Instant::now();
        let err = runner
            .shell("sleep 30", dir.path(), &BTreeMap::new(), None)
            .await
            .unwrap_err();
        trigger.await.unwrap();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
