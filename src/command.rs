use anyhow::{Context, Result, ensure};
use log::debug;
#[cfg(feature = "mock")]
use mockall::automock;
use std::{process::Stdio, sync::Arc, time::Duration};
use tokio::process::Command;
use trait_variant::make;

/// Captured result of an external program
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: &str) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Seam between the services and the OS utilities they drive
#[make(Send)]
#[cfg_attr(feature = "mock", automock)]
pub trait CommandRunner {
    /// Run `program` to completion and capture its output
    ///
    /// A non zero exit status is not an error at this level, callers decide
    /// how to interpret it. Failing to spawn or wait for the process is.
    async fn output<'a>(&self, program: &str, args: &[&'a str]) -> Result<CommandOutput>;
}

impl<T> CommandRunner for Arc<T>
where
    T: CommandRunner + Send + Sync,
{
    async fn output<'a>(&self, program: &str, args: &[&'a str]) -> Result<CommandOutput> {
        (**self).output(program, args).await
    }
}

/// Run a command and return its stdout, failing on a non zero exit status
pub async fn run<R>(runner: &R, program: &str, args: &[&str]) -> Result<String>
where
    R: CommandRunner + Sync,
{
    let output = runner.output(program, args).await?;
    let command_line = command_line(program, args);

    ensure!(
        output.success(),
        "`{command_line}` failed with status {:?}: {}",
        output.status,
        output.stderr.trim()
    );

    Ok(output.stdout)
}

pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs commands as child processes of the daemon
#[derive(Clone, Debug)]
pub struct SystemCommandRunner {
    timeout: Duration,
}

impl SystemCommandRunner {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

impl CommandRunner for SystemCommandRunner {
    async fn output<'a>(&self, program: &str, args: &[&'a str]) -> Result<CommandOutput> {
        debug!("running `{}`", command_line(program, args));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| format!("{program} timed out after {:?}", self.timeout))?
            .with_context(|| format!("failed to wait for {program}"))?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    /// Answers commands from a script and records every command line it sees
    ///
    /// A scripted response matches when its key is a prefix of the command
    /// line, the first matching key wins. Queued responses are consumed in
    /// order and the last one repeats. Unscripted commands succeed with
    /// empty output.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedRunner {
        script: Arc<Mutex<Script>>,
    }

    #[derive(Default)]
    struct Script {
        responses: Vec<(String, VecDeque<CommandOutput>)>,
        calls: Vec<String>,
    }

    impl ScriptedRunner {
        pub(crate) fn on(&self, command_line: &str, output: CommandOutput) -> &Self {
            let mut script = self.script.lock().unwrap();
            match script.responses.iter_mut().find(|(k, _)| k.as_str() == command_line) {
                Some((_, queue)) => queue.push_back(output),
                None => script
                    .responses
                    .push((command_line.to_string(), VecDeque::from([output]))),
            }
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.script.lock().unwrap().calls.clone()
        }

        pub(crate) fn count(&self, command_line: &str) -> usize {
            self.calls().iter().filter(|c| *c == command_line).count()
        }
    }

    impl CommandRunner for ScriptedRunner {
        async fn output<'a>(&self, program: &str, args: &[&'a str]) -> Result<CommandOutput> {
            let line = command_line(program, args);
            let mut script = self.script.lock().unwrap();
            script.calls.push(line.clone());

            let output = script
                .responses
                .iter_mut()
                .find(|(k, _)| line.starts_with(k.as_str()))
                .map(|(_, queue)| {
                    if queue.len() > 1 {
                        queue.pop_front().unwrap_or_default()
                    } else {
                        queue.front().cloned().unwrap_or_default()
                    }
                })
                .unwrap_or_else(|| CommandOutput::ok(""));

            Ok(output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testing::ScriptedRunner;

    #[tokio::test]
    async fn run_returns_stdout_on_success() {
        let runner = ScriptedRunner::default();
        runner.on("iwgetid wlan0 -r", CommandOutput::ok("bushnet\n"));

        let stdout = run(&runner, "iwgetid", &["wlan0", "-r"]).await.unwrap();

        assert_eq!(stdout, "bushnet\n");
    }

    #[tokio::test]
    async fn run_reports_command_line_and_stderr_on_failure() {
        let runner = ScriptedRunner::default();
        runner.on(
            "systemctl restart hostapd",
            CommandOutput::failed(1, "Unit hostapd.service is masked.\n"),
        );

        let err = run(&runner, "systemctl", &["restart", "hostapd"])
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "`systemctl restart hostapd` failed with status Some(1): Unit hostapd.service is masked."
        );
    }

    #[tokio::test]
    async fn scripted_responses_are_consumed_in_order() {
        let runner = ScriptedRunner::default();
        runner
            .on("wpa_cli", CommandOutput::ok("first"))
            .on("wpa_cli", CommandOutput::ok("second"));

        let first = runner.output("wpa_cli", &["status"]).await.unwrap();
        let second = runner.output("wpa_cli", &["status"]).await.unwrap();
        let third = runner.output("wpa_cli", &["status"]).await.unwrap();

        assert_eq!(first.stdout, "first");
        assert_eq!(second.stdout, "second");
        assert_eq!(third.stdout, "second");
        assert_eq!(runner.count("wpa_cli status"), 3);
    }
}
