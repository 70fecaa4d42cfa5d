//! External programmer invocation.
use std::fmt;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_COMMAND_TIMEOUT;
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A program and its argument list. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        ToolCommand {
            program: program.into(),
            args: vec![],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl TryFrom<Vec<String>> for ToolCommand {
    type Error = String;

    fn try_from(mut argv: Vec<String>) -> std::result::Result<Self, Self::Error> {
        if argv.is_empty() {
            return Err("empty command line".to_string());
        }
        let program = argv.remove(0);
        Ok(ToolCommand {
            program,
            args: argv,
        })
    }
}

impl From<ToolCommand> for Vec<String> {
    fn from(cmd: ToolCommand) -> Self {
        std::iter::once(cmd.program).chain(cmd.args).collect()
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
                write!(f, " '{}'", arg.replace('\'', r"'\''"))?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Exit status and combined stdout/stderr of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub output: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs programmer commands.
/// Might be a real process, or a scripted stand-in.
pub trait ToolRunner {
    /// Run once. Only spawn failures and timeouts are errors; a non-zero
    /// exit is reported through [`ToolOutput::code`].
    fn execute(&mut self, command: &ToolCommand) -> Result<ToolOutput>;

    /// Run with up to `attempts` tries.
    ///
    /// Output containing `benign` counts as success without retrying.
    /// Timeouts are never retried.
    fn run(
        &mut self,
        command: &ToolCommand,
        attempts: usize,
        benign: Option<&str>,
    ) -> Result<ToolOutput> {
        log::info!("{}", command);
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let out = self.execute(command)?;
            if out.success() {
                return Ok(out);
            }
            if let Some(notice) = benign.filter(|n| out.output.contains(n)) {
                log::warn!("Ignoring programmer notice: {}", notice);
                return Ok(out);
            }
            if attempt >= attempts {
                return Err(Error::CommandExecution {
                    command: command.clone(),
                    code: out.code,
                    output: out.output,
                });
            }
            log::error!(
                "Command '{}' was unsuccessful (code {:?}), attempt {}/{}: {}",
                command,
                out.code,
                attempt,
                attempts,
                out.output
            );
        }
    }
}

/// Spawns the programmer as a child process and kills it on timeout.
pub struct ProcessRunner {
    timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        ProcessRunner::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl ProcessRunner {
    pub fn new(timeout: Duration) -> Self {
        ProcessRunner { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl ToolRunner for ProcessRunner {
    fn execute(&mut self, command: &ToolCommand) -> Result<ToolOutput> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io(&command.program, e))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let spinner = ProgressBar::new_spinner();
        spinner.set_message(command.program.clone());
        spinner.enable_steady_tick(Duration::from_millis(100));

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait().map_err(|e| Error::io(&command.program, e))? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    spinner.finish_and_clear();
                    return Err(Error::Timeout {
                        command: command.clone(),
                        timeout: self.timeout,
                    });
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };
        spinner.finish_and_clear();

        let mut output = stdout.join().unwrap_or_default();
        output.push_str(&stderr.join().unwrap_or_default());
        log::debug!("{} exited with {:?}", command.program, status.code());
        Ok(ToolOutput {
            code: status.code(),
            output,
        })
    }
}
