//! Control Console
//!
//! Line-oriented command interface on stdin. `quit` ends the process
//! immediately; `status` reports every supervisor.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

use crate::relay::SupervisorStatus;
use crate::Result;

const PROMPT: &str = "$ ";

const HELP: &str = "commands:\n  status  show every relay\n  help    show this message\n  quit    exit immediately\n";

/// A parsed console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Quit,
    Status,
    Help,
    Empty,
    Unknown(String),
}

impl ControlCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "" => ControlCommand::Empty,
            "quit" | "exit" => ControlCommand::Quit,
            "status" => ControlCommand::Status,
            "help" | "?" => ControlCommand::Help,
            other => ControlCommand::Unknown(other.to_string()),
        }
    }
}

/// Why the console stopped reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    Quit,
    /// Input closed, e.g. stdin redirected from /dev/null
    EndOfInput,
}

pub struct ControlConsole<R, W> {
    input: R,
    output: W,
    supervisors: Vec<watch::Receiver<SupervisorStatus>>,
}

impl<R, W> ControlConsole<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(input: R, output: W, supervisors: Vec<watch::Receiver<SupervisorStatus>>) -> Self {
        Self {
            input,
            output,
            supervisors,
        }
    }

    /// Read commands until `quit` or end of input
    pub async fn run(&mut self) -> Result<ConsoleExit> {
        let mut line = String::new();
        loop {
            self.output.write_all(PROMPT.as_bytes()).await?;
            self.output.flush().await?;

            line.clear();
            if self.input.read_line(&mut line).await? == 0 {
                debug!("Control input closed");
                return Ok(ConsoleExit::EndOfInput);
            }

            match ControlCommand::parse(&line) {
                ControlCommand::Quit => return Ok(ConsoleExit::Quit),
                ControlCommand::Status => {
                    let report = self.status_report();
                    self.output.write_all(report.as_bytes()).await?;
                }
                ControlCommand::Help => self.output.write_all(HELP.as_bytes()).await?,
                ControlCommand::Empty => {}
                ControlCommand::Unknown(other) => {
                    let hint = format!("unknown command '{}', type 'help'\n", other);
                    self.output.write_all(hint.as_bytes()).await?;
                }
            }
        }
    }

    fn status_report(&self) -> String {
        let mut report = String::new();
        for receiver in &self.supervisors {
            let status = receiver.borrow();
            report.push_str(&format!(
                "port {:<5} {:<12} attempt {:<6} sessions {}",
                status.port, status.state.to_string(), status.attempt, status.sessions_completed
            ));
            if let Some(error) = &status.last_error {
                report.push_str(&format!(" last error: {}", error));
            }
            report.push('\n');
        }
        if report.is_empty() {
            report.push_str("no relays configured\n");
        }
        report
    }
}
