//! Local agent processes
//!
//! Each agent is the configured command with the task appended as its last
//! argument, started in the run's workspace. Stdout lines that parse as an
//! [`AgentReport`] become reports, everything else is plain output.
//! Instructions go to stdin as one JSON object per line.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::traits::{AgentInstruction, AgentReport, ProcessManager, RunEvent, RunHandle};

const CHANNEL_CAPACITY: usize = 64;
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct AgentProcess {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

pub struct LocalProcessManager {
    command: Vec<String>,
    grace: Duration,
    processes: Arc<Mutex<HashMap<String, AgentProcess>>>,
}

impl LocalProcessManager {
    pub fn new(command: Vec<String>, grace: Duration) -> Self {
        Self {
            command,
            grace,
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn running(&self) -> usize {
        self.processes.lock().await.len()
    }
}

fn parse_line(line: String) -> RunEvent {
    match serde_json::from_str::<AgentReport>(&line) {
        Ok(report) => RunEvent::Report(report),
        Err(_) => RunEvent::Output(line),
    }
}

#[async_trait]
impl ProcessManager for LocalProcessManager {
    async fn spawn(&self, agent_id: &str, workspace: &Path, task: &str) -> Result<RunHandle> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("No agent command configured"))?;

        tokio::fs::create_dir_all(workspace)
            .await
            .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

        let mut child = Command::new(program)
            .args(args)
            .arg(task)
            .current_dir(workspace)
            .env("SODA_HUB_AGENT_ID", agent_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start agent command '{program}'"))?;

        let pid = child.id();
        info!(agent_id = %agent_id, system_pid = ?pid, workspace = %workspace.display(), "Agent process started");

        let (events_tx, events) = mpsc::channel(CHANNEL_CAPACITY);
        let (instructions, instructions_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (kill, kill_rx) = oneshot::channel();
        let (exited_tx, exited) = watch::channel(false);

        self.processes.lock().await.insert(
            agent_id.to_string(),
            AgentProcess {
                pid,
                kill: Some(kill),
                exited,
            },
        );

        let stdout = child.stdout.take().map(|stdout| {
            let events = events_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if events.send(parse_line(line)).await.is_err() {
                        break;
                    }
                }
            })
        });

        if let Some(stderr) = child.stderr.take() {
            let agent_id = agent_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(agent_id = %agent_id, stderr = %line, "Agent stderr");
                }
            });
        }

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(forward_instructions(agent_id.to_string(), stdin, instructions_rx));
        }

        let processes = self.processes.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            let code = supervise(&agent_id, &mut child, kill_rx).await;
            let _ = exited_tx.send(true);
            // Orphaned grandchildren can hold the pipe open
            if let Some(mut reader) = stdout {
                if timeout(STDOUT_DRAIN_TIMEOUT, &mut reader).await.is_err() {
                    reader.abort();
                }
            }
            processes.lock().await.remove(&agent_id);
            debug!(agent_id = %agent_id, code = ?code, "Agent process exited");
            let _ = events_tx.send(RunEvent::Exited { code }).await;
        });

        Ok(RunHandle {
            events,
            instructions,
        })
    }

    async fn terminate(&self, agent_id: &str) -> Result<()> {
        let (pid, kill, mut exited) = {
            let mut processes = self.processes.lock().await;
            let Some(process) = processes.get_mut(agent_id) else {
                debug!(agent_id = %agent_id, "No process to terminate");
                return Ok(());
            };
            (process.pid, process.kill.take(), process.exited.clone())
        };

        info!(agent_id = %agent_id, system_pid = ?pid, "Terminating agent process");

        #[cfg(unix)]
        {
            if let Some(pid) = pid {
                let _ = Command::new("kill")
                    .arg("-TERM")
                    .arg(pid.to_string())
                    .status()
                    .await;
            }
        }
        #[cfg(not(unix))]
        let _ = pid;

        if timeout(self.grace, exited.wait_for(|exited| *exited))
            .await
            .is_err()
        {
            warn!(agent_id = %agent_id, grace_seconds = self.grace.as_secs(), "Agent ignored SIGTERM, killing");
            if let Some(kill) = kill {
                let _ = kill.send(());
            }
        }
        Ok(())
    }
}

/// Wait for the child to exit, or kill it when asked
async fn supervise(agent_id: &str, child: &mut Child, mut kill: oneshot::Receiver<()>) -> Option<i32> {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Failed to wait for agent process");
                None
            }
        },
        Ok(()) = &mut kill => {
            if let Err(e) = child.kill().await {
                warn!(agent_id = %agent_id, error = %e, "Failed to kill agent process");
            }
            None
        }
    }
}

async fn forward_instructions(
    agent_id: String,
    mut stdin: tokio::process::ChildStdin,
    mut instructions: mpsc::Receiver<AgentInstruction>,
) {
    while let Some(instruction) = instructions.recv().await {
        let mut line = match serde_json::to_string(&instruction) {
            Ok(line) => line,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Failed to encode instruction");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(agent_id = %agent_id, error = %e, "Agent stdin closed");
            break;
        }
        let _ = stdin.flush().await;
    }
}
