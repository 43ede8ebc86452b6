//! Launching a worker group: spawn N processes and bootstrap them.

use std::io;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::process::Command;

use crate::config::BootstrapConfig;
use crate::env::WorkerEnv;
use crate::error::BootstrapError;
use crate::session::BootstrapSession;
use crate::worker::TrackerAddr;

pub const ENV_TASK_ID: &str = "TRACKER_TASK_ID";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("{program} exited with {status}")]
    Exited { program: String, status: ExitStatus },
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for the process launching backend.
///
/// `spawn` starts `n` copies of `args` and resolves when they are done. The
/// tracker arguments are already appended to `args`.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, n: usize, args: &[String]) -> Result<(), SpawnError>;
}

/// Adapts a plain callback into a spawner.
///
/// The callback runs on the session's task and should only start the
/// workers, not wait for them.
pub struct FnSpawner<F>(F);

impl<F> FnSpawner<F>
where
    F: Fn(usize, &[String]) -> Result<(), SpawnError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> WorkerSpawner for FnSpawner<F>
where
    F: Fn(usize, &[String]) -> Result<(), SpawnError> + Send + Sync,
{
    async fn spawn(&self, n: usize, args: &[String]) -> Result<(), SpawnError> {
        (self.0)(n, args)
    }
}

/// Runs `mpirun -n N <args...>` and waits for it to exit.
#[derive(Debug, Clone)]
pub struct MpiSpawner {
    program: String,
    extra_args: Vec<String>,
}

impl Default for MpiSpawner {
    fn default() -> Self {
        Self {
            program: "mpirun".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl MpiSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Extra runner flag, placed before the worker command.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    fn command(&self, n: usize, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-n")
            .arg(n.to_string())
            .args(&self.extra_args)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl WorkerSpawner for MpiSpawner {
    async fn spawn(&self, n: usize, args: &[String]) -> Result<(), SpawnError> {
        if args.is_empty() {
            return Err(SpawnError::Other("empty worker command".to_string()));
        }
        tracing::info!(program = %self.program, n, command = ?args, "Launching workers");
        let status = self.command(n, args).status().await?;
        if !status.success() {
            return Err(SpawnError::Exited {
                program: self.program.clone(),
                status,
            });
        }
        Ok(())
    }
}

/// Runs N local copies of the command, each with `TRACKER_TASK_ID` set.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSpawner;

#[async_trait]
impl WorkerSpawner for LocalSpawner {
    async fn spawn(&self, n: usize, args: &[String]) -> Result<(), SpawnError> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| SpawnError::Other("empty worker command".to_string()))?;

        let mut children = Vec::with_capacity(n);
        for task in 0..n {
            let child = Command::new(program)
                .args(rest)
                .env(ENV_TASK_ID, task.to_string())
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;
            tracing::debug!(task, pid = ?child.id(), "Spawned local worker");
            children.push(child);
        }

        let statuses = join_all(children.iter_mut().map(|c| c.wait())).await;
        for status in statuses {
            let status = status?;
            if !status.success() {
                return Err(SpawnError::Exited {
                    program: program.clone(),
                    status,
                });
            }
        }
        Ok(())
    }
}

/// Bootstrap `nslave` workers with configuration from `TRACKER_*` variables.
pub async fn submit(
    nslave: usize,
    args: &[String],
    spawner: &dyn WorkerSpawner,
) -> Result<Vec<WorkerEnv>, BootstrapError> {
    if nslave < 1 {
        return Err(BootstrapError::invalid_argument(
            "number of workers must be at least 1",
        ));
    }
    submit_with_config(BootstrapConfig::from_env(nslave)?, args, spawner).await
}

/// Bind a tracker, spawn the workers pointed at it and wait for the outcome.
///
/// Returns after the workers are released and the spawner has finished.
/// A spawner failure before release aborts the session right away.
pub async fn submit_with_config(
    config: BootstrapConfig,
    args: &[String],
    spawner: &dyn WorkerSpawner,
) -> Result<Vec<WorkerEnv>, BootstrapError> {
    let n = config.world_size;
    let bound = BootstrapSession::new(config)?.bind().await?;

    let (host, port) = bound
        .tracker_addr()
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host.trim_matches(['[', ']']), port.parse::<u16>().ok()?)))
        .ok_or_else(|| {
            BootstrapError::io(format!("unusable tracker address {}", bound.tracker_addr()))
        })?;
    let tracker = TrackerAddr::new(host, port).with_session(bound.session_id());
    let mut worker_args = args.to_vec();
    worker_args.extend(tracker.to_args());

    let abort = bound.abort_handle();
    let session = bound.run();
    let spawn = spawner.spawn(n, &worker_args);
    tokio::pin!(session);
    tokio::pin!(spawn);

    let mut spawned = None;
    let envs = loop {
        tokio::select! {
            result = &mut session => break result?,
            result = &mut spawn, if spawned.is_none() => {
                if let Err(e) = &result {
                    tracing::error!(error = %e, "Spawner failed before release");
                    abort.abort(BootstrapError::spawn(e.to_string()));
                }
                spawned = Some(result);
            }
        }
    };

    let spawned = match spawned {
        Some(result) => result,
        None => spawn.await,
    };
    spawned.map_err(|e| BootstrapError::spawn(e.to_string()))?;
    Ok(envs)
}
