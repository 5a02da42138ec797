// Copyright (c) The retest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Talking to worker processes.
//!
//! Workers are child processes that exchange newline-delimited JSON messages with the runner over
//! their standard input and output. See [`retest_metadata::HostMessage`] for the protocol.

use crate::{
    errors::{RpcError, WorkerError},
    pool::{TestWorker, WorkerKey, WorkerLauncher},
    sync::AccessReporter,
};
use retest_metadata::{ClassLoaderScopes, HostMessage, InvocationResult, WorkerMessage};
use std::{collections::BTreeMap, process::Stdio, time::Duration};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
};
use tracing::{debug, trace};

/// The environment variable holding the pool slot a worker process was started for.
pub const WORKER_SLOT_ENV: &str = "RETEST_WORKER_SLOT";

/// How long a worker gets to exit on its own after being asked to shut down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A message channel to a worker.
#[derive(Debug)]
pub struct WorkerConnection<R, W> {
    reader: R,
    writer: W,
    line: String,
}

impl<R, W> WorkerConnection<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Creates a new connection over the given reader and writer.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            line: String::new(),
        }
    }

    /// Sends a message to the worker.
    pub async fn send(&mut self, message: &HostMessage) -> Result<(), RpcError> {
        let mut line = serde_json::to_string(message).map_err(RpcError::Serialize)?;
        trace!(%line, "sending to worker");
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receives the next message from the worker. Blank lines are skipped.
    pub async fn recv(&mut self) -> Result<WorkerMessage, RpcError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                return Err(RpcError::Disconnected);
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }
            trace!(%line, "received from worker");
            return serde_json::from_str(line).map_err(|error| RpcError::Deserialize {
                line: line.to_owned(),
                error,
            });
        }
    }

    /// Sends a message and waits for the worker to acknowledge it with
    /// [`WorkerMessage::Ready`].
    pub async fn request_ready(&mut self, message: &HostMessage) -> Result<(), WorkerError> {
        self.send(message).await?;
        match self.recv().await? {
            WorkerMessage::Ready => Ok(()),
            WorkerMessage::Error { message } => Err(WorkerError::Reported { message }),
            _ => Err(RpcError::UnexpectedMessage { expected: "ready" }.into()),
        }
    }

    /// Runs a test class, forwarding access requests to `reporter` until the worker reports the
    /// outcome.
    pub async fn invoke<A: AccessReporter>(
        &mut self,
        class_name: &str,
        parameters: &BTreeMap<String, String>,
        reporter: &A,
    ) -> Result<InvocationResult, WorkerError> {
        self.send(&HostMessage::Invoke {
            class_name: class_name.to_owned(),
            parameters: parameters.clone(),
        })
        .await?;
        loop {
            match self.recv().await? {
                WorkerMessage::Access { id, request } => {
                    reporter.report(&request);
                    self.send(&HostMessage::AccessDone { id }).await?;
                }
                WorkerMessage::Finished { result } => return Ok(result),
                WorkerMessage::Error { message } => return Err(WorkerError::Reported { message }),
                WorkerMessage::Ready => {
                    return Err(RpcError::UnexpectedMessage {
                        expected: "access request or result",
                    }
                    .into());
                }
            }
        }
    }
}

/// Starts worker processes.
#[derive(Clone, Debug, Default)]
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    type Worker = ProcessWorker;

    async fn launch(&self, key: &WorkerKey) -> Result<ProcessWorker, WorkerError> {
        let mut command = Command::new(key.executable.as_std_path());
        command
            .args(&key.args)
            .current_dir(&key.working_dir)
            .env(WORKER_SLOT_ENV, key.slot.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let spawn_error = |error| WorkerError::Spawn {
            executable: key.executable.clone(),
            error,
        };
        let mut child = command.spawn().map_err(spawn_error)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(spawn_error(std::io::Error::other(
                "child process is missing piped stdio",
            )));
        };
        debug!(slot = key.slot, pid = ?child.id(), "worker process started");
        Ok(ProcessWorker {
            child,
            connection: WorkerConnection::new(BufReader::new(stdout), stdin),
        })
    }
}

/// A worker running as a child process.
#[derive(Debug)]
pub struct ProcessWorker {
    child: Child,
    connection: WorkerConnection<BufReader<ChildStdout>, ChildStdin>,
}

impl TestWorker for ProcessWorker {
    async fn init_runner(
        &mut self,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), WorkerError> {
        self.connection
            .request_ready(&HostMessage::InitRunner {
                parameters: parameters.clone(),
            })
            .await
    }

    async fn init_class_loaders(
        &mut self,
        scopes: &ClassLoaderScopes,
    ) -> Result<(), WorkerError> {
        self.connection
            .request_ready(&HostMessage::InitClassLoaders {
                scopes: scopes.clone(),
            })
            .await
    }

    async fn invoke<A: AccessReporter>(
        &mut self,
        class_name: &str,
        parameters: &BTreeMap<String, String>,
        reporter: &A,
    ) -> Result<InvocationResult, WorkerError> {
        self.connection.invoke(class_name, parameters, reporter).await
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn shutdown(mut self) {
        // The worker may already be gone, in which case there's nothing to tell it.
        let _ = self.connection.send(&HostMessage::Shutdown).await;
        drop(self.connection);
        if let Ok(Ok(status)) = tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            debug!(%status, "worker process exited");
            return;
        }
        if let Err(error) = self.child.kill().await {
            debug!(%error, "error killing worker process");
        }
    }
}
