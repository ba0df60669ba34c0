//! Provides the connection to each target host.
//!
//! Two primitives are enough to express every step: run a shell command and capture
//! its output, and copy a local file up to the host. Probing, publishing, building,
//! and lifecycle control are all composed from these in [mod@crate::run_task], which
//! keeps fakes for testing small.

use crate::core::step::RemoteCommand;
use async_trait::async_trait;
use std::path::Path;
use std::process::Output;

/// Connects to hosts and returns values representing those connections.
#[async_trait]
pub trait Connect<S: HostSession>: Send {
    /// Connect to `host` and, on success, return a session on the host.
    async fn connect(&mut self, host: &str) -> anyhow::Result<S>;
}

/// The interface the sequencer uses to touch a target host.
///
/// Implementations capture output rather than streaming it; the sequencer decides
/// what to surface via its reporter. Every call blocks until the remote operation
/// completes or the session faults.
#[async_trait]
pub trait HostSession: Send {
    /// Runs a shell command on the host, capturing its output.
    ///
    /// A non-zero exit status is not an error at this layer; callers inspect the
    /// returned [Output]. Errors mean the command could not be run at all.
    async fn run(&mut self, command: &RemoteCommand) -> anyhow::Result<Output>;

    /// Copies a local file to a path on the host, as the login user.
    async fn upload(&mut self, from: &Path, to: &str) -> anyhow::Result<Output>;
}

/// Production implementation of [Connect].
#[cfg(feature = "openssh")]
#[derive(Clone)]
pub struct ConnectionManager;

#[cfg(feature = "openssh")]
#[async_trait]
impl Connect<Session> for ConnectionManager {
    async fn connect(&mut self, host: &str) -> anyhow::Result<Session> {
        Ok(Session {
            session: openssh::Session::connect_mux(host, openssh::KnownHosts::Add).await?,
            host: host.to_owned(),
        })
    }
}

/// Production implementation of [HostSession], backed by an OpenSSH control master.
#[cfg(feature = "openssh")]
pub struct Session {
    session: openssh::Session,
    host: String,
}

#[cfg(feature = "openssh")]
#[async_trait]
impl HostSession for Session {
    async fn run(&mut self, command: &RemoteCommand) -> anyhow::Result<Output> {
        // The line is handed to a remote shell as a single argument, so quoting
        // within it survives the trip intact.
        let output = match command.elevated {
            true => {
                self.session
                    .command("sudo")
                    .arg("sh")
                    .arg("-c")
                    .arg(&command.line)
                    .output()
                    .await?
            }
            false => {
                self.session
                    .command("sh")
                    .arg("-c")
                    .arg(&command.line)
                    .output()
                    .await?
            }
        };
        Ok(output)
    }

    async fn upload(&mut self, from: &Path, to: &str) -> anyhow::Result<Output> {
        let to = format!("{}:{to}", self.host);
        let output = tokio::process::Command::new("scp")
            .arg(from)
            .arg(&to)
            .output()
            .await?;
        Ok(output)
    }
}
