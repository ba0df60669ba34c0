//! Runs a [DeploymentTask] on every host of a resolved profile.
//!
//! Per host, steps run strictly in the order the task declares, and every mutating
//! remote call blocks until the remote operation completes. Hosts are independent of
//! one another: each gets its own connection and its own pass over the task, and the
//! only outcome shared across hosts is the per-host success or failure collected by
//! [run_task]. A fatal step failure stops the remaining steps for that host only, and
//! nothing is rolled back; re-running the task is the expected recovery, which the
//! steps' preconditions make safe.
//!
//! [DeploymentTask]: crate::core::DeploymentTask

pub mod client;
pub mod report;

#[cfg(test)]
mod test;

use crate::core::step::{ExecutionMode, Precondition, RemoteCommand, Step};
use crate::core::{Artifact, CertificateBundle, DeploymentTask};
#[cfg(feature = "openssh")]
use crate::profile::Context;
use anyhow::{bail, Context as _};
use client::{Connect, HostSession};
use report::Report;
use std::error::Error;
use std::fmt::{self, Display};
use std::io::Write as _;
use std::process::Output;
use tempfile::NamedTempFile;

/// A mutating remote command exited non-zero.
#[derive(Clone, Debug)]
pub struct RemoteExecutionError {
    /// The shell line that failed.
    pub command: String,

    /// The exit code, if the command exited normally.
    pub exit: Option<i32>,

    /// Whatever the command wrote to stderr.
    pub stderr: String,
}

impl Display for RemoteExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let exit = match self.exit {
            Some(code) => format!("exit code {code}"),
            None => "error".to_string(),
        };
        write!(f, "command exited with {exit}: {}", self.command)?;
        if !self.stderr.trim().is_empty() {
            write!(f, "\n{}", self.stderr.trim_end())?;
        }
        Ok(())
    }
}

impl Error for RemoteExecutionError {}

/// The reverse proxy's configuration test reported failure.
///
/// Carries the validator's own diagnostic text so the operator sees exactly what the
/// proxy objected to. The previously active proxy configuration is untouched.
#[derive(Clone, Debug)]
pub struct ValidationError {
    /// The validator's combined stdout and stderr.
    pub diagnostic: String,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "proxy configuration test failed; no reload was issued:\n{}",
            self.diagnostic.trim_end(),
        )
    }
}

impl Error for ValidationError {}

/// What happened to a single step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StepOutcome {
    /// The step ran to completion.
    Done,

    /// The step's precondition already held, so the step did not run.
    Skipped,

    /// The step deliberately stopped the task so an operator can act out-of-band.
    /// This is not a failure; the remaining steps simply do not run.
    Halted(String),
}

/// Runs `task` on every host in `context`, returning either success or every
/// `(host, error)` pair for hosts whose runs failed.
#[cfg(feature = "openssh")]
pub async fn run_task(
    task: &DeploymentTask,
    context: &Context,
) -> Result<(), Vec<(String, anyhow::Error)>> {
    _run_task(
        task,
        &context.hosts,
        client::ConnectionManager,
        report::Reporter,
    )
    .await
}

/// Testable body of [run_task].
///
/// To enable better integration testing, this function is public but stripped from
/// documentation.
#[doc(hidden)]
pub async fn _run_task<S, M, R>(
    task: &DeploymentTask,
    hosts: &[String],
    manager: M,
    reporter: R,
) -> Result<(), Vec<(String, anyhow::Error)>>
where
    S: HostSession,
    M: Connect<S> + Clone,
    R: Report + Clone,
{
    let mut runs = Vec::new();
    for host in hosts {
        runs.push((
            host.clone(),
            run_host_task(host.clone(), task.clone(), manager.clone(), reporter.clone()),
        ));
    }

    let mut errors = Vec::new();
    for (host, run) in runs {
        if let Err(err) = run.await {
            errors.push((host, err));
        }
    }

    match errors.len() {
        0 => Ok(()),
        _ => Err(errors),
    }
}

/// Runs every step of `task` on a single host, in order.
///
/// To enable better integration testing, this function is public but stripped from
/// documentation.
#[doc(hidden)]
pub async fn run_host_task<S, M, R>(
    host: String,
    task: DeploymentTask,
    mut manager: M,
    mut reporter: R,
) -> anyhow::Result<()>
where
    S: HostSession,
    M: Connect<S>,
    R: Report,
{
    let mut session = manager
        .connect(&host)
        .await
        .with_context(|| format!("failed to connect to {host}"))?;

    for step in &task.steps {
        reporter.starting(&host, step).await?;

        let outcome = run_step(&mut session, &mut reporter, &host, step)
            .await
            .with_context(|| format!("task {} failed at step: {}", task.name, report::title(step)))?;

        match outcome {
            StepOutcome::Done => {}
            StepOutcome::Skipped => reporter.skipped(&host, step).await?,
            StepOutcome::Halted(reason) => {
                reporter.halted(&host, &reason).await?;
                break;
            }
        }
    }
    Ok(())
}

/// Runs one step against a connected session.
async fn run_step<S: HostSession, R: Report>(
    session: &mut S,
    reporter: &mut R,
    host: &str,
    step: &Step,
) -> anyhow::Result<StepOutcome> {
    if let Some(precondition) = step.precondition() {
        if probe(session, precondition).await? {
            return Ok(StepOutcome::Skipped);
        }
    }

    use Step::*;
    match step {
        Command { command, mode, .. } => {
            let output = session.run(command).await?;
            match output.status.success() {
                true => {
                    reporter.completed(host, step, &output).await?;
                }
                false => match mode {
                    ExecutionMode::Strict => bail!(execution_error(command, &output)),
                    ExecutionMode::BestEffort => {
                        reporter.warning(host, step, &output).await?;
                    }
                },
            }
            Ok(StepOutcome::Done)
        }
        Install { artifact, .. } => install(session, reporter, host, step, artifact).await,
        Checkout {
            repository,
            dest,
            branch,
        } => checkout(session, reporter, host, step, repository, dest, branch).await,
        Build { dir, command, env } => {
            let mut line = format!("cd {}", quote(dir));
            for (key, value) in env {
                line.push_str(&format!(" && export {key}={}", quote(value)));
            }
            line.push_str(&format!(" && {command}"));

            let output = exec(session, &RemoteCommand::new(line)).await?;
            reporter.completed(host, step, &output).await?;
            Ok(StepOutcome::Done)
        }
        Stop(service) => {
            // Deliberately unconditional: we never ask whether the service is running
            // first. A stop that fails because there is nothing to stop is the normal
            // case on a first deployment.
            let command = RemoteCommand::elevated(format!("systemctl stop {}", quote(&service.name)));
            let output = session.run(&command).await?;
            match output.status.success() {
                true => reporter.completed(host, step, &output).await?,
                false => reporter.warning(host, step, &output).await?,
            }
            Ok(StepOutcome::Done)
        }
        Start(service) => {
            let command =
                RemoteCommand::elevated(format!("systemctl start {}", quote(&service.name)));
            let output = exec(session, &command).await?;
            reporter.completed(host, step, &output).await?;
            Ok(StepOutcome::Done)
        }
        Certificate(bundle) => certificate(session, reporter, host, step, bundle).await,
        CheckProxy {
            command,
            failure_marker,
        } => {
            // The validator's exit code is authoritative; the marker is a documented
            // fallback for wrappers that exit zero even when the test fails.
            let output = session.run(command).await?;
            let mut diagnostic = String::from_utf8_lossy(&output.stdout).into_owned();
            diagnostic.push_str(&String::from_utf8_lossy(&output.stderr));

            if !output.status.success() || diagnostic.contains(failure_marker) {
                bail!(ValidationError { diagnostic });
            }

            reporter.completed(host, step, &output).await?;
            Ok(StepOutcome::Done)
        }
    }
}

/// Answers a [Precondition] query without mutating the host.
///
/// A non-zero exit from the probe command means "not present"; probing is inherently
/// non-fatal, so only a session fault is an error here.
async fn probe<S: HostSession>(
    session: &mut S,
    precondition: &Precondition,
) -> anyhow::Result<bool> {
    let command = match precondition {
        Precondition::PathPresent(path) => RemoteCommand::new(format!("test -e {}", quote(path))),
        Precondition::LinePresent { pattern, path } => {
            RemoteCommand::new(format!("grep -q {} {}", quote(pattern), quote(path)))
        }
    };
    let output = session.run(&command).await?;
    Ok(output.status.success())
}

/// Runs a command and converts a non-zero exit into a [RemoteExecutionError].
async fn exec<S: HostSession>(
    session: &mut S,
    command: &RemoteCommand,
) -> anyhow::Result<Output> {
    let output = session.run(command).await?;
    if !output.status.success() {
        bail!(execution_error(command, &output));
    }
    Ok(output)
}

fn execution_error(command: &RemoteCommand, output: &Output) -> RemoteExecutionError {
    RemoteExecutionError {
        command: command.line.clone(),
        exit: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

/// Places a rendered [Artifact] at its destination, then sets ownership, then sets
/// the permission mode, in that fixed order.
async fn install<S: HostSession, R: Report>(
    session: &mut S,
    reporter: &mut R,
    host: &str,
    step: &Step,
    artifact: &Artifact,
) -> anyhow::Result<StepOutcome> {
    // Stage the content under a unique temporary path on the host, since the
    // destination may only be writable with elevation.
    let output = exec(session, &RemoteCommand::new("mktemp")).await?;
    let staging = parse_mktemp(&output)?;

    let mut local = NamedTempFile::new()?;
    local.write_all(artifact.content.as_bytes())?;
    local.flush()?;

    let uploaded = session.upload(local.path(), &staging).await?;
    if !uploaded.status.success() {
        bail!(execution_error(
            &RemoteCommand::new(format!("scp {} {host}:{staging}", local.path().display())),
            &uploaded,
        ));
    }

    let place = |line: String| RemoteCommand {
        line,
        elevated: artifact.elevated,
    };
    exec(
        session,
        &place(format!("mv {} {}", quote(&staging), quote(&artifact.dest))),
    )
    .await?;
    exec(
        session,
        &place(format!(
            "chown {}:{} {}",
            artifact.owner,
            artifact.group,
            quote(&artifact.dest),
        )),
    )
    .await?;
    let output = exec(
        session,
        &place(format!("chmod {} {}", artifact.mode, quote(&artifact.dest))),
    )
    .await?;

    reporter.completed(host, step, &output).await?;
    Ok(StepOutcome::Done)
}

/// Clones a repository, or hard-resets and fast-forwards an existing checkout.
async fn checkout<S: HostSession, R: Report>(
    session: &mut S,
    reporter: &mut R,
    host: &str,
    step: &Step,
    repository: &str,
    dest: &str,
    branch: &str,
) -> anyhow::Result<StepOutcome> {
    if !probe(session, &Precondition::PathPresent(dest.to_owned())).await? {
        let clone = RemoteCommand::new(format!(
            "git clone {} {} && cd {} && git checkout {}",
            quote(repository),
            quote(dest),
            quote(dest),
            quote(branch),
        ));
        let output = exec(session, &clone).await?;
        reporter.completed(host, step, &output).await?;
        return Ok(StepOutcome::Done);
    }

    // The destination exists. It must be a checkout; anything else needs a human, not
    // an auto-repair heuristic.
    if !probe(
        session,
        &Precondition::PathPresent(format!("{dest}/.git")),
    )
    .await?
    {
        bail!("{dest} exists but is not a source checkout; move it aside and re-run");
    }

    let update = RemoteCommand::new(format!(
        "cd {} && git reset --hard && git checkout {} && git pull --ff-only",
        quote(dest),
        quote(branch),
    ));
    let output = exec(session, &update).await?;
    reporter.completed(host, step, &output).await?;
    Ok(StepOutcome::Done)
}

/// Runs one phase of the two-phase certificate bootstrap.
async fn certificate<S: HostSession, R: Report>(
    session: &mut S,
    reporter: &mut R,
    host: &str,
    step: &Step,
    bundle: &CertificateBundle,
) -> anyhow::Result<StepOutcome> {
    if !probe(session, &Precondition::PathPresent(bundle.csr.clone())).await? {
        // Phase 1: create the key and signing request, then wait for the operator.
        // The subject carries only the common name; certificate authorities take the
        // rest from their own records.
        let keygen = RemoteCommand::elevated(format!(
            "openssl req -nodes -newkey rsa:2048 -subj {} -keyout {} -out {}",
            quote(&format!("/CN={}", bundle.domain)),
            quote(&bundle.key),
            quote(&bundle.csr),
        ));
        let output = exec(session, &keygen).await?;
        reporter.completed(host, step, &output).await?;

        return Ok(StepOutcome::Halted(format!(
            "created {}; submit it to the certificate authority, place the signed \
            certificate at {}, then re-run this task",
            bundle.csr, bundle.certificate,
        )));
    }

    // Phase 2: the signing request exists, so the signed certificate should too.
    // Tighten permissions on both halves. If the certificate has not been placed yet,
    // the chmod fails and the task reports it; that checkpoint cannot be automated
    // away.
    exec(
        session,
        &RemoteCommand::elevated(format!("chmod 400 {}", quote(&bundle.key))),
    )
    .await?;
    let output = exec(
        session,
        &RemoteCommand::elevated(format!("chmod 400 {}", quote(&bundle.certificate))),
    )
    .await?;

    reporter.completed(host, step, &output).await?;
    Ok(StepOutcome::Done)
}

// mktemp prints the created path followed by a newline.
fn parse_mktemp(output: &Output) -> anyhow::Result<String> {
    let mut path = String::from_utf8(output.stdout.clone()).with_context(|| {
        format!(
            "mktemp returned a path that was not UTF-8: {}",
            String::from_utf8_lossy(&output.stdout),
        )
    })?;

    // Trim any trailing white space, e.g. a trailing newline.
    path.truncate(path.trim_end().len());
    if path.is_empty() {
        bail!("mktemp did not return a path");
    }
    Ok(path)
}

// Quotes a value for interpolation into a remote shell line.
fn quote(value: &str) -> String {
    match shlex::Quoter::new().quote(value) {
        Ok(quoted) => quoted.into_owned(),
        // Quoting only fails on interior nul bytes, which no sane path or pattern
        // contains; pass the value through and let the remote shell complain.
        Err(_) => value.to_owned(),
    }
}
