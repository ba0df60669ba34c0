//! Reports the progress and outcome of each [Step] as it runs on a host.
//!
//! The arrangement of this module is a bit unusual. Instead of presenting a generic
//! method that the user calls with either a real or a fake trait implementation, the
//! user chooses either a real or a fake trait implementation and calls that trait's
//! methods. These trait methods call private methods that provide all of the logic
//! for writing to writers that can be either real or fake stdout and stderr. This
//! odd arrangement allows the real trait implementation to lock stdout and stderr
//! just before reporting and release the locks as soon as reporting is done. Locking
//! this way allows most of the program to write to stdout and stderr freely but
//! prevents the output of multiple hosts from getting mangled if they try to report
//! at the same time.
//!
//! [Step]: crate::core::Step

use crate::core::Step;
use async_trait::async_trait;
use std::fmt::Display;
use std::io::{self, Write};
use std::ops::DerefMut;
use std::process::Output;
#[cfg(feature = "openssh")]
use tokio::task;

/// Keeps the user informed about each [Step] run on a host.
///
/// [Step]: crate::core::Step
#[async_trait]
pub trait Report: Send {
    /// Reports that a step is about to commence.
    async fn starting(&mut self, host: &str, step: &Step) -> io::Result<()>;

    /// Reports that a step's precondition already held, so the step did not run.
    async fn skipped(&mut self, host: &str, step: &Step) -> io::Result<()>;

    /// Reports the outcome of a completed step.
    async fn completed(&mut self, host: &str, step: &Step, output: &Output) -> io::Result<()>;

    /// Reports a best-effort command that failed without failing the task.
    async fn warning(&mut self, host: &str, step: &Step, output: &Output) -> io::Result<()>;

    /// Reports that the task deliberately stopped so an operator can act.
    async fn halted(&mut self, host: &str, reason: &str) -> io::Result<()>;
}

/// The real, production-ready [Report] implementation. Uses the real stdout/stderr.
///
/// Each line is prefixed with the local wall-clock time, since deployment runs are
/// long and operators read these logs after the fact.
#[cfg(feature = "openssh")]
#[derive(Clone, Debug)]
pub struct Reporter;

#[cfg(feature = "openssh")]
impl Reporter {
    fn clock() -> String {
        chrono::Local::now().format("%H:%M:%S").to_string()
    }
}

#[cfg(feature = "openssh")]
#[async_trait]
impl Report for Reporter {
    async fn starting(&mut self, host: &str, step: &Step) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        task::block_in_place(move || {
            write!(&mut stdout, "{} ", Self::clock())?;
            _starting(&mut stdout, host, step)
        })
    }

    async fn skipped(&mut self, host: &str, step: &Step) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        task::block_in_place(move || {
            write!(&mut stdout, "{} ", Self::clock())?;
            _skipped(&mut stdout, host, step)
        })
    }

    async fn completed(&mut self, host: &str, step: &Step, output: &Output) -> io::Result<()> {
        // Lock stdout and stderr for sane output ordering. For this same reason, we
        // do not use Tokio's async IO, which provides no locking mechanisms.
        //
        // We need to release the locks as soon as we're done reporting rather than
        // holding them across invocations, so we construct them here instead of
        // storing them in the struct.
        let mut stdout = io::stdout().lock();
        let mut stderr = io::stderr().lock();
        task::block_in_place(move || {
            write!(&mut stdout, "{} ", Self::clock())?;
            _completed(&mut stdout, &mut stderr, host, step, output)
        })
    }

    async fn warning(&mut self, host: &str, step: &Step, output: &Output) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        let mut stderr = io::stderr().lock();
        task::block_in_place(move || {
            write!(&mut stderr, "{} ", Self::clock())?;
            _warning(&mut stdout, &mut stderr, host, step, output)
        })
    }

    async fn halted(&mut self, host: &str, reason: &str) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        task::block_in_place(move || {
            write!(&mut stdout, "{} ", Self::clock())?;
            _halted(&mut stdout, host, reason)
        })
    }
}

/// Generates a one-line identifier for a [Step], suitable for use as its title in
/// user output and error messages.
///
/// [Step]: crate::core::Step
pub fn title(step: &Step) -> String {
    use Step::*;
    match step {
        Command { command, .. } => format!("command: {}", command.line),
        Install { artifact, .. } => format!("install: {}", artifact.dest),
        Checkout {
            repository, dest, ..
        } => format!("checkout: {repository} -> {dest}"),
        Build { dir, command, .. } => format!("build ({dir}): {command}"),
        Stop(service) => format!("stop: {}", service.name),
        Start(service) => format!("start: {}", service.name),
        Certificate(bundle) => format!("certificate: {}", bundle.domain),
        CheckProxy { command, .. } => format!("proxy check: {}", command.line),
    }
}

fn write_indented(
    mut writer: impl Write,
    header: impl Display,
    content: impl AsRef<str>,
) -> io::Result<()> {
    //                1234
    writeln!(writer, "    {header}")?;
    for line in content.as_ref().lines() {
        //                12345678
        writeln!(writer, "        {line}")?;
    }
    Ok(())
}

fn write_captured<OT: Write, ET: Write>(
    stdout: &mut OT,
    stderr: &mut ET,
    output: &Output,
) -> io::Result<()> {
    if !output.stdout.is_empty() {
        write_indented(
            &mut *stdout,
            "Captured stdout:",
            String::from_utf8_lossy(&output.stdout),
        )?;
    }

    if !output.stderr.is_empty() {
        write_indented(
            &mut *stderr,
            "Captured stderr:",
            String::from_utf8_lossy(&output.stderr),
        )?;
    }
    Ok(())
}

/// A testable method containing the logic for reporting that a [Step] is starting.
///
/// [Step]: crate::core::Step
pub fn _starting<OT: Write, O: DerefMut<Target = OT>>(
    mut stdout: O,
    host: &str,
    step: &Step,
) -> io::Result<()> {
    let step = title(step);
    writeln!(
        &mut stdout,
        // Adding one extra space lines up "Starting" with "Completed" in the final
        // output.
        "[{host}] Starting  {step}",
        // Ex:    Completed {step}
    )
}

/// A testable method containing the logic for reporting a skipped [Step].
///
/// [Step]: crate::core::Step
pub fn _skipped<OT: Write, O: DerefMut<Target = OT>>(
    mut stdout: O,
    host: &str,
    step: &Step,
) -> io::Result<()> {
    let step = title(step);
    writeln!(&mut stdout, "[{host}] Skipped   {step} (already applied)")
}

/// A testable method containing the logic for reporting the outcome of a [Step].
///
/// [Step]: crate::core::Step
pub fn _completed<OT: Write, ET: Write, O: DerefMut<Target = OT>, E: DerefMut<Target = ET>>(
    mut stdout: O,
    mut stderr: E,
    host: &str,
    step: &Step,
    output: &Output,
) -> io::Result<()> {
    writeln!(&mut stdout, "[{host}] Completed {}", title(step))?;
    write_captured(stdout.deref_mut(), stderr.deref_mut(), output)
}

/// A testable method containing the logic for reporting a tolerated failure.
pub fn _warning<OT: Write, ET: Write, O: DerefMut<Target = OT>, E: DerefMut<Target = ET>>(
    mut stdout: O,
    mut stderr: E,
    host: &str,
    step: &Step,
    output: &Output,
) -> io::Result<()> {
    writeln!(
        &mut stderr,
        "[{host}] Warning   {} failed; continuing",
        title(step),
    )?;
    write_captured(stdout.deref_mut(), stderr.deref_mut(), output)
}

/// A testable method containing the logic for reporting a deliberate halt.
pub fn _halted<OT: Write, O: DerefMut<Target = OT>>(
    mut stdout: O,
    host: &str,
    reason: &str,
) -> io::Result<()> {
    writeln!(&mut stdout, "[{host}] Halted: {reason}")
}
