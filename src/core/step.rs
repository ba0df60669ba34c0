//! Types for representing individual provisioning steps.

use crate::core::artifact::{Artifact, CertificateBundle, ServiceDescriptor};

/// How a remote command's exit status is treated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecutionMode {
    /// A non-zero exit fails the enclosing task on the current host.
    Strict,

    /// A non-zero exit is reported as a warning and execution continues. Lifecycle
    /// stops use this: on a first deployment there is no running instance to stop.
    BestEffort,
}

/// A shell command to run on a target host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommand {
    /// The shell line to execute.
    pub line: String,

    /// Whether the command must run with host-administrator privilege.
    pub elevated: bool,
}

impl RemoteCommand {
    /// A command run as the login user.
    pub fn new(line: impl Into<String>) -> Self {
        RemoteCommand {
            line: line.into(),
            elevated: false,
        }
    }

    /// A command run with host-administrator privilege.
    pub fn elevated(line: impl Into<String>) -> Self {
        RemoteCommand {
            line: line.into(),
            elevated: true,
        }
    }
}

/// A read-only query about a target host, used to skip steps that have already been
/// applied.
///
/// Preconditions state what an applied step leaves behind. Re-running a task against a
/// provisioned host therefore probes, skips, and mutates nothing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Precondition {
    /// The path already exists on the host.
    PathPresent(String),

    /// The file already contains a line matching the pattern.
    LinePresent { pattern: String, path: String },
}

/// A single provisioning action within a [DeploymentTask].
///
/// Steps are data; the sequencer in [mod@crate::run_task] interprets them against a
/// host session. Each variant is idempotent either by guard ([Step::Command] and
/// [Step::Install] via their `unless` field, [Step::Checkout] and [Step::Certificate]
/// via their own existence checks) or by nature (`mkdir -p`-style commands, lifecycle
/// transitions, builds).
///
/// [DeploymentTask]: crate::core::DeploymentTask
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// Run a remote command.
    Command {
        command: RemoteCommand,
        mode: ExecutionMode,
        unless: Option<Precondition>,
    },

    /// Install a rendered configuration artifact on the host.
    Install {
        artifact: Artifact,
        unless: Option<Precondition>,
    },

    /// Clone a source checkout, or update it if it already exists.
    Checkout {
        repository: String,
        dest: String,
        branch: String,
    },

    /// Invoke an opaque build command inside a working directory.
    ///
    /// `env` entries are exported before the command runs. Whatever caching or
    /// idempotence the build tool has is its own business; the command re-runs on
    /// every invocation.
    Build {
        dir: String,
        command: String,
        env: Vec<(String, String)>,
    },

    /// Stop a service, tolerating services that are not running or not yet installed.
    Stop(ServiceDescriptor),

    /// Start a service. Failure fails the task; there is no rollback.
    Start(ServiceDescriptor),

    /// Create TLS material, or finish a bootstrap whose signing request already
    /// exists. May halt the task so an operator can act.
    Certificate(CertificateBundle),

    /// Run the reverse proxy's own configuration test, aborting the task before any
    /// reload if the test reports failure.
    CheckProxy {
        command: RemoteCommand,
        failure_marker: String,
    },
}

impl Step {
    /// A strict, unelevated [Step::Command].
    pub fn run(line: impl Into<String>) -> Self {
        Step::Command {
            command: RemoteCommand::new(line),
            mode: ExecutionMode::Strict,
            unless: None,
        }
    }

    /// A strict, elevated [Step::Command].
    pub fn sudo(line: impl Into<String>) -> Self {
        Step::Command {
            command: RemoteCommand::elevated(line),
            mode: ExecutionMode::Strict,
            unless: None,
        }
    }

    /// A strict, elevated [Step::Command] that is skipped when `unless` already holds.
    pub fn sudo_unless(line: impl Into<String>, unless: Precondition) -> Self {
        Step::Command {
            command: RemoteCommand::elevated(line),
            mode: ExecutionMode::Strict,
            unless: Some(unless),
        }
    }

    /// A strict, unelevated [Step::Command] that is skipped when `unless` already
    /// holds.
    pub fn run_unless(line: impl Into<String>, unless: Precondition) -> Self {
        Step::Command {
            command: RemoteCommand::new(line),
            mode: ExecutionMode::Strict,
            unless: Some(unless),
        }
    }

    /// The precondition guarding this step, if any.
    pub fn precondition(&self) -> Option<&Precondition> {
        match self {
            Step::Command { unless, .. } | Step::Install { unless, .. } => unless.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod constructors {
        use super::*;

        #[test]
        fn run_is_strict_and_unelevated() {
            let step = Step::run("echo hi");
            assert_eq!(
                Step::Command {
                    command: RemoteCommand {
                        line: "echo hi".to_owned(),
                        elevated: false,
                    },
                    mode: ExecutionMode::Strict,
                    unless: None,
                },
                step,
            );
        }

        #[test]
        fn sudo_is_elevated() {
            let step = Step::sudo("apt-get update");
            assert_eq!(
                Step::Command {
                    command: RemoteCommand {
                        line: "apt-get update".to_owned(),
                        elevated: true,
                    },
                    mode: ExecutionMode::Strict,
                    unless: None,
                },
                step,
            );
        }

        #[test]
        fn sudo_unless_carries_the_guard() {
            let guard = Precondition::PathPresent("/srv/app".to_owned());
            let step = Step::sudo_unless("mkdir -p /srv/app", guard.clone());
            assert_eq!(Some(&guard), step.precondition());
        }
    }

    mod precondition {
        use super::*;

        #[test]
        fn unguarded_steps_have_none() {
            assert_eq!(None, Step::run("true").precondition());
            assert_eq!(
                None,
                Step::Checkout {
                    repository: "r".to_owned(),
                    dest: "d".to_owned(),
                    branch: "master".to_owned(),
                }
                .precondition(),
            );
        }
    }
}
