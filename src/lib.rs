//! Remote deployment orchestration.
//!
//! Stevedore deploys a small fleet of cooperating services (a backend daemon, a client
//! daemon, a web frontend, and the reverse proxy in front of them) onto one or more
//! remote hosts over SSH.
//!
//! # Program flow
//!
//! 1. The operator invokes the `stevedore` binary with a profile name and one or more
//!    task names, e.g. `stevedore production server`.
//!
//! 2. The profile resolves to a frozen [profile::Context]: every host, account, path,
//!    and domain the run will touch. Nothing else reads configuration after this point.
//!
//! 3. For each requested task, the catalog in [mod@tasks] builds a [core::DeploymentTask]:
//!    an ordered list of [core::Step]s with any configuration artifacts already rendered.
//!
//! 4. [run_task] runs the task against every host in the context. Steps run strictly in
//!    order per host; a step whose precondition already holds is skipped rather than
//!    re-applied, so re-running a task against a provisioned host is safe.

pub mod config;
pub mod core;
pub mod profile;
pub mod run_task;
pub mod tasks;
pub mod template;

#[cfg(feature = "openssh")]
#[doc(inline)]
pub use run_task::run_task;
