//! A named, ordered sequence of steps producing one deployable outcome.

use crate::core::step::Step;

/// One deployable outcome, e.g. "deploy the web frontend".
///
/// Tasks are built fresh by the catalog in [mod@crate::tasks] for every run and have
/// no identity beyond it: any artifacts they carry were rendered for this run, and
/// nothing persists between runs except what the steps leave on the host.
///
/// Steps run strictly in the order listed. The first fatal step failure stops the
/// remaining steps for the current host; other hosts are unaffected.
#[derive(Clone, Debug, PartialEq)]
pub struct DeploymentTask {
    /// The task's name, used for lookup, logging, and error messages.
    pub name: String,

    /// The steps that comprise this task, in execution order.
    pub steps: Vec<Step>,
}
