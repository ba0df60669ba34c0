//! Provides types that represent a deployment: tasks, the steps within them, and the
//! objects steps act on.

pub mod artifact;
pub mod step;
pub mod task;

#[doc(inline)]
pub use artifact::{Artifact, CertificateBundle, ServiceDescriptor};

#[doc(inline)]
pub use step::{ExecutionMode, Precondition, RemoteCommand, Step};

#[doc(inline)]
pub use task::DeploymentTask;
