//! Automation side of playbooks: publishing jobs, running them in containers
//! and feeding results back into tickets.

pub mod dispatch;
pub mod docker;
pub mod feedback;
pub mod runner;
pub mod worker;

pub use dispatch::Dispatcher;
pub use docker::DockerRuntime;
pub use feedback::CompletionLoop;
pub use runner::{JobPhase, SandboxRunner};
pub use worker::Worker;
