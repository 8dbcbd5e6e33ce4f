pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{CasebookError, GraphError, Result, SandboxError};
pub use event::EventBus;
pub use mockable::{Clock, DefaultClock};
pub use types::*;
