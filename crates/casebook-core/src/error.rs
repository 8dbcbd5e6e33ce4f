use thiserror::Error;

/// Structural failures while building or ordering a playbook graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate node: {0}")]
    DuplicateNode(String),

    #[error("node does not exist: {0}")]
    UnknownNode(String),

    /// Nodes that could be ordered before the cycle blocked progress.
    #[error("cycle detected after ordering {} node(s)", sorted.len())]
    Cycle { sorted: Vec<String> },

    #[error("expected exactly one root, found {count}")]
    NoUniqueRoot { count: usize },
}

/// Failures of a single sandboxed script run. Terminal for that job only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("container runtime unavailable: {0}")]
    Connect(String),

    #[error("image pull failed: {image}: {message}")]
    ImagePull { image: String, message: String },

    #[error("container create failed: {0}")]
    Create(String),

    #[error("copy into container failed: {0}")]
    Copy(String),

    #[error("container start failed: {0}")]
    Start(String),

    #[error("container wait failed: {0}")]
    Wait(String),

    #[error("container remove failed: {0}")]
    Remove(String),

    #[error("container timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("container returned status code {code}: stderr: {stderr}")]
    NonZeroExit { code: i64, stderr: String },
}

#[derive(Debug, Error)]
pub enum CasebookError {
    // Graph errors
    #[error("Playbook graph error: {0}")]
    Graph(#[from] GraphError),

    // Dispatch errors
    #[error("Automation not found: {0}")]
    AutomationNotFound(String),

    #[error("Automation has an empty script: {0}")]
    EmptyScript(String),

    #[error("Publish failed on channel {channel}: {message}")]
    PublishFailed { channel: String, message: String },

    #[error("Payload generation failed for argument {argument}: {message}")]
    PayloadGeneration { argument: String, message: String },

    // Sandbox errors
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    // Lookup errors
    #[error("Ticket not found: {0}")]
    TicketNotFound(i64),

    #[error("Playbook not found: {0}")]
    PlaybookNotFound(String),

    #[error("Task not found: {playbook}/{task}")]
    TaskNotFound { playbook: String, task: String },

    #[error("Task cannot be completed, it is not active: {0}")]
    TaskNotActive(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    // Expression errors
    #[error("Expression error in `{expr}`: {message}")]
    Expression { expr: String, message: String },

    // Template errors
    #[error("Playbook template error: {0}")]
    Template(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CasebookError {
    pub fn expression(expr: &str, message: impl Into<String>) -> Self {
        Self::Expression {
            expr: expr.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CasebookError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_error_converts() {
        let err: CasebookError = GraphError::Cycle {
            sorted: vec!["a".into()],
        }
        .into();
        assert!(matches!(err, CasebookError::Graph(GraphError::Cycle { .. })));
        assert_eq!(
            err.to_string(),
            "Playbook graph error: cycle detected after ordering 1 node(s)"
        );
    }

    #[test]
    fn test_non_zero_exit_message() {
        let err = SandboxError::NonZeroExit {
            code: 3,
            stderr: "boom\n".into(),
        };
        assert_eq!(
            err.to_string(),
            "container returned status code 3: stderr: boom\n"
        );
    }

    #[test]
    fn test_remove_failure_message() {
        let err = SandboxError::Remove("no such container: 4f1c".into());
        assert_eq!(err.to_string(), "container remove failed: no such container: 4f1c");
    }
}
