use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use casebook_core::error::{Result, SandboxError};
use casebook_core::traits::{ContainerRuntime, ContainerSpec};

/// How a fake container behaves once started.
#[derive(Debug, Clone)]
pub struct Script {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: Vec<String>,
    /// Never exit; only a timeout or removal ends the run.
    pub hang: bool,
    pub fail_pull: bool,
}

impl Script {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: Vec::new(),
            hang: false,
            fail_pull: false,
        }
    }

    pub fn failure(exit_code: i64, stderr: &[&str]) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.iter().map(|s| s.to_string()).collect(),
            hang: false,
            fail_pull: false,
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::success("")
        }
    }

    pub fn unpullable() -> Self {
        Self {
            fail_pull: true,
            ..Self::success("")
        }
    }

    pub fn with_stderr(mut self, lines: &[&str]) -> Self {
        self.stderr = lines.iter().map(|s| s.to_string()).collect();
        self
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::success("{}")
    }
}

/// One call made against the fake runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    Pull(String),
    Create(ContainerSpec),
    Copy {
        container: String,
        path: String,
        content: String,
        mode: u32,
    },
    Start(String),
    Remove { container: String, force: bool },
}

/// In-memory container runtime. Behavior is scripted per image.
#[derive(Default)]
pub struct ScriptedRuntime {
    default_script: Script,
    scripts: HashMap<String, Script>,
    containers: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<RuntimeCall>>,
}

impl ScriptedRuntime {
    pub fn new(default_script: Script) -> Self {
        Self {
            default_script,
            ..Self::default()
        }
    }

    pub fn on_image(mut self, image: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(image.into(), script);
        self
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Create(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RuntimeCall::Remove { container, .. } => Some(container),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RuntimeCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn script_for_image(&self, image: &str) -> Script {
        self.scripts
            .get(image)
            .cloned()
            .unwrap_or_else(|| self.default_script.clone())
    }

    fn script_for_container(&self, container: &str) -> Script {
        let image = self
            .containers
            .lock()
            .ok()
            .and_then(|c| c.get(container).cloned())
            .unwrap_or_default();
        self.script_for_image(&image)
    }
}

impl ContainerRuntime for ScriptedRuntime {
    fn pull<'a>(&'a self, image: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.record(RuntimeCall::Pull(image.to_string()));
            if self.script_for_image(image).fail_pull {
                return Err(SandboxError::ImagePull {
                    image: image.to_string(),
                    message: "manifest unknown".into(),
                }
                .into());
            }
            Ok(format!("Pulling from {image}\nStatus: Downloaded newer image\n"))
        })
    }

    fn create(&self, spec: ContainerSpec) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let id = {
                let mut containers = self
                    .containers
                    .lock()
                    .map_err(|e| SandboxError::Create(e.to_string()))?;
                let id = format!("container-{}", containers.len() + 1);
                containers.insert(id.clone(), spec.image.clone());
                id
            };
            self.record(RuntimeCall::Create(spec));
            Ok(id)
        })
    }

    fn copy_file<'a>(
        &'a self,
        container: &'a str,
        path: &'a str,
        content: &'a [u8],
        mode: u32,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(RuntimeCall::Copy {
                container: container.to_string(),
                path: path.to_string(),
                content: String::from_utf8_lossy(content).into_owned(),
                mode,
            });
            Ok(())
        })
    }

    fn start<'a>(&'a self, container: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(RuntimeCall::Start(container.to_string()));
            Ok(())
        })
    }

    fn stream_logs<'a>(&'a self, container: &'a str) -> BoxStream<'a, Result<String>> {
        let lines: Vec<Result<String>> = self
            .script_for_container(container)
            .stderr
            .into_iter()
            .map(|line| Ok(format!("{line}\n")))
            .collect();
        futures::stream::iter(lines).boxed()
    }

    fn wait<'a>(&'a self, container: &'a str) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let script = self.script_for_container(container);
            if script.hang {
                futures::future::pending::<()>().await;
            }
            Ok(script.exit_code)
        })
    }

    fn stdout<'a>(&'a self, container: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { Ok(self.script_for_container(container).stdout) })
    }

    fn remove<'a>(&'a self, container: &'a str, force: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(RuntimeCall::Remove {
                container: container.to_string(),
                force,
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_per_image() {
        let runtime = ScriptedRuntime::new(Script::success("{}"))
            .on_image("broken", Script::failure(2, &["boom"]));

        let spec = |image: &str| ContainerSpec {
            image: image.into(),
            cmd: vec!["/script".into()],
            working_dir: "/home".into(),
        };
        let ok = runtime.create(spec("python")).await.unwrap();
        let bad = runtime.create(spec("broken")).await.unwrap();

        assert_eq!(runtime.wait(&ok).await.unwrap(), 0);
        assert_eq!(runtime.wait(&bad).await.unwrap(), 2);
        let logs: Vec<_> = runtime.stream_logs(&bad).collect().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(runtime.created().len(), 2);
    }
}
