use std::path::Path;

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use casebook_core::config::SandboxConfig;
use casebook_core::error::{Result, SandboxError};
use casebook_core::traits::{ContainerRuntime, ContainerSpec};

/// Container runtime backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
    memory_mb: u64,
    network: Option<String>,
}

impl DockerRuntime {
    pub fn connect(config: &SandboxConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Connect(format!("Docker connect failed: {}", e)))?;
        Ok(Self {
            docker,
            memory_mb: config.memory_mb,
            network: config.network.clone(),
        })
    }
}

/// A tar archive holding one file.
fn single_file_tar(name: &str, content: &[u8], mode: u32) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, content)?;
    builder.into_inner()
}

impl ContainerRuntime for DockerRuntime {
    fn pull<'a>(&'a self, image: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let options = CreateImageOptions {
                from_image: image,
                ..Default::default()
            };
            let mut stream = self.docker.create_image(Some(options), None, None);

            let mut log = String::new();
            while let Some(item) = stream.next().await {
                let info = item.map_err(|e| SandboxError::ImagePull {
                    image: image.to_string(),
                    message: e.to_string(),
                })?;
                if let Some(error) = info.error {
                    return Err(SandboxError::ImagePull {
                        image: image.to_string(),
                        message: error,
                    }
                    .into());
                }
                if let Some(status) = info.status {
                    match (info.id, info.progress) {
                        (Some(id), Some(progress)) => log.push_str(&format!("{id}: {status} {progress}\n")),
                        (Some(id), None) => log.push_str(&format!("{id}: {status}\n")),
                        _ => log.push_str(&format!("{status}\n")),
                    }
                }
            }
            debug!(image, "Image pulled");
            Ok(log)
        })
    }

    fn create(&self, spec: ContainerSpec) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let config = Config {
                image: Some(spec.image),
                cmd: Some(spec.cmd),
                working_dir: Some(spec.working_dir),
                host_config: Some(bollard::models::HostConfig {
                    memory: Some((self.memory_mb as i64) * 1024 * 1024),
                    network_mode: self.network.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            };

            let container = self
                .docker
                .create_container::<&str, String>(None::<CreateContainerOptions<&str>>, config)
                .await
                .map_err(|e| SandboxError::Create(e.to_string()))?;
            Ok(container.id)
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
            let target = Path::new(path);
            let name = target
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| SandboxError::Copy(format!("invalid target path {path}")))?;
            let dir = target
                .parent()
                .and_then(|p| p.to_str())
                .filter(|p| !p.is_empty())
                .unwrap_or("/");

            let archive = single_file_tar(name, content, mode)
                .map_err(|e| SandboxError::Copy(e.to_string()))?;

            self.docker
                .upload_to_container(
                    container,
                    Some(UploadToContainerOptions {
                        path: dir,
                        ..Default::default()
                    }),
                    bytes::Bytes::from(archive),
                )
                .await
                .map_err(|e| SandboxError::Copy(e.to_string()))?;
            Ok(())
        })
    }

    fn start<'a>(&'a self, container: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.docker
                .start_container::<String>(container, None)
                .await
                .map_err(|e| SandboxError::Start(e.to_string()))?;
            Ok(())
        })
    }

    fn stream_logs<'a>(&'a self, container: &'a str) -> BoxStream<'a, Result<String>> {
        let options = LogsOptions::<String> {
            follow: true,
            stderr: true,
            ..Default::default()
        };
        self.docker
            .logs(container, Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(LogOutput::StdErr { message }) => {
                        Some(Ok(String::from_utf8_lossy(&message).into_owned()))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(SandboxError::Wait(format!("log stream: {e}")).into())),
                }
            })
            .boxed()
    }

    fn wait<'a>(&'a self, container: &'a str) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let mut stream = self
                .docker
                .wait_container(container, None::<WaitContainerOptions<String>>);
            match stream.next().await {
                Some(Ok(exit)) => Ok(exit.status_code),
                // bollard reports a non-zero exit as an error
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(SandboxError::Wait(e.to_string()).into()),
                None => Err(SandboxError::Wait("wait stream ended without a status".into()).into()),
            }
        })
    }

    fn stdout<'a>(&'a self, container: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let options = LogsOptions::<String> {
                stdout: true,
                ..Default::default()
            };
            let mut stream = self.docker.logs(container, Some(options));
            let mut out = String::new();
            while let Some(item) = stream.next().await {
                if let LogOutput::StdOut { message } =
                    item.map_err(|e| SandboxError::Wait(format!("stdout: {e}")))?
                {
                    out.push_str(&String::from_utf8_lossy(&message));
                }
            }
            Ok(out)
        })
    }

    fn remove<'a>(&'a self, container: &'a str, force: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let options = RemoveContainerOptions {
                force,
                ..Default::default()
            };
            self.docker
                .remove_container(container, Some(options))
                .await
                .map_err(|e| SandboxError::Remove(e.to_string()))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_file_tar() {
        let archive = single_file_tar("script", b"#!/bin/sh\necho hi\n", 0o755).unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());
        let entries: Vec<_> = reader
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().display().to_string(),
                    e.header().mode().unwrap(),
                    e.header().size().unwrap(),
                )
            })
            .collect();
        assert_eq!(entries, vec![("script".to_string(), 0o755, 18)]);
    }
}
