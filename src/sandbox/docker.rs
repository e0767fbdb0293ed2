//! Local container backend.
//!
//! Each sandbox is a labelled container started from the template's image.
//! The preview port is published on the loopback interface, commands run
//! through `docker exec`, and files move in and out as tar archives.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CommandOutput, OutputSink, SandboxError, SandboxProvider, SandboxSession};
use crate::config::DockerConfig;

const MANAGED_LABEL: &str = "sandforge.managed";
const EXPIRES_LABEL: &str = "sandforge.expires-at";
const TEMPLATE_LABEL: &str = "sandforge.template";

/// Provisions sandboxes as local Docker containers.
pub(crate) struct DockerProvider {
    docker: Docker,
    config: DockerConfig,
    preview_port: u16,
    command_timeout: Duration,
}

impl DockerProvider {
    /// Connect to the local Docker daemon.
    pub fn connect(
        config: DockerConfig,
        preview_port: u16,
        command_timeout: Duration,
    ) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::unavailable(format!("Failed to connect to Docker. Is Docker running? {e}"))
        })?;
        Ok(Self {
            docker,
            config,
            preview_port,
            command_timeout,
        })
    }

    /// Remove managed containers whose lifetime has elapsed.
    ///
    /// Docker has no native container TTL, so expiry is enforced here before
    /// each provision.
    pub async fn cleanup_expired(&self) -> Result<usize, SandboxError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let now = chrono::Utc::now().timestamp();
        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            let labels = container.labels.unwrap_or_default();
            if !is_expired(&labels, now) {
                continue;
            }
            debug!(container = %id, "Removing expired sandbox container");
            match self.remove(&id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(container = %id, error = %e, "Failed to remove expired container"),
            }
        }
        Ok(removed)
    }

    async fn remove(&self, container: &str) -> Result<(), SandboxError> {
        self.docker
            .remove_container(
                container,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    fn container_config(&self, template: &str, timeout: Duration) -> ContainerConfig<String> {
        let port_key = format!("{}/tcp", self.preview_port);
        let expires_at = chrono::Utc::now().timestamp()
            + i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX / 2);

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(EXPIRES_LABEL.to_string(), expires_at.to_string());
        labels.insert(TEMPLATE_LABEL.to_string(), template.to_string());

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key.clone(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key,
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                // Empty host port lets Docker choose a free one
                host_port: Some(String::new()),
            }]),
        );

        ContainerConfig {
            image: Some(self.config.image_for(template)),
            working_dir: Some(self.config.workdir.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn provision(&self, template: &str, timeout: Duration) -> Result<String, SandboxError> {
        match self.cleanup_expired().await {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "Cleaned up expired sandbox containers"),
            Err(e) => warn!(error = %e, "Expired sandbox cleanup failed"),
        }

        let short_id = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("sandforge-{}", &short_id[..12]);

        debug!(container = %name, template, "Creating sandbox container");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                self.container_config(template, timeout),
            )
            .await?;

        if let Err(e) = self.docker.start_container::<String>(&name, None).await {
            if let Err(remove) = self.remove(&name).await {
                warn!(container = %name, error = %remove, "Failed to remove unstarted container");
            }
            return Err(e.into());
        }
        info!(container = %name, "Sandbox container started");
        Ok(name)
    }

    async fn connect(&self, sandbox_id: &str) -> Result<Box<dyn SandboxSession>, SandboxError> {
        let inspect = self
            .docker
            .inspect_container(sandbox_id, None::<InspectContainerOptions>)
            .await?;

        let running = inspect
            .state
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            return Err(SandboxError::unavailable(format!(
                "container {sandbox_id} is not running"
            )));
        }

        Ok(Box::new(DockerSession {
            docker: self.docker.clone(),
            container: sandbox_id.to_string(),
            workdir: self.config.workdir.clone(),
            public_host: self.config.public_host.clone(),
            preview_scheme: self.config.preview_scheme.clone(),
            command_timeout: self.command_timeout,
        }))
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        self.remove(sandbox_id).await?;
        info!(container = %sandbox_id, "Sandbox container removed");
        Ok(())
    }
}

/// A connection to one running sandbox container.
struct DockerSession {
    docker: Docker,
    container: String,
    workdir: String,
    public_host: String,
    preview_scheme: String,
    command_timeout: Duration,
}

impl DockerSession {
    async fn exec(
        &self,
        command: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<CommandOutput, SandboxError> {
        let exec = self
            .docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        command.to_string(),
                    ]),
                    working_dir: Some(self.workdir.clone()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        let text = String::from_utf8_lossy(&message);
                        sink.on_stdout(&text);
                        stdout.push_str(&text);
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        let text = String::from_utf8_lossy(&message);
                        sink.on_stderr(&text);
                        stderr.push_str(&text);
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let exit_code = self
            .docker
            .inspect_exec(&exec.id)
            .await?
            .exit_code
            .unwrap_or(-1);

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}

/// Discards streamed output; used for internal housekeeping commands.
struct NullSink;

impl OutputSink for NullSink {
    fn on_stdout(&mut self, _chunk: &str) {}
    fn on_stderr(&mut self, _chunk: &str) {}
}

#[async_trait]
impl SandboxSession for DockerSession {
    fn sandbox_id(&self) -> &str {
        &self.container
    }

    async fn run_command(
        &self,
        command: &str,
        sink: &mut dyn OutputSink,
    ) -> Result<CommandOutput, SandboxError> {
        match tokio::time::timeout(self.command_timeout, self.exec(command, sink)).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::timeout(self.command_timeout)),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let absolute = resolve_path(&self.workdir, path);

        if let Some((parent, _)) = absolute.rsplit_once('/') {
            if !parent.is_empty() {
                let mkdir = format!("mkdir -p {}", shell_words::quote(parent));
                let out = self.run_command(&mkdir, &mut NullSink).await?;
                if !out.success() {
                    return Err(SandboxError::operation_failed(format!(
                        "could not create {parent}: {}",
                        out.stderr.trim()
                    )));
                }
            }
        }

        let archive = tar_single_file(&absolute, content.as_bytes())?;
        self.docker
            .upload_to_container(
                &self.container,
                Some(UploadToContainerOptions {
                    path: "/".to_string(),
                    ..Default::default()
                }),
                archive,
            )
            .await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let absolute = resolve_path(&self.workdir, path);
        let mut stream = self.docker.download_from_container(
            &self.container,
            Some(DownloadFromContainerOptions {
                path: absolute.clone(),
            }),
        );

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(e) => {
                    return Err(match SandboxError::from(e) {
                        SandboxError::NotFound { .. } => SandboxError::not_found(path),
                        other => other,
                    })
                }
            }
        }

        let data = untar_first_file(&archive)?.ok_or_else(|| SandboxError::not_found(path))?;
        String::from_utf8(data)
            .map_err(|_| SandboxError::operation_failed(format!("{path} is not valid UTF-8")))
    }

    async fn host(&self, port: u16) -> Result<String, SandboxError> {
        let inspect = self
            .docker
            .inspect_container(&self.container, None::<InspectContainerOptions>)
            .await?;

        let ports = inspect
            .network_settings
            .and_then(|n| n.ports)
            .unwrap_or_default();

        let host_port = published_host_port(&ports, port).ok_or_else(|| {
            SandboxError::operation_failed(format!("port {port} is not published"))
        })?;
        Ok(format!("{}:{host_port}", self.public_host))
    }

    fn preview_scheme(&self) -> &str {
        &self.preview_scheme
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve `path` against the container working directory.
fn resolve_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        let relative = path.strip_prefix("./").unwrap_or(path);
        format!("{}/{relative}", workdir.trim_end_matches('/'))
    }
}

fn is_expired(labels: &HashMap<String, String>, now: i64) -> bool {
    labels
        .get(EXPIRES_LABEL)
        .and_then(|v| v.parse::<i64>().ok())
        .is_some_and(|expires_at| expires_at <= now)
}

fn published_host_port(
    ports: &HashMap<String, Option<Vec<PortBinding>>>,
    port: u16,
) -> Option<String> {
    ports
        .get(&format!("{port}/tcp"))?
        .as_ref()?
        .iter()
        .find_map(|b| b.host_port.clone().filter(|p| !p.is_empty()))
}

/// Build an in-memory tar archive holding one file at `absolute` (rooted at `/`).
fn tar_single_file(absolute: &str, data: &[u8]) -> Result<Bytes, SandboxError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0));

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, absolute.trim_start_matches('/'), data)
        .map_err(|e| SandboxError::operation_failed(format!("failed to build archive: {e}")))?;
    let buf = builder
        .into_inner()
        .map_err(|e| SandboxError::operation_failed(format!("failed to build archive: {e}")))?;
    Ok(Bytes::from(buf))
}

/// Extract the contents of the first regular file in a tar archive.
fn untar_first_file(archive: &[u8]) -> Result<Option<Vec<u8>>, SandboxError> {
    let invalid = |e: std::io::Error| SandboxError::operation_failed(format!("invalid archive: {e}"));
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries().map_err(invalid)? {
        let mut entry = entry.map_err(invalid)?;
        if entry.header().entry_type().is_file() {
            let mut data = Vec::new();
            entry.read_to_end(&mut data).map_err(invalid)?;
            return Ok(Some(data));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/home/user", "app/page.tsx"), "/home/user/app/page.tsx");
        assert_eq!(resolve_path("/home/user/", "./a.txt"), "/home/user/a.txt");
        assert_eq!(resolve_path("/home/user", "/etc/hosts"), "/etc/hosts");
    }

    #[test]
    fn test_is_expired() {
        let mut labels = HashMap::new();
        assert!(!is_expired(&labels, 100));

        labels.insert(EXPIRES_LABEL.to_string(), "50".to_string());
        assert!(is_expired(&labels, 100));
        assert!(!is_expired(&labels, 10));

        labels.insert(EXPIRES_LABEL.to_string(), "garbage".to_string());
        assert!(!is_expired(&labels, 100));
    }

    #[test]
    fn test_published_host_port() {
        let mut ports = HashMap::new();
        ports.insert(
            "3000/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some("49153".to_string()),
            }]),
        );
        ports.insert("8080/tcp".to_string(), None);

        assert_eq!(published_host_port(&ports, 3000).as_deref(), Some("49153"));
        assert_eq!(published_host_port(&ports, 8080), None);
        assert_eq!(published_host_port(&ports, 5173), None);
    }

    #[test]
    fn test_tar_then_extract_single_file() {
        let archive = tar_single_file("/home/user/app/page.tsx", b"export default 1;").unwrap();
        let data = untar_first_file(&archive).unwrap().unwrap();
        assert_eq!(data, b"export default 1;");
    }

    #[test]
    fn test_untar_empty_archive() {
        let builder = tar::Builder::new(Vec::new());
        let empty = builder.into_inner().unwrap();
        assert!(untar_first_file(&empty).unwrap().is_none());
    }
}
