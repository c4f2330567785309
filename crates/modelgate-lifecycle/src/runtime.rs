// Container runtime behind a trait
//
// The manager only sees `ContainerRuntime`; `DockerRuntime` is the bollard
// implementation. Dry-run and unit tests run without a Docker socket.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    DeviceRequest, HealthConfig, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::Docker;
use futures::StreamExt;
use modelgate_core::{LifecycleError, Settings};

use crate::command::{ContainerSpec, GpuRequest};

/// Result of creating an engine container
#[derive(Debug, Clone)]
pub struct CreatedContainer {
    pub name: String,
    /// Ephemeral host port published for container port 8000
    pub host_port: u16,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_cached(&self, image: &str) -> Result<bool, LifecycleError>;
    async fn pull_image(&self, image: &str) -> Result<(), LifecycleError>;
    /// Create and start a container. Callers remove any same-named container
    /// first via `stop_and_remove` (creation is idempotent by name).
    async fn create_container(&self, spec: &ContainerSpec) -> Result<CreatedContainer, LifecycleError>;
    /// Stop and remove by name; missing containers are not an error
    async fn stop_and_remove(&self, name: &str, stop_timeout_sec: i64) -> Result<(), LifecycleError>;
    async fn logs(&self, name: &str, tail: usize) -> Result<String, LifecycleError>;
    async fn container_running(&self, name: &str) -> Result<bool, LifecycleError>;
}

/// Ensure the engine image is present, honoring the offline policy:
/// online pulls, auto-offline probes the registry first, strict offline and
/// precache-required never pull.
pub async fn ensure_image(
    runtime: &dyn ContainerRuntime,
    settings: &Settings,
    image: &str,
) -> Result<(), LifecycleError> {
    if runtime.image_cached(image).await? {
        tracing::info!(image, "using cached engine image");
        return Ok(());
    }

    let mut offline = settings.offline_mode;
    if !offline && settings.offline_mode_auto_detect && !registry_reachable().await {
        tracing::warn!("registry unreachable - treating this operation as offline");
        offline = true;
    }

    if offline || settings.require_image_precache {
        return Err(LifecycleError::ImageUnavailableOffline {
            image: image.to_string(),
            remediation: offline_remediation(image, offline),
        });
    }

    tracing::warn!(image, "image not cached, pulling from registry (may take several minutes)");
    match runtime.pull_image(image).await {
        Ok(()) => {
            tracing::info!(image, "image pulled");
            Ok(())
        }
        Err(err) => {
            let text = err.to_string().to_lowercase();
            if text.contains("connection") || text.contains("network") || text.contains("timeout") {
                Err(LifecycleError::ImageUnavailableOffline {
                    image: image.to_string(),
                    remediation: pull_failure_remediation(image),
                })
            } else {
                Err(err)
            }
        }
    }
}

async fn registry_reachable() -> bool {
    tokio::time::timeout(
        Duration::from_secs(3),
        tokio::net::TcpStream::connect(("registry-1.docker.io", 443)),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false)
}

fn offline_remediation(image: &str, offline: bool) -> String {
    let mode_line = if offline {
        "System is in OFFLINE MODE - cannot download from internet."
    } else {
        "REQUIRE_IMAGE_PRECACHE is enabled - only cached images allowed."
    };
    format!(
        "Engine image '{image}' is not available locally.\n\n\
         {mode_line}\n\n\
         To resolve this issue:\n\
         Option 1: Load the image from an offline package\n\
           1. On an internet-connected machine: docker pull {image}\n\
           2. docker save -o engine-image.tar {image}\n\
           3. Transfer engine-image.tar to this machine\n\
           4. docker load -i engine-image.tar\n\
         Option 2: Disable offline mode (if network is available)\n\
           - Set OFFLINE_MODE=false and restart the gateway"
    )
}

fn pull_failure_remediation(image: &str) -> String {
    format!(
        "Cannot pull image {image} - network error.\n\n\
         The host may be offline or the registry is unreachable.\n\n\
         To resolve:\n\
         1. Check internet connectivity\n\
         2. Verify the container runtime can reach its registry\n\
         3. Or pre-load the image: docker load -i <image.tar>\n\
         4. Or enable offline mode: OFFLINE_MODE=true"
    )
}

fn runtime_err(err: bollard::errors::Error) -> LifecycleError {
    LifecycleError::Runtime(err.to_string())
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

/// bollard-backed runtime talking to the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, LifecycleError> {
        let docker = Docker::connect_with_local_defaults().map_err(runtime_err)?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_cached(&self, image: &str) -> Result<bool, LifecycleError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(runtime_err(err)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), LifecycleError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(runtime_err)?;
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<CreatedContainer, LifecycleError> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            "8000/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("0".to_string()),
            }]),
        );

        let device_requests = match &spec.gpus {
            GpuRequest::None => None,
            GpuRequest::All => Some(vec![DeviceRequest {
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]),
            GpuRequest::Ids(ids) => Some(vec![DeviceRequest {
                device_ids: Some(ids.iter().map(u32::to_string).collect()),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]),
        };

        let host_config = HostConfig {
            binds: Some(spec.binds.clone()),
            port_bindings: Some(port_bindings),
            network_mode: Some(spec.network.clone()),
            device_requests,
            shm_size: Some(spec.shm_size_bytes),
            ipc_mode: Some("host".to_string()),
            // Models start only on explicit operator action
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            runtime: (spec.gpus != GpuRequest::None).then(|| "nvidia".to_string()),
            ..Default::default()
        };

        let healthcheck = HealthConfig {
            test: Some(vec!["CMD-SHELL".to_string(), spec.healthcheck_cmd.clone()]),
            interval: Some(spec.healthcheck_interval.as_nanos() as i64),
            timeout: Some(spec.healthcheck_timeout.as_nanos() as i64),
            retries: Some(spec.healthcheck_retries as i64),
            start_period: Some(spec.healthcheck_start_grace.as_nanos() as i64),
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "modelgate".to_string());

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            healthcheck: Some(healthcheck),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(runtime_err)?;
        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(runtime_err)?;

        // Read back the ephemeral host port
        let inspect = self
            .docker
            .inspect_container(&spec.name, None)
            .await
            .map_err(runtime_err)?;
        let host_port = inspect
            .network_settings
            .and_then(|net| net.ports)
            .and_then(|ports| ports.get("8000/tcp").cloned().flatten())
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port)
            .and_then(|port| port.parse().ok())
            .unwrap_or(0);

        Ok(CreatedContainer {
            name: spec.name.clone(),
            host_port,
        })
    }

    async fn stop_and_remove(&self, name: &str, stop_timeout_sec: i64) -> Result<(), LifecycleError> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: stop_timeout_sec }))
            .await
        {
            Ok(()) => {}
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => tracing::warn!(container = name, error = %err, "stop failed, removing anyway"),
        }
        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(runtime_err(err)),
        }
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<String, LifecycleError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                Err(err) if is_not_found(&err) => return Ok(out),
                Err(err) => return Err(runtime_err(err)),
            }
        }
        Ok(out)
    }

    async fn container_running(&self, name: &str) -> Result<bool, LifecycleError> {
        match self.docker.inspect_container(name, None).await {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(runtime_err(err)),
        }
    }
}
