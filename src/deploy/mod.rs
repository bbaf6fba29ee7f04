/// Deployment executor: container lifecycle behind the reverse proxy
///
/// Owns a process-local map of deployment records and the set of used host
/// ports, both behind one read-write lock. Canonical truth lives in the
/// container runtime; the map is a cache rebuilt on boot and refreshed on
/// every status query.
use crate::config::DeployConfig;
use crate::error::{NexusError, NexusResult};
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Recovery label keys
const LABEL_PROJECT_ID: &str = "nexus.project_id";
const LABEL_DEPLOYMENT_ID: &str = "nexus.deployment_id";
const LABEL_DOMAIN: &str = "nexus.domain";
const LABEL_MANAGED: &str = "io.nexusdeploy.managed";

/// Local image prefix used when no registry is configured
const LOCAL_IMAGE_PREFIX: &str = "nexus/";

/// State of a running deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Stopped,
    Failed,
    Restarting,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Restarting => "restarting",
        }
    }
}

/// One running container instance serving user traffic
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub id: String,
    pub project_id: String,
    pub container_id: String,
    pub image_tag: String,
    pub host_port: u16,
    pub status: DeploymentStatus,
    pub public_url: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// What to deploy
#[derive(Debug, Clone, Default)]
pub struct DeploymentSpec {
    pub project_id: String,
    pub build_id: String,
    pub image_tag: String,
    pub port: u16,
    pub domain: String,
    pub env_vars: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    pub resources: Option<ResourceLimits>,
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub memory_mb: i64,
    pub cpu_cores: i64,
}

struct ExecutorState {
    deployments: HashMap<String, Deployment>,
    used_ports: HashSet<u16>,
}

pub struct DeploymentExecutor {
    docker: Docker,
    config: DeployConfig,
    state: RwLock<ExecutorState>,
}

impl DeploymentExecutor {
    /// Connect to the runtime and recover deployments left behind by a
    /// previous process.
    pub async fn new(config: DeployConfig) -> NexusResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;

        tokio::time::timeout(Duration::from_secs(5), docker.ping())
            .await
            .map_err(|_| NexusError::DeadlineExceeded("docker ping".to_string()))??;

        info!(
            network = %config.traefik_network,
            entrypoint = %config.traefik_entrypoint,
            domain_suffix = %config.traefik_domain_suffix,
            "Deployment executor initialized"
        );

        let executor = Self {
            docker,
            config,
            state: RwLock::new(ExecutorState {
                deployments: HashMap::new(),
                used_ports: HashSet::new(),
            }),
        };

        if let Err(e) = executor.recover_existing_deployments().await {
            warn!(error = %e, "Failed to recover existing deployments on startup");
        }

        Ok(executor)
    }

    pub async fn is_healthy(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    // ==================== Deploy ====================

    /// Pull (or locate) the image, allocate a host port, and start a
    /// container wired to the reverse proxy.
    pub async fn deploy(&self, mut spec: DeploymentSpec) -> NexusResult<Deployment> {
        let deployment_id = Uuid::new_v4().to_string();

        info!(
            deployment_id = %deployment_id,
            project_id = %spec.project_id,
            image = %spec.image_tag,
            "Starting deployment"
        );

        let mut deployment = Deployment {
            id: deployment_id.clone(),
            project_id: spec.project_id.clone(),
            container_id: String::new(),
            image_tag: spec.image_tag.clone(),
            host_port: 0,
            status: DeploymentStatus::Pending,
            public_url: String::new(),
            started_at: Utc::now(),
            error: String::new(),
        };

        if let Err(e) = self.ensure_image(&mut spec).await {
            deployment.status = DeploymentStatus::Failed;
            deployment.error = format!("pull image: {}", e);
            self.store(deployment.clone()).await;
            return Err(e);
        }
        deployment.image_tag = spec.image_tag.clone();

        let container_name = container_name(&spec.project_id, &deployment_id);
        let domain = self.domain_for(&spec);
        let env = build_env(&spec);
        let resources = build_resource_limits(spec.resources);
        let mut labels = self.build_traefik_labels(&container_name, &domain, spec.port);
        labels.extend(nexus_labels(&spec.project_id, &deployment_id, &domain));

        let host_port = match self.allocate_port().await {
            Ok(port) => port,
            Err(e) => {
                deployment.status = DeploymentStatus::Failed;
                deployment.error = format!("allocate port: {}", e);
                self.store(deployment.clone()).await;
                return Err(e);
            }
        };

        let port_key = format!("{}/tcp", spec.port);
        let port_bindings = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        )]);
        let exposed_ports = HashMap::from([(port_key, HashMap::new())]);

        let create = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name,
                    platform: None,
                }),
                Config {
                    image: Some(spec.image_tag.clone()),
                    env: Some(env),
                    exposed_ports: Some(exposed_ports),
                    labels: Some(labels),
                    host_config: Some(HostConfig {
                        memory: Some(resources.0),
                        nano_cpus: Some(resources.1),
                        restart_policy: Some(RestartPolicy {
                            name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                            maximum_retry_count: None,
                        }),
                        network_mode: Some(self.config.traefik_network.clone()),
                        port_bindings: Some(port_bindings),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await;

        let container_id = match create {
            Ok(resp) => resp.id,
            Err(e) => {
                self.release_port(host_port).await;
                deployment.status = DeploymentStatus::Failed;
                deployment.error = format!("create container: {}", e);
                self.store(deployment.clone()).await;
                return Err(e.into());
            }
        };

        deployment.container_id = container_id.clone();
        deployment.host_port = host_port;

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self
                .docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            self.release_port(host_port).await;
            deployment.status = DeploymentStatus::Failed;
            deployment.error = format!("start container: {}", e);
            // The container was just force-removed; a failed record must not
            // point at it
            deployment.container_id.clear();
            self.store(deployment.clone()).await;
            return Err(e.into());
        }

        // Give the container a moment before declaring it live
        tokio::time::sleep(Duration::from_secs(2)).await;

        deployment.status = DeploymentStatus::Running;
        deployment.public_url = format!("https://{}", domain);
        self.store(deployment.clone()).await;

        crate::metrics::DEPLOYMENTS_ACTIVE.inc();
        info!(
            deployment_id = %deployment.id,
            project_id = %deployment.project_id,
            container_id = %deployment.container_id,
            public_url = %deployment.public_url,
            container_port = spec.port,
            host_port,
            "Deployment successful"
        );
        Ok(deployment)
    }

    /// Inspect the requested image; pull on miss. When the pull fails and
    /// the tag is not already local-prefixed, retry with the `nexus/`
    /// rewrite so runner-built images that were never pushed still deploy.
    async fn ensure_image(&self, spec: &mut DeploymentSpec) -> NexusResult<()> {
        if self.docker.inspect_image(&spec.image_tag).await.is_ok() {
            info!(image = %spec.image_tag, "Image found locally, skipping pull");
            return Ok(());
        }

        debug!(image = %spec.image_tag, "Image not found locally, trying to pull");
        let pull_err = match self.pull_image(&spec.image_tag).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if !spec.image_tag.starts_with(LOCAL_IMAGE_PREFIX) {
            if let Some((_, rest)) = spec.image_tag.split_once('/') {
                let local_tag = format!("{}{}", LOCAL_IMAGE_PREFIX, rest);
                debug!(local_tag = %local_tag, "Trying local image with nexus/ prefix");
                if self.docker.inspect_image(&local_tag).await.is_ok() {
                    info!(
                        original = %spec.image_tag,
                        local = %local_tag,
                        "Using local image instead of registry"
                    );
                    spec.image_tag = local_tag;
                    return Ok(());
                }
            }
        }

        Err(pull_err)
    }

    async fn pull_image(&self, image: &str) -> NexusResult<()> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(item) = stream.next().await {
            item?;
        }
        Ok(())
    }

    // ==================== Stop / Restart ====================

    /// Stop gracefully (30 s), force-remove, release the host port, and
    /// clear the container id so later status queries don't inspect a
    /// removed container.
    pub async fn stop(&self, deployment_id: &str, project_id: &str) -> NexusResult<()> {
        let deployment = self
            .find_record(deployment_id, project_id)
            .await
            .ok_or_else(|| NexusError::NotFound("deployment not found".to_string()))?;

        if deployment.container_id.is_empty() {
            return Err(NexusError::NotFound("deployment not found".to_string()));
        }

        info!(
            deployment_id = %deployment.id,
            container_id = %deployment.container_id,
            "Stopping deployment"
        );

        if let Err(e) = self
            .docker
            .stop_container(&deployment.container_id, Some(StopContainerOptions { t: 30 }))
            .await
        {
            warn!(error = %e, "Failed to stop container gracefully");
        }

        self.docker
            .remove_container(
                &deployment.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;

        if deployment.host_port > 0 {
            self.release_port(deployment.host_port).await;
        }

        let mut state = self.state.write().await;
        if let Some(d) = state.deployments.get_mut(&deployment.id) {
            d.status = DeploymentStatus::Stopped;
            d.container_id.clear();
        }
        drop(state);

        crate::metrics::DEPLOYMENTS_ACTIVE.dec();
        info!(deployment_id = %deployment.id, "Deployment stopped");
        Ok(())
    }

    /// Restart the container with a 10 s grace period
    pub async fn restart(&self, deployment_id: &str, project_id: &str) -> NexusResult<Deployment> {
        let mut deployment = self.get_status(deployment_id, project_id).await?;

        if deployment.container_id.is_empty() {
            return Err(NexusError::FailedPrecondition(
                "no container to restart".to_string(),
            ));
        }

        info!(
            deployment_id = %deployment.id,
            container_id = %deployment.container_id,
            "Restarting deployment"
        );

        self.docker
            .restart_container(
                &deployment.container_id,
                Some(RestartContainerOptions { t: 10 }),
            )
            .await?;

        deployment.status = DeploymentStatus::Running;
        self.store(deployment.clone()).await;
        Ok(deployment)
    }

    // ==================== Status ====================

    /// Three-stage resolution (map by id, map scan by project, label-based
    /// recovery), then verification of the candidate against the runtime.
    pub async fn get_status(
        &self,
        deployment_id: &str,
        project_id: &str,
    ) -> NexusResult<Deployment> {
        let mut deployment = match self.find_record(deployment_id, project_id).await {
            Some(d) => d,
            None => {
                let recovered = self.recover_from_container(project_id).await?;
                self.store(recovered.clone()).await;
                recovered
            }
        };

        if deployment.container_id.is_empty() {
            return Ok(deployment);
        }

        match self.docker.inspect_container(&deployment.container_id, None).await {
            Ok(inspect) => {
                let state = inspect.state.as_ref();
                let running = state.and_then(|s| s.running).unwrap_or(false);
                let restarting = state.and_then(|s| s.restarting).unwrap_or(false);
                let exit_code = state.and_then(|s| s.exit_code).unwrap_or(-1);
                let exited = state
                    .and_then(|s| s.status)
                    .map(|s| s == bollard::models::ContainerStateStatusEnum::EXITED)
                    .unwrap_or(false);

                let actual = if running {
                    DeploymentStatus::Running
                } else if restarting {
                    DeploymentStatus::Restarting
                } else if exited && exit_code == 0 {
                    DeploymentStatus::Stopped
                } else {
                    DeploymentStatus::Failed
                };

                let status_changed = deployment.status != actual;
                let mut url_updated = false;

                if actual == DeploymentStatus::Running && deployment.public_url.is_empty() {
                    // Reconstruct once; the write-back caches it
                    if deployment.host_port > 0 {
                        deployment.public_url =
                            format!("http://localhost:{}", deployment.host_port);
                        url_updated = true;
                    } else if let Some(domain) = inspect
                        .config
                        .as_ref()
                        .and_then(|c| c.labels.as_ref())
                        .and_then(|l| l.get(LABEL_DOMAIN))
                    {
                        deployment.public_url = format!("https://{}", domain);
                        url_updated = true;
                    }
                    if url_updated {
                        info!(
                            deployment_id = %deployment.id,
                            public_url = %deployment.public_url,
                            "Reconstructed public URL"
                        );
                    }
                }

                if status_changed {
                    info!(
                        deployment_id = %deployment.id,
                        old_status = deployment.status.as_str(),
                        new_status = actual.as_str(),
                        "Updating deployment status from runtime"
                    );
                    deployment.status = actual;
                }
                if status_changed || url_updated {
                    self.store(deployment.clone()).await;
                }
            }
            Err(e) => {
                if is_not_found(&e) {
                    // Container is gone; record stopped once and stop
                    // inspecting a removed container
                    if deployment.status != DeploymentStatus::Stopped {
                        info!(
                            deployment_id = %deployment.id,
                            container_id = %deployment.container_id,
                            "Container not found, marking deployment as stopped"
                        );
                        deployment.status = DeploymentStatus::Stopped;
                        deployment.container_id.clear();
                        self.store(deployment.clone()).await;
                    }
                } else {
                    debug!(
                        error = %e,
                        deployment_id = %deployment.id,
                        "Failed to inspect container, attempting recovery"
                    );
                    if deployment.status != DeploymentStatus::Stopped {
                        if let Ok(recovered) =
                            self.recover_from_container(&deployment.project_id).await
                        {
                            if recovered.container_id != deployment.container_id {
                                self.store(recovered.clone()).await;
                                deployment = recovered;
                            }
                        }
                    }
                }
            }
        }

        Ok(deployment)
    }

    /// Map lookup: by deployment id first, then the newest record for the
    /// project.
    async fn find_record(&self, deployment_id: &str, project_id: &str) -> Option<Deployment> {
        let state = self.state.read().await;
        if let Some(d) = state.deployments.get(deployment_id) {
            return Some(d.clone());
        }
        state
            .deployments
            .values()
            .filter(|d| d.project_id == project_id)
            .max_by_key(|d| d.started_at)
            .cloned()
    }

    // ==================== Recovery ====================

    /// Reconstruct a deployment record from a labelled container. The first
    /// running or restarting container for the project wins.
    async fn recover_from_container(&self, project_id: &str) -> NexusResult<Deployment> {
        debug!(project_id, "Attempting to recover deployment from container");

        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", LABEL_PROJECT_ID, project_id)],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        debug!(
            project_id,
            container_count = containers.len(),
            "Found containers for recovery"
        );

        for summary in &containers {
            let container_state = summary.state.as_deref().unwrap_or("");
            if container_state != "running" && container_state != "restarting" {
                continue;
            }
            let Some(container_id) = summary.id.as_deref() else {
                continue;
            };
            let Ok(inspect) = self.docker.inspect_container(container_id, None).await else {
                continue;
            };

            let labels = inspect
                .config
                .as_ref()
                .and_then(|c| c.labels.clone())
                .unwrap_or_default();

            let deployment_id = labels
                .get(LABEL_DEPLOYMENT_ID)
                .cloned()
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            let image_tag = inspect
                .config
                .as_ref()
                .and_then(|c| c.image.clone())
                .unwrap_or_default();

            let public_url = if let Some(domain) = labels.get(LABEL_DOMAIN) {
                format!("http://{}", domain)
            } else {
                extract_url_from_router_rule(summary, &labels).unwrap_or_default()
            };

            let host_port = inspect
                .network_settings
                .as_ref()
                .and_then(|ns| ns.ports.as_ref())
                .and_then(first_host_port)
                .unwrap_or(0);

            let state = inspect.state.as_ref();
            let status = if state.and_then(|s| s.running).unwrap_or(false) {
                DeploymentStatus::Running
            } else if state.and_then(|s| s.restarting).unwrap_or(false) {
                DeploymentStatus::Restarting
            } else {
                DeploymentStatus::Stopped
            };

            let started_at = inspect
                .created
                .as_deref()
                .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            let deployment = Deployment {
                id: deployment_id.clone(),
                project_id: project_id.to_string(),
                container_id: container_id.to_string(),
                image_tag,
                host_port,
                status,
                public_url,
                started_at,
                error: String::new(),
            };

            info!(
                deployment_id = %deployment_id,
                project_id,
                container_id,
                "Recovered deployment from container"
            );

            if host_port > 0 {
                let mut state = self.state.write().await;
                state.used_ports.insert(host_port);
            }

            return Ok(deployment);
        }

        debug!(project_id, "No running container found for recovery");
        Err(NexusError::NotFound(
            "no running container found for project".to_string(),
        ))
    }

    /// Boot-time recovery: one deployment per labelled project, newest
    /// running container wins.
    async fn recover_existing_deployments(&self) -> NexusResult<()> {
        let filters = HashMap::from([("label".to_string(), vec![LABEL_PROJECT_ID.to_string()])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut recovered = 0usize;
        let mut seen_projects: HashSet<String> = HashSet::new();

        for summary in &containers {
            let Some(project_id) = summary
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_PROJECT_ID))
                .cloned()
            else {
                continue;
            };
            if seen_projects.contains(&project_id) {
                continue;
            }

            if let Ok(deployment) = self.recover_from_container(&project_id).await {
                info!(
                    deployment_id = %deployment.id,
                    project_id = %project_id,
                    container_id = %deployment.container_id,
                    "Recovered deployment on startup"
                );
                self.store(deployment).await;
                seen_projects.insert(project_id);
                recovered += 1;
            }
        }

        info!(count = recovered, "Deployment recovery completed");
        Ok(())
    }

    // ==================== Logs ====================

    /// Tail the container's log stream. The runtime API demultiplexes the
    /// stream framing; we return clean lines.
    pub async fn get_logs(
        &self,
        deployment_id: &str,
        project_id: &str,
        tail_lines: u32,
    ) -> NexusResult<Vec<String>> {
        let deployment = self.get_status(deployment_id, project_id).await?;
        if deployment.container_id.is_empty() {
            return Err(NexusError::FailedPrecondition(
                "no container for logs".to_string(),
            ));
        }

        let tail = if tail_lines > 0 {
            tail_lines.to_string()
        } else {
            "100".to_string()
        };

        let mut stream = self.docker.logs(
            &deployment.container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail,
                ..Default::default()
            }),
        );

        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let output = chunk?;
            let bytes = match output {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message }
                | LogOutput::StdIn { message } => message,
            };
            for line in crate::pubsub::sanitize_bytes(&bytes).lines() {
                if !line.is_empty() {
                    lines.push(line.to_string());
                }
            }
        }
        Ok(lines)
    }

    // ==================== Ports ====================

    /// Allocate a free host port: up to 100 uniform random attempts, each
    /// candidate must be unmarked and pass a real bind probe, then a
    /// sequential scan as fallback.
    async fn allocate_port(&self) -> NexusResult<u16> {
        let (start, end) = (self.config.port_range_start, self.config.port_range_end);
        let mut state = self.state.write().await;

        for _ in 0..100 {
            let port = rand::thread_rng().gen_range(start..=end);
            if !state.used_ports.contains(&port) && is_port_available(port) {
                state.used_ports.insert(port);
                debug!(port, "Allocated random port");
                return Ok(port);
            }
        }

        warn!("Random port allocation failed after 100 attempts, falling back to sequential scan");

        for port in start..=end {
            if !state.used_ports.contains(&port) && is_port_available(port) {
                state.used_ports.insert(port);
                debug!(port, "Allocated sequential port");
                return Ok(port);
            }
        }

        Err(NexusError::FailedPrecondition(format!(
            "no available ports in range {}-{}",
            start, end
        )))
    }

    async fn release_port(&self, port: u16) {
        if port == 0 {
            return;
        }
        let mut state = self.state.write().await;
        state.used_ports.remove(&port);
    }

    /// Whether the executor is tracking a host port as used (for tests and
    /// diagnostics)
    pub async fn is_port_used(&self, port: u16) -> bool {
        self.state.read().await.used_ports.contains(&port)
    }

    async fn store(&self, deployment: Deployment) {
        let mut state = self.state.write().await;
        state.deployments.insert(deployment.id.clone(), deployment);
    }

    // ==================== Labels ====================

    fn domain_for(&self, spec: &DeploymentSpec) -> String {
        if !spec.domain.is_empty() {
            return spec.domain.clone();
        }
        // Hyphens become dots so the full project id stays a valid subdomain
        let project = spec.project_id.replace('-', ".");
        format!("{}.{}", project, self.config.traefik_domain_suffix)
    }

    fn build_traefik_labels(
        &self,
        container_name: &str,
        domain: &str,
        port: u16,
    ) -> HashMap<String, String> {
        let router = container_name.replace('-', "_");
        HashMap::from([
            ("traefik.enable".to_string(), "true".to_string()),
            (
                format!("traefik.http.routers.{}.rule", router),
                format!("Host(`{}`)", domain),
            ),
            (
                format!("traefik.http.routers.{}.entrypoints", router),
                self.config.traefik_entrypoint.clone(),
            ),
            (
                format!("traefik.http.routers.{}.tls.certresolver", router),
                "letsencrypt".to_string(),
            ),
            (
                format!("traefik.http.services.{}.loadbalancer.server.port", router),
                port.to_string(),
            ),
            (
                "traefik.docker.network".to_string(),
                self.config.traefik_network.clone(),
            ),
        ])
    }
}

fn nexus_labels(project_id: &str, deployment_id: &str, domain: &str) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_PROJECT_ID.to_string(), project_id.to_string()),
        (LABEL_DEPLOYMENT_ID.to_string(), deployment_id.to_string()),
        (LABEL_DOMAIN.to_string(), domain.to_string()),
        (LABEL_MANAGED.to_string(), "true".to_string()),
    ])
}

fn container_name(project_id: &str, deployment_id: &str) -> String {
    format!(
        "nexus-app-{}-{}",
        crate::runner::docker::short8(project_id),
        crate::runner::docker::short8(deployment_id)
    )
}

fn build_env(spec: &DeploymentSpec) -> Vec<String> {
    let mut env: Vec<String> = Vec::with_capacity(spec.env_vars.len() + spec.secrets.len() + 1);
    for (k, v) in &spec.env_vars {
        env.push(format!("{}={}", k, v));
    }
    for (k, v) in &spec.secrets {
        env.push(format!("{}={}", k, v));
    }
    env.push(format!("PORT={}", spec.port));
    env
}

/// Default 512 MB / 1 CPU; MB to bytes, cores to nano-CPUs
fn build_resource_limits(limits: Option<ResourceLimits>) -> (i64, i64) {
    match limits {
        None => (512 * 1024 * 1024, 1_000_000_000),
        Some(l) => {
            let memory = if l.memory_mb > 0 {
                l.memory_mb * 1024 * 1024
            } else {
                512 * 1024 * 1024
            };
            let cpus = if l.cpu_cores > 0 {
                l.cpu_cores * 1_000_000_000
            } else {
                1_000_000_000
            };
            (memory, cpus)
        }
    }
}

fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Pull the public URL out of a Traefik router rule of the form
/// ``Host(`domain`)`` when the recovery labels are incomplete
fn extract_url_from_router_rule(
    summary: &ContainerSummary,
    labels: &HashMap<String, String>,
) -> Option<String> {
    let name = summary
        .names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/'))?;
    let router = name.replace('-', "_");
    let rule = labels.get(&format!("traefik.http.routers.{}.rule", router))?;
    let start = rule.find("Host(`")? + "Host(`".len();
    let end = rule[start..].find("`)")?;
    Some(format!("http://{}", &rule[start..start + end]))
}

fn first_host_port(
    ports: &HashMap<String, Option<Vec<PortBinding>>>,
) -> Option<u16> {
    for bindings in ports.values().flatten() {
        for binding in bindings {
            if let Some(port) = binding.host_port.as_deref() {
                if let Ok(parsed) = port.parse() {
                    return Some(parsed);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name_shortens_ids() {
        let name = container_name(
            "aaaabbbb-cccc-dddd-eeee-ffff00001111",
            "11112222-3333-4444-5555-666677778888",
        );
        assert_eq!(name, "nexus-app-aaaabbbb-11112222");
    }

    #[test]
    fn test_build_env_includes_port_and_secrets() {
        let spec = DeploymentSpec {
            port: 3000,
            env_vars: HashMap::from([("A".to_string(), "1".to_string())]),
            secrets: HashMap::from([("S".to_string(), "2".to_string())]),
            ..Default::default()
        };
        let env = build_env(&spec);
        assert!(env.contains(&"A=1".to_string()));
        assert!(env.contains(&"S=2".to_string()));
        assert!(env.contains(&"PORT=3000".to_string()));
    }

    #[test]
    fn test_resource_limits_defaults() {
        assert_eq!(build_resource_limits(None), (512 * 1024 * 1024, 1_000_000_000));
        assert_eq!(
            build_resource_limits(Some(ResourceLimits {
                memory_mb: 1024,
                cpu_cores: 2
            })),
            (1024 * 1024 * 1024, 2_000_000_000)
        );
        assert_eq!(
            build_resource_limits(Some(ResourceLimits {
                memory_mb: 0,
                cpu_cores: 0
            })),
            (512 * 1024 * 1024, 1_000_000_000)
        );
    }

    #[test]
    fn test_nexus_labels() {
        let labels = nexus_labels("p", "d", "x.local");
        assert_eq!(labels.get("nexus.project_id").unwrap(), "p");
        assert_eq!(labels.get("nexus.deployment_id").unwrap(), "d");
        assert_eq!(labels.get("nexus.domain").unwrap(), "x.local");
        assert_eq!(labels.get("io.nexusdeploy.managed").unwrap(), "true");
    }

    #[test]
    fn test_extract_url_from_router_rule() {
        let summary = ContainerSummary {
            names: Some(vec!["/nexus-app-aaaa-bbbb".to_string()]),
            ..Default::default()
        };
        let labels = HashMap::from([(
            "traefik.http.routers.nexus_app_aaaa_bbbb.rule".to_string(),
            "Host(`proj.localhost`)".to_string(),
        )]);
        assert_eq!(
            extract_url_from_router_rule(&summary, &labels),
            Some("http://proj.localhost".to_string())
        );
    }

    #[test]
    fn test_first_host_port() {
        let ports = HashMap::from([(
            "3000/tcp".to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("12345".to_string()),
            }]),
        )]);
        assert_eq!(first_host_port(&ports), Some(12345));
        assert_eq!(first_host_port(&HashMap::new()), None);
    }

    #[test]
    fn test_port_probe_detects_collision() {
        let holder = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = holder.local_addr().unwrap().port();
        assert!(!is_port_available(port));
        drop(holder);
        assert!(is_port_available(port));
    }
}
