/// Runner: consumes build jobs and drives the pipeline
///
/// Each handler owns one build end-to-end: enrichment, clone, build, image,
/// push, terminal status. Every log line flows through a per-build collector
/// task, which keeps runner-local ordering on both delivery paths.
pub mod docker;

use crate::build::models::{BuildStatus, StepName, StepStatus};
use crate::build::BuildService;
use crate::error::{NexusError, NexusResult};
use crate::project::ProjectService;
use crate::pubsub::{LogCollector, LogSink, Publisher};
use crate::queue::{BuildJobHandler, BuildJobPayload};
use async_trait::async_trait;
use docker::{BuildContext, DockerExecutor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Commands understood by the per-build collector task
enum LogCmd {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Handle for feeding log lines from sync callbacks into the async collector
#[derive(Clone)]
struct LogFeed {
    tx: mpsc::UnboundedSender<LogCmd>,
}

impl LogFeed {
    fn line(&self, line: String) {
        let _ = self.tx.send(LogCmd::Line(line));
    }

    async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(LogCmd::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Spawn the collector task for one build. The task is the single writer,
/// so line order is preserved end to end.
fn spawn_collector(mut collector: LogCollector) -> LogFeed {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                LogCmd::Line(line) => collector.add(&line).await,
                LogCmd::Flush(ack) => {
                    collector.flush().await;
                    let _ = ack.send(());
                }
            }
        }
        collector.flush().await;
    });
    LogFeed { tx }
}

struct PipelineOutcome {
    image_tag: String,
    workspace: Option<PathBuf>,
    error: Option<NexusError>,
}

pub struct BuildRunner {
    projects: Arc<ProjectService>,
    builds: Arc<BuildService>,
    executor: Arc<DockerExecutor>,
    publisher: Publisher,
}

impl BuildRunner {
    pub fn new(
        projects: Arc<ProjectService>,
        builds: Arc<BuildService>,
        executor: Arc<DockerExecutor>,
        publisher: Publisher,
    ) -> Self {
        Self {
            projects,
            builds,
            executor,
            publisher,
        }
    }

    pub fn executor(&self) -> &Arc<DockerExecutor> {
        &self.executor
    }

    /// Fill missing project configuration and secrets from the project
    /// service. Failures here are warnings; the pipeline proceeds with what
    /// it has.
    async fn enrich(&self, bc: &mut BuildContext, feed: &LogFeed) {
        let needs_config = bc.repo_url.is_empty()
            || bc.branch.is_empty()
            || bc.preset.is_empty()
            || bc.port == 0
            || bc.build_command.is_empty()
            || bc.start_command.is_empty();

        let project_id = match Uuid::parse_str(&bc.project_id) {
            Ok(id) => id,
            Err(_) => {
                feed.line("[setup] Warning: invalid project id, skipping enrichment".to_string());
                return;
            }
        };

        if needs_config {
            feed.line("[setup] Fetching project configuration...".to_string());
            match self.projects.get_project(project_id, None).await {
                Ok(project) => {
                    if bc.repo_url.is_empty() {
                        bc.repo_url = project.repo_url;
                    }
                    if bc.branch.is_empty() {
                        bc.branch = project.branch;
                    }
                    if bc.preset.is_empty() {
                        bc.preset = project.preset;
                    }
                    if bc.port == 0 {
                        bc.port = project.port as u16;
                    }
                    if bc.build_command.is_empty() {
                        bc.build_command = project.build_command;
                    }
                    if bc.start_command.is_empty() {
                        bc.start_command = project.start_command;
                    }
                }
                Err(e) => {
                    feed.line(format!("[setup] Warning: Failed to fetch project: {}", e));
                }
            }
        }

        if bc.secrets.is_empty() {
            feed.line("[setup] Fetching secrets...".to_string());
            match self.projects.get_secrets(project_id).await {
                Ok(secrets) => {
                    feed.line(format!("[setup] Loaded {} secrets", secrets.len()));
                    bc.secrets = secrets;
                }
                Err(e) => {
                    feed.line(format!("[setup] Warning: Failed to fetch secrets: {}", e));
                }
            }
        }
    }

    async fn set_status(
        &self,
        build_id: Uuid,
        status: BuildStatus,
        image_tag: Option<&str>,
        logs: Vec<String>,
    ) {
        if let Err(e) = self
            .builds
            .update_build_status(build_id, status, image_tag, logs)
            .await
        {
            error!(
                build_id = %build_id,
                status = status.as_str(),
                error = %e,
                "Failed to update build status"
            );
        }
    }

    async fn set_step(
        &self,
        build_id: Uuid,
        step: StepName,
        status: StepStatus,
        duration_ms: Option<i64>,
    ) {
        if let Err(e) = self
            .builds
            .update_step_status(build_id, step, status, duration_ms)
            .await
        {
            warn!(build_id = %build_id, step = step.as_str(), error = %e, "Failed to update step");
        }
        self.publisher
            .publish_step_complete(&build_id.to_string(), step.as_str(), status.as_str())
            .await;
    }

    /// Run the four pipeline stages, reporting step status as each
    /// completes. Returns the outcome with the workspace (for cleanup) and
    /// the image tag on success.
    async fn execute_pipeline(
        &self,
        build_id: Uuid,
        bc: &BuildContext,
        feed: &LogFeed,
    ) -> PipelineOutcome {
        let mut outcome = PipelineOutcome {
            image_tag: String::new(),
            workspace: None,
            error: None,
        };

        // Stage 1: clone
        feed.line("[step 1/4] Cloning repository...".to_string());
        self.set_step(build_id, StepName::Clone, StepStatus::Running, None)
            .await;
        let started = Instant::now();
        let log = {
            let feed = feed.clone();
            move |line: String| feed.line(line)
        };
        let workspace = match self.executor.clone_repository(bc, log).await {
            Ok(ws) => {
                self.set_step(
                    build_id,
                    StepName::Clone,
                    StepStatus::Success,
                    Some(started.elapsed().as_millis() as i64),
                )
                .await;
                ws
            }
            Err(e) => {
                self.set_step(
                    build_id,
                    StepName::Clone,
                    StepStatus::Failed,
                    Some(started.elapsed().as_millis() as i64),
                )
                .await;
                outcome.error = Some(e);
                return outcome;
            }
        };
        outcome.workspace = Some(workspace.clone());

        // Stage 2: dependency install + build command
        feed.line("[step 2/4] Running build command...".to_string());
        self.set_step(build_id, StepName::Install, StepStatus::Running, None)
            .await;
        self.set_step(build_id, StepName::Build, StepStatus::Running, None)
            .await;
        let started = Instant::now();
        let log = {
            let feed = feed.clone();
            move |line: String| feed.line(line)
        };
        if let Err(e) = self.executor.run_build_command(bc, &workspace, log).await {
            let elapsed = Some(started.elapsed().as_millis() as i64);
            self.set_step(build_id, StepName::Install, StepStatus::Failed, elapsed)
                .await;
            self.set_step(build_id, StepName::Build, StepStatus::Failed, elapsed)
                .await;
            outcome.error = Some(e);
            return outcome;
        }
        let elapsed = Some(started.elapsed().as_millis() as i64);
        self.set_step(build_id, StepName::Install, StepStatus::Success, elapsed)
            .await;
        self.set_step(build_id, StepName::Build, StepStatus::Success, elapsed)
            .await;
        // No dedicated test stage in the pipeline
        self.set_step(build_id, StepName::Test, StepStatus::Skipped, None)
            .await;

        self.set_status(build_id, BuildStatus::BuildingImage, None, vec![])
            .await;

        // Stage 3: image build
        feed.line("[step 3/4] Building container image...".to_string());
        self.set_step(build_id, StepName::DockerBuild, StepStatus::Running, None)
            .await;
        let started = Instant::now();
        let log = {
            let feed = feed.clone();
            move |line: String| feed.line(line)
        };
        let image_tag = match self.executor.build_docker_image(bc, &workspace, log).await {
            Ok(tag) => {
                self.set_step(
                    build_id,
                    StepName::DockerBuild,
                    StepStatus::Success,
                    Some(started.elapsed().as_millis() as i64),
                )
                .await;
                tag
            }
            Err(e) => {
                self.set_step(
                    build_id,
                    StepName::DockerBuild,
                    StepStatus::Failed,
                    Some(started.elapsed().as_millis() as i64),
                )
                .await;
                outcome.error = Some(e);
                return outcome;
            }
        };
        outcome.image_tag = image_tag.clone();

        self.set_status(
            build_id,
            BuildStatus::PushingImage,
            Some(&image_tag),
            vec![],
        )
        .await;

        // Stage 4: registry push
        feed.line("[step 4/4] Pushing image to registry...".to_string());
        self.set_step(build_id, StepName::DockerPush, StepStatus::Running, None)
            .await;
        let started = Instant::now();
        let log = {
            let feed = feed.clone();
            move |line: String| feed.line(line)
        };
        if let Err(e) = self.executor.push_image(&image_tag, log).await {
            self.set_step(
                build_id,
                StepName::DockerPush,
                StepStatus::Failed,
                Some(started.elapsed().as_millis() as i64),
            )
            .await;
            outcome.error = Some(e);
            return outcome;
        }
        self.set_step(
            build_id,
            StepName::DockerPush,
            StepStatus::Success,
            Some(started.elapsed().as_millis() as i64),
        )
        .await;

        outcome
    }
}

#[async_trait]
impl BuildJobHandler for BuildRunner {
    async fn handle(&self, payload: BuildJobPayload) -> NexusResult<()> {
        let started = Instant::now();
        let build_id = Uuid::parse_str(&payload.build_id)
            .map_err(|_| NexusError::Validation("invalid build id in payload".to_string()))?;

        info!(
            build_id = %build_id,
            project_id = %payload.project_id,
            repo_url = %payload.repo_url,
            "Starting build job"
        );

        let sink: Arc<dyn LogSink> = Arc::clone(&self.builds) as Arc<dyn LogSink>;
        let collector = LogCollector::new(
            self.publisher.clone(),
            Some(sink),
            &payload.project_id,
            build_id,
            10,
        );
        let feed = spawn_collector(collector);

        // Enrichment resolves the build's configuration before anyone is
        // told the build is running
        let mut bc = BuildContext {
            build_id: payload.build_id.clone(),
            project_id: payload.project_id.clone(),
            repo_url: payload.repo_url,
            branch: payload.branch,
            commit_sha: payload.commit_sha,
            build_command: payload.build_command,
            start_command: payload.start_command,
            preset: payload.preset,
            port: payload.port,
            secrets: payload.secrets,
            github_token: String::new(),
        };
        self.enrich(&mut bc, &feed).await;

        self.publisher.publish_build_started(&payload.build_id).await;
        self.set_status(build_id, BuildStatus::Running, None, vec![])
            .await;

        let outcome = self.execute_pipeline(build_id, &bc, &feed).await;

        let duration = started.elapsed();
        feed.line(format!(
            "[done] Build completed in {}s",
            duration.as_secs()
        ));

        // Durable logs must land before the terminal status
        feed.flush().await;

        let result = match &outcome.error {
            None => {
                let message = format!("Build successful, image: {}", outcome.image_tag);
                self.publisher
                    .publish_build_completed(&payload.build_id, "success", &message)
                    .await;
                self.set_status(
                    build_id,
                    BuildStatus::Success,
                    Some(&outcome.image_tag),
                    vec![message],
                )
                .await;
                Ok(())
            }
            Some(e) => {
                let message = format!("Build failed: {}", e);
                self.publisher
                    .publish_build_completed(&payload.build_id, "failed", &message)
                    .await;
                self.set_status(build_id, BuildStatus::Failed, None, vec![message.clone()])
                    .await;
                Err(NexusError::Dependency(message))
            }
        };

        if let Some(workspace) = &outcome.workspace {
            if let Err(e) = self.executor.cleanup(workspace).await {
                warn!(
                    build_id = %build_id,
                    workspace = %workspace.display(),
                    error = %e,
                    "Failed to cleanup workspace"
                );
            }
        }

        result
    }
}
