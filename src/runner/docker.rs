/// Container operations for the build pipeline
///
/// Container-level work (pull, create, exec, commit, wait) goes through the
/// Docker API; image build and registry push shell out to the `docker` CLI
/// for BuildKit support. Workspaces live under `{work_dir}/{build_id}` and
/// are removed on terminal outcomes and on history deletion.
use crate::error::{NexusError, NexusResult};
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CommitContainerOptions, CreateImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// Everything the pipeline needs to run one build
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub build_id: String,
    pub project_id: String,
    pub repo_url: String,
    pub branch: String,
    pub commit_sha: String,
    pub build_command: String,
    pub start_command: String,
    pub preset: String,
    pub port: u16,
    pub secrets: HashMap<String, String>,
    pub github_token: String,
}

pub struct DockerExecutor {
    docker: Docker,
    registry_url: String,
    registry_user: String,
    registry_pass: String,
    work_dir: PathBuf,
}

impl DockerExecutor {
    pub async fn new(
        registry_url: &str,
        registry_user: &str,
        registry_pass: &str,
        work_dir: &str,
    ) -> NexusResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;

        tokio::time::timeout(Duration::from_secs(5), docker.ping())
            .await
            .map_err(|_| NexusError::DeadlineExceeded("docker ping".to_string()))??;

        tokio::fs::create_dir_all(work_dir).await?;

        info!(registry = registry_url, work_dir, "Build executor initialized");

        Ok(Self {
            docker,
            registry_url: registry_url.to_string(),
            registry_user: registry_user.to_string(),
            registry_pass: registry_pass.to_string(),
            work_dir: PathBuf::from(work_dir),
        })
    }

    pub fn workspace_path(&self, build_id: &str) -> PathBuf {
        self.work_dir.join(build_id)
    }

    // ==================== Clone ====================

    /// Shallow-clone the repository into the per-build workspace. Falls back
    /// through `main`, `master`, and the default branch when the requested
    /// branch does not exist. Commit checkout failure is non-fatal.
    pub async fn clone_repository<F>(
        &self,
        bc: &BuildContext,
        mut log_line: F,
    ) -> NexusResult<PathBuf>
    where
        F: FnMut(String),
    {
        let workspace = self.workspace_path(&bc.build_id);
        tokio::fs::create_dir_all(&workspace).await?;
        log_line(format!("[clone] Creating workspace: {}", workspace.display()));

        let mut repo_url = bc.repo_url.clone();
        if !bc.github_token.is_empty() && repo_url.contains("github.com") {
            repo_url = repo_url.replacen(
                "https://github.com",
                &format!("https://{}@github.com", bc.github_token),
                1,
            );
        }

        log_line(format!("[clone] Cloning {} branch {}", bc.repo_url, bc.branch));

        let mut cloned = false;
        if !bc.branch.is_empty() {
            cloned = self
                .try_clone(&workspace, &repo_url, Some(&bc.branch), &mut log_line)
                .await;
        }
        if !cloned {
            log_line(format!(
                "[clone] Branch {} not found, trying default branch...",
                bc.branch
            ));
            for fallback in ["main", "master"] {
                if fallback == bc.branch {
                    continue;
                }
                if self
                    .try_clone(&workspace, &repo_url, Some(fallback), &mut log_line)
                    .await
                {
                    log_line(format!("[clone] Cloned default branch: {}", fallback));
                    cloned = true;
                    break;
                }
            }
        }
        if !cloned {
            // Last resort: no branch flag, take whatever the remote default is
            log_line("[clone] Branch-specific clone failed, trying without branch...".to_string());
            if !self
                .try_clone(&workspace, &repo_url, None, &mut log_line)
                .await
            {
                return Err(NexusError::Dependency("git clone failed".to_string()));
            }
        }

        if !bc.commit_sha.is_empty() {
            log_line(format!("[clone] Checking out commit {}", bc.commit_sha));
            let output = Command::new("git")
                .args(["checkout", &bc.commit_sha])
                .current_dir(&workspace)
                .output()
                .await?;
            if !output.status.success() {
                log_line(format!(
                    "[clone] Checkout error: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ));
                // Continue with the branch head
            }
        }

        log_line(format!(
            "[clone] Successfully cloned to {}",
            workspace.display()
        ));
        Ok(workspace)
    }

    async fn try_clone<F>(
        &self,
        workspace: &Path,
        repo_url: &str,
        branch: Option<&str>,
        log_line: &mut F,
    ) -> bool
    where
        F: FnMut(String),
    {
        let mut args = vec!["clone".to_string(), "--depth".to_string(), "1".to_string()];
        if let Some(branch) = branch {
            args.push("--branch".to_string());
            args.push(branch.to_string());
        }
        args.push(repo_url.to_string());
        args.push(".".to_string());

        match Command::new("git")
            .args(&args)
            .current_dir(workspace)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stderr);
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    log_line(format!("[clone] {}", trimmed));
                }
                true
            }
            Ok(_) => false,
            Err(e) => {
                log_line(format!("[clone] git invocation failed: {}", e));
                false
            }
        }
    }

    // ==================== Build command ====================

    /// Run dependency install and the user's build command inside a
    /// container: pull the preset base image, copy the workspace in via a
    /// tar stream, exec the install command, commit to a transient image
    /// with the build command as entrypoint, and run it to completion.
    pub async fn run_build_command<F>(
        &self,
        bc: &BuildContext,
        workspace: &Path,
        mut log_line: F,
    ) -> NexusResult<()>
    where
        F: FnMut(String),
    {
        if bc.build_command.is_empty() {
            log_line("[build] No build command specified, skipping".to_string());
            return Ok(());
        }

        let base_image = base_image_for_preset(&bc.preset);
        log_line(format!("[build] Using base image: {}", base_image));

        self.pull_image(&base_image).await?;

        let mut env: Vec<String> = bc
            .secrets
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        if is_node_preset(&bc.preset) {
            env.push("NODE_OPTIONS=--max-old-space-size=4096".to_string());
        }

        let container_name = format!("nexus-build-{}", bc.build_id);

        // Stage 1: keep-alive container to receive the workspace tree
        let create = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                Config {
                    image: Some(base_image.clone()),
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        "sleep infinity".to_string(),
                    ]),
                    working_dir: Some("/app".to_string()),
                    env: Some(env.clone()),
                    host_config: Some(HostConfig {
                        memory: Some(4 * 1024 * 1024 * 1024),
                        nano_cpus: Some(1_000_000_000),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await?;
        let container_id = create.id;

        let result = self
            .run_build_stages(bc, workspace, &container_id, env, &mut log_line)
            .await;

        // The stage-1 container is always disposable
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

        result
    }

    async fn run_build_stages<F>(
        &self,
        bc: &BuildContext,
        workspace: &Path,
        container_id: &str,
        env: Vec<String>,
        log_line: &mut F,
    ) -> NexusResult<()>
    where
        F: FnMut(String),
    {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;

        log_line("[build] Copying workspace files to container...".to_string());
        let tar_bytes = archive_workspace(workspace)?;
        self.docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path: "/app".to_string(),
                    ..Default::default()
                }),
                tar_bytes.into(),
            )
            .await?;
        log_line("[build] Workspace files copied to container".to_string());

        if let Some(install_cmd) = install_command_for_preset(&bc.preset, workspace) {
            log_line(format!("[build] Installing dependencies: {}", install_cmd));
            let exit_code = self
                .exec_streaming(container_id, &install_cmd, &env, log_line)
                .await?;
            if exit_code != 0 {
                return Err(NexusError::Dependency(format!(
                    "install dependencies failed with exit code {}",
                    exit_code
                )));
            }
            log_line("[build] Dependencies installed successfully".to_string());
        }

        self.docker
            .stop_container(container_id, Some(StopContainerOptions { t: 10 }))
            .await
            .ok();

        // Commit workspace + installed dependencies, then run the build
        // command from the committed image
        let temp_tag = format!("nexus-build-temp-{}", bc.build_id);
        log_line(format!("[build] Running: {}", bc.build_command));
        let commit = self
            .docker
            .commit_container(
                CommitContainerOptions {
                    container: container_id.to_string(),
                    repo: temp_tag.clone(),
                    tag: "latest".to_string(),
                    ..Default::default()
                },
                Config::<String> {
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        bc.build_command.clone(),
                    ]),
                    working_dir: Some("/app".to_string()),
                    env: Some(env.clone()),
                    ..Default::default()
                },
            )
            .await?;
        let committed_image = commit.id.unwrap_or_else(|| format!("{}:latest", temp_tag));

        let run_name = format!("nexus-build-run-{}", bc.build_id);
        let create = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: run_name,
                    platform: None,
                }),
                Config {
                    image: Some(committed_image),
                    cmd: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        bc.build_command.clone(),
                    ]),
                    working_dir: Some("/app".to_string()),
                    env: Some(env),
                    host_config: Some(HostConfig {
                        memory: Some(4 * 1024 * 1024 * 1024),
                        nano_cpus: Some(1_000_000_000),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await?;
        let run_id = create.id;

        let run_result = self.run_to_completion(&run_id, log_line).await;

        let _ = self
            .docker
            .remove_container(
                &run_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        let exit_code = run_result?;
        if exit_code != 0 {
            return Err(NexusError::Dependency(format!(
                "build failed with exit code {}",
                exit_code
            )));
        }

        log_line("[build] Build completed successfully".to_string());
        Ok(())
    }

    async fn run_to_completion<F>(&self, container_id: &str, log_line: &mut F) -> NexusResult<i64>
    where
        F: FnMut(String),
    {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;

        let mut logs = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        let mut wait = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>);

        loop {
            tokio::select! {
                chunk = logs.next() => match chunk {
                    Some(Ok(output)) => emit_log_output(output, log_line),
                    Some(Err(_)) | None => {
                        // Log stream ended; fall through to the wait result
                        match wait.next().await {
                            Some(Ok(resp)) => return Ok(resp.status_code),
                            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                                return Ok(code)
                            }
                            Some(Err(e)) => return Err(e.into()),
                            None => return Ok(0),
                        }
                    }
                },
                status = wait.next() => match status {
                    Some(Ok(resp)) => return Ok(resp.status_code),
                    Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                        return Ok(code)
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(0),
                },
            }
        }
    }

    async fn exec_streaming<F>(
        &self,
        container_id: &str,
        cmd: &str,
        env: &[String],
        log_line: &mut F,
    ) -> NexusResult<i64>
    where
        F: FnMut(String),
    {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), cmd.to_string()]),
                    working_dir: Some("/app".to_string()),
                    env: Some(env.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(Ok(chunk)) = output.next().await {
                emit_log_output(chunk, log_line);
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok(inspect.exit_code.unwrap_or(0))
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

    // ==================== Image build & push ====================

    /// Build the application image: synthesise a Dockerfile from the preset
    /// when the workspace lacks one, then invoke the image build, streaming
    /// output line by line.
    pub async fn build_docker_image<F>(
        &self,
        bc: &BuildContext,
        workspace: &Path,
        mut log_line: F,
    ) -> NexusResult<String>
    where
        F: FnMut(String),
    {
        let image_tag = image_tag(&self.registry_url, bc);
        log_line(format!("[docker] Building image: {}", image_tag));

        let dockerfile_path = workspace.join("Dockerfile");
        if !dockerfile_path.exists() {
            log_line("[docker] No Dockerfile found, generating from preset".to_string());
            let dockerfile = generate_dockerfile(bc);
            tokio::fs::write(&dockerfile_path, dockerfile).await?;
        }

        let output = Command::new("docker")
            .args(["build", "-t", &image_tag])
            .arg(workspace)
            .output()
            .await?;

        for line in String::from_utf8_lossy(&output.stderr)
            .lines()
            .chain(String::from_utf8_lossy(&output.stdout).lines())
        {
            if !line.trim().is_empty() {
                log_line(format!("[docker] {}", line.trim()));
            }
        }

        if !output.status.success() {
            return Err(NexusError::Dependency("docker build failed".to_string()));
        }

        log_line(format!("[docker] Image built successfully: {}", image_tag));
        Ok(image_tag)
    }

    /// Push the image to the configured registry. Authentication failures
    /// are logged as warnings and the push treated as successful: the image
    /// remains locally addressable for deployment on the same host. Network
    /// failures are failures.
    pub async fn push_image<F>(&self, image_tag: &str, mut log_line: F) -> NexusResult<()>
    where
        F: FnMut(String),
    {
        if self.registry_url.is_empty() {
            log_line("[push] No registry configured, skipping push".to_string());
            log_line(format!("[push] Image available locally: {}", image_tag));
            return Ok(());
        }

        log_line(format!("[push] Pushing image: {}", image_tag));

        if !self.registry_user.is_empty() && !self.registry_pass.is_empty() {
            log_line("[push] Logging in to registry...".to_string());
            let login = Command::new("docker")
                .args([
                    "login",
                    "-u",
                    &self.registry_user,
                    "-p",
                    &self.registry_pass,
                    &self.registry_url,
                ])
                .output()
                .await?;
            if login.status.success() {
                log_line("[push] Successfully logged in to registry".to_string());
            } else {
                log_line("[push] Warning: Failed to login to registry".to_string());
                log_line("[push] Attempting push without login".to_string());
            }
        }

        let output = Command::new("docker")
            .args(["push", image_tag])
            .output()
            .await?;

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        for line in combined.lines() {
            if !line.trim().is_empty() {
                log_line(format!("[push] {}", line.trim()));
            }
        }

        if !output.status.success() {
            if is_auth_failure(&combined) {
                log_line("[push] Warning: Push failed due to authentication/authorization".to_string());
                log_line("[push] Image is available locally but not pushed to registry".to_string());
                log_line("[push] Build will continue - image can be used for local deployment".to_string());
                return Ok(());
            }
            return Err(NexusError::Dependency("docker push failed".to_string()));
        }

        log_line("[push] Image pushed successfully".to_string());
        Ok(())
    }

    // ==================== Workspaces ====================

    pub async fn cleanup(&self, workspace: &Path) -> NexusResult<()> {
        tokio::fs::remove_dir_all(workspace).await?;
        Ok(())
    }

    /// Remove workspace directories for the given build ids; failures are
    /// logged and skipped.
    pub async fn cleanup_workspaces(&self, build_ids: &[String]) {
        for build_id in build_ids {
            let workspace = self.workspace_path(build_id);
            match tokio::fs::remove_dir_all(&workspace).await {
                Ok(()) => {
                    info!(build_id, workspace = %workspace.display(), "Workspace cleaned up");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(build_id, error = %e, "Failed to cleanup workspace");
                }
            }
        }
    }
}

fn emit_log_output<F>(output: LogOutput, log_line: &mut F)
where
    F: FnMut(String),
{
    let bytes = match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => message,
    };
    for line in crate::pubsub::sanitize_bytes(&bytes).lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            log_line(trimmed.to_string());
        }
    }
}

fn is_auth_failure(output: &str) -> bool {
    output.contains("denied")
        || output.contains("unauthorized")
        || output.contains("authentication required")
}

pub fn is_node_preset(preset: &str) -> bool {
    matches!(preset.to_lowercase().as_str(), "nodejs" | "node")
}

/// Base image by preset
pub fn base_image_for_preset(preset: &str) -> String {
    match preset.to_lowercase().as_str() {
        "nodejs" | "node" => "node:20-alpine",
        "go" | "golang" => "golang:1.24-alpine",
        "python" => "python:3.12-alpine",
        "ruby" => "ruby:3.3-alpine",
        "java" => "eclipse-temurin:21-alpine",
        _ => "alpine:latest",
    }
    .to_string()
}

/// Preset-specific install command, keyed on which manifest actually exists
/// in the workspace
pub fn install_command_for_preset(preset: &str, workspace: &Path) -> Option<String> {
    match preset.to_lowercase().as_str() {
        "nodejs" | "node" => workspace
            .join("package.json")
            .exists()
            .then(|| "npm install".to_string()),
        "python" => {
            if workspace.join("requirements.txt").exists() {
                Some("pip install --no-cache-dir -r requirements.txt".to_string())
            } else if workspace.join("pyproject.toml").exists() {
                Some("pip install poetry && poetry install --no-dev".to_string())
            } else {
                None
            }
        }
        "go" | "golang" => workspace
            .join("go.mod")
            .exists()
            .then(|| "go mod download".to_string()),
        "ruby" => workspace
            .join("Gemfile")
            .exists()
            .then(|| "bundle install".to_string()),
        "java" => {
            if workspace.join("pom.xml").exists() {
                Some("mvn dependency:resolve".to_string())
            } else if workspace.join("build.gradle").exists() {
                Some("gradle dependencies".to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}

/// The image tag scheme shared with the deploy path:
/// `{registry}/{project_id}:{short8}` when a registry is configured, else
/// `nexus/{project_id}:{short8}`; short8 comes from the commit SHA, falling
/// back to the build id.
pub fn image_tag(registry_url: &str, bc: &BuildContext) -> String {
    let tag = short8(if bc.commit_sha.is_empty() {
        &bc.build_id
    } else {
        &bc.commit_sha
    });

    if registry_url.is_empty() {
        format!("nexus/{}:{}", bc.project_id, tag)
    } else {
        format!("{}/{}:{}", registry_url, bc.project_id, tag)
    }
}

pub fn short8(s: &str) -> String {
    s.chars().take(8).collect()
}

/// Multi-stage Dockerfile from the preset: builder installs dependencies and
/// runs the build command; runtime copies artefacts, exposes the port, and
/// starts via `sh -c`.
pub fn generate_dockerfile(bc: &BuildContext) -> String {
    let base_image = base_image_for_preset(&bc.preset);
    let preset = bc.preset.to_lowercase();
    let port = if bc.port == 0 { 8080 } else { bc.port };

    let mut out = String::new();
    out.push_str(&format!("FROM {} AS builder\n", base_image));
    out.push_str("WORKDIR /app\n");

    match preset.as_str() {
        "nodejs" | "node" => {
            out.push_str("COPY package*.json ./\n");
            out.push_str("RUN npm ci --only=production || npm install --production\n");
        }
        "python" => {
            out.push_str("COPY requirements.txt ./\n");
            out.push_str("RUN pip install --no-cache-dir -r requirements.txt || true\n");
        }
        "go" | "golang" => {
            out.push_str("COPY go.mod go.sum ./\n");
            out.push_str("RUN go mod download || true\n");
        }
        _ => {}
    }

    out.push_str("COPY . .\n");

    if !bc.build_command.is_empty() {
        out.push_str(&format!("RUN {}\n", bc.build_command));
    } else {
        match preset.as_str() {
            "nodejs" | "node" => out.push_str("RUN npm run build || true\n"),
            "go" | "golang" => out.push_str("RUN go build -o app . || true\n"),
            _ => {}
        }
    }

    out.push_str(&format!("\nFROM {}\n", base_image));
    out.push_str("WORKDIR /app\n");
    match preset.as_str() {
        "go" | "golang" => {
            out.push_str("COPY --from=builder /app/app ./app\n");
            out.push_str("COPY --from=builder /app ./\n");
        }
        _ => {
            out.push_str("COPY --from=builder /app ./\n");
        }
    }

    out.push_str(&format!("EXPOSE {}\n", port));

    let start_cmd = if bc.start_command.is_empty() {
        match preset.as_str() {
            "nodejs" | "node" => "npm start",
            "go" | "golang" => "./app",
            "python" => "python main.py",
            _ => "./start.sh",
        }
        .to_string()
    } else {
        bc.start_command.clone()
    };
    let escaped = start_cmd.replace('"', "\\\"");
    out.push_str(&format!("CMD [\"sh\", \"-c\", \"{}\"]\n", escaped));

    out
}

/// Tar the workspace tree in memory, excluding `.git`
pub fn archive_workspace(workspace: &Path) -> NexusResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    append_dir(&mut builder, workspace, Path::new(""))?;
    builder
        .into_inner()
        .map_err(|e| NexusError::Internal(format!("finalize tar archive: {}", e)))
}

fn append_dir(
    builder: &mut tar::Builder<Vec<u8>>,
    dir: &Path,
    prefix: &Path,
) -> NexusResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let path = entry.path();
        let rel = prefix.join(&name);
        if path.is_dir() {
            builder.append_dir(&rel, &path).map_err(|e| {
                NexusError::Internal(format!("tar dir {}: {}", rel.display(), e))
            })?;
            append_dir(builder, &path, &rel)?;
        } else if path.is_file() {
            builder.append_path_with_name(&path, &rel).map_err(|e| {
                NexusError::Internal(format!("tar file {}: {}", rel.display(), e))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> BuildContext {
        BuildContext {
            build_id: "0b7e5f2c-aaaa-bbbb-cccc-000000000000".to_string(),
            project_id: "proj-1".to_string(),
            preset: "nodejs".to_string(),
            port: 3000,
            start_command: "npm start".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_base_images() {
        assert_eq!(base_image_for_preset("nodejs"), "node:20-alpine");
        assert_eq!(base_image_for_preset("NODE"), "node:20-alpine");
        assert_eq!(base_image_for_preset("go"), "golang:1.24-alpine");
        assert_eq!(base_image_for_preset("python"), "python:3.12-alpine");
        assert_eq!(base_image_for_preset("ruby"), "ruby:3.3-alpine");
        assert_eq!(base_image_for_preset("java"), "eclipse-temurin:21-alpine");
        assert_eq!(base_image_for_preset("unknown"), "alpine:latest");
    }

    #[test]
    fn test_image_tag_with_registry() {
        let mut bc = test_context();
        bc.commit_sha = "deadbeefcafebabe".to_string();
        assert_eq!(
            image_tag("registry.local:5000", &bc),
            "registry.local:5000/proj-1:deadbeef"
        );
    }

    #[test]
    fn test_image_tag_without_registry() {
        let mut bc = test_context();
        bc.commit_sha = "deadbeefcafebabe".to_string();
        assert_eq!(image_tag("", &bc), "nexus/proj-1:deadbeef");
    }

    #[test]
    fn test_image_tag_falls_back_to_build_id() {
        let bc = test_context();
        assert_eq!(image_tag("", &bc), "nexus/proj-1:0b7e5f2c");
    }

    #[test]
    fn test_generate_dockerfile_node() {
        let bc = test_context();
        let df = generate_dockerfile(&bc);
        assert!(df.starts_with("FROM node:20-alpine AS builder"));
        assert!(df.contains("COPY package*.json ./"));
        assert!(df.contains("EXPOSE 3000"));
        assert!(df.contains("CMD [\"sh\", \"-c\", \"npm start\"]"));
    }

    #[test]
    fn test_generate_dockerfile_defaults() {
        let bc = BuildContext {
            preset: "go".to_string(),
            ..Default::default()
        };
        let df = generate_dockerfile(&bc);
        assert!(df.contains("EXPOSE 8080"));
        assert!(df.contains("CMD [\"sh\", \"-c\", \"./app\"]"));
    }

    #[test]
    fn test_generate_dockerfile_escapes_quotes() {
        let bc = BuildContext {
            preset: "nodejs".to_string(),
            start_command: r#"node -e "console.log(1)""#.to_string(),
            ..Default::default()
        };
        let df = generate_dockerfile(&bc);
        assert!(df.contains(r#"CMD ["sh", "-c", "node -e \"console.log(1)\""]"#));
    }

    #[test]
    fn test_install_command_requires_manifest() {
        let dir = std::env::temp_dir().join(format!("nexus-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        assert_eq!(install_command_for_preset("nodejs", &dir), None);
        std::fs::write(dir.join("package.json"), "{}").unwrap();
        assert_eq!(
            install_command_for_preset("nodejs", &dir),
            Some("npm install".to_string())
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_archive_excludes_git() {
        let dir = std::env::temp_dir().join(format!("nexus-tar-{}", std::process::id()));
        std::fs::create_dir_all(dir.join(".git")).unwrap();
        std::fs::create_dir_all(dir.join("src")).unwrap();
        std::fs::write(dir.join(".git/HEAD"), "ref").unwrap();
        std::fs::write(dir.join("src/main.js"), "x").unwrap();
        std::fs::write(dir.join("package.json"), "{}").unwrap();

        let bytes = archive_workspace(&dir).unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();

        assert!(names.iter().any(|n| n == "package.json"));
        assert!(names.iter().any(|n| n == "src/main.js"));
        assert!(!names.iter().any(|n| n.starts_with(".git")));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_short8() {
        assert_eq!(short8("deadbeefcafebabe"), "deadbeef");
        assert_eq!(short8("abc"), "abc");
    }

    #[test]
    fn test_auth_failure_detection() {
        assert!(is_auth_failure("push access denied for repo"));
        assert!(is_auth_failure("unauthorized: access token invalid"));
        assert!(is_auth_failure("authentication required"));
        assert!(!is_auth_failure("connection timed out"));
    }
}
