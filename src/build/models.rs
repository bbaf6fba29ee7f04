/// Build models: builds, steps, log lines, and the build state machine
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The state of a build in the CI/CD pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    BuildingImage,
    PushingImage,
    Deploying,
    Success,
    DeployFailed,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::BuildingImage => "building_image",
            BuildStatus::PushingImage => "pushing_image",
            BuildStatus::Deploying => "deploying",
            BuildStatus::Success => "success",
            BuildStatus::DeployFailed => "deploy_failed",
            BuildStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<BuildStatus> {
        match s {
            "pending" => Some(BuildStatus::Pending),
            "running" => Some(BuildStatus::Running),
            "building_image" => Some(BuildStatus::BuildingImage),
            "pushing_image" => Some(BuildStatus::PushingImage),
            "deploying" => Some(BuildStatus::Deploying),
            "success" => Some(BuildStatus::Success),
            "deploy_failed" => Some(BuildStatus::DeployFailed),
            "failed" => Some(BuildStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failed | BuildStatus::DeployFailed
        )
    }

    /// The legal edges of the build state machine; everything else is
    /// rejected at the persistence boundary.
    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, BuildingImage)
                | (Running, Failed)
                | (BuildingImage, PushingImage)
                | (BuildingImage, Failed)
                | (PushingImage, Success)
                | (PushingImage, Deploying)
                | (PushingImage, Failed)
                | (Deploying, Success)
                | (Deploying, DeployFailed)
        )
    }

    /// Statuses counted against the concurrent-build quota
    pub fn active_statuses() -> &'static [&'static str] {
        &[
            "pending",
            "running",
            "building_image",
            "pushing_image",
            "deploying",
        ]
    }
}

/// One CI/CD execution from source commit to pushed image
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Build {
    pub id: Uuid,
    pub project_id: Uuid,
    pub commit_sha: String,
    pub status: String,
    pub image_tag: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Build {
    pub fn status(&self) -> BuildStatus {
        BuildStatus::parse(&self.status).unwrap_or(BuildStatus::Pending)
    }
}

/// Pipeline step name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Clone,
    Install,
    Build,
    Test,
    DockerBuild,
    DockerPush,
    Deploy,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Clone => "clone",
            StepName::Install => "install",
            StepName::Build => "build",
            StepName::Test => "test",
            StepName::DockerBuild => "docker_build",
            StepName::DockerPush => "docker_push",
            StepName::Deploy => "deploy",
        }
    }

    /// All seven steps, created pending alongside the build row
    pub fn all() -> [StepName; 7] {
        [
            StepName::Clone,
            StepName::Install,
            StepName::Build,
            StepName::Test,
            StepName::DockerBuild,
            StepName::DockerPush,
            StepName::Deploy,
        ]
    }
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// Per-step status row
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BuildStep {
    pub id: Uuid,
    pub build_id: Uuid,
    pub step_name: String,
    pub status: String,
    pub duration_ms: Option<i64>,
}

/// Append-only log line, range-scanned by id
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BuildLog {
    pub id: i64,
    pub build_id: Uuid,
    pub ts: DateTime<Utc>,
    pub log_line: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use BuildStatus::*;

    #[test]
    fn test_legal_transitions() {
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(BuildingImage));
        assert!(Running.can_transition_to(Failed));
        assert!(BuildingImage.can_transition_to(PushingImage));
        assert!(BuildingImage.can_transition_to(Failed));
        assert!(PushingImage.can_transition_to(Success));
        assert!(PushingImage.can_transition_to(Deploying));
        assert!(PushingImage.can_transition_to(Failed));
        assert!(Deploying.can_transition_to(Success));
        assert!(Deploying.can_transition_to(DeployFailed));
    }

    #[test]
    fn test_illegal_transitions() {
        // The §8 scenario: pending cannot jump straight to success
        assert!(!Pending.can_transition_to(Success));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(BuildingImage));
        assert!(!Running.can_transition_to(Success));
        assert!(!Running.can_transition_to(Pending));
        assert!(!BuildingImage.can_transition_to(Running));
        assert!(!Deploying.can_transition_to(Failed));
    }

    #[test]
    fn test_no_reentry_from_terminal() {
        for terminal in [Success, Failed, DeployFailed] {
            for next in [
                Pending,
                Running,
                BuildingImage,
                PushingImage,
                Deploying,
                Success,
                DeployFailed,
                Failed,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{:?} -> {:?} must be rejected",
                    terminal,
                    next
                );
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(Success.is_terminal());
        assert!(Failed.is_terminal());
        assert!(DeployFailed.is_terminal());
        assert!(!Pending.is_terminal());
        assert!(!Running.is_terminal());
        assert!(!BuildingImage.is_terminal());
        assert!(!PushingImage.is_terminal());
        assert!(!Deploying.is_terminal());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            Pending,
            Running,
            BuildingImage,
            PushingImage,
            Deploying,
            Success,
            DeployFailed,
            Failed,
        ] {
            assert_eq!(BuildStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BuildStatus::parse("bogus"), None);
    }

    #[test]
    fn test_step_names_complete() {
        let names: Vec<&str> = StepName::all().iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "clone",
                "install",
                "build",
                "test",
                "docker_build",
                "docker_push",
                "deploy"
            ]
        );
    }
}
