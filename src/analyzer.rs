/// AI build analyzer
///
/// Fetches a failed build's logs, asks the configured LLM endpoint for a
/// diagnosis, and caches the result by build id for 24 hours. The prompt is
/// a strict platform-context template: users can only edit repository files,
/// so shell-command suggestions are forbidden outright.
use crate::build::BuildService;
use crate::config::LlmConfig;
use crate::error::{NexusError, NexusResult};
use crate::identity::models::Plan;
use crate::kv::Kv;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

const CACHE_KEY_PREFIX: &str = "ai:analysis:";
const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
const MAX_LOG_LINES: i64 = 1000;
const MAX_SUGGESTIONS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis: String,
    pub suggestions: Vec<String>,
    pub cached: bool,
}

pub struct Analyzer {
    kv: Kv,
    builds: Arc<BuildService>,
    config: LlmConfig,
    http: reqwest::Client,
}

impl Analyzer {
    pub fn new(kv: Kv, builds: Arc<BuildService>, config: LlmConfig) -> Self {
        Self {
            kv,
            builds,
            config,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("build http client"),
        }
    }

    pub async fn analyze_build(&self, build_id: Uuid, plan: Plan) -> NexusResult<AnalysisResult> {
        let cache_key = format!("{}{}", CACHE_KEY_PREFIX, build_id);
        if let Some(cached) = self.kv.get(&cache_key).await? {
            if let Ok(mut result) = serde_json::from_str::<AnalysisResult>(&cached) {
                info!(build_id = %build_id, "Returning cached analysis result");
                result.cached = true;
                return Ok(result);
            }
        }

        let (logs, _) = self.builds.get_build_logs(build_id, 0, MAX_LOG_LINES).await?;
        if logs.is_empty() {
            return Err(NexusError::NotFound(
                "no logs found for this build".to_string(),
            ));
        }

        let logs_text = logs
            .iter()
            .map(|l| l.log_line.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = build_prompt(plan, &logs_text);
        let analysis = self.call_llm(&prompt).await?;
        let suggestions = parse_suggestions(&analysis);

        let result = AnalysisResult {
            analysis,
            suggestions,
            cached: false,
        };

        // Cached regardless of quality
        if let Ok(serialized) = serde_json::to_string(&result) {
            let _ = self.kv.set_ex(&cache_key, &serialized, CACHE_TTL).await;
        }

        Ok(result)
    }

    async fn call_llm(&self, prompt: &str) -> NexusResult<String> {
        #[derive(Deserialize)]
        struct LlmResponse {
            #[serde(default)]
            response: String,
            #[serde(default)]
            error: String,
        }

        let resp = self
            .http
            .post(&self.config.api_url)
            .json(&serde_json::json!({
                "model": self.config.model,
                "prompt": prompt,
                "stream": false,
            }))
            .send()
            .await
            .map_err(|e| NexusError::Dependency(format!("llm request: {}", e)))?;

        if !resp.status().is_success() {
            return Err(NexusError::Dependency(format!(
                "llm API error: status {}",
                resp.status()
            )));
        }

        let body: LlmResponse = resp
            .json()
            .await
            .map_err(|e| NexusError::Dependency(format!("decode llm response: {}", e)))?;

        if !body.error.is_empty() {
            return Err(NexusError::Dependency(format!("llm error: {}", body.error)));
        }
        Ok(body.response)
    }
}

/// Compose the plan-specific prompt. Premium plans get the longer variant
/// with room for alternatives; standard stays terse.
fn build_prompt(plan: Plan, logs_text: &str) -> String {
    let platform_context = "You are analyzing build errors from Nexus Deploy, a self-hosted \
CI/CD platform. Users push code to GitHub, and the platform automatically clones and builds \
it in managed containers. Users CANNOT access containers, cannot run commands, cannot fix \
permissions, cannot install tools.\n\n\
WHAT USERS CAN DO (ONLY THIS):\n\
- Edit files in their GitHub repository: source code, `package.json`, `Dockerfile`, config files\n\
- Fix code errors: syntax, missing imports, wrong paths, logic errors\n\
- Fix config errors: missing dependencies, wrong build/start commands, Dockerfile mistakes\n\
- Fix repository structure: add missing files, correct file paths\n\n\
WHAT USERS CANNOT DO (NEVER SUGGEST THESE):\n\
- Run ANY terminal commands (npm install, chmod, ls, cd, export, etc.)\n\
- Access or modify the container or CI/CD environment\n\
- Fix permissions or system settings\n\
- Install tools or dependencies by hand (the platform does this automatically)\n\
- Run git commands (the code is already in GitHub)\n\n";

    let format_requirements = "Response format (STRICTLY follow - use markdown):\n\
## Error\n\
[One sentence: what code/config error caused the build to fail]\n\n\
## Fix\n\
1. [Fix in code: specific file and what to change]\n\
2. [Fix in config: specific config file and what to update]\n\
3. [Verify: what to check in code/config to confirm the fix]\n\n\
CRITICAL RULES:\n\
- Error: EXACTLY 1 sentence\n\
- Fix: EXACTLY 3 steps, each ONE sentence\n\
- Total: UNDER 60 words\n\
- Use inline code with backticks for file names\n\
- NO code blocks, NO URLs, NO links\n\
- NEVER suggest ANY commands\n\
- EVERY fix step MUST be about editing a file in the repo\n\n";

    let base = format!("{}{}", platform_context, format_requirements);

    match plan {
        Plan::Premium => format!(
            "{}For premium users: you may provide more detailed explanations and \
             alternative solutions if applicable.\n\nBuild logs:\n{}",
            base, logs_text
        ),
        Plan::Standard => format!("{}Build logs:\n{}", base, logs_text),
    }
}

/// Extract up to five numbered suggestions from the "Fix" section of the
/// analysis. Falls back to any numbered list in the full text.
fn parse_suggestions(analysis: &str) -> Vec<String> {
    let mut suggestions = Vec::new();
    let mut in_fix_section = false;

    for line in analysis.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let lower = line.to_lowercase();
        if lower.starts_with("## fix") || lower.starts_with("fix:") || lower.contains("**fix") {
            in_fix_section = true;
            continue;
        }
        if in_fix_section && (line.starts_with("##") || line.starts_with("**")) && !lower.contains("fix")
        {
            break;
        }

        if in_fix_section {
            if let Some(item) = numbered_item(line).or_else(|| bullet_item(line)) {
                let cleaned = clean_suggestion(item);
                if cleaned.len() > 5 {
                    suggestions.push(cleaned);
                }
            }
        }
    }

    if suggestions.is_empty() {
        for line in analysis.lines() {
            if let Some(item) = numbered_item(line.trim()) {
                let cleaned = clean_suggestion(item);
                if cleaned.len() > 5 {
                    suggestions.push(cleaned);
                }
                if suggestions.len() >= MAX_SUGGESTIONS {
                    break;
                }
            }
        }
    }

    suggestions.truncate(MAX_SUGGESTIONS);
    suggestions
}

fn numbered_item(line: &str) -> Option<&str> {
    let mut chars = line.chars();
    let first = chars.next()?;
    let second = chars.next()?;
    if first.is_ascii_digit() && (second == '.' || second == ')') {
        Some(line[2..].trim())
    } else {
        None
    }
}

fn bullet_item(line: &str) -> Option<&str> {
    line.strip_prefix("- ").or_else(|| line.strip_prefix("* "))
}

/// Strip markdown emphasis, inline code, and any trailing URLs
fn clean_suggestion(s: &str) -> String {
    let mut out = s.to_string();
    for url_marker in ["http://", "https://", "github.com/"] {
        if let Some(idx) = out.find(url_marker) {
            out.truncate(idx);
        }
    }
    out = out.replace("**", "").replace('*', "").replace('`', "").replace('_', " ");
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suggestions_from_fix_section() {
        let analysis = "## Error\nMissing build script.\n\n## Fix\n\
            1. Add a \"build\" script to `package.json`.\n\
            2. Check dependency versions in `package.json`.\n\
            3. Push the updated file to GitHub.\n";
        let suggestions = parse_suggestions(analysis);
        assert_eq!(suggestions.len(), 3);
        assert!(suggestions[0].contains("build"));
        assert!(!suggestions[0].contains('`'));
    }

    #[test]
    fn test_parse_suggestions_limit() {
        let analysis = "## Fix\n1. one suggestion here\n2. two suggestion here\n\
            3. three suggestion here\n4. four suggestion here\n5. five suggestion here\n\
            6. six suggestion here\n";
        let suggestions = parse_suggestions(analysis);
        assert_eq!(suggestions.len(), 5);
    }

    #[test]
    fn test_parse_suggestions_fallback_to_any_numbered_list() {
        let analysis = "Some analysis without a fix header.\n\
            1. Update the Dockerfile base image.\n\
            2. Correct the start command.\n";
        let suggestions = parse_suggestions(analysis);
        assert_eq!(suggestions.len(), 2);
    }

    #[test]
    fn test_parse_suggestions_strips_urls() {
        let analysis = "## Fix\n1. See the docs at https://example.com/help for details\n";
        let suggestions = parse_suggestions(analysis);
        assert_eq!(suggestions.len(), 1);
        assert!(!suggestions[0].contains("http"));
    }

    #[test]
    fn test_parse_suggestions_stops_at_next_section() {
        let analysis = "## Fix\n1. Fix the build script today\n## Notes\n1. unrelated item\n";
        let suggestions = parse_suggestions(analysis);
        assert_eq!(suggestions.len(), 1);
    }

    #[test]
    fn test_prompt_variants() {
        let standard = build_prompt(Plan::Standard, "log");
        let premium = build_prompt(Plan::Premium, "log");
        assert!(premium.contains("premium users"));
        assert!(!standard.contains("premium users"));
        assert!(standard.contains("NEVER suggest ANY commands"));
    }
}
