use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure for soda-hub
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SodaHubConfig {
    /// Coordination hub settings
    pub hub: HubConfig,
    /// Lifecycle orchestrator settings
    pub orchestrator: OrchestratorConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

/// What happens to a connection's work-item claims when it goes away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectPolicy {
    /// Claims stay until released or until their timeout fires
    #[default]
    PersistUntilTimeout,
    /// Claims placed by the connection are released immediately
    ReleaseOnDisconnect,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the TCP server listens on
    pub bind_address: String,
    /// Project used for items and callers that do not name one
    pub default_project: String,
    pub disconnect_policy: DisconnectPolicy,
    pub transitions: TransitionConfig,
    pub vocabulary: VocabularyConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7878".to_string(),
            default_project: "default".to_string(),
            disconnect_policy: DisconnectPolicy::default(),
            transitions: TransitionConfig::default(),
            vocabulary: VocabularyConfig::default(),
        }
    }
}

/// Optional allow-list for `publish_transition`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TransitionConfig {
    /// Reject transitions not covered by `allowed`
    pub strict: bool,
    pub allowed: Vec<TransitionRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransitionRule {
    /// Source status, or `*`
    pub from: String,
    /// Target status, or `*`
    pub to: String,
}

impl TransitionRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Status labels the hub writes and the patterns it reads them with.
///
/// Patterns are matched against the normalised label: lowercase, with `-`
/// and `_` replaced by single spaces.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VocabularyConfig {
    pub available: String,
    pub claimed: String,
    pub in_review: String,
    pub done: String,
    pub approved: String,
    pub needs_changes: String,
    pub rejected: String,
    pub reviewed: String,
    pub ready_for_review_pattern: String,
    pub needs_changes_pattern: String,
    pub approved_pattern: String,
    pub in_review_pattern: String,
    pub completed_pattern: String,
    pub reviewer_role_pattern: String,
    pub developer_role_pattern: String,
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            available: "available".to_string(),
            claimed: "in-progress".to_string(),
            in_review: "in-review".to_string(),
            done: "done".to_string(),
            approved: "approved".to_string(),
            needs_changes: "needs-changes".to_string(),
            rejected: "rejected".to_string(),
            reviewed: "reviewed".to_string(),
            ready_for_review_pattern: r"^(ready for review|review requested|awaiting review|review)$"
                .to_string(),
            needs_changes_pattern: r"^(needs changes|changes requested|needs work|rework)$"
                .to_string(),
            approved_pattern: r"^(approved|accepted|lgtm)$".to_string(),
            in_review_pattern: r"^(in review|under review|reviewing|review in progress)$"
                .to_string(),
            completed_pattern: r"^(done|completed|complete|closed|merged)$".to_string(),
            reviewer_role_pattern: r"(review|qa|tester|auditor)".to_string(),
            developer_role_pattern: r"(dev|engineer|implement|coder)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum number of runs active at once
    pub max_concurrent: usize,
    /// Validation failures allowed before a run fails
    pub max_retries: u32,
    /// Default run deadline
    pub deadline_seconds: u64,
    /// A run with no activity for this long gets pinged
    pub staleness_seconds: u64,
    pub sweep_interval_seconds: u64,
    /// Time between graceful and forced termination
    pub termination_grace_seconds: u64,
    /// Parent directory for per-run workspaces
    pub workspace_root: PathBuf,
    /// Program and arguments used to start an agent; the task is appended
    pub agent_command: Vec<String>,
    /// Shell commands run in the workspace to validate a run, in order
    pub validation_commands: Vec<String>,
    /// JSON file the backlog sink writes to
    pub backlog_file: PathBuf,
    /// Identity the orchestrator claims on the hub
    pub identity: String,
    pub project: String,
    /// Status written when a run completes
    pub completion_label: String,
    /// Remote hub to connect to; an in-process hub is started when unset
    pub hub_address: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_retries: 3,
            deadline_seconds: 1800, // 30 minutes
            staleness_seconds: 300,
            sweep_interval_seconds: 60,
            termination_grace_seconds: 10,
            workspace_root: PathBuf::from(".soda-hub/workspaces"),
            agent_command: vec!["claude".to_string(), "-p".to_string()],
            validation_commands: vec!["cargo build".to_string(), "cargo test".to_string()],
            backlog_file: PathBuf::from(".soda-hub/backlog.json"),
            identity: "orchestrator".to_string(),
            project: "default".to_string(),
            completion_label: "done".to_string(),
            hub_address: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON log lines instead of plain text
    pub json_logs: bool,
    /// Enable hub activity counters
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
            metrics_enabled: true,
        }
    }
}

impl SodaHubConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (soda-hub.toml, .soda-hub-rc)
    /// 3. Environment variables (prefixed with SODA_HUB__)
    ///
    /// Configuration files are looked up in `dir`.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder();

        let toml_file = dir.join("soda-hub.toml");
        if toml_file.exists() {
            builder = builder.add_source(File::from(toml_file));
        }

        let rc_file = dir.join(".soda-hub-rc");
        if rc_file.exists() {
            builder = builder.add_source(File::from(rc_file).format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("SODA_HUB")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let soda_hub_config: SodaHubConfig = config.try_deserialize()?;
        Ok(soda_hub_config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
