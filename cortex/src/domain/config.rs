// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Cortex Configuration Types
//
// Defines the configuration schema for a cortex deployment:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Storage, embedding and semantic index settings
// - Learning, dream consolidation, promotion and transfer tuning
// - Infrastructure failure signatures and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::qe_domain::QeDomain;
use super::transfer::{default_transfer_matrix, DomainTransferEdge, DEFAULT_TRANSFER_WEIGHT};

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "CortexConfig";

/// Top-level Kubernetes-style cortex configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CortexConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "CortexConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: CortexConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Cortex settings (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CortexConfigSpec {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub learning: LearningConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub dream: DreamConfig,

    #[serde(default)]
    pub promotion: PromotionConfig,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub infra: InfraConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file; created on first start
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Attempts made when the database reports busy/locked
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,

    /// Initial backoff between busy retries, doubled each attempt
    #[serde(default = "default_busy_backoff", with = "humantime_serde")]
    pub busy_backoff: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Fixed embedding length; every stored and queried vector must match
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Max out-degree per node on upper layers (layer 0 allows 2M)
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// How long a search waits for the index lock before `IndexUnavailable`
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    pub search_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Candidates fetched per requested result, to survive downstream filtering
    pub overfetch_factor: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub alpha: f64,
    pub gamma: f64,
    /// Confidence gained per successful usage
    pub success_delta: f64,
    /// Confidence lost per failed usage, per unit of penalty ratio
    pub failure_delta: f64,
    pub default_penalty_ratio: f64,
    pub safety_critical_penalty_ratio: f64,
    pub safety_critical_domains: Vec<QeDomain>,
    pub quarantine_threshold: f64,
    pub rehabilitation_successes: u32,
    pub initial_confidence: f64,
    /// Same-domain similarity above which `store_pattern` returns the existing id
    pub dedup_similarity: f64,
}

impl LearningConfig {
    pub fn penalty_ratio(&self, domain: QeDomain) -> f64 {
        if self.safety_critical_domains.contains(&domain) {
            self.safety_critical_penalty_ratio
        } else {
            self.default_penalty_ratio
        }
    }

    /// Confidence lost by one failed usage in `domain`
    pub fn failure_penalty(&self, domain: QeDomain) -> f64 {
        self.failure_delta * self.penalty_ratio(domain)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Open trajectories older than this are sealed as `infra_error`
    #[serde(with = "humantime_serde")]
    pub orphan_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DreamConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Unconsolidated experiences that trigger a cycle
    pub buffer_threshold: usize,
    #[serde(with = "humantime_serde")]
    pub time_box: Duration,
    #[serde(with = "humantime_serde")]
    pub quality_gate_time_box: Duration,
    /// Wait before resuming a cycle that yielded
    #[serde(with = "humantime_serde")]
    pub resume_delay: Duration,
    /// Patterns below this confidence stay out of the concept graph
    pub min_node_confidence: f64,
    pub merge_similarity: f64,
    pub iterations: usize,
    pub decay: f64,
    pub spread_factor: f64,
    /// Minimum activation of both endpoints for a pair to count as co-activated
    pub co_activation_threshold: f64,
    /// Edge weight at or above which a co-activated pair is a correlation
    pub correlation_edge_weight: f64,
    pub anomaly_z_score: f64,
    pub anti_pattern_failure_ratio: f64,
    pub anti_pattern_min_observations: u32,
    pub auto_apply_confidence: f64,
    /// Experiences replayed per cycle
    pub replay_sample_size: usize,
    /// Activation added to a node each time a replayed experience touches it
    pub replay_activation: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    pub min_usage: u64,
    pub min_success_rate: f64,
    pub min_confidence: f64,
    pub contradiction_similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub default_weight: f64,
    /// Compatibility matrix; the built-in matrix is used when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edges: Option<Vec<DomainTransferEdge>>,
}

impl TransferConfig {
    pub fn edges(&self) -> Vec<DomainTransferEdge> {
        self.edges
            .clone()
            .unwrap_or_else(|| default_transfer_matrix(self.default_weight))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraConfig {
    /// Regexes matched against failure reasons; a match turns the
    /// failure into `infra_error`
    pub failure_signatures: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("./cortex.db")
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_retries() -> u32 {
    5
}

fn default_busy_backoff() -> Duration {
    Duration::from_millis(20)
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_connections: default_max_connections(),
            busy_retries: default_busy_retries(),
            busy_backoff: default_busy_backoff(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: default_embedding_dimension(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            read_timeout: Duration::from_millis(50),
            search_retries: 3,
            retry_backoff: Duration::from_millis(10),
            overfetch_factor: 4,
        }
    }
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            gamma: 0.95,
            success_delta: 0.1,
            failure_delta: 0.1,
            default_penalty_ratio: 10.0,
            safety_critical_penalty_ratio: 20.0,
            safety_critical_domains: vec![QeDomain::SecurityCompliance, QeDomain::ChaosResilience],
            quarantine_threshold: 0.3,
            rehabilitation_successes: 10,
            initial_confidence: 0.5,
            dedup_similarity: 0.95,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            orphan_timeout: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            buffer_threshold: 20,
            time_box: Duration::from_secs(10),
            quality_gate_time_box: Duration::from_secs(5),
            resume_delay: Duration::from_secs(30),
            min_node_confidence: 0.3,
            merge_similarity: 0.95,
            iterations: 20,
            decay: 0.1,
            spread_factor: 0.5,
            co_activation_threshold: 0.5,
            correlation_edge_weight: 0.5,
            anomaly_z_score: 2.0,
            anti_pattern_failure_ratio: 0.7,
            anti_pattern_min_observations: 3,
            auto_apply_confidence: 0.8,
            replay_sample_size: 200,
            replay_activation: 0.2,
        }
    }
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            min_usage: 3,
            min_success_rate: 0.7,
            min_confidence: 0.6,
            contradiction_similarity: 0.9,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            default_weight: DEFAULT_TRANSFER_WEIGHT,
            edges: None,
        }
    }
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            failure_signatures: vec![
                r"(?i)connection (refused|reset)".to_string(),
                r"(?i)timed? ?out".to_string(),
                r"(?i)no space left on device".to_string(),
                r"(?i)out of memory|oomkilled".to_string(),
                r"(?i)docker daemon".to_string(),
                r"(?i)network is unreachable".to_string(),
                r"(?i)rate limit".to_string(),
            ],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for CortexConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "aegis-cortex".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: CortexConfigSpec::default(),
        }
    }
}

impl CortexConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. CORTEX_CONFIG_PATH environment variable
    /// 2. ./cortex-config.yaml (working directory)
    /// 3. ~/.aegis/cortex.yaml (user home)
    /// 4. /etc/aegis/cortex.yaml (system, Unix) or C:\ProgramData\Aegis\cortex.yaml (Windows)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("CORTEX_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./cortex-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".aegis").join("cortex.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        let system_config = PathBuf::from("/etc/aegis/cortex.yaml");
        #[cfg(windows)]
        let system_config = PathBuf::from("C:\\ProgramData\\Aegis\\cortex.yaml");

        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CORTEX_DB_PATH") {
            tracing::info!("Environment override: CORTEX_DB_PATH={}", val);
            self.spec.storage.database_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("CORTEX_LOG_LEVEL") {
            tracing::info!("Environment override: CORTEX_LOG_LEVEL={}", val);
            self.spec.observability.logging.level = val;
        }

        if let Ok(val) = std::env::var("CORTEX_EMBEDDING_DIM") {
            match val.parse::<usize>() {
                Ok(dimension) => {
                    tracing::info!("Environment override: CORTEX_EMBEDDING_DIM={}", dimension);
                    self.spec.embedding.dimension = dimension;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for CORTEX_EMBEDDING_DIM: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;

        if spec.embedding.dimension == 0 {
            anyhow::bail!("spec.embedding.dimension must be greater than zero");
        }

        if spec.storage.max_connections == 0 {
            anyhow::bail!("spec.storage.max_connections must be greater than zero");
        }

        if spec.index.m < 2 {
            anyhow::bail!("spec.index.m must be at least 2, got {}", spec.index.m);
        }
        if spec.index.ef_search == 0 || spec.index.ef_construction == 0 {
            anyhow::bail!("spec.index.ef_search and ef_construction must be greater than zero");
        }
        if spec.index.overfetch_factor == 0 {
            anyhow::bail!("spec.index.overfetch_factor must be greater than zero");
        }

        let learning = &spec.learning;
        check_unit("spec.learning.alpha", learning.alpha)?;
        check_unit("spec.learning.gamma", learning.gamma)?;
        check_unit("spec.learning.success_delta", learning.success_delta)?;
        check_unit("spec.learning.failure_delta", learning.failure_delta)?;
        check_unit("spec.learning.quarantine_threshold", learning.quarantine_threshold)?;
        check_unit("spec.learning.initial_confidence", learning.initial_confidence)?;
        check_unit("spec.learning.dedup_similarity", learning.dedup_similarity)?;
        if learning.default_penalty_ratio <= 0.0 || learning.safety_critical_penalty_ratio <= 0.0 {
            anyhow::bail!("spec.learning penalty ratios must be positive");
        }
        if learning.rehabilitation_successes == 0 {
            anyhow::bail!("spec.learning.rehabilitation_successes must be greater than zero");
        }

        let dream = &spec.dream;
        check_unit("spec.dream.min_node_confidence", dream.min_node_confidence)?;
        check_unit("spec.dream.merge_similarity", dream.merge_similarity)?;
        check_unit("spec.dream.decay", dream.decay)?;
        check_unit("spec.dream.spread_factor", dream.spread_factor)?;
        check_unit("spec.dream.co_activation_threshold", dream.co_activation_threshold)?;
        check_unit("spec.dream.correlation_edge_weight", dream.correlation_edge_weight)?;
        check_unit("spec.dream.anti_pattern_failure_ratio", dream.anti_pattern_failure_ratio)?;
        check_unit("spec.dream.auto_apply_confidence", dream.auto_apply_confidence)?;
        if dream.buffer_threshold == 0 {
            anyhow::bail!("spec.dream.buffer_threshold must be greater than zero");
        }
        if dream.time_box.is_zero() || dream.quality_gate_time_box.is_zero() {
            anyhow::bail!("spec.dream time boxes must be non-zero");
        }

        let promotion = &spec.promotion;
        check_unit("spec.promotion.min_success_rate", promotion.min_success_rate)?;
        check_unit("spec.promotion.min_confidence", promotion.min_confidence)?;
        check_unit("spec.promotion.contradiction_similarity", promotion.contradiction_similarity)?;

        if spec.transfer.default_weight <= 0.0 || spec.transfer.default_weight > 1.0 {
            anyhow::bail!(
                "spec.transfer.default_weight must be in (0, 1], got {}",
                spec.transfer.default_weight
            );
        }
        for edge in spec.transfer.edges() {
            if edge.source == edge.target {
                anyhow::bail!("Transfer edge cannot point a domain at itself: {}", edge.source);
            }
            if edge.weight <= 0.0 || edge.weight > 1.0 {
                anyhow::bail!(
                    "Transfer weight {} -> {} must be in (0, 1], got {}",
                    edge.source,
                    edge.target,
                    edge.weight
                );
            }
        }

        for signature in &spec.infra.failure_signatures {
            if let Err(e) = regex::Regex::new(signature) {
                anyhow::bail!("Invalid infrastructure failure signature '{}': {}", signature, e);
            }
        }

        match spec.observability.logging.format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("Invalid log format: '{}'. Must be 'text' or 'json'", other),
        }

        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&value) {
        anyhow::bail!("{} must be in [0, 1], got {}", name, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = CortexConfigManifest::default();
        assert_eq!(manifest.api_version, "100monkeys.ai/v1");
        assert_eq!(manifest.kind, "CortexConfig");
        assert_eq!(manifest.spec.embedding.dimension, 384);
        assert_eq!(manifest.spec.index.m, 16);
        assert_eq!(manifest.spec.index.ef_search, 64);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
apiVersion: 100monkeys.ai/v1
kind: CortexConfig
metadata:
  name: qe-fleet
spec:
  storage:
    database_path: /var/lib/aegis/cortex.db
  dream:
    interval: 30m
    buffer_threshold: 50
  learning:
    safety_critical_domains: [security-compliance]
"#;
        let manifest = CortexConfigManifest::from_yaml_str(yaml).unwrap();

        assert_eq!(manifest.spec.storage.database_path, PathBuf::from("/var/lib/aegis/cortex.db"));
        assert_eq!(manifest.spec.storage.busy_retries, 5);
        assert_eq!(manifest.spec.dream.interval, Duration::from_secs(30 * 60));
        assert_eq!(manifest.spec.dream.buffer_threshold, 50);
        assert_eq!(manifest.spec.dream.time_box, Duration::from_secs(10));
        assert_eq!(manifest.spec.learning.alpha, 0.1);
        assert_eq!(manifest.spec.learning.penalty_ratio(QeDomain::ChaosResilience), 10.0);
        assert_eq!(manifest.spec.learning.penalty_ratio(QeDomain::SecurityCompliance), 20.0);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let manifest = CortexConfigManifest::default();
        let yaml = serde_yaml::to_string(&manifest).unwrap();
        let parsed = CortexConfigManifest::from_yaml_str(&yaml).unwrap();

        assert_eq!(parsed.metadata.name, "aegis-cortex");
        assert_eq!(parsed.spec.capture.orphan_timeout, Duration::from_secs(3600));
        assert_eq!(parsed.spec.infra.failure_signatures.len(), manifest.spec.infra.failure_signatures.len());
    }

    #[test]
    fn test_failure_penalty_scales_with_ratio() {
        let learning = LearningConfig::default();
        assert!((learning.failure_penalty(QeDomain::TestGeneration) - 1.0).abs() < 1e-12);
        assert!((learning.failure_penalty(QeDomain::SecurityCompliance) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_transfer_edges_fall_back_to_matrix() {
        let transfer = TransferConfig::default();
        assert!(!transfer.edges().is_empty());

        let custom = TransferConfig {
            default_weight: 0.8,
            edges: Some(vec![DomainTransferEdge::new(
                QeDomain::TestGeneration,
                QeDomain::CoverageAnalysis,
                0.5,
            )]),
        };
        assert_eq!(custom.edges().len(), 1);
    }

    #[test]
    fn test_validation() {
        let mut manifest = CortexConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.embedding.dimension = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.embedding.dimension = 384;

        manifest.spec.learning.quarantine_threshold = 1.5;
        assert!(manifest.validate().is_err());
        manifest.spec.learning.quarantine_threshold = 0.3;

        manifest.spec.transfer.edges = Some(vec![DomainTransferEdge::new(
            QeDomain::TestGeneration,
            QeDomain::TestExecution,
            1.2,
        )]);
        assert!(manifest.validate().is_err());
        manifest.spec.transfer.edges = None;

        manifest.spec.infra.failure_signatures.push("(unclosed".to_string());
        assert!(manifest.validate().is_err());
    }
}
