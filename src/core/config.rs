//! Pipeline configuration from YAML

use crate::core::{
    artifact::RetentionPolicy,
    buildspec::DEFAULT_BUILDSPEC,
    pipeline::{Action, ActionKind, ComputeSize, PipelineDefinition, RepositoryRef, Stage},
};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Default ceiling for invoked actions, in seconds
pub const DEFAULT_INVOKE_TIMEOUT_SECS: u64 = 60;

/// A configuration value: a literal, or a reference into the deployment settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Simple string value
    Literal(String),
    /// Read from the deployment settings, with an optional fallback
    FromEnv {
        from_env: String,
        #[serde(default)]
        default: Option<String>,
    },
}

impl ConfigValue {
    /// Resolve against deployment settings
    pub fn resolve(&self, settings: &DeploymentSettings) -> Result<String> {
        match self {
            ConfigValue::Literal(s) => Ok(s.clone()),
            ConfigValue::FromEnv { from_env, default } => settings
                .get(from_env)
                .map(|s| s.to_string())
                .or_else(|| default.clone())
                .with_context(|| format!("Deployment setting '{}' is not set", from_env)),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::Literal(s.to_string())
    }
}

/// Environment-provided values consumed at deployment-definition time
///
/// Passed explicitly so that nothing below the binary reads the process
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentSettings {
    values: HashMap<String, String>,
}

impl DeploymentSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the process environment
    pub fn from_process_env() -> Self {
        Self {
            values: std::env::vars().collect(),
        }
    }

    /// Parse a `.env` style file: `KEY=VALUE` lines, `#` comments, optional quotes
    pub fn from_env_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        Ok(Self::parse_env(&content))
    }

    pub fn parse_env(content: &str) -> Self {
        let mut values = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                    .unwrap_or(value);
                values.insert(key.trim().to_string(), value.to_string());
            }
        }
        Self { values }
    }

    /// Layer `other` on top of these settings
    pub fn merge(mut self, other: DeploymentSettings) -> Self {
        self.values.extend(other.values);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }
}

/// Policy for overlapping runs of one pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// A newer run supersedes the in-progress one
    #[default]
    Superseded,
    /// Runs wait for each other (not supported)
    Queued,
    /// Runs proceed independently (not supported)
    Parallel,
}

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Pipeline version (optional)
    #[serde(default)]
    pub version: Option<String>,

    /// Repository the source stage fetches from
    pub source: SourceConfig,

    /// Stages in execution order
    pub stages: Vec<StageConfig>,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    #[serde(default)]
    pub artifact_retention: RetentionPolicy,

    /// Maximum concurrently running actions within a stage (unset = unbounded)
    #[serde(default)]
    pub action_concurrency: Option<usize>,

    /// Default timeout for invoked actions (in seconds)
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,
}

/// Source repository coordinates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub owner: ConfigValue,
    pub repo: ConfigValue,
    pub branch: ConfigValue,
    /// Connection credential reference
    pub connection: ConfigValue,
}

/// Stage configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub actions: Vec<ActionConfig>,
}

/// Action configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    pub name: String,

    /// Artifact names consumed
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Artifact name produced
    #[serde(default)]
    pub output: Option<String>,

    #[serde(flatten)]
    pub kind: ActionKindConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKindConfig {
    Source {
        /// Overrides the pipeline-level connection
        #[serde(default)]
        connection: Option<ConfigValue>,
    },
    Build {
        #[serde(default = "default_buildspec")]
        buildspec: String,
        #[serde(default)]
        compute: ComputeSize,
        /// Named build-time variables
        #[serde(default)]
        environment: BTreeMap<String, ConfigValue>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Deploy {
        #[serde(default = "default_extract")]
        extract: bool,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        object_key: Option<String>,
    },
    Invoke {
        function: String,
        #[serde(default)]
        user_parameters: BTreeMap<String, String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

fn default_buildspec() -> String {
    DEFAULT_BUILDSPEC.to_string()
}

fn default_extract() -> bool {
    true
}

impl ActionKindConfig {
    fn is_source(&self) -> bool {
        matches!(self, ActionKindConfig::Source { .. })
    }
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        let name_pattern = Regex::new(r"^[A-Za-z0-9.@_-]{1,100}$")?;

        if !name_pattern.is_match(&self.name) {
            anyhow::bail!("Invalid pipeline name: '{}'", self.name);
        }

        if self.execution_mode != ExecutionMode::Superseded {
            anyhow::bail!(
                "Execution mode {:?} is not supported; only 'superseded' is",
                self.execution_mode
            );
        }

        if self.action_concurrency == Some(0) {
            anyhow::bail!("action_concurrency must be at least 1");
        }

        if self.default_timeout_secs == Some(0) {
            anyhow::bail!("default_timeout_secs must be at least 1");
        }

        if self.stages.len() < 2 {
            anyhow::bail!("A pipeline needs a source stage and at least one more stage");
        }

        // Check that stage names are unique
        let mut seen_stages = HashSet::new();
        for stage in &self.stages {
            if !name_pattern.is_match(&stage.name) {
                anyhow::bail!("Invalid stage name: '{}'", stage.name);
            }
            if !seen_stages.insert(&stage.name) {
                anyhow::bail!("Duplicate stage name: {}", stage.name);
            }
            if stage.actions.is_empty() {
                anyhow::bail!("Stage '{}' has no actions", stage.name);
            }

            let mut seen_actions = HashSet::new();
            for action in &stage.actions {
                if !name_pattern.is_match(&action.name) {
                    anyhow::bail!("Invalid action name: '{}'", action.name);
                }
                if !seen_actions.insert(&action.name) {
                    anyhow::bail!(
                        "Duplicate action name '{}' in stage '{}'",
                        action.name,
                        stage.name
                    );
                }
            }
        }

        // Source actions fill the first stage and appear nowhere else
        for (index, stage) in self.stages.iter().enumerate() {
            for action in &stage.actions {
                if index == 0 && !action.kind.is_source() {
                    anyhow::bail!(
                        "Stage '{}' is the first stage and may only contain source actions, found '{}'",
                        stage.name,
                        action.name
                    );
                }
                if index > 0 && action.kind.is_source() {
                    anyhow::bail!(
                        "Source action '{}' must be in the first stage",
                        action.name
                    );
                }
                self.validate_action_shape(&stage.name, action)?;
            }
        }

        self.validate_bindings()?;

        Ok(())
    }

    fn validate_action_shape(&self, stage: &str, action: &ActionConfig) -> Result<()> {
        let at = format!("{}/{}", stage, action.name);
        match &action.kind {
            ActionKindConfig::Source { .. } => {
                if !action.inputs.is_empty() {
                    anyhow::bail!("Source action '{}' cannot have inputs", at);
                }
                if action.output.is_none() {
                    anyhow::bail!("Source action '{}' must declare an output", at);
                }
            }
            ActionKindConfig::Build { timeout_secs, .. } => {
                if action.inputs.len() != 1 {
                    anyhow::bail!("Build action '{}' must have exactly one input", at);
                }
                if action.output.is_none() {
                    anyhow::bail!("Build action '{}' must declare an output", at);
                }
                if *timeout_secs == Some(0) {
                    anyhow::bail!("Build action '{}' has a zero timeout", at);
                }
            }
            ActionKindConfig::Deploy {
                extract,
                object_key,
                ..
            } => {
                if action.inputs.len() != 1 {
                    anyhow::bail!("Deploy action '{}' must have exactly one input", at);
                }
                if action.output.is_some() {
                    anyhow::bail!("Deploy action '{}' cannot declare an output", at);
                }
                if !*extract && object_key.is_none() {
                    anyhow::bail!(
                        "Deploy action '{}' needs an object_key when extract is false",
                        at
                    );
                }
            }
            ActionKindConfig::Invoke {
                function,
                timeout_secs,
                ..
            } => {
                if function.trim().is_empty() {
                    anyhow::bail!("Invoke action '{}' must name a function", at);
                }
                if *timeout_secs == Some(0) {
                    anyhow::bail!("Invoke action '{}' has a zero timeout", at);
                }
            }
        }
        Ok(())
    }

    /// Every artifact has one producer, and every input is produced upstream
    fn validate_bindings(&self) -> Result<()> {
        let mut producers: HashMap<&str, (usize, &str)> = HashMap::new();
        for (index, stage) in self.stages.iter().enumerate() {
            for action in &stage.actions {
                if let Some(output) = &action.output {
                    if let Some((_, other)) =
                        producers.insert(output.as_str(), (index, action.name.as_str()))
                    {
                        anyhow::bail!(
                            "Artifact '{}' is produced by both '{}' and '{}'",
                            output,
                            other,
                            action.name
                        );
                    }
                }
            }
        }

        for (index, stage) in self.stages.iter().enumerate() {
            for action in &stage.actions {
                for input in &action.inputs {
                    match producers.get(input.as_str()) {
                        None => anyhow::bail!(
                            "Action '{}' consumes artifact '{}' which no action produces",
                            action.name,
                            input
                        ),
                        Some((producer_stage, _)) if *producer_stage > index => anyhow::bail!(
                            "Action '{}' consumes artifact '{}' produced by a later stage",
                            action.name,
                            input
                        ),
                        Some((_, producer)) if *producer == action.name => anyhow::bail!(
                            "Action '{}' consumes its own output '{}'",
                            action.name,
                            input
                        ),
                        _ => {}
                    }
                }
            }
            self.check_cycles(stage)?;
        }

        Ok(())
    }

    /// Check for cycles between actions of one stage
    fn check_cycles(&self, stage: &StageConfig) -> Result<()> {
        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for action in &stage.actions {
            if !visited.contains(&action.name) {
                Self::dfs_check(stage, &action.name, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check(
        stage: &StageConfig,
        action_name: &str,
        visited: &mut HashSet<String>,
        recursion_stack: &mut HashSet<String>,
    ) -> Result<()> {
        visited.insert(action_name.to_string());
        recursion_stack.insert(action_name.to_string());

        if let Some(action) = stage.actions.iter().find(|a| a.name == action_name) {
            for input in &action.inputs {
                let producer = stage
                    .actions
                    .iter()
                    .find(|a| a.output.as_deref() == Some(input.as_str()));
                if let Some(producer) = producer {
                    if recursion_stack.contains(&producer.name) {
                        anyhow::bail!(
                            "Cycle detected in stage '{}' involving action '{}'",
                            stage.name,
                            producer.name
                        );
                    }
                    if !visited.contains(&producer.name) {
                        Self::dfs_check(stage, &producer.name, visited, recursion_stack)?;
                    }
                }
            }
        }

        recursion_stack.remove(action_name);
        Ok(())
    }

    /// Resolve the repository coordinates against deployment settings
    pub fn repository(&self, settings: &DeploymentSettings) -> Result<RepositoryRef> {
        Ok(RepositoryRef {
            owner: self.source.owner.resolve(settings)?,
            name: self.source.repo.resolve(settings)?,
            branch: self.source.branch.resolve(settings)?,
        })
    }

    /// Convert config to a pipeline definition, resolving every setting
    pub fn to_definition(&self, settings: &DeploymentSettings) -> Result<PipelineDefinition> {
        let repository = self.repository(settings)?;
        let connection = self.source.connection.resolve(settings)?;

        let mut stages = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let mut actions = Vec::with_capacity(stage.actions.len());
            for action in &stage.actions {
                let kind = match &action.kind {
                    ActionKindConfig::Source { connection: own } => ActionKind::SourceFetch {
                        repository: repository.clone(),
                        connection: match own {
                            Some(value) => value.resolve(settings)?,
                            None => connection.clone(),
                        },
                    },
                    ActionKindConfig::Build {
                        buildspec,
                        compute,
                        environment,
                        timeout_secs,
                    } => {
                        let mut resolved = BTreeMap::new();
                        for (key, value) in environment {
                            let value = value.resolve(settings).with_context(|| {
                                format!("Build variable '{}' of action '{}'", key, action.name)
                            })?;
                            resolved.insert(key.clone(), value);
                        }
                        ActionKind::Build {
                            buildspec: buildspec.clone(),
                            compute: *compute,
                            environment: resolved,
                            timeout_secs: *timeout_secs,
                        }
                    }
                    ActionKindConfig::Deploy {
                        extract,
                        prefix,
                        object_key,
                    } => ActionKind::Deploy {
                        extract: *extract,
                        prefix: prefix.clone(),
                        object_key: object_key.clone(),
                    },
                    ActionKindConfig::Invoke {
                        function,
                        user_parameters,
                        timeout_secs,
                    } => ActionKind::Invoke {
                        function: function.clone(),
                        user_parameters: user_parameters.clone(),
                        timeout_secs: *timeout_secs,
                    },
                };

                actions.push(Action {
                    name: action.name.clone(),
                    kind,
                    inputs: action.inputs.clone(),
                    output: action.output.clone(),
                });
            }
            stages.push(Stage::new(stage.name.clone(), actions));
        }

        Ok(PipelineDefinition::new(self.name.clone(), stages))
    }
}
