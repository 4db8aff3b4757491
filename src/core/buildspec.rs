//! Declarative build specification read from the source artifact
//!
//! ```yaml
//! version: 0.2
//! env:
//!   variables:
//!     NODE_ENV: production
//! phases:
//!   install:
//!     commands: ["npm ci"]
//!   build:
//!     commands: ["npm run build"]
//! artifacts:
//!   base-directory: dist
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default location of the build specification inside the source artifact
pub const DEFAULT_BUILDSPEC: &str = "buildspec.yml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    #[serde(default)]
    pub version: Option<serde_yaml::Value>,

    #[serde(default)]
    pub env: BuildSpecEnv,

    #[serde(default)]
    pub phases: BuildPhases,

    #[serde(default)]
    pub artifacts: BuildArtifacts,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildSpecEnv {
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildPhases {
    #[serde(default)]
    pub install: Option<Phase>,
    #[serde(default)]
    pub pre_build: Option<Phase>,
    #[serde(default)]
    pub build: Option<Phase>,
    #[serde(default)]
    pub post_build: Option<Phase>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildArtifacts {
    /// Directory (relative to the source root) packaged as the build output
    #[serde(rename = "base-directory", default = "default_base_directory")]
    pub base_directory: String,
}

impl Default for BuildArtifacts {
    fn default() -> Self {
        Self {
            base_directory: default_base_directory(),
        }
    }
}

fn default_base_directory() -> String {
    ".".to_string()
}

impl BuildSpec {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Phases in execution order, skipping undeclared ones
    pub fn phases(&self) -> Vec<(&'static str, &Phase)> {
        [
            ("install", &self.phases.install),
            ("pre_build", &self.phases.pre_build),
            ("build", &self.phases.build),
            ("post_build", &self.phases.post_build),
        ]
        .into_iter()
        .filter_map(|(name, phase)| phase.as_ref().map(|p| (name, p)))
        .collect()
    }

    pub fn command_count(&self) -> usize {
        self.phases().iter().map(|(_, p)| p.commands.len()).sum()
    }
}
