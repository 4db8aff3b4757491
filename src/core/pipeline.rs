//! Pipeline definition domain model

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

/// Coordinates of the source repository a pipeline tracks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
    pub branch: String,
}

impl std::fmt::Display for RepositoryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.name, self.branch)
    }
}

/// Compute size of the isolated build environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeSize {
    #[default]
    Small,
    Medium,
    Large,
}

/// Resource ceiling a build must stay within
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeEnvelope {
    pub timeout: Duration,
    pub max_output_bytes: u64,
}

impl ComputeSize {
    pub fn envelope(&self) -> ComputeEnvelope {
        const MIB: u64 = 1024 * 1024;
        match self {
            ComputeSize::Small => ComputeEnvelope {
                timeout: Duration::from_secs(15 * 60),
                max_output_bytes: 512 * MIB,
            },
            ComputeSize::Medium => ComputeEnvelope {
                timeout: Duration::from_secs(30 * 60),
                max_output_bytes: 2048 * MIB,
            },
            ComputeSize::Large => ComputeEnvelope {
                timeout: Duration::from_secs(60 * 60),
                max_output_bytes: 8192 * MIB,
            },
        }
    }
}

/// What an action does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    /// Fetch the trigger revision from the source collaborator
    SourceFetch {
        repository: RepositoryRef,
        connection: String,
    },
    /// Run the build specification found in the source artifact
    Build {
        buildspec: String,
        compute: ComputeSize,
        /// Named build-time variables, resolved at definition time
        environment: BTreeMap<String, String>,
        /// Overrides the compute envelope's time ceiling
        timeout_secs: Option<u64>,
    },
    /// Write the input artifact to the publish target
    Deploy {
        extract: bool,
        /// Key prefix for extracted files
        prefix: Option<String>,
        /// Object key for the whole bundle when not extracting
        object_key: Option<String>,
    },
    /// Invoke an external function and wait for its job result
    Invoke {
        function: String,
        user_parameters: BTreeMap<String, String>,
        /// Falls back to the orchestrator's default when unset
        timeout_secs: Option<u64>,
    },
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::SourceFetch { .. } => "source",
            ActionKind::Build { .. } => "build",
            ActionKind::Deploy { .. } => "deploy",
            ActionKind::Invoke { .. } => "invoke",
        }
    }
}

/// A single unit of work within a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub name: String,
    pub kind: ActionKind,
    /// Artifact names this action consumes
    pub inputs: Vec<String>,
    /// Artifact name this action produces, if any
    pub output: Option<String>,
}

/// An ordered phase of the pipeline, gated by a join barrier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub actions: Vec<Action>,
}

impl Stage {
    pub fn new(name: impl Into<String>, actions: Vec<Action>) -> Self {
        Self {
            name: name.into(),
            actions,
        }
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name == name)
    }

    /// Artifact names produced by this stage's actions
    pub fn outputs(&self) -> Vec<&str> {
        self.actions
            .iter()
            .filter_map(|a| a.output.as_deref())
            .collect()
    }

    /// Inputs that must come from earlier stages
    pub fn external_inputs(&self) -> Vec<&str> {
        let produced: HashSet<&str> = self.outputs().into_iter().collect();
        let mut inputs: Vec<&str> = self
            .actions
            .iter()
            .flat_map(|a| a.inputs.iter().map(|s| s.as_str()))
            .filter(|input| !produced.contains(input))
            .collect();
        inputs.sort_unstable();
        inputs.dedup();
        inputs
    }

    /// Group action indices into waves
    ///
    /// An action lands one wave after the latest same-stage producer of any of
    /// its inputs. Actions in one wave have no artifact dependency on each
    /// other. Cyclic dependencies are broken arbitrarily; the affected actions
    /// fail their input binding at run time.
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let producers: HashMap<&str, usize> = self
            .actions
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.output.as_deref().map(|o| (o, i)))
            .collect();

        let mut depths: HashMap<usize, usize> = HashMap::new();
        let mut temp_visited = HashSet::new();
        for index in 0..self.actions.len() {
            self.visit(index, &producers, &mut depths, &mut temp_visited);
        }

        let max_depth = depths.values().copied().max().unwrap_or(0);
        let mut waves = vec![Vec::new(); if self.actions.is_empty() { 0 } else { max_depth + 1 }];
        for index in 0..self.actions.len() {
            let depth = depths.get(&index).copied().unwrap_or(0);
            waves[depth].push(index);
        }
        waves.retain(|w| !w.is_empty());
        waves
    }

    fn visit(
        &self,
        index: usize,
        producers: &HashMap<&str, usize>,
        depths: &mut HashMap<usize, usize>,
        temp_visited: &mut HashSet<usize>,
    ) -> usize {
        if let Some(depth) = depths.get(&index) {
            return *depth;
        }
        if !temp_visited.insert(index) {
            // Cycle
            return 0;
        }

        let mut depth = 0;
        for input in &self.actions[index].inputs {
            if let Some(&producer) = producers.get(input.as_str()) {
                if producer != index {
                    depth = depth.max(self.visit(producer, producers, depths, temp_visited) + 1);
                }
            }
        }

        temp_visited.remove(&index);
        depths.insert(index, depth);
        depth
    }
}

/// A pipeline definition: stages executed strictly in declared order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<Stage>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The repository tracked by the source action, if any
    pub fn repository(&self) -> Option<(&RepositoryRef, &str)> {
        self.stages
            .iter()
            .flat_map(|s| s.actions.iter())
            .find_map(|a| match &a.kind {
                ActionKind::SourceFetch {
                    repository,
                    connection,
                } => Some((repository, connection.as_str())),
                _ => None,
            })
    }
}
