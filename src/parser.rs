//! Workflow file loading and static validation.
//!
//! Parsing is a seam: the engine only ever sees [`Workflow`] values, so the
//! file format lives entirely behind [`WorkflowParser`]. The bundled
//! [`YamlParser`] deserializes `.laq.yaml` files and rejects definitions the
//! runner could not execute (unknown agent references, dependency cycles,
//! defaults that violate their own constraints).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::LacquerError;
use crate::types::workflow::Workflow;
use crate::validation::check_constraints;

/// Turns a file path into a workflow definition.
pub trait WorkflowParser: Send + Sync {
    fn parse_file(&self, path: &Path) -> Result<Workflow, LacquerError>;
}

/// Derive a workflow id from its file name.
///
/// The last path segment with the trailing `.laq.yaml` / `.laq.yml`
/// (or plain `.yaml` / `.yml`) extension stripped.
pub fn workflow_id_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    for suffix in [".laq.yaml", ".laq.yml", ".yaml", ".yml"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    name
}

/// Default serde_yaml-backed parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlParser;

impl YamlParser {
    pub fn new() -> Self {
        Self
    }
}

impl WorkflowParser for YamlParser {
    fn parse_file(&self, path: &Path) -> Result<Workflow, LacquerError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            LacquerError::Io(format!("reading {}: {err}", path.display()))
        })?;
        let mut workflow: Workflow = serde_yaml::from_str(&raw).map_err(|err| {
            LacquerError::Yaml(format!("{}: {err}", path.display()))
        })?;
        workflow.id = workflow_id_from_path(path);
        validate_workflow(&workflow)?;
        Ok(workflow)
    }
}

/// Static checks on a freshly parsed workflow.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), LacquerError> {
    if workflow.version.trim().is_empty() {
        return Err(LacquerError::Yaml(format!(
            "workflow '{}' has an empty version",
            workflow.id
        )));
    }
    if workflow.steps.is_empty() {
        return Err(LacquerError::Yaml(format!(
            "workflow '{}' declares no steps",
            workflow.id
        )));
    }

    let mut seen = HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(step.id.as_str()) {
            return Err(LacquerError::Yaml(format!(
                "duplicate step id '{}' in workflow '{}'",
                step.id, workflow.id
            )));
        }
        // Agent and prompt are optional; a step missing them is only an
        // error if a run actually reaches it, which the runner reports.
        if let Some(agent) = step.agent.as_deref() {
            if !workflow.agents.contains_key(agent) {
                return Err(LacquerError::Yaml(format!(
                    "step '{}' references unknown agent '{}'",
                    step.id, agent
                )));
            }
        }
        if let Some(retry) = &step.retry {
            if retry.max_attempts == 0 {
                return Err(LacquerError::Yaml(format!(
                    "step '{}' declares retry with zero attempts",
                    step.id
                )));
            }
        }
    }

    // Resolves dependencies and detects cycles before any run is accepted.
    workflow.execution_order()?;

    for (name, spec) in &workflow.inputs {
        if let Some(default) = &spec.default {
            let violations = check_constraints(name, default, spec);
            if let Some(first) = violations.first() {
                return Err(LacquerError::Yaml(format!(
                    "default for input '{name}' violates its constraints: {}",
                    first.message
                )));
            }
        }
    }

    Ok(())
}

/// Load every configured workflow, keyed by derived id.
///
/// Explicit `files` are loaded unconditionally; `dir`, when given, is scanned
/// non-recursively for `*.laq.yaml` / `*.laq.yml`. A later file with the same
/// derived id replaces the earlier one with a warning.
pub fn load_workflows(
    parser: &dyn WorkflowParser,
    files: &[PathBuf],
    dir: Option<&Path>,
) -> Result<HashMap<String, Arc<Workflow>>, LacquerError> {
    let mut paths: Vec<PathBuf> = files.to_vec();

    if let Some(dir) = dir {
        let entries = std::fs::read_dir(dir).map_err(|err| {
            LacquerError::Io(format!("reading workflow dir {}: {err}", dir.display()))
        })?;
        let mut discovered: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                let name = p.file_name().map(|n| n.to_string_lossy().into_owned());
                name.is_some_and(|n| n.ends_with(".laq.yaml") || n.ends_with(".laq.yml"))
            })
            .collect();
        discovered.sort();
        paths.extend(discovered);
    }

    let mut workflows = HashMap::new();
    for path in &paths {
        let workflow = parser.parse_file(path)?;
        debug!(id = %workflow.id, path = %path.display(), steps = workflow.steps.len(), "loaded workflow");
        if let Some(previous) = workflows.insert(workflow.id.clone(), Arc::new(workflow)) {
            warn!(id = %previous.id, "duplicate workflow id, keeping the later file");
        }
    }

    if workflows.is_empty() {
        return Err(LacquerError::Configuration(
            "no valid workflows loaded".to_string(),
        ));
    }

    Ok(workflows)
}
