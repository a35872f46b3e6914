//! The grimoire step DSL.
//!
//! A grimoire is a declarative, immutable list of steps interpreted by the
//! workflow engine: shell scripts, agent spawns, bounded loops, and worktree
//! merges. Grimoires are YAML files; built-ins are compiled into the binary
//! and user files override them by name.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GrimoireError {
    #[error("failed to parse grimoire: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("grimoire has no name")]
    MissingName,
    #[error("duplicate step name at one nesting level: {0}")]
    DuplicateStepName(String),
    #[error("step {step}: {field} must not be empty")]
    EmptyField { step: String, field: String },
    #[error("step {0}: exit_loop is only valid inside a loop")]
    ExitLoopOutsideLoop(String),
    #[error("invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },
}

pub type Result<T> = std::result::Result<T, GrimoireError>;

/// Control action taken after a step finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Advance to the next step.
    Continue,
    /// Terminate the innermost enclosing loop with its current success.
    ExitLoop,
    /// Transition the workflow to blocked, preserving the resume point.
    Block,
    /// Transition the workflow to failed, preserving the resume point.
    Fail,
}

/// Policy when a loop exhausts `max_iterations` without an `exit_loop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMaxIterations {
    #[default]
    Continue,
    Block,
    Fail,
}

/// Step-kind specific fields, tagged by `type` in the YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Run a shell command in the workflow's worktree.
    Script { command: String },
    /// Spawn the agent binary with a rendered spell as its prompt.
    Agent { spell: String },
    /// Run nested steps up to `max_iterations` times.
    Loop {
        max_iterations: u32,
        #[serde(default)]
        on_max_iterations: OnMaxIterations,
        steps: Vec<Step>,
    },
    /// Reconcile the worktree back onto the base branch.
    Merge {
        #[serde(default)]
        require_review: bool,
    },
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Script { .. } => "script",
            Self::Agent { .. } => "agent",
            Self::Loop { .. } => "loop",
            Self::Merge { .. } => "merge",
        }
    }
}

/// One step of a grimoire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Per-step timeout; the step is killed and fails with `step_timeout`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "duration_str::deserialize_opt",
        serialize_with = "duration_str::serialize_opt"
    )]
    pub timeout: Option<Duration>,
    /// Workflow variable to bind the step's trimmed output to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Condition; a false or undefined result skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<StepAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_fail: Option<StepAction>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    /// Effective action on success (default: continue).
    pub fn success_action(&self) -> StepAction {
        self.on_success.unwrap_or(StepAction::Continue)
    }

    /// Effective action on failure (default: fail).
    pub fn fail_action(&self) -> StepAction {
        self.on_fail.unwrap_or(StepAction::Fail)
    }
}

/// A named, immutable workflow specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grimoire {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Workflow-level timeout; on expiry the current step is cancelled and
    /// the workflow fails with `workflow_timeout`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "duration_str::deserialize_opt",
        serialize_with = "duration_str::serialize_opt"
    )]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Grimoire {
    /// Parse a grimoire from YAML and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let grimoire: Self = serde_yaml::from_str(yaml)?;
        grimoire.validate()?;
        Ok(grimoire)
    }

    /// Validate structural invariants: non-empty name, unique step names per
    /// nesting level, `exit_loop` only inside loops, non-empty commands.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GrimoireError::MissingName);
        }
        validate_steps(&self.steps, 0)
    }
}

fn validate_steps(steps: &[Step], loop_depth: usize) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for step in steps {
        if !seen.insert(step.name.as_str()) {
            return Err(GrimoireError::DuplicateStepName(step.name.clone()));
        }
        let exit_loop_used = step.on_success == Some(StepAction::ExitLoop)
            || step.on_fail == Some(StepAction::ExitLoop);
        if exit_loop_used && loop_depth == 0 {
            return Err(GrimoireError::ExitLoopOutsideLoop(step.name.clone()));
        }
        match &step.kind {
            StepKind::Script { command } => {
                if command.trim().is_empty() {
                    return Err(GrimoireError::EmptyField {
                        step: step.name.clone(),
                        field: "command".to_string(),
                    });
                }
            }
            StepKind::Agent { spell } => {
                if spell.trim().is_empty() {
                    return Err(GrimoireError::EmptyField {
                        step: step.name.clone(),
                        field: "spell".to_string(),
                    });
                }
            }
            StepKind::Loop { steps, .. } => {
                validate_steps(steps, loop_depth + 1)?;
            }
            StepKind::Merge { .. } => {}
        }
    }
    Ok(())
}

/// Duration strings in grimoire files: `30s`, `5m`, `2h`, or bare seconds.
pub mod duration_str {
    use super::GrimoireError;
    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn parse(value: &str) -> Result<Duration, GrimoireError> {
        let value = value.trim();
        let invalid = |reason: &str| GrimoireError::InvalidDuration {
            value: value.to_string(),
            reason: reason.to_string(),
        };
        if value.is_empty() {
            return Err(invalid("empty"));
        }
        let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => value.split_at(idx),
            None => (value, "s"),
        };
        let n: u64 = digits.parse().map_err(|_| invalid("missing number"))?;
        let secs = match unit {
            "s" | "sec" => n,
            "m" | "min" => n * 60,
            "h" => n * 3600,
            "ms" => return Ok(Duration::from_millis(n)),
            other => return Err(invalid(&format!("unknown unit {other:?}"))),
        };
        Ok(Duration::from_secs(secs))
    }

    pub fn format(d: Duration) -> String {
        let secs = d.as_secs();
        if d.subsec_millis() != 0 {
            format!("{}ms", d.as_millis())
        } else if secs % 3600 == 0 && secs > 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 && secs > 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(s) => parse(&s).map(Some).map_err(D::Error::custom),
            None => Ok(None),
        }
    }

    pub fn serialize_opt<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_str(&format(*d)),
            None => serializer.serialize_none(),
        }
    }
}
