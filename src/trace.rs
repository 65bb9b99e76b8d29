use serde::Serialize;
use std::fmt;

/// One explainable step of an evaluation: what was done, on what, and how it ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceStep {
    pub step: String,
    pub input: String,
    pub outcome: String,
}

impl TraceStep {
    pub fn new(step: impl Into<String>, input: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            input: input.into(),
            outcome: outcome.into(),
        }
    }
}

impl fmt::Display for TraceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} => {}", self.step, self.input, self.outcome)
    }
}

/// Ordered list of steps; appended only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Trace(Vec<TraceStep>);

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: impl Into<String>, input: impl Into<String>, outcome: impl Into<String>) {
        self.0.push(TraceStep::new(step, input, outcome));
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Display lines, each prefixed with `prefix`.
    pub fn lines(&self, prefix: &str) -> Vec<String> {
        self.0.iter().map(|s| format!("{prefix}{s}")).collect()
    }
}
