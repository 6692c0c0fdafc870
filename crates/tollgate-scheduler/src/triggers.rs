//! Trigger matching and evaluation.

use std::collections::BTreeMap;
use tollgate_core::pipeline::{
    PipelineDefinition, ReleaseAction, TriggerConfig, TriggerPredicate, TriggerType,
};
use tollgate_core::run::TriggerInfo;
use tracing::debug;

/// Event that can trigger a pipeline.
#[derive(Debug, Clone)]
pub enum TriggerEvent {
    Push { branch: String },
    Release { action: ReleaseAction },
    Manual { actor: Option<String> },
}

impl TriggerEvent {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerEvent::Push { .. } => TriggerType::Push,
            TriggerEvent::Release { .. } => TriggerType::Release,
            TriggerEvent::Manual { .. } => TriggerType::Manual,
        }
    }

    fn info(&self) -> TriggerInfo {
        let mut info = TriggerInfo {
            trigger_type: self.trigger_type(),
            git_ref: None,
            release_action: None,
            triggered_by: None,
        };
        match self {
            TriggerEvent::Push { branch } => info.git_ref = Some(branch.clone()),
            TriggerEvent::Release { action } => info.release_action = Some(*action),
            TriggerEvent::Manual { actor } => info.triggered_by = actor.clone(),
        }
        info
    }
}

/// A run that should start because a trigger matched.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub definition: PipelineDefinition,
    /// Index of the matching trigger; `None` for a manual run of a
    /// definition that declares no triggers.
    pub trigger_index: Option<usize>,
    pub trigger: TriggerInfo,
}

impl RunRequest {
    /// Build a request directly, bypassing trigger evaluation.
    pub fn manual(definition: PipelineDefinition, actor: Option<String>) -> Self {
        let index = definition
            .triggers
            .iter()
            .position(|t| t.trigger_type() == TriggerType::Manual);
        Self {
            definition,
            trigger_index: index,
            trigger: TriggerEvent::Manual { actor }.info(),
        }
    }

    pub fn trigger_config(&self) -> Option<&TriggerConfig> {
        self.trigger_index
            .and_then(|idx| self.definition.triggers.get(idx))
    }

    /// Fail-fast overrides the matching trigger applies, keyed by job name.
    pub fn fail_fast_overrides(&self) -> BTreeMap<String, bool> {
        self.trigger_config()
            .map(|t| t.overrides.fail_fast.clone())
            .unwrap_or_default()
    }
}

/// Matcher for determining which runs an event starts.
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// One request per (definition, trigger) pair whose predicate matches.
    ///
    /// Triggers are independent, so a single event may start several runs of
    /// the same definition.
    pub fn evaluate(
        &self,
        definitions: &[PipelineDefinition],
        event: &TriggerEvent,
    ) -> Vec<RunRequest> {
        let mut requests = Vec::new();

        for definition in definitions {
            if definition.triggers.is_empty() {
                if let TriggerEvent::Manual { .. } = event {
                    requests.push(RunRequest {
                        definition: definition.clone(),
                        trigger_index: None,
                        trigger: event.info(),
                    });
                }
                continue;
            }

            for (idx, trigger) in definition.triggers.iter().enumerate() {
                if self.trigger_matches(trigger, event) {
                    debug!(pipeline = %definition.name, trigger = idx, "Trigger matched");
                    requests.push(RunRequest {
                        definition: definition.clone(),
                        trigger_index: Some(idx),
                        trigger: event.info(),
                    });
                }
            }
        }

        requests
    }

    fn trigger_matches(&self, trigger: &TriggerConfig, event: &TriggerEvent) -> bool {
        match (&trigger.on, event) {
            (TriggerPredicate::Push { branches }, TriggerEvent::Push { branch }) => {
                self.branch_matches(branches, branch)
            }
            (TriggerPredicate::Release { types }, TriggerEvent::Release { action }) => {
                types.contains(action)
            }
            (TriggerPredicate::Manual {}, TriggerEvent::Manual { .. }) => true,
            _ => false,
        }
    }

    fn branch_matches(&self, patterns: &[String], branch: &str) -> bool {
        if patterns.is_empty() {
            return true; // Match all branches if no patterns specified
        }
        patterns.iter().any(|p| self.glob_match(p, branch))
    }

    fn glob_match(&self, pattern: &str, text: &str) -> bool {
        if pattern == "*" || pattern == "**" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix("/**") {
            return text.starts_with(&format!("{}/", prefix));
        }
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return text
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'));
        }
        if let Some((head, tail)) = pattern.split_once('*') {
            if !tail.contains('*') {
                return text.len() >= head.len() + tail.len()
                    && text.starts_with(head)
                    && text.ends_with(tail);
            }
        }
        pattern == text
    }
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::new()
    }
}
