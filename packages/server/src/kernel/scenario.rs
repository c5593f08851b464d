//! Scenario documents: declarative `when`/`then` rules and their matcher.
//!
//! A scenario is loaded from YAML, validated once, and then frozen: the
//! matcher only ever sees an immutable [`Scenario`] behind an `Arc`.
//! Activating a new document is an atomic swap of that `Arc`; a match that
//! already started keeps using whichever set it first read.
//!
//! Matching is pure: for an event it returns, in declared rule order, the
//! concatenated `then`-lists of every rule whose `event_type` equals the
//! event's and whose `from`, when present, equals the event's source. An
//! empty result is a normal outcome.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Validation or parse failure while loading a scenario document.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to parse scenario YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("rule {rule} has an empty event_type")]
    EmptyEventType { rule: usize },

    #[error("rule {rule} has no actions")]
    NoActions { rule: usize },

    #[error("rule {rule}, action {action}: send_to is empty")]
    MissingTarget { rule: usize, action: usize },

    #[error("rule {rule}, action {action}: command is empty")]
    MissingCommand { rule: usize, action: usize },
}

/// Root of the YAML document: `scenario: { name, rules }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScenarioFile {
    scenario: Scenario,
}

/// A named, ordered rule set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// One trigger/action pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub when: When,
    #[serde(default)]
    pub then: Vec<Action>,
}

/// Event selector for a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct When {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// One command to send when a rule fires. `params` and `compensate_params`
/// are opaque and passed through to the target unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub send_to: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate_params: Option<Value>,
}

impl Action {
    /// Whether this action carries a rollback command.
    pub fn has_compensation(&self) -> bool {
        self.compensate_command
            .as_deref()
            .is_some_and(|cmd| !cmd.is_empty())
    }
}

/// An event as seen by the matcher. `source` is the registered id of the
/// connection that delivered it, never the value a client put on the wire.
#[derive(Debug, Clone)]
pub struct Event {
    pub source: String,
    pub event_type: String,
    pub payload: Option<Value>,
}

impl Scenario {
    /// Parse and validate a YAML scenario document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ScenarioError> {
        let file: ScenarioFile = serde_yaml::from_str(yaml)?;
        let scenario = file.scenario;
        scenario.validate()?;
        Ok(scenario)
    }

    fn validate(&self) -> Result<(), ScenarioError> {
        for (rule_idx, rule) in self.rules.iter().enumerate() {
            if rule.when.event_type.is_empty() {
                return Err(ScenarioError::EmptyEventType { rule: rule_idx });
            }
            if rule.then.is_empty() {
                return Err(ScenarioError::NoActions { rule: rule_idx });
            }
            for (action_idx, action) in rule.then.iter().enumerate() {
                if action.send_to.is_empty() {
                    return Err(ScenarioError::MissingTarget {
                        rule: rule_idx,
                        action: action_idx,
                    });
                }
                if action.command.is_empty() {
                    return Err(ScenarioError::MissingCommand {
                        rule: rule_idx,
                        action: action_idx,
                    });
                }
            }
        }
        Ok(())
    }

    /// Actions matching `event`, in declared rule order.
    pub fn match_event(&self, event: &Event) -> Vec<Action> {
        let mut actions = Vec::new();
        for rule in &self.rules {
            if rule.when.event_type != event.event_type {
                continue;
            }
            if let Some(from) = &rule.when.from {
                if from != &event.source {
                    continue;
                }
            }
            actions.extend(rule.then.iter().cloned());
        }
        actions
    }
}

/// Holder of the active scenario. Cloneable; all clones see the same swap.
#[derive(Clone, Default)]
pub struct ScenarioManager {
    active: Arc<RwLock<Option<Arc<Scenario>>>>,
}

impl ScenarioManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse, validate and activate a YAML document in one step.
    pub fn load_yaml(&self, yaml: &str) -> Result<Arc<Scenario>, ScenarioError> {
        let scenario = Arc::new(Scenario::from_yaml(yaml)?);
        self.activate(scenario.clone());
        Ok(scenario)
    }

    /// Atomically publish `scenario` as the active set.
    pub fn activate(&self, scenario: Arc<Scenario>) {
        let mut active = match self.active.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *active = Some(scenario);
    }

    /// The currently active scenario, if any.
    pub fn current(&self) -> Option<Arc<Scenario>> {
        let active = match self.active.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.clone()
    }

    /// Match `event` against the active set. No scenario loaded means no
    /// actions.
    pub fn match_event(&self, event: &Event) -> Vec<Action> {
        match self.current() {
            Some(scenario) => scenario.match_event(event),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"
scenario:
  name: demo
  rules:
    - when:
        event_type: attack.detected
        from: cyber
      then:
        - send_to: vr
          command: show_alert
          params:
            msg: "!"
    - when:
        event_type: attack.detected
      then:
        - send_to: sensor
          command: activate
          compensate_command: deactivate
"#;

    fn event(event_type: &str, source: &str) -> Event {
        Event {
            source: source.to_string(),
            event_type: event_type.to_string(),
            payload: None,
        }
    }

    #[test]
    fn test_load_valid_scenario() {
        let scenario = Scenario::from_yaml(SAMPLE).unwrap();
        assert_eq!(scenario.name, "demo");
        assert_eq!(scenario.rules.len(), 2);
        assert_eq!(
            scenario.rules[0].then[0].params,
            Some(json!({"msg": "!"}))
        );
    }

    #[test]
    fn test_match_concatenates_in_rule_order() {
        let scenario = Scenario::from_yaml(SAMPLE).unwrap();
        let actions = scenario.match_event(&event("attack.detected", "cyber"));
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].send_to, "vr");
        assert_eq!(actions[1].send_to, "sensor");
    }

    #[test]
    fn test_from_filter_excludes_other_sources() {
        let scenario = Scenario::from_yaml(SAMPLE).unwrap();
        let actions = scenario.match_event(&event("attack.detected", "other"));
        // Only the rule without a `from` constraint fires.
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].send_to, "sensor");
    }

    #[test]
    fn test_no_match_is_empty() {
        let scenario = Scenario::from_yaml(SAMPLE).unwrap();
        assert!(scenario.match_event(&event("unrelated", "cyber")).is_empty());
    }

    #[test]
    fn test_rejects_rule_without_actions() {
        let yaml = r#"
scenario:
  name: bad
  rules:
    - when:
        event_type: x
      then: []
"#;
        let err = Scenario::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ScenarioError::NoActions { rule: 0 }));
    }

    #[test]
    fn test_rejects_empty_event_type() {
        let yaml = r#"
scenario:
  name: bad
  rules:
    - when:
        event_type: ""
      then:
        - send_to: vr
          command: go
"#;
        let err = Scenario::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ScenarioError::EmptyEventType { rule: 0 }));
    }

    #[test]
    fn test_rejects_action_without_target() {
        let yaml = r#"
scenario:
  name: bad
  rules:
    - when:
        event_type: x
      then:
        - send_to: ""
          command: go
"#;
        let err = Scenario::from_yaml(yaml).unwrap_err();
        assert!(matches!(
            err,
            ScenarioError::MissingTarget { rule: 0, action: 0 }
        ));
    }

    #[test]
    fn test_manager_swaps_atomically() {
        let manager = ScenarioManager::new();
        assert!(manager.current().is_none());
        assert!(manager
            .match_event(&event("attack.detected", "cyber"))
            .is_empty());

        manager.load_yaml(SAMPLE).unwrap();
        let first = manager.current().unwrap();

        // A reader that grabbed the Arc keeps its frozen set across a swap.
        let replacement = r#"
scenario:
  name: other
  rules: []
"#;
        manager.load_yaml(replacement).unwrap();
        assert_eq!(first.name, "demo");
        assert_eq!(manager.current().unwrap().name, "other");
    }

    #[test]
    fn test_has_compensation() {
        let scenario = Scenario::from_yaml(SAMPLE).unwrap();
        assert!(!scenario.rules[0].then[0].has_compensation());
        assert!(scenario.rules[1].then[0].has_compensation());
    }
}
