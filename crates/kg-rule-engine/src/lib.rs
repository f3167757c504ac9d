//! Composable predicate/effect rule engine.
//!
//! Two very different parts of the control plane need "evaluate an ordered
//! set of conditions against a target and return the highest-priority
//! effect" logic: the authorisation kernel's `scope_filter` evaluation
//! (spec §4.8) and the relationship-vocabulary substitution table (spec
//! §4.4). Rather than duplicate the combinator logic, both are built on
//! this single engine, which evaluates structured boolean predicates
//! ([`Condition`]) against a bag of key-value [`Facts`].
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A bag of attributes describing the target object a rule is evaluated
/// against (e.g. `{"owner_id": "alice", "is_system_job": false}`).
pub type Facts = BTreeMap<String, Value>;

/// A composable predicate over a [`Facts`] bag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Matches every target.
    Always,
    /// Matches no target.
    Never,
    /// Matches when `facts[key] == value`. Missing keys never match.
    Eq {
        /// Fact key to look up.
        key: String,
        /// Expected value.
        value: Value,
    },
    /// Matches when `facts[key]` is truthy (`true`, a non-zero number, or a
    /// non-empty string/array).
    Truthy {
        /// Fact key to look up.
        key: String,
    },
    /// All child conditions must match.
    And(Vec<Condition>),
    /// At least one child condition must match.
    Or(Vec<Condition>),
    /// Negates the inner condition.
    Not(Box<Condition>),
}

impl Condition {
    /// Evaluate this condition against `facts`.
    #[must_use]
    pub fn matches(&self, facts: &Facts) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Eq { key, value } => facts.get(key) == Some(value),
            Self::Truthy { key } => facts.get(key).is_some_and(is_truthy),
            Self::And(conds) => conds.iter().all(|c| c.matches(facts)),
            Self::Or(conds) => conds.iter().any(|c| c.matches(facts)),
            Self::Not(inner) => !inner.matches(facts),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

/// The effect applied when a rule's condition matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Permit the action.
    Allow,
    /// Explicitly deny the action (overrides a lower-priority `Allow`).
    Deny,
}

/// A single rule: a condition, an effect, and a priority.
///
/// Rules are evaluated in **descending** priority order (higher number
/// wins); ties are broken by insertion order (earlier rule wins), matching
/// the deny-overrides-allow evaluation spec §4.8 requires for role
/// inheritance chains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Unique identifier for the rule (e.g. a `RolePermission` row id).
    pub id: String,
    /// Condition that must hold for this rule to apply.
    pub condition: Condition,
    /// Effect applied when the condition matches.
    pub effect: Effect,
    /// Higher priority rules are evaluated first and take precedence.
    pub priority: i64,
}

/// Result of evaluating a single rule against a [`Facts`] bag.
#[derive(Debug, Clone)]
pub struct RuleEvaluation {
    /// The id of the rule that was evaluated.
    pub rule_id: String,
    /// Whether the rule's condition matched.
    pub matched: bool,
    /// The effect the rule would apply, regardless of match.
    pub effect: Effect,
}

/// Engine that evaluates an ordered set of [`Rule`]s against a [`Facts`] bag.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    /// Create an empty rule engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule to the engine.
    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Evaluate `facts` and return the effect of the highest-priority
    /// matching rule. Returns `None` when no rule matches (the caller
    /// decides the default — spec §4.8 says "default deny").
    #[must_use]
    pub fn evaluate(&self, facts: &Facts) -> Option<Effect> {
        self.rules
            .iter()
            .filter(|r| r.condition.matches(facts))
            .max_by_key(|r| r.priority)
            .map(|r| r.effect)
    }

    /// Evaluate every rule against `facts` and return all results, in
    /// descending priority order. Useful for audit trails ("why was this
    /// allowed/denied").
    #[must_use]
    pub fn evaluate_all(&self, facts: &Facts) -> Vec<RuleEvaluation> {
        let mut rules: Vec<&Rule> = self.rules.iter().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        rules
            .into_iter()
            .map(|r| RuleEvaluation {
                rule_id: r.id.clone(),
                matched: r.condition.matches(facts),
                effect: r.effect,
            })
            .collect()
    }

    /// Borrow the current rule list.
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Remove a rule by its id. Does nothing if no such rule exists.
    pub fn remove_rule(&mut self, id: &str) {
        self.rules.retain(|r| r.id != id);
    }

    /// Number of rules currently registered.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// Convenience constructor for a `{"owner_id": self_id}` fact bag, used by
/// callers evaluating an `owner=self` scope filter.
#[must_use]
pub fn facts_from_pairs(pairs: &[(&str, Value)]) -> Facts {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_deny_beats_lower_priority_allow() {
        let mut engine = RuleEngine::new();
        engine.add_rule(Rule {
            id: "allow-all".into(),
            condition: Condition::Always,
            effect: Effect::Allow,
            priority: 0,
        });
        engine.add_rule(Rule {
            id: "deny-system".into(),
            condition: Condition::Truthy {
                key: "is_system_job".into(),
            },
            effect: Effect::Deny,
            priority: 10,
        });

        let facts = facts_from_pairs(&[("is_system_job", json!(true))]);
        assert_eq!(engine.evaluate(&facts), Some(Effect::Deny));

        let facts = facts_from_pairs(&[("is_system_job", json!(false))]);
        assert_eq!(engine.evaluate(&facts), Some(Effect::Allow));
    }

    #[test]
    fn owner_self_filter_matches_only_owner() {
        let mut engine = RuleEngine::new();
        engine.add_rule(Rule {
            id: "owner-self".into(),
            condition: Condition::Eq {
                key: "owner_id".into(),
                value: json!("alice"),
            },
            effect: Effect::Allow,
            priority: 0,
        });

        let alice_facts = facts_from_pairs(&[("owner_id", json!("alice"))]);
        let bob_facts = facts_from_pairs(&[("owner_id", json!("bob"))]);
        assert_eq!(engine.evaluate(&alice_facts), Some(Effect::Allow));
        assert_eq!(engine.evaluate(&bob_facts), None);
    }

    #[test]
    fn and_or_not_compose() {
        let cond = Condition::And(vec![
            Condition::Eq {
                key: "ontology".into(),
                value: json!("T1"),
            },
            Condition::Not(Box::new(Condition::Truthy {
                key: "is_system_job".into(),
            })),
        ]);
        let matching = facts_from_pairs(&[("ontology", json!("T1")), ("is_system_job", json!(false))]);
        let not_matching = facts_from_pairs(&[("ontology", json!("T2")), ("is_system_job", json!(false))]);
        assert!(cond.matches(&matching));
        assert!(!cond.matches(&not_matching));
    }

    #[test]
    fn missing_key_never_matches_eq() {
        let cond = Condition::Eq {
            key: "owner_id".into(),
            value: json!("alice"),
        };
        assert!(!cond.matches(&Facts::new()));
    }

    #[test]
    fn evaluate_all_orders_by_priority_descending() {
        let mut engine = RuleEngine::new();
        engine.add_rule(Rule {
            id: "low".into(),
            condition: Condition::Always,
            effect: Effect::Allow,
            priority: 1,
        });
        engine.add_rule(Rule {
            id: "high".into(),
            condition: Condition::Always,
            effect: Effect::Deny,
            priority: 5,
        });
        let results = engine.evaluate_all(&Facts::new());
        assert_eq!(results[0].rule_id, "high");
        assert_eq!(results[1].rule_id, "low");
    }
}
