//! Load rules deciding which plugins run on a page

use crate::utils::{is_truthy, value_at_path};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Predicate over the global data
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Decision logic for a single plugin
#[derive(Clone)]
pub enum Rule {
    /// Load or skip unconditionally
    Flag(bool),
    /// Load when the predicate holds
    When(Predicate),
    /// Like `When`, but with `test: true` only considered in test mode
    Gated { test: bool, rule: Predicate },
}

impl Rule {
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Rule::When(Arc::new(predicate))
    }

    pub fn gated<F>(test: bool, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Rule::Gated {
            test,
            rule: Arc::new(predicate),
        }
    }
}

impl From<bool> for Rule {
    fn from(flag: bool) -> Self {
        Rule::Flag(flag)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Flag(flag) => write!(f, "Flag({})", flag),
            Rule::When(_) => write!(f, "When(<predicate>)"),
            Rule::Gated { test, .. } => write!(f, "Gated {{ test: {} }}", test),
        }
    }
}

/// Insertion-ordered mapping plugin id → rule
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<(String, Rule)>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, id: impl Into<String>, rule: impl Into<Rule>) -> Self {
        self.insert(id, rule);
        self
    }

    /// Insert a rule; an existing id keeps its position and gets the new rule
    pub fn insert(&mut self, id: impl Into<String>, rule: impl Into<Rule>) {
        let id = id.into();
        let rule = rule.into();
        match self.rules.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => slot.1 = rule,
            None => self.rules.push((id, rule)),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|(existing, _)| existing == id).map(|(_, rule)| rule)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rule)> {
        self.rules.iter().map(|(id, rule)| (id.as_str(), rule))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl<S: Into<String>, R: Into<Rule>> FromIterator<(S, R)> for RuleSet {
    fn from_iter<I: IntoIterator<Item = (S, R)>>(iter: I) -> Self {
        let mut set = RuleSet::new();
        for (id, rule) in iter {
            set.insert(id, rule);
        }
        set
    }
}

/// Evaluates rules against the global data
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleEvaluator {
    test_mode: bool,
}

impl RuleEvaluator {
    pub fn new(test_mode: bool) -> Self {
        Self { test_mode }
    }

    /// Decide a single rule
    pub fn validate(&self, rule: &Rule, data: &Value) -> bool {
        match rule {
            Rule::Flag(flag) => *flag,
            Rule::When(predicate) => predicate(data),
            Rule::Gated { test, rule } => {
                if !*test || self.test_mode {
                    rule(data)
                } else {
                    false
                }
            }
        }
    }

    /// Ids whose rules pass, in rule-set order
    pub fn select(&self, rules: &RuleSet, data: &Value) -> Vec<String> {
        rules
            .iter()
            .filter(|(id, rule)| {
                let selected = self.validate(rule, data);
                debug!("Rule for '{}' evaluated to {}", id, selected);
                selected
            })
            .map(|(id, _)| id.to_string())
            .collect()
    }
}

/// Declarative rule as written in configuration files or queued commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleSpec {
    Flag(bool),
    Condition(ConditionSpec),
}

/// Condition over the value at a dotted path.
///
/// Every constraint given must hold. A path with no constraints requires a
/// truthy value; no path at all always holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionSpec {
    #[serde(default)]
    pub test: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
}

impl ConditionSpec {
    fn has_constraints(&self) -> bool {
        self.equals.is_some() || self.one_of.is_some() || self.exists.is_some()
    }

    /// Reject conditions whose constraints have nothing to look at
    pub fn check(&self) -> std::result::Result<(), String> {
        match &self.path {
            Some(path) if path.trim().is_empty() => Err("rule path must not be empty".to_string()),
            None if self.has_constraints() => {
                Err("rule constraints require a path".to_string())
            }
            _ => Ok(()),
        }
    }

    pub fn matches(&self, data: &Value) -> bool {
        let Some(path) = &self.path else {
            return true;
        };
        let value = value_at_path(data, path).filter(|v| !v.is_null());

        if !self.has_constraints() {
            return value.map(is_truthy).unwrap_or(false);
        }
        if let Some(exists) = self.exists {
            if value.is_some() != exists {
                return false;
            }
        }
        if let Some(expected) = &self.equals {
            if value != Some(expected) {
                return false;
            }
        }
        if let Some(options) = &self.one_of {
            if !value.map(|v| options.contains(v)).unwrap_or(false) {
                return false;
            }
        }
        true
    }
}

impl RuleSpec {
    pub fn check(&self) -> std::result::Result<(), String> {
        match self {
            RuleSpec::Flag(_) => Ok(()),
            RuleSpec::Condition(condition) => condition.check(),
        }
    }
}

impl From<RuleSpec> for Rule {
    fn from(spec: RuleSpec) -> Self {
        match spec {
            RuleSpec::Flag(flag) => Rule::Flag(flag),
            RuleSpec::Condition(condition) => {
                let test = condition.test;
                Rule::gated(test, move |data| condition.matches(data))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> Value {
        json!({"page": {"type": "product", "name": "Shoe"}, "site": {"id": "s1"}, "user": {}})
    }

    #[test]
    fn test_flags_and_predicates() {
        let eval = RuleEvaluator::new(false);
        assert!(eval.validate(&Rule::Flag(true), &data()));
        assert!(!eval.validate(&Rule::Flag(false), &data()));
        assert!(eval.validate(&Rule::when(|d| d["page"]["type"] == "product"), &data()));
        assert!(!eval.validate(&Rule::when(|d| d["page"]["type"] == "home"), &data()));
    }

    #[test]
    fn test_gated_rule_needs_test_mode() {
        let rule = Rule::gated(true, |_| true);
        assert!(!RuleEvaluator::new(false).validate(&rule, &data()));
        assert!(RuleEvaluator::new(true).validate(&rule, &data()));

        let ungated = Rule::gated(false, |_| true);
        assert!(RuleEvaluator::new(false).validate(&ungated, &data()));
    }

    #[test]
    fn test_select_keeps_insertion_order() {
        let rules = RuleSet::new()
            .with("c", true)
            .with("a", false)
            .with("b", Rule::when(|_| true))
            .with("a", true);
        let ids = RuleEvaluator::new(false).select(&rules, &data());
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn test_declarative_rules() {
        let spec: RuleSpec = serde_json::from_value(json!({"path": "page.type", "one_of": ["product", "category"]})).unwrap();
        assert!(RuleEvaluator::new(false).validate(&spec.into(), &data()));

        let spec: RuleSpec = serde_json::from_value(json!({"path": "page.type", "equals": "home"})).unwrap();
        assert!(!RuleEvaluator::new(false).validate(&spec.into(), &data()));

        let spec: RuleSpec = serde_json::from_value(json!({"path": "order", "exists": false})).unwrap();
        assert!(RuleEvaluator::new(false).validate(&spec.into(), &data()));

        let spec: RuleSpec = serde_json::from_value(json!({"test": true, "path": "site.id"})).unwrap();
        let rule: Rule = spec.into();
        assert!(!RuleEvaluator::new(false).validate(&rule, &data()));
        assert!(RuleEvaluator::new(true).validate(&rule, &data()));

        let spec: RuleSpec = serde_json::from_value(json!(true)).unwrap();
        assert_eq!(spec, RuleSpec::Flag(true));
    }

    #[test]
    fn test_condition_check() {
        let spec = ConditionSpec {
            equals: Some(json!(1)),
            ..Default::default()
        };
        assert!(spec.check().is_err());
        assert!(serde_json::from_value::<RuleSpec>(json!({"path": "a", "bogus": 1})).is_err());
    }
}
