//! Path protection policy.
//!
//! A path is protected when any rule in the policy matches it. Rules are
//! independent predicates; the policy is an open list so sites can append
//! their own without touching the callers.

use regex::Regex;

use crate::error::{MaintError, Result};

pub trait ProtectionRule: Send + Sync {
    fn name(&self) -> &str;

    fn matches(&self, path: &str) -> bool;
}

/// Regex searched anywhere in the path unless the pattern anchors itself.
#[derive(Debug, Clone)]
pub struct PatternRule {
    name: String,
    pattern: Regex,
}

impl PatternRule {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            MaintError::Configuration(format!("invalid protection pattern {:?}: {}", pattern, e))
        })?;
        Ok(Self {
            name: name.into(),
            pattern,
        })
    }
}

impl ProtectionRule for PatternRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }
}

/// Protects the root and every top-level directory (`/data`, `/tmp/`).
#[derive(Debug, Clone, Default)]
pub struct TopLevelRule;

impl ProtectionRule for TopLevelRule {
    fn name(&self) -> &str {
        "top-level"
    }

    fn matches(&self, path: &str) -> bool {
        match path.strip_prefix('/') {
            Some(rest) => !rest.trim_end_matches('/').contains('/'),
            None => false,
        }
    }
}

const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    // removing the framework staging area kills running jobs
    ("mapreduce-staging", "hadoop-mapred"),
    ("hbase-root", "^/hbase/?"),
    // bulk loads stage here
    ("hbase-bulkload-staging", "^/tmp/hbase-staging|(^|/)hbase-staging(/|$)"),
];

const DEFAULT_TRAILING_PATTERNS: &[(&str, &str)] = &[
    ("health-canary", "cloudera_health_monitoring_canary_files"),
    ("production-data", "^/data/production/?"),
];

#[derive(Default)]
pub struct ProtectionPolicy {
    rules: Vec<Box<dyn ProtectionRule>>,
}

impl ProtectionPolicy {
    /// An empty policy. Nothing is protected until rules are pushed.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in safety rules.
    pub fn with_defaults() -> Self {
        let mut policy = Self::new();
        for (name, pattern) in DEFAULT_PATTERNS {
            policy.push(Box::new(builtin(name, pattern)));
        }
        policy.push(Box::new(TopLevelRule));
        for (name, pattern) in DEFAULT_TRAILING_PATTERNS {
            policy.push(Box::new(builtin(name, pattern)));
        }
        policy
    }

    /// Appends one named regex rule per pattern.
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for (i, pattern) in patterns.into_iter().enumerate() {
            let rule = PatternRule::new(format!("configured-{}", i + 1), pattern.as_ref())?;
            self.push(Box::new(rule));
        }
        Ok(self)
    }

    pub fn push(&mut self, rule: Box<dyn ProtectionRule>) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.matched_rule(path).is_some()
    }

    /// Name of the first rule protecting `path`.
    pub fn matched_rule(&self, path: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(path))
            .map(|rule| rule.name())
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }
}

fn builtin(name: &str, pattern: &str) -> PatternRule {
    match PatternRule::new(name, pattern) {
        Ok(rule) => rule,
        Err(e) => unreachable!("built-in protection pattern is invalid: {}", e),
    }
}
