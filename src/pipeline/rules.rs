//! Keyword rules engine.
//!
//! Rules are evaluated highest priority first; ties keep their configured
//! order. The first enabled rule whose kinds include the message kind and
//! whose keywords match wins.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::pipeline::types::MessageKind;

/// How a single keyword is compared against the content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchType {
    #[default]
    Contains,
    Exact,
    StartsWith,
    EndsWith,
    Regex,
}

/// How per-keyword results combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchLogic {
    And,
    #[default]
    Or,
}

fn default_enabled() -> bool {
    true
}

/// A keyword reply rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, alias = "matchType")]
    pub match_type: MatchType,
    #[serde(default, alias = "matchLogic")]
    pub match_logic: MatchLogic,
    /// Kinds the rule applies to. Empty means every kind.
    #[serde(default)]
    pub kinds: Vec<MessageKind>,
    #[serde(default)]
    pub priority: i32,
    /// Static reply text.
    #[serde(default)]
    pub response: Option<String>,
    /// Generate the reply with the decision service instead.
    #[serde(default, alias = "useAi")]
    pub use_ai: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Lead tool to send when this rule matches.
    #[serde(default, alias = "leadTool")]
    pub lead_tool: Option<String>,
}

impl Rule {
    /// An enabled OR/contains rule with a static response.
    pub fn keyword(id: &str, keywords: &[&str], response: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            match_type: MatchType::Contains,
            match_logic: MatchLogic::Or,
            kinds: Vec::new(),
            priority: 0,
            response: Some(response.to_string()),
            use_ai: false,
            enabled: true,
            lead_tool: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_match(mut self, match_type: MatchType, match_logic: MatchLogic) -> Self {
        self.match_type = match_type;
        self.match_logic = match_logic;
        self
    }

    pub fn with_kinds(mut self, kinds: &[MessageKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn with_lead_tool(mut self, tool_id: &str) -> Self {
        self.lead_tool = Some(tool_id.to_string());
        self
    }

    /// Drop the static response and generate one instead.
    pub fn with_ai(mut self) -> Self {
        self.response = None;
        self.use_ai = true;
        self
    }

    pub fn applies_to(&self, kind: MessageKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    /// Non-empty static response, if any.
    pub fn static_response(&self) -> Option<&str> {
        self.response
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }
}

/// Matches content against rules, caching compiled regexes.
#[derive(Debug, Default)]
pub struct RuleMatcher {
    // `None` marks a pattern that failed to compile and was already logged.
    regex_cache: Mutex<HashMap<String, Option<Regex>>>,
}

impl RuleMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// First rule matching `content` for a message of `kind`.
    pub fn find_match<'a>(
        &self,
        rules: &'a [Rule],
        content: &str,
        kind: MessageKind,
    ) -> Option<&'a Rule> {
        self.find_match_where(rules, content, kind, |_| true)
    }

    /// Like [`find_match`](Self::find_match), restricted to rules accepted by `filter`.
    pub fn find_match_where<'a, F>(
        &self,
        rules: &'a [Rule],
        content: &str,
        kind: MessageKind,
        filter: F,
    ) -> Option<&'a Rule>
    where
        F: Fn(&Rule) -> bool,
    {
        let mut candidates: Vec<&Rule> = rules
            .iter()
            .filter(|r| r.enabled && r.applies_to(kind) && filter(r))
            .collect();
        candidates.sort_by_key(|r| Reverse(r.priority));

        let matched = candidates
            .into_iter()
            .find(|rule| self.rule_matches(rule, content));
        if let Some(rule) = matched {
            debug!(rule = %rule.id, priority = rule.priority, "Rule matched");
        }
        matched
    }

    /// Whether the rule's keywords match, ignoring enabled/kind filters.
    pub fn rule_matches(&self, rule: &Rule, content: &str) -> bool {
        let keywords: Vec<&str> = rule
            .keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return false;
        }

        let hit = |keyword: &&str| self.keyword_matches(rule.match_type, keyword, content);
        match rule.match_logic {
            MatchLogic::And => keywords.iter().all(hit),
            MatchLogic::Or => keywords.iter().any(hit),
        }
    }

    fn keyword_matches(&self, match_type: MatchType, keyword: &str, content: &str) -> bool {
        if match_type == MatchType::Regex {
            return self.regex_matches(keyword, content);
        }

        let content = content.trim().to_lowercase();
        let keyword = keyword.to_lowercase();
        match match_type {
            MatchType::Contains => content.contains(&keyword),
            MatchType::Exact => content == keyword,
            MatchType::StartsWith => content.starts_with(&keyword),
            MatchType::EndsWith => content.ends_with(&keyword),
            MatchType::Regex => false,
        }
    }

    fn regex_matches(&self, pattern: &str, content: &str) -> bool {
        let mut cache = self
            .regex_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let compiled = cache.entry(pattern.to_string()).or_insert_with(|| {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Invalid rule regex, treating as non-match");
                    None
                }
            }
        });
        compiled.as_ref().is_some_and(|re| re.is_match(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> RuleMatcher {
        RuleMatcher::new()
    }

    // ── Match types ─────────────────────────────────────────────────

    #[test]
    fn contains_is_case_insensitive() {
        let rules = vec![Rule::keyword("price", &["PRICE"], "10 dollars")];
        let hit = matcher().find_match(&rules, "What's the price?", MessageKind::Text);
        assert_eq!(hit.unwrap().id, "price");
    }

    #[test]
    fn exact_starts_and_ends() {
        let m = matcher();
        let exact = Rule::keyword("e", &["hello"], "x").with_match(MatchType::Exact, MatchLogic::Or);
        assert!(m.rule_matches(&exact, "  Hello "));
        assert!(!m.rule_matches(&exact, "hello there"));

        let starts =
            Rule::keyword("s", &["hi"], "x").with_match(MatchType::StartsWith, MatchLogic::Or);
        assert!(m.rule_matches(&starts, "Hi, anyone?"));
        assert!(!m.rule_matches(&starts, "oh hi"));

        let ends = Rule::keyword("n", &["thanks"], "x").with_match(MatchType::EndsWith, MatchLogic::Or);
        assert!(m.rule_matches(&ends, "ok, THANKS"));
        assert!(!m.rule_matches(&ends, "thanks a lot"));
    }

    #[test]
    fn regex_is_case_insensitive() {
        let rule = Rule::keyword("r", &[r"\bstock\b"], "x").with_match(MatchType::Regex, MatchLogic::Or);
        assert!(matcher().rule_matches(&rule, "In STOCK now?"));
        assert!(!matcher().rule_matches(&rule, "stocking"));
    }

    #[test]
    fn invalid_regex_never_matches() {
        let m = matcher();
        let rule = Rule::keyword("bad", &["(unclosed"], "x").with_match(MatchType::Regex, MatchLogic::Or);
        assert!(!m.rule_matches(&rule, "(unclosed"));
        // Cached as a failed pattern.
        assert!(!m.rule_matches(&rule, "anything"));
        assert_eq!(m.regex_cache.lock().unwrap().len(), 1);
    }

    // ── Logic and ordering ──────────────────────────────────────────

    #[test]
    fn and_requires_every_keyword() {
        let rule = Rule::keyword("both", &["price", "shipping"], "x")
            .with_match(MatchType::Contains, MatchLogic::And);
        let m = matcher();
        assert!(m.rule_matches(&rule, "price incl. shipping?"));
        assert!(!m.rule_matches(&rule, "price?"));
    }

    #[test]
    fn blank_keywords_are_ignored() {
        let m = matcher();
        let only_blank = Rule::keyword("blank", &["", "  "], "x");
        assert!(!m.rule_matches(&only_blank, "anything"));

        let mixed = Rule::keyword("mixed", &["", "hello"], "x")
            .with_match(MatchType::Contains, MatchLogic::And);
        assert!(m.rule_matches(&mixed, "hello"));
    }

    #[test]
    fn highest_priority_wins() {
        let rules = vec![
            Rule::keyword("low", &["price"], "low").with_priority(1),
            Rule::keyword("high", &["price"], "high").with_priority(10),
        ];
        let hit = matcher().find_match(&rules, "price", MessageKind::Text).unwrap();
        assert_eq!(hit.id, "high");
    }

    #[test]
    fn ties_keep_configured_order() {
        let rules = vec![
            Rule::keyword("first", &["price"], "a").with_priority(5),
            Rule::keyword("second", &["price"], "b").with_priority(5),
        ];
        let hit = matcher().find_match(&rules, "price", MessageKind::Text).unwrap();
        assert_eq!(hit.id, "first");
    }

    #[test]
    fn disabled_and_kind_filtered_rules_skip() {
        let mut disabled = Rule::keyword("off", &["price"], "x").with_priority(9);
        disabled.enabled = false;
        let cards_only = Rule::keyword("card", &["price"], "x")
            .with_priority(5)
            .with_kinds(&[MessageKind::Card]);
        let any = Rule::keyword("any", &["price"], "x");
        let rules = vec![disabled, cards_only, any];

        let m = matcher();
        assert_eq!(m.find_match(&rules, "price", MessageKind::Text).unwrap().id, "any");
        assert_eq!(m.find_match(&rules, "price", MessageKind::Card).unwrap().id, "card");
    }

    #[test]
    fn predicate_variant_filters_candidates() {
        let rules = vec![
            Rule::keyword("reply", &["form"], "x").with_priority(10),
            Rule::keyword("tool", &["form"], "x").with_lead_tool("form-1"),
        ];
        let hit = matcher()
            .find_match_where(&rules, "send me the form", MessageKind::Text, |r| {
                r.lead_tool.is_some()
            })
            .unwrap();
        assert_eq!(hit.id, "tool");
    }

    #[test]
    fn no_match_returns_none() {
        let rules = vec![Rule::keyword("price", &["price"], "x")];
        assert!(matcher().find_match(&rules, "hello", MessageKind::Text).is_none());
        assert!(matcher().find_match(&[], "hello", MessageKind::Text).is_none());
    }

    #[test]
    fn static_response_ignores_blank() {
        let mut rule = Rule::keyword("r", &["x"], "  ");
        assert!(rule.static_response().is_none());
        rule.response = Some(" ok ".into());
        assert_eq!(rule.static_response(), Some("ok"));
        assert!(rule.with_ai().static_response().is_none());
    }

    #[test]
    fn deserializes_camel_case_fields() {
        let rule: Rule = serde_json::from_str(
            r#"{"id":"r","keywords":["a"],"matchType":"startsWith","matchLogic":"AND","kinds":["CARD"],"useAi":true,"leadTool":"t1"}"#,
        )
        .unwrap();
        assert_eq!(rule.match_type, MatchType::StartsWith);
        assert_eq!(rule.match_logic, MatchLogic::And);
        assert_eq!(rule.kinds, vec![MessageKind::Card]);
        assert!(rule.use_ai);
        assert!(rule.enabled);
        assert_eq!(rule.lead_tool.as_deref(), Some("t1"));
    }
}
