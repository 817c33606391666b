//! Manual keyword rule evaluation. Case-insensitive except regex rules;
//! first match in priority order (descending priority, ascending id) wins.

use regex::Regex;
use tracing::warn;

use wagate_common::models::{AutoReplyRule, MatchMode};

pub fn matches(rule: &AutoReplyRule, text: &str) -> bool {
    match rule.match_mode {
        MatchMode::Exact => text.to_lowercase() == rule.trigger.to_lowercase(),
        MatchMode::Contains => text.to_lowercase().contains(&rule.trigger.to_lowercase()),
        MatchMode::StartsWith => text.to_lowercase().starts_with(&rule.trigger.to_lowercase()),
        MatchMode::EndsWith => text.to_lowercase().ends_with(&rule.trigger.to_lowercase()),
        MatchMode::Regex => match Regex::new(&rule.trigger) {
            Ok(re) => re.is_match(text),
            Err(e) => {
                warn!(rule_id = rule.id, "invalid rule regex '{}': {}", rule.trigger, e);
                false
            }
        },
    }
}

/// First matching rule. The slice may arrive in any order; evaluation order
/// is always priority descending, then id ascending.
pub fn select<'a>(rules: &'a [AutoReplyRule], text: &str) -> Option<&'a AutoReplyRule> {
    let mut ordered: Vec<&AutoReplyRule> = rules.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    ordered.into_iter().find(|rule| matches(rule, text))
}
