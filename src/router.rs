//! Task router and model selector.
//!
//! Given a task, an optional explicit model, and the calling tool's
//! categorical tag, the router picks a model that is available,
//! authorized under the active credential, and matched to the task's
//! complexity. Selection is deterministic: the same inputs against the
//! same tracker and auth snapshots always produce the same choice.
//!
//! Classification prefers the tool tag; free-text classification falls
//! back to regex word lists (complex indicators first, then simple,
//! otherwise standard). Both the tag map and the word lists are
//! configuration, since callers may carry their own vocabulary.

use crate::auth::AuthMethod;
use crate::limits::RateTracker;
use crate::types::{ModelSpec, RELIABLE_DEFAULT_MODEL, TaskComplexity, Tier, find_model};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tracing::debug;

static DEFAULT_COMPLEX_INDICATORS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(architect|design|refactor|implement|migrat\w*|debug|security|vulnerab\w*|concurren\w*|distributed|optimi[sz]e|algorithm|protocol)\b",
    )
    .unwrap()
});

static DEFAULT_SIMPLE_INDICATORS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(what is|who is|define|list|translate|spell|convert|rename|count)\b")
        .unwrap()
});

fn default_tool_tag_map() -> HashMap<String, TaskComplexity> {
    HashMap::from([
        ("ask_gemini".to_string(), TaskComplexity::Trivial),
        ("summarize_files".to_string(), TaskComplexity::Standard),
        ("research_topic".to_string(), TaskComplexity::Standard),
        ("analyze_codebase".to_string(), TaskComplexity::Standard),
        (
            "draft_code_implementation".to_string(),
            TaskComplexity::Complex,
        ),
        ("fix_bug".to_string(), TaskComplexity::Complex),
        ("refactor_code".to_string(), TaskComplexity::Complex),
        ("security_audit".to_string(), TaskComplexity::Critical),
    ])
}

/// Router configuration: tag vocabulary, word lists, and the fallback model.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Tool tag to complexity, consulted before any text classification.
    pub tool_tag_map: HashMap<String, TaskComplexity>,
    /// Override for the complex-indicator word list.
    pub complex_indicators: Option<Regex>,
    /// Override for the simple-indicator word list.
    pub simple_indicators: Option<Regex>,
    /// Model used when every candidate is unavailable.
    pub reliable_default: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tool_tag_map: default_tool_tag_map(),
            complex_indicators: None,
            simple_indicators: None,
            reliable_default: RELIABLE_DEFAULT_MODEL.to_string(),
        }
    }
}

/// The router's decision for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChoice {
    pub model: &'static ModelSpec,
    pub complexity: TaskComplexity,
    pub preferred_tier: Tier,
    /// True when every candidate was unavailable and the reliable default
    /// was chosen regardless.
    pub forced_default: bool,
}

/// Deterministic task router.
#[derive(Debug, Clone, Default)]
pub struct Router {
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Classify complexity: tool tag first, then the word lists.
    pub fn classify(&self, task: &str, tool_tag: Option<&str>) -> TaskComplexity {
        if let Some(tag) = tool_tag {
            if let Some(&complexity) = self.config.tool_tag_map.get(tag) {
                return complexity;
            }
        }

        let complex = self
            .config
            .complex_indicators
            .as_ref()
            .unwrap_or(&DEFAULT_COMPLEX_INDICATORS);
        if complex.is_match(task) {
            return TaskComplexity::Complex;
        }

        let simple = self
            .config
            .simple_indicators
            .as_ref()
            .unwrap_or(&DEFAULT_SIMPLE_INDICATORS);
        if simple.is_match(task) {
            return TaskComplexity::Trivial;
        }

        TaskComplexity::Standard
    }

    /// Select a model for the task.
    ///
    /// The explicit hint wins when it names a known model whose gate the
    /// active auth satisfies and which the tracker reports available.
    /// Otherwise candidates are ranked by tier distance from the preferred
    /// tier, ties broken toward the more capable model, and the first
    /// authorized available candidate wins. When nothing is available the
    /// reliable default is chosen anyway.
    pub fn select(
        &self,
        task: &str,
        tool_tag: Option<&str>,
        explicit_model: Option<&str>,
        prefer_fast: bool,
        auth_method: AuthMethod,
        tracker: &mut RateTracker,
    ) -> ModelChoice {
        let complexity = self.classify(task, tool_tag);
        let preferred_tier = if prefer_fast {
            3
        } else {
            complexity.preferred_tier()
        };

        if let Some(hint) = explicit_model {
            if let Some(spec) = find_model(hint) {
                if auth_method.satisfies(spec.gate) && tracker.available(spec.name) {
                    debug!(model = spec.name, "explicit model hint honored");
                    return ModelChoice {
                        model: spec,
                        complexity,
                        preferred_tier,
                        forced_default: false,
                    };
                }
                debug!(
                    model = spec.name,
                    "explicit hint unavailable, falling back to smart selection"
                );
            }
        }

        let mut candidates: Vec<&'static ModelSpec> = crate::types::known_models().iter().collect();
        candidates.sort_by_key(|spec| {
            (
                (spec.tier as i16 - preferred_tier as i16).abs(),
                spec.tier,
            )
        });

        for spec in candidates {
            if auth_method.satisfies(spec.gate) && tracker.available(spec.name) {
                return ModelChoice {
                    model: spec,
                    complexity,
                    preferred_tier,
                    forced_default: false,
                };
            }
        }

        // Everything unavailable: proceed with the reliable default anyway.
        let fallback = find_model(&self.config.reliable_default)
            .unwrap_or_else(|| find_model(RELIABLE_DEFAULT_MODEL).expect("catalog default"));
        debug!(model = fallback.name, "all candidates unavailable, using reliable default");
        ModelChoice {
            model: fallback,
            complexity,
            preferred_tier,
            forced_default: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::DEFAULT_FAILURE_THRESHOLD;

    fn router() -> Router {
        Router::default()
    }

    #[test]
    fn test_tool_tag_beats_text_classification() {
        let router = router();
        // The text alone would classify as complex.
        let complexity = router.classify("implement a security protocol", Some("ask_gemini"));
        assert_eq!(complexity, TaskComplexity::Trivial);
    }

    #[test]
    fn test_text_classification_order() {
        let router = router();
        assert_eq!(
            router.classify("refactor the storage layer", None),
            TaskComplexity::Complex
        );
        assert_eq!(
            router.classify("what is a monad", None),
            TaskComplexity::Trivial
        );
        assert_eq!(
            router.classify("summarize this document", None),
            TaskComplexity::Standard
        );
        // Complex indicators take priority over simple ones.
        assert_eq!(
            router.classify("what is the best way to refactor this", None),
            TaskComplexity::Complex
        );
    }

    #[test]
    fn test_trivial_read_picks_fast_tier() {
        let router = router();
        let mut tracker = RateTracker::default();
        let choice = router.select(
            "what is 2+2",
            Some("ask_gemini"),
            None,
            false,
            AuthMethod::OAuth,
            &mut tracker,
        );
        assert_eq!(choice.model.name, "gemini-2.5-flash-lite");
        assert_eq!(choice.preferred_tier, 3);
        assert!(!choice.forced_default);
    }

    #[test]
    fn test_rate_limited_hint_falls_back_to_next_capable() {
        let router = router();
        let mut tracker = RateTracker::default();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            tracker.record_failure("gemini-2.5-pro");
        }
        let choice = router.select(
            "implement a cache",
            Some("draft_code_implementation"),
            Some("gemini-2.5-pro"),
            false,
            AuthMethod::ApiKey,
            &mut tracker,
        );
        // Preview shares tier 1 and is reachable with an API key.
        assert_eq!(choice.model.name, "gemini-2.5-pro-preview");
        assert!(!choice.forced_default);
    }

    #[test]
    fn test_gated_model_skipped_without_auth() {
        let router = router();
        let mut tracker = RateTracker::default();
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            tracker.record_failure("gemini-2.5-pro");
        }
        let choice = router.select(
            "implement a cache",
            Some("draft_code_implementation"),
            Some("gemini-2.5-pro"),
            false,
            AuthMethod::OAuth,
            &mut tracker,
        );
        // The preview model is keyed-only, so OAuth lands on tier 2.
        assert_eq!(choice.model.name, "gemini-2.5-flash");
    }

    #[test]
    fn test_prefer_fast_overrides_complexity() {
        let router = router();
        let mut tracker = RateTracker::default();
        let choice = router.select(
            "design a distributed consensus protocol",
            None,
            None,
            true,
            AuthMethod::OAuth,
            &mut tracker,
        );
        assert_eq!(choice.preferred_tier, 3);
        assert_eq!(choice.model.tier, 3);
    }

    #[test]
    fn test_everything_unavailable_forces_default() {
        let router = router();
        let mut tracker = RateTracker::default();
        for spec in crate::types::known_models() {
            for _ in 0..DEFAULT_FAILURE_THRESHOLD {
                tracker.record_failure(spec.name);
            }
        }
        let choice = router.select(
            "what is 2+2",
            None,
            None,
            false,
            AuthMethod::OAuth,
            &mut tracker,
        );
        assert_eq!(choice.model.name, RELIABLE_DEFAULT_MODEL);
        assert!(choice.forced_default);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let router = router();
        let mut tracker = RateTracker::default();
        let first = router.select(
            "summarize the repo",
            None,
            None,
            false,
            AuthMethod::OAuth,
            &mut tracker,
        );
        let second = router.select(
            "summarize the repo",
            None,
            None,
            false,
            AuthMethod::OAuth,
            &mut tracker,
        );
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_tool_tag_falls_through_to_text() {
        let router = router();
        assert_eq!(
            router.classify("design a protocol", Some("unknown_tag")),
            TaskComplexity::Complex
        );
    }
}
