//! Domain query classification and expansion.
//!
//! The N2S (Navigate-to-SaaS) detection regexes and synonym lists are a
//! policy, not a mechanism: they live behind [`QueryClassifier`] so the
//! retriever is not hard-coupled to one domain vocabulary.

use regex::Regex;
use std::sync::LazyLock;

static N2S_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bn2s\b",
        r"\bnavigate\s+to\s+saas\b",
        r"\bnavigate-to-saas\b",
        r"\blifecycle\b",
        r"\bmethodology\b",
        r"\bsprint\s+0\b",
        r"\bsprint\s+zero\b",
        r"\bdiscovery\b",
        r"\bbuild\b",
        r"\boptimize\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static SYNONYM_TRIGGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bn2s\b|\bnavigate.+saas\b").unwrap());
static METHODOLOGY_TRIGGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\blifecycle\b|\bmethodology\b").unwrap());
static GOVERNANCE_TRIGGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bgovernance\b|\bcriteria\b|\bcheckpoint\b").unwrap());

const SYNONYMS: [&str; 2] = ["N2S", "Navigate to SaaS"];
const PHASES: [&str; 3] = ["Discovery", "Build", "Optimize"];
const STAGES: [&str; 4] = ["Start", "Prepare", "Sprint 0", "Plan"];
const GOVERNANCE: [&str; 3] = ["governance checkpoints", "entry criteria", "exit criteria"];

/// Classifies queries against the configured domain vocabulary.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryClassifier;

impl QueryClassifier {
    pub fn new() -> Self {
        Self
    }

    /// True when the query matches the closed set of domain patterns.
    pub fn is_domain_query(&self, query: &str) -> bool {
        let lower = query.to_lowercase();
        N2S_PATTERNS.iter().any(|p| p.is_match(&lower))
    }

    /// Expand a domain query with synonyms and phase terms into a
    /// BM25-friendly `OR` query. Non-domain queries pass through unchanged.
    pub fn expand_query(&self, query: &str) -> String {
        if !self.is_domain_query(query) {
            return query.to_string();
        }
        let lower = query.to_lowercase();

        let mut terms: Vec<&str> = Vec::new();
        if SYNONYM_TRIGGER.is_match(&lower) {
            terms.extend(SYNONYMS);
        }
        if METHODOLOGY_TRIGGER.is_match(&lower) {
            terms.extend(PHASES);
            terms.extend(STAGES);
        }
        if GOVERNANCE_TRIGGER.is_match(&lower) {
            terms.extend(GOVERNANCE);
        }

        if terms.is_empty() {
            return query.to_string();
        }
        let expansion: Vec<String> = terms.iter().map(|t| format!("\"{}\"", t)).collect();
        format!("{} OR {}", query, expansion.join(" OR "))
    }

    /// SQL fragment filtering documents to domain titles/doctypes. The
    /// caller splices this into a WHERE clause; it contains no user input.
    pub fn domain_filter_sql(&self) -> &'static str {
        "(d.title ILIKE '%N2S%'
          OR d.title ILIKE '%Navigate to SaaS%'
          OR d.title ILIKE '%Methodology%'
          OR d.title ILIKE '%Playbook%'
          OR d.title ILIKE '%Runbook%'
          OR d.meta::text ILIKE '%doctype%methodology%'
          OR d.meta::text ILIKE '%doctype%playbook%'
          OR d.meta::text ILIKE '%doctype%runbook%')"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_domain_terms() {
        let c = QueryClassifier::new();
        assert!(c.is_domain_query("What is the N2S lifecycle?"));
        assert!(c.is_domain_query("navigate to saas governance"));
        assert!(c.is_domain_query("Sprint 0 planning"));
        assert!(c.is_domain_query("methodology overview"));
    }

    #[test]
    fn test_ignores_unrelated_queries() {
        let c = QueryClassifier::new();
        assert!(!c.is_domain_query("how do I reset my password"));
        assert!(!c.is_domain_query("database connection pooling"));
    }

    #[test]
    fn test_expansion_adds_or_terms() {
        let c = QueryClassifier::new();
        let expanded = c.expand_query("N2S methodology");
        assert!(expanded.starts_with("N2S methodology OR "));
        assert!(expanded.contains("\"Navigate to SaaS\""));
        assert!(expanded.contains("\"Discovery\""));
        assert!(expanded.contains("\"Sprint 0\""));
    }

    #[test]
    fn test_expansion_is_identity_for_plain_queries() {
        let c = QueryClassifier::new();
        assert_eq!(c.expand_query("password reset"), "password reset");
    }

    #[test]
    fn test_governance_terms_included_on_trigger() {
        let c = QueryClassifier::new();
        let expanded = c.expand_query("n2s governance checkpoint");
        assert!(expanded.contains("\"entry criteria\""));
        assert!(expanded.contains("\"exit criteria\""));
    }

    #[test]
    fn test_word_boundaries_respected() {
        let c = QueryClassifier::new();
        // "builder" must not match \bbuild\b
        assert!(!c.is_domain_query("website builder tools"));
    }
}
