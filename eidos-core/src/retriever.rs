//! Structural retrieval: find distillations by EIDOS structure, not text
//! similarity.
//!
//! If retrieval were "find similar logs" it would pull more tool junk.
//! Instead retrieval happens in layers, by type priority: policies always
//! bind, playbooks when the task matches, sharp edges for the tools in play,
//! heuristics for the intent category, anti-patterns for known failures,
//! and similar failures to fill remaining slots.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::distillation::{Distillation, DistillationKind};
use crate::error::Result;
use crate::step::Step;
use crate::storage::EidosStorage;

/// Words ignored when measuring keyword overlap.
const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "if", "then", "so", "to", "of", "in", "on", "for",
    "with", "by", "is", "are", "was", "were", "be", "been", "being", "user", "request", "when",
];

/// Retrieval statistics for one retriever instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrieverStats {
    pub retrievals: u64,
    pub by_kind: HashMap<String, u64>,
    pub empty_results: u64,
}

/// Retrieves distillations by structural relevance over the canonical store.
pub struct StructuralRetriever {
    store: Arc<dyn EidosStorage>,
    max_results: usize,
    stats: Mutex<RetrieverStats>,
}

impl StructuralRetriever {
    /// Create a retriever returning up to `max_results` distillations.
    pub fn new(store: Arc<dyn EidosStorage>, max_results: usize) -> Self {
        Self {
            store,
            max_results,
            stats: Mutex::new(RetrieverStats::default()),
        }
    }

    /// Retrieve relevant distillations for a step, in priority order:
    /// policies, playbooks, sharp edges for the tool, heuristics for the
    /// intent, anti-patterns, then similar failures to fill remaining slots.
    pub async fn retrieve_for_step(&self, step: &Step) -> Result<Vec<Distillation>> {
        self.stats.lock().retrievals += 1;
        let mut results: Vec<Distillation> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        // 1. Policies, kept only when the intent shares a keyword
        for policy in self.policies().await? {
            if has_keyword_overlap(&step.intent, &policy.statement, 1) {
                self.push_unique(&mut results, &mut seen, policy);
            }
        }

        // 2. Playbooks whose trigger appears in the intent
        for playbook in self.playbooks(&step.intent).await? {
            self.push_unique(&mut results, &mut seen, playbook);
        }

        // 3. Sharp edges for the tool in use
        let tool = step.tool();
        if !tool.is_empty() {
            for edge in self.sharp_edges_for_tool(tool).await? {
                self.push_unique(&mut results, &mut seen, edge);
            }
        }

        // 4. Heuristics matching the intent category
        for heuristic in self.heuristics(&step.intent).await? {
            self.push_unique(&mut results, &mut seen, heuristic);
        }

        // 5. Anti-patterns for this context
        for anti in self.anti_patterns(&step.intent, &step.hypothesis).await? {
            self.push_unique(&mut results, &mut seen, anti);
        }

        // 6. Fill remaining slots with similar failures
        if results.len() < self.max_results && !step.hypothesis.is_empty() {
            for failure in self.similar_failures(&step.hypothesis).await? {
                self.push_unique(&mut results, &mut seen, failure);
            }
        }

        self.finalize(results).await
    }

    /// Retrieve distillations matching an intent string; skips tool-specific
    /// sharp edges and requires policy keyword overlap.
    pub async fn retrieve_for_intent(&self, intent: &str) -> Result<Vec<Distillation>> {
        self.stats.lock().retrievals += 1;
        let mut results: Vec<Distillation> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for policy in self.policies().await? {
            if has_keyword_overlap(intent, &policy.statement, 1) {
                self.push_unique(&mut results, &mut seen, policy);
            }
        }
        for heuristic in self.heuristics(intent).await? {
            self.push_unique(&mut results, &mut seen, heuristic);
        }
        for anti in self.anti_patterns(intent, "").await? {
            self.push_unique(&mut results, &mut seen, anti);
        }

        self.finalize(results).await
    }

    /// Retrieve sharp edges and anti-patterns relevant to an error message.
    pub async fn retrieve_for_error(&self, error_text: &str) -> Result<Vec<Distillation>> {
        self.stats.lock().retrievals += 1;
        let mut results: Vec<Distillation> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let edges = self
            .store
            .get_distillations_by_kind(DistillationKind::SharpEdge, 50)
            .await?;
        for edge in edges {
            if matches_error(error_text, &edge) {
                self.push_unique(&mut results, &mut seen, edge);
            }
        }

        let antis = self
            .store
            .get_distillations_by_kind(DistillationKind::AntiPattern, 50)
            .await?;
        for anti in antis {
            if matches_error(error_text, &anti) {
                self.push_unique(&mut results, &mut seen, anti);
            }
        }

        self.finalize(results).await
    }

    /// Forward usage feedback to the store counters.
    pub async fn record_usage(&self, distillation_id: &str, helped: bool) -> Result<()> {
        self.store
            .record_distillation_usage(distillation_id, helped)
            .await
    }

    /// Retrieval statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> RetrieverStats {
        self.stats.lock().clone()
    }

    // ==================== Retrieval by kind ====================

    async fn policies(&self) -> Result<Vec<Distillation>> {
        self.store
            .get_distillations_by_kind(DistillationKind::Policy, 10)
            .await
    }

    async fn playbooks(&self, intent: &str) -> Result<Vec<Distillation>> {
        let all = self
            .store
            .get_distillations_by_kind(DistillationKind::Playbook, 20)
            .await?;
        let intent_lower = intent.to_lowercase();
        Ok(all
            .into_iter()
            .filter(|p| matches_trigger(&intent_lower, &p.triggers))
            .collect())
    }

    async fn sharp_edges_for_tool(&self, tool: &str) -> Result<Vec<Distillation>> {
        let tool_lower = tool.to_lowercase();
        let mut edges = self
            .store
            .get_distillations_by_domain(&tool_lower, 10)
            .await?;
        let mut seen: HashSet<String> =
            edges.iter().map(|e| e.distillation_id.clone()).collect();

        let all = self
            .store
            .get_distillations_by_kind(DistillationKind::SharpEdge, 20)
            .await?;
        for edge in all {
            let in_domain = edge
                .domains
                .iter()
                .any(|d| d.to_lowercase().contains(&tool_lower));
            let in_statement = edge.statement.to_lowercase().contains(&tool_lower);
            if (in_domain || in_statement) && seen.insert(edge.distillation_id.clone()) {
                edges.push(edge);
            }
        }
        edges.truncate(10);
        Ok(edges)
    }

    async fn heuristics(&self, intent: &str) -> Result<Vec<Distillation>> {
        let category = normalize_intent(intent);

        let mut heuristics = self
            .store
            .get_distillations_by_trigger(&category, 10)
            .await?;
        let mut seen: HashSet<String> = heuristics
            .iter()
            .map(|h| h.distillation_id.clone())
            .collect();
        for h in self
            .store
            .get_distillations_by_domain(&category, 10)
            .await?
        {
            if seen.insert(h.distillation_id.clone()) {
                heuristics.push(h);
            }
        }

        heuristics.retain(|h| h.kind == DistillationKind::Heuristic);
        heuristics.truncate(10);
        Ok(heuristics)
    }

    async fn anti_patterns(&self, intent: &str, hypothesis: &str) -> Result<Vec<Distillation>> {
        let category = normalize_intent(intent);
        let all = self
            .store
            .get_distillations_by_kind(DistillationKind::AntiPattern, 30)
            .await?;

        let context = format!("{intent} {hypothesis}");
        let mut relevant = Vec::new();
        for anti in all {
            if matches_trigger(&category, &anti.anti_triggers)
                || has_keyword_overlap(&context, &anti.statement, 2)
            {
                relevant.push(anti);
            }
        }
        relevant.truncate(10);
        Ok(relevant)
    }

    async fn similar_failures(&self, hypothesis: &str) -> Result<Vec<Distillation>> {
        let mut candidates = self
            .store
            .get_distillations_by_kind(DistillationKind::AntiPattern, 20)
            .await?;
        candidates.extend(
            self.store
                .get_distillations_by_kind(DistillationKind::SharpEdge, 20)
                .await?,
        );

        let hypothesis_words = word_set(hypothesis);
        let mut ranked: Vec<(usize, Distillation)> = candidates
            .into_iter()
            .filter_map(|d| {
                let overlap = hypothesis_words
                    .intersection(&word_set(&d.statement))
                    .count();
                (overlap >= 2).then_some((overlap, d))
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(ranked.into_iter().take(5).map(|(_, d)| d).collect())
    }

    // ==================== Assembly ====================

    fn push_unique(
        &self,
        results: &mut Vec<Distillation>,
        seen: &mut HashSet<String>,
        distillation: Distillation,
    ) {
        if seen.insert(distillation.distillation_id.clone()) {
            *self
                .stats
                .lock()
                .by_kind
                .entry(distillation.kind.to_string())
                .or_insert(0) += 1;
            results.push(distillation);
        }
    }

    async fn finalize(&self, mut results: Vec<Distillation>) -> Result<Vec<Distillation>> {
        results.sort_by(|a, b| {
            a.kind
                .retrieval_priority()
                .cmp(&b.kind.retrieval_priority())
                .then(
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(b.times_helped.cmp(&a.times_helped))
        });
        results.truncate(self.max_results);

        if results.is_empty() {
            self.stats.lock().empty_results += 1;
        }
        for d in &results {
            self.store
                .record_distillation_retrieval(&d.distillation_id)
                .await?;
        }
        debug!(count = results.len(), "structural retrieval complete");
        Ok(results)
    }
}

/// Map an intent onto a retrieval category via keyword buckets, falling back
/// to the first meaningful word.
#[must_use]
pub fn normalize_intent(intent: &str) -> String {
    let mut lower = intent.to_lowercase();
    for prefix in ["fulfill user request:", "user wants:", "request:"] {
        if let Some(stripped) = lower.strip_prefix(prefix) {
            lower = stripped.trim().to_string();
        }
    }

    let categories: &[(&str, &str)] = &[
        ("git", "git_operations"),
        ("push", "git_operations"),
        ("commit", "git_operations"),
        ("fix", "bug_fixing"),
        ("bug", "bug_fixing"),
        ("add", "feature_addition"),
        ("create", "feature_addition"),
        ("remove", "deletion"),
        ("delete", "deletion"),
        ("clean", "cleanup"),
        ("test", "testing"),
        ("deploy", "deployment"),
    ];
    for (keyword, category) in categories {
        if lower.contains(keyword) {
            return (*category).to_string();
        }
    }

    lower
        .split(|c: char| !c.is_ascii_alphabetic())
        .find(|w| !w.is_empty())
        .map_or_else(|| "general".to_string(), ToString::to_string)
}

fn matches_trigger(text_lower: &str, triggers: &[String]) -> bool {
    triggers
        .iter()
        .any(|t| !t.is_empty() && text_lower.contains(&t.to_lowercase()))
}

fn matches_error(error: &str, distillation: &Distillation) -> bool {
    let error_lower = error.to_lowercase();
    if distillation
        .triggers
        .iter()
        .any(|t| !t.is_empty() && error_lower.contains(&t.to_lowercase()))
    {
        return true;
    }
    let overlap = word_set(error)
        .intersection(&word_set(&distillation.statement))
        .count();
    overlap >= 3
}

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| !w.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Whether two texts share at least `min_overlap` non-stop-word keywords.
#[must_use]
pub fn has_keyword_overlap(text1: &str, text2: &str, min_overlap: usize) -> bool {
    let stops: HashSet<&str> = STOP_WORDS.iter().copied().collect();
    let words1: HashSet<String> = word_set(text1)
        .into_iter()
        .filter(|w| !stops.contains(w.as_str()))
        .collect();
    let words2: HashSet<String> = word_set(text2)
        .into_iter()
        .filter(|w| !stops.contains(w.as_str()))
        .collect();
    words1.intersection(&words2).count() >= min_overlap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_intent_categories() {
        assert_eq!(normalize_intent("git push origin main"), "git_operations");
        assert_eq!(normalize_intent("Fix the login bug"), "bug_fixing");
        assert_eq!(normalize_intent("Add retry logic"), "feature_addition");
        assert_eq!(normalize_intent("Remove dead code"), "deletion");
        assert_eq!(normalize_intent("clean up imports"), "cleanup");
        assert_eq!(normalize_intent("run tests"), "testing");
        assert_eq!(normalize_intent("deploy the service"), "deployment");
        assert_eq!(normalize_intent("inspect logs"), "inspect");
        assert_eq!(normalize_intent("!!!"), "general");
    }

    #[test]
    fn test_normalize_intent_strips_prefixes() {
        assert_eq!(
            normalize_intent("Fulfill user request: deploy the API"),
            "deployment"
        );
    }

    #[test]
    fn test_keyword_overlap_ignores_stop_words() {
        assert!(!has_keyword_overlap(
            "the user request when",
            "the user request when",
            1
        ));
        assert!(has_keyword_overlap(
            "validate token expiry",
            "token expiry must be validated",
            2
        ));
    }

    #[test]
    fn test_matches_error_via_trigger_or_overlap() {
        let mut edge = Distillation::new(
            DistillationKind::SharpEdge,
            "Module imports fail when the virtualenv is stale",
            0.3,
        );
        edge.triggers = vec!["ImportError".to_string()];
        assert!(matches_error("ImportError: no module X", &edge));

        edge.triggers.clear();
        assert!(matches_error(
            "imports fail because virtualenv is stale",
            &edge
        ));
        assert!(!matches_error("segfault in codec", &edge));
    }
}
