//! Matching unresolved folder groups to remote add-on identities.
//!
//! Matching runs two passes, highest-confidence first:
//!
//! 1. **Hint pass**: folders whose manifest embeds a source-specific
//!    project key (e.g. `X-Curse-Project-ID`) are looked up directly against
//!    the hinted source. A confirmed hint match scores a flat 1.0:
//!    provenance metadata outranks any text similarity.
//! 2. **Name pass**: the group's folder names are normalized into a token
//!    query and searched across every registered source concurrently
//!    (through the metadata cache). Each returned identity is scored with a
//!    token-set ratio against its normalized display name and slug.
//!
//! Candidates from both passes are merged per (source, slug) keeping the
//! higher score, filtered by the acceptance threshold, and sorted by
//! (score desc, source priority asc, slug asc). That tie-break order is a
//! correctness invariant (it decides default selections), and the whole
//! computation is deterministic for a fixed catalogue snapshot and folder
//! group.
//!
//! # Similarity metric
//!
//! Token-set ratio: both strings are normalized and tokenized; the sorted
//! token intersection is compared against each sorted full token string
//! using a longest-common-subsequence character ratio (`2·lcs/(|a|+|b|)`),
//! and the best of the three pairings wins. The metric is deterministic,
//! symmetric under token reordering, bounded in `[0, 1]`, and yields 1.0
//! when one token set contains the other, which is the shape folder-derived
//! queries need. An empty candidate list is a valid result, never an
//! error.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;

use crate::cache::{CacheKey, CachedPayload, MetadataCache};
use crate::scanner::FolderGroup;
use crate::source::{AddonIdentity, SourceRegistry};
use crate::utils::CancelToken;

/// Similarity below which a candidate is discarded.
pub const ACCEPT_THRESHOLD: f64 = 0.6;

/// A scored, ranked guess linking a folder group to an identity.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    /// The candidate identity.
    pub identity: AddonIdentity,
    /// Similarity in `[0, 1]`; hint-confirmed matches score 1.0.
    pub score: f64,
    /// The owning source's tie-break rank (lower wins).
    pub priority: u32,
}

/// Lower-cases and strips everything but ASCII alphanumerics into tokens,
/// dropping trailing version-looking tokens (`2`, `v10`, `1.2.3`).
pub fn normalize_tokens(value: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            current.push(ch.to_ascii_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    while let Some(last) = tokens.last() {
        if is_version_token(last) && tokens.len() > 1 {
            tokens.pop();
        } else {
            break;
        }
    }
    tokens
}

fn is_version_token(token: &str) -> bool {
    let digits = token.strip_prefix('v').unwrap_or(token);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// The normalized query string for a folder group: its folder names'
/// deduplicated tokens, joined in first-seen order.
pub fn group_query(group: &FolderGroup) -> String {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();
    for folder in group.folders() {
        for token in normalize_tokens(&folder.name) {
            if seen.insert(token.clone()) {
                ordered.push(token);
            }
        }
    }
    ordered.join(" ")
}

fn lcs_len(a: &[u8], b: &[u8]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            row[j + 1] = if ca == cb { prev[j] + 1 } else { prev[j + 1].max(row[j]) };
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

fn char_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * lcs_len(a.as_bytes(), b.as_bytes()) as f64 / total as f64
}

/// Token-set similarity between two strings (see module docs).
pub fn token_set_ratio(a: &str, b: &str) -> f64 {
    let tokens_a: BTreeSet<String> = normalize_tokens(a).into_iter().collect();
    let tokens_b: BTreeSet<String> = normalize_tokens(b).into_iter().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let inter: Vec<&str> = tokens_a.intersection(&tokens_b).map(String::as_str).collect();
    let joined = |tokens: &BTreeSet<String>| {
        tokens.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
    };
    let s_inter = inter.join(" ");
    let s_a = joined(&tokens_a);
    let s_b = joined(&tokens_b);

    let mut best = char_ratio(&s_a, &s_b);
    if !s_inter.is_empty() {
        best = best.max(char_ratio(&s_inter, &s_a)).max(char_ratio(&s_inter, &s_b));
        if inter.len() == tokens_a.len() || inter.len() == tokens_b.len() {
            // One token set contains the other.
            best = 1.0;
        }
    }
    best
}

/// Score of an identity against a normalized query: the better of its
/// display name and slug.
pub fn score_identity(query: &str, identity: &AddonIdentity) -> f64 {
    token_set_ratio(query, &identity.name).max(token_set_ratio(query, &identity.slug))
}

/// Sorts candidates by (score desc, priority asc, slug asc), in place.
pub fn rank(candidates: &mut Vec<MatchCandidate>) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.priority.cmp(&b.priority))
            .then_with(|| a.identity.slug.cmp(&b.identity.slug))
    });
}

/// The fuzzy matcher: scores candidate identities for folder groups.
///
/// Holds no per-group state; a matcher is shared by every group a session
/// reconciles.
pub struct Matcher {
    registry: Arc<SourceRegistry>,
    cache: Arc<MetadataCache>,
}

impl Matcher {
    /// Matcher over the given registry, with cache-wrapped queries.
    pub fn new(registry: Arc<SourceRegistry>, cache: Arc<MetadataCache>) -> Self {
        Self { registry, cache }
    }

    async fn cached_search(
        &self,
        source: &str,
        query: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<AddonIdentity>, crate::core::AddaxError> {
        let key = CacheKey::search(source, query);
        let ttl = self.registry.cache_ttl_of(source);
        let payload = self
            .cache
            .get_or_fetch(key, ttl, || async {
                let identities = self.registry.search(source, query, cancel).await?;
                Ok(CachedPayload::Identities(identities))
            })
            .await?;
        match payload.as_ref() {
            CachedPayload::Identities(identities) => Ok(identities.clone()),
            CachedPayload::Versions(_) => Ok(Vec::new()),
        }
    }

    /// Hint pass: resolve manifest-embedded source keys into candidates.
    async fn hint_candidates(
        &self,
        group: &FolderGroup,
        cancel: &CancelToken,
    ) -> Vec<MatchCandidate> {
        let hint_keys = self.registry.hint_keys();
        let mut hints: BTreeMap<String, String> = BTreeMap::new();
        for folder in group.folders() {
            for (toc_key, source_id) in &hint_keys {
                if let Some(value) = folder.toc.get(toc_key) {
                    hints.insert(source_id.clone(), value.trim().to_string());
                }
            }
        }

        let mut candidates = Vec::new();
        for (source_id, project_key) in hints {
            if cancel.is_cancelled() {
                break;
            }
            match self.cached_search(&source_id, &project_key, cancel).await {
                Ok(identities) => {
                    // The hinted key is authoritative; take the source's
                    // answer for it as confirmed provenance.
                    for identity in identities {
                        candidates.push(MatchCandidate {
                            priority: self.registry.priority_of(&identity.source),
                            identity,
                            score: 1.0,
                        });
                    }
                }
                Err(err) => {
                    tracing::debug!(source = %source_id, %err, "hint lookup failed");
                }
            }
        }
        candidates
    }

    /// Name pass: fan the normalized query out and score every hit.
    async fn name_candidates(
        &self,
        query: &str,
        cancel: &CancelToken,
    ) -> Vec<MatchCandidate> {
        if query.is_empty() {
            return Vec::new();
        }
        let searches = self.registry.source_ids().into_iter().map(|source| async move {
            (self.cached_search(&source, query, cancel).await, source)
        });
        let mut candidates = Vec::new();
        for (result, source) in join_all(searches).await {
            match result {
                Ok(identities) => {
                    for identity in identities {
                        let score = score_identity(query, &identity);
                        if score >= ACCEPT_THRESHOLD {
                            candidates.push(MatchCandidate {
                                priority: self.registry.priority_of(&identity.source),
                                identity,
                                score,
                            });
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%source, %err, "source dropped from name matching");
                }
            }
        }
        candidates
    }

    /// Produces the ranked candidate list for one folder group.
    ///
    /// Returns an empty list (never an error) when no source yields an
    /// acceptable match; callers surface that as "no matches found" and
    /// default the selection to Skip.
    pub async fn match_group(
        &self,
        group: &FolderGroup,
        cancel: &CancelToken,
    ) -> Vec<MatchCandidate> {
        let query = group_query(group);
        tracing::debug!(group = ?group.names(), %query, "matching folder group");

        let (hinted, named) =
            futures::join!(self.hint_candidates(group, cancel), self.name_candidates(&query, cancel));

        let mut best: BTreeMap<(String, String), MatchCandidate> = BTreeMap::new();
        for candidate in hinted.into_iter().chain(named) {
            let key = (candidate.identity.source.clone(), candidate.identity.slug.clone());
            match best.get(&key) {
                Some(existing) if existing.score >= candidate.score => {}
                _ => {
                    best.insert(key, candidate);
                }
            }
        }

        let mut candidates: Vec<_> = best.into_values().collect();
        rank(&mut candidates);
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(source: &str, slug: &str, name: &str) -> AddonIdentity {
        AddonIdentity { source: source.into(), slug: slug.into(), name: name.into() }
    }

    #[test]
    fn normalization_strips_separators_and_versions() {
        assert_eq!(normalize_tokens("DBM-Core"), vec!["dbm", "core"]);
        assert_eq!(normalize_tokens("Details_Streamer v2"), vec!["details", "streamer"]);
        assert_eq!(normalize_tokens("AtlasLoot 8.15.02"), vec!["atlasloot"]);
        // A lone version-looking name is kept; stripping would empty it.
        assert_eq!(normalize_tokens("v2"), vec!["v2"]);
    }

    #[test]
    fn token_set_ratio_is_symmetric_and_order_insensitive() {
        let a = token_set_ratio("deadly boss mods", "mods boss deadly");
        assert_eq!(a, 1.0);
        let left = token_set_ratio("dbm core", "dbm core alt");
        let right = token_set_ratio("dbm core alt", "dbm core");
        assert_eq!(left, right);
    }

    #[test]
    fn subset_token_sets_score_one() {
        assert_eq!(token_set_ratio("dbm core statusbartimers", "dbm core"), 1.0);
    }

    #[test]
    fn disjoint_token_sets_score_low() {
        assert!(token_set_ratio("weakauras", "bagnon") < ACCEPT_THRESHOLD);
    }

    #[test]
    fn ratio_stays_in_unit_interval() {
        for (a, b) in [
            ("", ""),
            ("x", ""),
            ("deadly boss mods", "dbm core alt"),
            ("auctionator", "auctioneer"),
        ] {
            let r = token_set_ratio(a, b);
            assert!((0.0..=1.0).contains(&r), "ratio {r} out of range for {a:?}/{b:?}");
        }
    }

    #[test]
    fn ranking_breaks_ties_by_priority_then_slug() {
        let mut candidates = vec![
            MatchCandidate { identity: identity("b", "zeta", "Zeta"), score: 0.8, priority: 2 },
            MatchCandidate { identity: identity("a", "beta", "Beta"), score: 0.8, priority: 1 },
            MatchCandidate { identity: identity("a", "alpha", "Alpha"), score: 0.8, priority: 1 },
            MatchCandidate { identity: identity("b", "top", "Top"), score: 0.95, priority: 2 },
        ];
        rank(&mut candidates);
        let slugs: Vec<_> = candidates.iter().map(|c| c.identity.slug.as_str()).collect();
        assert_eq!(slugs, vec!["top", "alpha", "beta", "zeta"]);
    }

    #[test]
    fn score_identity_takes_the_better_of_name_and_slug() {
        // Name matches poorly, slug matches exactly.
        let id = identity("a", "dbm-core", "Deadly Boss Mods");
        let score = score_identity("dbm core", &id);
        assert_eq!(score, 1.0);
        assert!(score > token_set_ratio("dbm core", &id.name));
    }
}
