//! Eviction policy
//!
//! Victim selection is least-recent-access over a tier's candidate set,
//! with insertion order as the documented deterministic tie-break. A
//! configured veto predicate can reject candidates; selection then moves
//! to the next-best candidate in recency order.

use std::sync::Arc;

use crate::cache::error::CacheError;
use crate::cache::tier::TierStore;
use crate::cache::traits::{CacheKey, CacheValue, EvictionVeto};

/// Outcome of one victim selection pass over a tier.
pub(crate) enum VictimOutcome<K> {
    /// Least-recently-accessed non-vetoed key.
    Victim(K),
    /// Candidates existed but the veto rejected every one of them; the
    /// tier's capacity becomes a soft bound for this admission.
    AllVetoed,
    /// The tier holds nothing to evict.
    NoCandidates,
}

/// LRU policy with an optional veto hook.
pub(crate) struct LruPolicy<K, V> {
    veto: Option<Arc<dyn EvictionVeto<K, V>>>,
}

impl<K: CacheKey, V: CacheValue> LruPolicy<K, V> {
    pub(crate) fn new(veto: Option<Arc<dyn EvictionVeto<K, V>>>) -> Self {
        Self { veto }
    }

    /// Select the eviction victim for `tier`.
    ///
    /// Candidates are visited in ascending (last-access, insertion) order.
    /// The veto sees the peeked value, so checking it never refreshes
    /// recency. A candidate that vanishes between the snapshot and the
    /// peek lost a race with a concurrent removal and is skipped.
    pub(crate) fn select_victim(
        &self,
        tier: &dyn TierStore<K, V>,
    ) -> Result<VictimOutcome<K>, CacheError> {
        let mut candidates = tier.candidates();
        if candidates.is_empty() {
            return Ok(VictimOutcome::NoCandidates);
        }
        candidates.sort_unstable_by(|a, b| {
            (a.last_access, a.insert_seq).cmp(&(b.last_access, b.insert_seq))
        });
        let Some(veto) = &self.veto else {
            let candidate = candidates.into_iter().next();
            return Ok(match candidate {
                Some(candidate) => VictimOutcome::Victim(candidate.key),
                None => VictimOutcome::NoCandidates,
            });
        };
        for candidate in candidates {
            if let Some(value) = tier.peek(&candidate.key)? {
                if !veto.vetoes(&candidate.key, &value) {
                    return Ok(VictimOutcome::Victim(candidate.key));
                }
            }
        }
        Ok(VictimOutcome::AllVetoed)
    }
}
