//! Session matching decisions
//!
//! Queue order is arrival order and the first eligible session wins, except
//! that a session reusing the runner's loaded adapter is preferred over an
//! earlier one that would force a reload.

use chrono::{DateTime, Utc};
use gantry_core::{Session, SessionFilter};
use std::collections::VecDeque;

/// Strategy for picking the next session for a filter
pub trait MatchStrategy: Send + Sync {
    /// Index of the chosen candidate, or `None` when nothing is eligible
    fn select(
        &self,
        candidates: &VecDeque<Session>,
        filter: &SessionFilter,
        now: DateTime<Utc>,
    ) -> Option<usize>;
}

/// Whether `session` satisfies every hard constraint of `filter`
pub fn matches(session: &Session, filter: &SessionFilter, now: DateTime<Utc>) -> bool {
    if filter.mode.is_some_and(|mode| mode != session.mode) {
        return false;
    }
    if filter.session_type.is_some_and(|t| t != session.session_type) {
        return false;
    }
    if filter.model_name.is_some_and(|m| m != session.model_name) {
        return false;
    }
    if filter
        .memory
        .is_some_and(|available| session.memory_requirement() > available)
    {
        return false;
    }
    if filter.reject.contains(&session.filter_model()) {
        return false;
    }
    if let Some(older) = filter.older {
        if session.age(now) <= older {
            return false;
        }
    }
    true
}

/// Whether an instance bound to `bound` can serve `session`.
///
/// Stricter than [`matches`]: the adapter must be exactly the bound one,
/// since an instance can never swap what it has loaded.
pub fn accepts_bound(bound: &SessionFilter, session: &Session) -> bool {
    bound.model_name == Some(session.model_name)
        && bound.mode == Some(session.mode)
        && bound.lora_dir == session.finetune_file
}

fn prefers_affinity(filter: &SessionFilter) -> bool {
    filter.model_name.is_some() || !filter.lora_dir.is_empty()
}

/// FIFO with filtering plus adapter affinity
#[derive(Debug, Default, Clone, Copy)]
pub struct AffinityMatchStrategy;

impl MatchStrategy for AffinityMatchStrategy {
    fn select(
        &self,
        candidates: &VecDeque<Session>,
        filter: &SessionFilter,
        now: DateTime<Utc>,
    ) -> Option<usize> {
        let mut first_eligible = None;
        for (idx, session) in candidates.iter().enumerate() {
            if !matches(session, filter, now) {
                continue;
            }
            if !prefers_affinity(filter) || session.finetune_file == filter.lora_dir {
                return Some(idx);
            }
            first_eligible.get_or_insert(idx);
        }
        first_eligible
    }
}
