//! Reduction of candidate couples to an executable set.
//!
//! A correlation query may pair one message with several waiting events and
//! one waiting event with several messages. Within a single pass each message
//! fires at most once, and each single-use waiting event is consumed at most
//! once. Reusable kinds (start events by default) may absorb any number of
//! distinct messages in the same pass.

use std::collections::HashSet;

use super::types::{MessageEventCouple, WaitingEventKind};

/// Classification of waiting-event kinds that survive being coupled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupPolicy {
    reusable: HashSet<WaitingEventKind>,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self::new([WaitingEventKind::StartEvent])
    }
}

impl DedupPolicy {
    pub fn new(reusable: impl IntoIterator<Item = WaitingEventKind>) -> Self {
        Self {
            reusable: reusable.into_iter().collect(),
        }
    }

    pub fn is_reusable(&self, kind: WaitingEventKind) -> bool {
        self.reusable.contains(&kind)
    }

    /// Keep the first couple for each message, and the first couple for each
    /// single-use waiting event, in input order.
    pub fn unique_couples(&self, candidates: &[MessageEventCouple]) -> Vec<MessageEventCouple> {
        let mut taken_messages = HashSet::with_capacity(candidates.len());
        let mut taken_waitings = HashSet::with_capacity(candidates.len());
        let mut unique = Vec::with_capacity(candidates.len());

        for couple in candidates {
            if taken_messages.contains(&couple.message_instance_id)
                || taken_waitings.contains(&couple.waiting_message_id)
            {
                continue;
            }
            taken_messages.insert(couple.message_instance_id);
            if !self.is_reusable(couple.waiting_message_event_kind) {
                taken_waitings.insert(couple.waiting_message_id);
            }
            unique.push(*couple);
        }

        unique
    }
}
