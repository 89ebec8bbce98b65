//! Candidate pairs and the per-pair check schedule.

use std::time::{Duration, Instant};

use crate::stun::TransactionId;

/// RFC 5389 §7.2.1 retransmission parameters: RTO doubles per transmit, at
/// most 7 transmits, and the transaction fails 16·RTO after the last one.
/// With the 500 ms initial RTO that gives up 39.5 s after the first send.
pub const INITIAL_RTO: Duration = Duration::from_millis(500);
pub const MAX_TRANSMITS: u32 = 7;
const FINAL_WAIT: Duration = Duration::from_secs(8);

/// Delay between transmit `count` and the next one.
fn resend_delay(count: u32) -> Duration {
    INITIAL_RTO * 2u32.pow(count.saturating_sub(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

/// One local/remote pairing on the checklist.
#[derive(Debug)]
pub struct CandidatePair {
    pub local_idx: usize,
    pub remote_idx: usize,
    pub priority: u64,
    pub state: CheckState,
    /// Confirmed as the pair that carries data.
    pub nominated: bool,
    /// We are the controlling side and our next check on this pair carries
    /// USE-CANDIDATE.
    pub nominating: bool,
    /// The controlled side saw USE-CANDIDATE before the pair succeeded.
    pub remote_nominated: bool,
    /// Index of the local candidate of the valid pair this check produced
    /// (either an existing candidate matching the mapped address or a
    /// synthesized peer-reflexive one).
    pub valid_idx: Option<usize>,

    trans_id: Option<TransactionId>,
    check_use_candidate: bool,
    transmit_count: u32,
    first_sent_at: Option<Instant>,
    last_sent_at: Option<Instant>,
}

impl CandidatePair {
    pub fn new(local_idx: usize, remote_idx: usize, priority: u64) -> Self {
        CandidatePair {
            local_idx,
            remote_idx,
            priority,
            state: CheckState::Frozen,
            nominated: false,
            nominating: false,
            remote_nominated: false,
            valid_idx: None,
            trans_id: None,
            check_use_candidate: false,
            transmit_count: 0,
            first_sent_at: None,
            last_sent_at: None,
        }
    }

    /// RFC 5245 §5.7.2: `2^32·min(G,D) + 2·max(G,D) + (G>D ? 1 : 0)` where G
    /// is the controlling side's candidate priority and D the controlled
    /// side's.
    pub fn calculate_priority(controlling: bool, local_prio: u32, remote_prio: u32) -> u64 {
        let (g, d) = if controlling {
            (local_prio as u64, remote_prio as u64)
        } else {
            (remote_prio as u64, local_prio as u64)
        };
        (1u64 << 32) * g.min(d) + 2 * g.max(d) + u64::from(g > d)
    }

    /// Starts a fresh check round: new transaction id, transmit count 1.
    pub fn begin_check(&mut self, now: Instant, use_candidate: bool) -> TransactionId {
        let id = TransactionId::new();
        self.trans_id = Some(id);
        self.check_use_candidate = use_candidate;
        self.transmit_count = 1;
        self.first_sent_at = Some(now);
        self.last_sent_at = Some(now);
        self.state = CheckState::InProgress;
        id
    }

    /// Whether the current check round should be retransmitted now.
    /// Retransmits reuse the transaction id of the round.
    pub fn retransmit_due(&self, now: Instant) -> bool {
        if self.state != CheckState::InProgress || self.transmit_count >= MAX_TRANSMITS {
            return false;
        }
        match self.last_sent_at {
            Some(last) => now.duration_since(last) >= resend_delay(self.transmit_count),
            None => false,
        }
    }

    pub fn record_retransmit(&mut self, now: Instant) -> Option<TransactionId> {
        self.transmit_count += 1;
        self.last_sent_at = Some(now);
        self.trans_id
    }

    pub fn use_candidate(&self) -> bool {
        self.check_use_candidate
    }

    /// Whether the check round has exhausted its retransmits and grace
    /// period.
    pub fn timed_out(&self, now: Instant) -> bool {
        if self.state != CheckState::InProgress || self.transmit_count < MAX_TRANSMITS {
            return false;
        }
        match self.last_sent_at {
            Some(last) => now.duration_since(last) >= FINAL_WAIT,
            None => false,
        }
    }

    pub fn matches(&self, id: TransactionId) -> bool {
        self.trans_id == Some(id)
    }

    /// Ends the current round so duplicate responses no longer match.
    pub fn finish_round(&mut self) {
        self.trans_id = None;
    }

    /// Returns the pair to `Waiting` for a new round (role conflict retry, or
    /// a triggered re-check of a failed pair).
    pub fn reset_for_retry(&mut self) {
        self.state = CheckState::Waiting;
        self.trans_id = None;
        self.check_use_candidate = false;
        self.transmit_count = 0;
        self.first_sent_at = None;
        self.last_sent_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_priority_formula() {
        // Invariant: with the controlling side's priority G and the
        // controlled side's D the pair priority is
        // 2^32·min + 2·max + (G>D ? 1 : 0), so both sides order their
        // checklists identically.
        let g = 2_130_706_431u32;
        let d = 1_694_498_815u32;

        let controlling = CandidatePair::calculate_priority(true, g, d);
        let controlled = CandidatePair::calculate_priority(false, d, g);

        assert_eq!(controlling, controlled);
        assert_eq!(
            controlling,
            (1u64 << 32) * (d as u64) + 2 * (g as u64) + 1
        );

        // Mirror the roles: G < D now, losing the tiebreak bit.
        let swapped = CandidatePair::calculate_priority(true, d, g);
        assert_eq!(swapped, (1u64 << 32) * (d as u64) + 2 * (g as u64));
    }

    #[test]
    fn retransmit_schedule_doubles_and_caps() {
        let start = Instant::now();
        let mut pair = CandidatePair::new(0, 0, 1);
        let id = pair.begin_check(start, false);

        // Not due before the initial RTO.
        assert!(!pair.retransmit_due(start + Duration::from_millis(499)));
        assert!(pair.retransmit_due(start + Duration::from_millis(500)));

        // Walk the whole schedule: sends at 0, 0.5, 1.5, 3.5, 7.5, 15.5
        // and 31.5 seconds.
        let mut at = start;
        let mut offsets = vec![Duration::ZERO];
        while pair.transmit_count < MAX_TRANSMITS {
            at += resend_delay(pair.transmit_count);
            assert!(pair.retransmit_due(at));
            assert_eq!(pair.record_retransmit(at), Some(id));
            offsets.push(at.duration_since(start));
        }

        assert_eq!(
            offsets,
            [0.0f64, 0.5, 1.5, 3.5, 7.5, 15.5, 31.5]
                .map(Duration::from_secs_f64)
                .to_vec()
        );

        // No eighth transmit; the round times out 8 s after the last send,
        // 39.5 s in.
        assert!(!pair.retransmit_due(at + Duration::from_secs(60)));
        assert!(!pair.timed_out(at + Duration::from_millis(7999)));
        assert!(pair.timed_out(at + Duration::from_secs(8)));
    }

    #[test]
    fn new_round_gets_a_new_transaction_id() {
        let start = Instant::now();
        let mut pair = CandidatePair::new(0, 0, 1);

        let first = pair.begin_check(start, false);
        pair.reset_for_retry();
        assert_eq!(pair.state, CheckState::Waiting);
        assert!(!pair.matches(first));

        let second = pair.begin_check(start + Duration::from_secs(1), true);
        assert!(pair.matches(second));
        assert!(pair.use_candidate());
    }
}
