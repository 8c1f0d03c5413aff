//! Nonce assignment (spec §4.6 step 2): `next = max(chain, table) + 1`,
//! computed under the row lock `claim_one_pending_transaction` already
//! holds, so concurrent claimers on the same lane can't collide.

/// `chain_nonce` is the chain's own confirmed-nonce (what it would hand out
/// next); `highest_assigned` is the largest nonce this queue has already
/// put on an in-flight row for the lane, if any.
pub fn next_nonce(chain_nonce: u64, highest_assigned: Option<u64>) -> u64 {
    match highest_assigned {
        Some(h) if h.saturating_add(1) > chain_nonce => h + 1,
        _ => chain_nonce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_chain_nonce_when_nothing_assigned_yet() {
        assert_eq!(next_nonce(5, None), 5);
    }

    #[test]
    fn continues_past_chain_nonce_when_a_lane_tx_is_still_in_flight() {
        // W_A submitted at nonce 5, chain hasn't confirmed it yet, so the
        // chain's own count still reads 5. W_B must get 6, not collide.
        assert_eq!(next_nonce(5, Some(5)), 6);
    }

    #[test]
    fn falls_back_to_chain_nonce_once_it_catches_up() {
        // Chain confirmed everything the table knew about; chain wins.
        assert_eq!(next_nonce(7, Some(4)), 7);
    }

    #[test]
    fn never_goes_backwards_across_repeated_calls() {
        let chain = 10u64; // chain confirms lazily, lagging behind assignment
        let mut highest = None;
        let mut assigned = Vec::new();
        for _ in 0..5 {
            let n = next_nonce(chain, highest);
            assigned.push(n);
            highest = Some(n);
        }
        for pair in assigned.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }
}
