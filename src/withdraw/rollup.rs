//! Status rollup (spec §4.5): one pure function over the four sub-statuses
//! plus `fallback_transferred`. Callers mutate sub-statuses via CAS and
//! then apply this function in the same transaction — the rollup itself
//! never touches the database.

use crate::db::models::{ExecuteStatus, HookStatus, PayoutStatus, ProofStatus, WithdrawStatus};

/// `previous` only feeds the table's final "otherwise unchanged" row; every
/// other row is decided purely from the sub-statuses and `fallback_transferred`.
pub fn rollup_status(
    proof: ProofStatus,
    execute: ExecuteStatus,
    payout: PayoutStatus,
    hook: HookStatus,
    fallback_transferred: bool,
    user_cancelled: bool,
    previous: WithdrawStatus,
) -> WithdrawStatus {
    use ExecuteStatus::*;
    use HookStatus::*;
    use PayoutStatus::*;
    use ProofStatus::*;
    use WithdrawStatus::*;

    if user_cancelled {
        return Cancelled;
    }
    if proof == Pending && execute == ExecuteStatus::Pending {
        return Created;
    }
    if proof == InProgress {
        return Proving;
    }
    if proof == Failed && execute == ExecuteStatus::Pending {
        return ProofFailed;
    }
    if proof == Completed && execute == ExecuteStatus::Pending {
        return ProofGenerated;
    }
    if execute == VerifyFailed {
        return FailedPermanent;
    }
    if execute == SubmitFailed {
        return WithdrawStatus::SubmitFailed;
    }
    if execute == Submitted {
        return Submitting;
    }
    if execute == Success && payout == PayoutStatus::Pending {
        return WaitingForPayout;
    }
    if payout == Processing {
        return PayoutProcessing;
    }
    if payout == Failed {
        return FailedPermanent;
    }
    if payout == Completed && matches!(hook, NotRequired | HookStatus::Completed) {
        return WithdrawStatus::Completed;
    }
    if payout == Completed && hook == HookStatus::Processing {
        return HookProcessing;
    }
    if payout == Completed && hook == HookStatus::Failed && fallback_transferred {
        return WithdrawStatus::Completed;
    }
    if payout == Completed && hook == HookStatus::Failed && !fallback_transferred {
        return FailedPermanent;
    }
    if payout == Completed && hook == Abandoned {
        return CompletedWithHookFailed;
    }

    previous
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> (ProofStatus, ExecuteStatus, PayoutStatus, HookStatus) {
        (ProofStatus::Pending, ExecuteStatus::Pending, PayoutStatus::Pending, HookStatus::NotRequired)
    }

    #[test]
    fn user_cancelled_always_wins() {
        assert_eq!(
            rollup_status(
                ProofStatus::Completed,
                ExecuteStatus::Success,
                PayoutStatus::Completed,
                HookStatus::Completed,
                false,
                true,
                WithdrawStatus::Created,
            ),
            WithdrawStatus::Cancelled
        );
    }

    #[test]
    fn created_when_nothing_started() {
        let (p, e, pay, h) = base();
        assert_eq!(
            rollup_status(p, e, pay, h, false, false, WithdrawStatus::Created),
            WithdrawStatus::Created
        );
    }

    #[test]
    fn proving_while_proof_in_progress() {
        assert_eq!(
            rollup_status(
                ProofStatus::InProgress,
                ExecuteStatus::Pending,
                PayoutStatus::Pending,
                HookStatus::NotRequired,
                false,
                false,
                WithdrawStatus::Created,
            ),
            WithdrawStatus::Proving
        );
    }

    #[test]
    fn verify_failed_is_failed_permanent_regardless_of_proof() {
        assert_eq!(
            rollup_status(
                ProofStatus::Completed,
                ExecuteStatus::VerifyFailed,
                PayoutStatus::Pending,
                HookStatus::NotRequired,
                false,
                false,
                WithdrawStatus::ProofGenerated,
            ),
            WithdrawStatus::FailedPermanent
        );
    }

    #[test]
    fn completed_with_hook_failed_but_fallback_succeeded_is_completed() {
        assert_eq!(
            rollup_status(
                ProofStatus::Completed,
                ExecuteStatus::Success,
                PayoutStatus::Completed,
                HookStatus::Failed,
                true,
                false,
                WithdrawStatus::HookProcessing,
            ),
            WithdrawStatus::Completed
        );
    }

    #[test]
    fn completed_with_hook_failed_no_fallback_is_failed_permanent() {
        assert_eq!(
            rollup_status(
                ProofStatus::Completed,
                ExecuteStatus::Success,
                PayoutStatus::Completed,
                HookStatus::Failed,
                false,
                false,
                WithdrawStatus::HookProcessing,
            ),
            WithdrawStatus::FailedPermanent
        );
    }

    #[test]
    fn abandoned_hook_is_completed_with_hook_failed() {
        assert_eq!(
            rollup_status(
                ProofStatus::Completed,
                ExecuteStatus::Success,
                PayoutStatus::Completed,
                HookStatus::Abandoned,
                false,
                false,
                WithdrawStatus::HookProcessing,
            ),
            WithdrawStatus::CompletedWithHookFailed
        );
    }

    #[test]
    fn payout_failed_is_failed_permanent() {
        assert_eq!(
            rollup_status(
                ProofStatus::Completed,
                ExecuteStatus::Success,
                PayoutStatus::Failed,
                HookStatus::NotRequired,
                false,
                false,
                WithdrawStatus::PayoutProcessing,
            ),
            WithdrawStatus::FailedPermanent
        );
    }

    #[test]
    fn exhaustive_cross_product_never_panics_and_is_deterministic() {
        let proofs = [ProofStatus::Pending, ProofStatus::InProgress, ProofStatus::Completed, ProofStatus::Failed];
        let executes = [
            ExecuteStatus::Pending,
            ExecuteStatus::Submitted,
            ExecuteStatus::Success,
            ExecuteStatus::SubmitFailed,
            ExecuteStatus::VerifyFailed,
        ];
        let payouts = [PayoutStatus::Pending, PayoutStatus::Processing, PayoutStatus::Completed, PayoutStatus::Failed];
        let hooks = [
            HookStatus::NotRequired,
            HookStatus::Pending,
            HookStatus::Processing,
            HookStatus::Completed,
            HookStatus::Failed,
            HookStatus::Abandoned,
        ];
        for &p in &proofs {
            for &e in &executes {
                for &pay in &payouts {
                    for &h in &hooks {
                        for &fb in &[false, true] {
                            let a = rollup_status(p, e, pay, h, fb, false, WithdrawStatus::Created);
                            let b = rollup_status(p, e, pay, h, fb, false, WithdrawStatus::Created);
                            assert_eq!(a, b);
                        }
                    }
                }
            }
        }
    }
}
