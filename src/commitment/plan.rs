//! Allocation plan construction (spec §4.4): the caller's requested amounts
//! drive every allocation but the last, which is back-computed from the
//! checkbook's `allocatable_amount` so the sum is wei-exact by
//! construction instead of by checking the caller's arithmetic.

use crate::db::models::Wei;
use crate::error::DomainError;

pub fn build_allocation_plan(allocatable_amount: Wei, requested_amounts: &[Wei]) -> Result<Vec<Wei>, DomainError> {
    if requested_amounts.is_empty() {
        return Err(DomainError::Invalid("allocation plan must name at least one allocation".into()));
    }
    let (head, _) = requested_amounts.split_at(requested_amounts.len() - 1);
    let head_sum: Wei = head.iter().copied().sum();
    if head_sum.0 > allocatable_amount.0 {
        return Err(DomainError::Invalid(format!(
            "allocation plan's first {} amounts ({head_sum}) exceed allocatable amount {allocatable_amount}",
            head.len()
        )));
    }
    let mut plan = head.to_vec();
    plan.push(Wei(allocatable_amount.0 - head_sum.0));
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_allocation_takes_the_full_amount() {
        let plan = build_allocation_plan(Wei::from_str("100").unwrap(), &[Wei::from_str("1").unwrap()]).unwrap();
        assert_eq!(plan, vec![Wei::from_str("100").unwrap()]);
    }

    #[test]
    fn last_allocation_is_back_computed_not_taken_literally() {
        let requested = vec![Wei::from_str("30").unwrap(), Wei::from_str("999").unwrap()];
        let plan = build_allocation_plan(Wei::from_str("100").unwrap(), &requested).unwrap();
        assert_eq!(plan, vec![Wei::from_str("30").unwrap(), Wei::from_str("70").unwrap()]);
    }

    #[test]
    fn plan_sums_to_allocatable_amount_exactly() {
        let requested = vec![
            Wei::from_str("33.33").unwrap(),
            Wei::from_str("33.33").unwrap(),
            Wei::from_str("0").unwrap(),
        ];
        let plan = build_allocation_plan(Wei::from_str("100").unwrap(), &requested).unwrap();
        let sum: Wei = plan.into_iter().sum();
        assert_eq!(sum, Wei::from_str("100").unwrap());
    }

    #[test]
    fn rejects_empty_plan() {
        assert!(build_allocation_plan(Wei::ZERO, &[]).is_err());
    }

    #[test]
    fn rejects_head_amounts_exceeding_allocatable() {
        let requested = vec![Wei::from_str("150").unwrap(), Wei::from_str("1").unwrap()];
        assert!(build_allocation_plan(Wei::from_str("100").unwrap(), &requested).is_err());
    }
}
