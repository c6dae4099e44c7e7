use std::collections::BTreeSet;

use anyhow::Result;

use crate::opcodes::*;

/// Outcome of a conditional branch over every possible operand value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BranchResult {
    AlwaysTaken,
    NeverTaken,
    Unknown,
}

impl BranchResult {
    fn from_counts(taken: usize, not_taken: usize) -> BranchResult {
        match (taken, not_taken) {
            (_, 0) => BranchResult::AlwaysTaken,
            (0, _) => BranchResult::NeverTaken,
            _ => BranchResult::Unknown,
        }
    }
}

/// Evaluate `ifeq` .. `ifle` for each value in `values`.
pub(crate) fn evaluate_unary(opcode: u8, values: &BTreeSet<i32>) -> Result<BranchResult> {
    if values.is_empty() {
        anyhow::bail!("branch operand has no possible values");
    }
    let mut taken = 0;
    for value in values {
        let outcome = match opcode {
            IFEQ => *value == 0,
            IFNE => *value != 0,
            IFLT => *value < 0,
            IFGE => *value >= 0,
            IFGT => *value > 0,
            IFLE => *value <= 0,
            _ => anyhow::bail!("opcode 0x{opcode:02x} is not a unary int branch"),
        };
        taken += usize::from(outcome);
    }
    Ok(BranchResult::from_counts(taken, values.len() - taken))
}

/// Evaluate `if_icmpeq` .. `if_icmple` over the Cartesian product of operands.
pub(crate) fn evaluate_binary(
    opcode: u8,
    values1: &BTreeSet<i32>,
    values2: &BTreeSet<i32>,
) -> Result<BranchResult> {
    if values1.is_empty() || values2.is_empty() {
        anyhow::bail!("branch operand has no possible values");
    }
    let mut taken = 0;
    for value1 in values1 {
        for value2 in values2 {
            let outcome = match opcode {
                IF_ICMPEQ => value1 == value2,
                IF_ICMPNE => value1 != value2,
                IF_ICMPLT => value1 < value2,
                IF_ICMPGE => value1 >= value2,
                IF_ICMPGT => value1 > value2,
                IF_ICMPLE => value1 <= value2,
                _ => anyhow::bail!("opcode 0x{opcode:02x} is not a binary int branch"),
            };
            taken += usize::from(outcome);
        }
    }
    let total = values1.len() * values2.len();
    Ok(BranchResult::from_counts(taken, total - taken))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[i32]) -> BTreeSet<i32> {
        values.iter().copied().collect()
    }

    #[test]
    fn unary_branches_fold_when_all_values_agree() {
        assert_eq!(
            evaluate_unary(IFEQ, &set(&[0])).expect("eval"),
            BranchResult::AlwaysTaken
        );
        assert_eq!(
            evaluate_unary(IFEQ, &set(&[1, 2])).expect("eval"),
            BranchResult::NeverTaken
        );
        assert_eq!(
            evaluate_unary(IFLT, &set(&[-1, 1])).expect("eval"),
            BranchResult::Unknown
        );
        assert!(evaluate_unary(IFEQ, &BTreeSet::new()).is_err());
        assert!(evaluate_unary(GOTO, &set(&[0])).is_err());
    }

    #[test]
    fn binary_branches_use_every_pair() {
        assert_eq!(
            evaluate_binary(IF_ICMPLT, &set(&[1, 2]), &set(&[3, 4])).expect("eval"),
            BranchResult::AlwaysTaken
        );
        assert_eq!(
            evaluate_binary(IF_ICMPEQ, &set(&[1, 2]), &set(&[3])).expect("eval"),
            BranchResult::NeverTaken
        );
        assert_eq!(
            evaluate_binary(IF_ICMPEQ, &set(&[3, 4]), &set(&[3])).expect("eval"),
            BranchResult::Unknown
        );
    }
}
