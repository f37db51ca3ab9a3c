use std::ops::{Add, AddAssign};

use crate::types::{GroupOutput, GroupStatus};

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProgressRecord {
    pub groups: usize,
    pub resolved: usize,
    pub failed: usize,
    pub surviving_combinations: usize,
    pub rounds: usize,
}

impl From<&GroupOutput> for ProgressRecord {
    fn from(value: &GroupOutput) -> Self {
        let resolved = matches!(value.status, GroupStatus::Resolved);
        Self {
            groups: 1,
            resolved: resolved as usize,
            failed: (!resolved) as usize,
            surviving_combinations: value.intensities.len(),
            rounds: value.rounds.len(),
        }
    }
}

impl Add for ProgressRecord {
    type Output = ProgressRecord;

    fn add(self, rhs: Self) -> Self::Output {
        let mut dup = self;
        dup += rhs;
        dup
    }
}

impl AddAssign for ProgressRecord {
    fn add_assign(&mut self, rhs: Self) {
        self.groups += rhs.groups;
        self.resolved += rhs.resolved;
        self.failed += rhs.failed;
        self.surviving_combinations += rhs.surviving_combinations;
        self.rounds += rhs.rounds;
    }
}
