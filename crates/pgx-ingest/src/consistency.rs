//! Record count reconciliation
//!
//! Compares the raw line count of the annotated file against the records the
//! parser accounted for. Silent partial inserts (a crash in the middle of a
//! bulk insert, a truncated parse) only show up here.

/// What one subject accounted for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubjectTally {
    /// Records found in the subject's collection
    pub inserted: u64,
    /// Lines the parser deliberately skipped for this subject
    pub ignored: u64,
    /// Share of the raw lines this subject is expected to account for
    pub expected: Option<u64>,
}

impl SubjectTally {
    pub fn new(inserted: u64, ignored: u64) -> Self {
        Self {
            inserted,
            ignored,
            expected: None,
        }
    }

    pub fn with_expected(mut self, expected: u64) -> Self {
        self.expected = Some(expected);
        self
    }

    pub fn accounted(&self) -> u64 {
        self.inserted.saturating_add(self.ignored)
    }
}

/// Outcome of a reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Mismatch {
        /// Index of the first subject whose count diverges from its allocation
        subject_index: usize,
        /// Lines allocated to that subject
        allocated: u64,
        /// Lines that subject actually accounted for
        accounted: u64,
        /// Sum over all subjects
        total_accounted: u64,
    },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Reconcile `raw_line_count` against per-subject tallies.
///
/// Passes iff `raw_line_count == Σ(inserted + ignored)`. On failure the
/// blamed subject is the first one whose own count differs from its
/// allocation: its `expected` share when known, otherwise an even split of
/// whatever the explicit shares leave over.
pub fn check(raw_line_count: u64, tallies: &[SubjectTally]) -> Verdict {
    let total_accounted = saturating_sum(tallies.iter().map(SubjectTally::accounted));
    if total_accounted == raw_line_count {
        return Verdict::Pass;
    }

    let allocations = allocate(raw_line_count, tallies);
    let blamed = tallies
        .iter()
        .zip(&allocations)
        .position(|(tally, allocated)| tally.accounted() != *allocated)
        .unwrap_or_else(|| tallies.len().saturating_sub(1));

    Verdict::Mismatch {
        subject_index: blamed,
        allocated: allocations.get(blamed).copied().unwrap_or(raw_line_count),
        accounted: tallies.get(blamed).map(SubjectTally::accounted).unwrap_or(0),
        total_accounted,
    }
}

/// Sum that clamps at `u64::MAX`
fn saturating_sum(values: impl Iterator<Item = u64>) -> u64 {
    values.fold(0, u64::saturating_add)
}

/// Per-subject share of the raw lines
fn allocate(raw_line_count: u64, tallies: &[SubjectTally]) -> Vec<u64> {
    let explicit = saturating_sum(tallies.iter().filter_map(|t| t.expected));
    let implicit = tallies.iter().filter(|t| t.expected.is_none()).count() as u64;
    let remaining = raw_line_count.saturating_sub(explicit);

    let (base, mut extra) = if implicit == 0 {
        (0, 0)
    } else {
        (remaining / implicit, remaining % implicit)
    };

    tallies
        .iter()
        .map(|tally| match tally.expected {
            Some(expected) => expected,
            None => {
                let share = base + u64::from(extra > 0);
                extra = extra.saturating_sub(1);
                share
            },
        })
        .collect()
}
