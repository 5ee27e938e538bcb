//! Sparse coverage sums over inclusive integer intervals.
//!
//! Coverage is kept as change points rather than per-base arrays: an interval
//! `[s, e]` opens at `s` and closes at `e + 1`. Every query is a single left to
//! right scan that accumulates the running depth.

use crate::error::{ReadDbError, Result};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Change {
    opens: i32,
    closes: i32,
}

impl Change {
    fn delta(&self) -> i32 {
        self.opens - self.closes
    }

    fn is_empty(&self) -> bool {
        self.opens == 0 && self.closes == 0
    }
}

fn order(start: i32, end: i32) -> (i32, i32) {
    if start <= end {
        (start, end)
    } else {
        (end, start)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OverlapSum {
    changes: BTreeMap<i32, Change>,
}

impl OverlapSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_intervals<I: IntoIterator<Item = (i32, i32)>>(intervals: I) -> Self {
        let mut sum = Self::new();
        for (start, end) in intervals {
            sum.add_interval(start, end);
        }
        sum
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn add_interval(&mut self, start: i32, end: i32) {
        let (start, end) = order(start, end);
        self.changes.entry(start).or_default().opens += 1;
        self.changes.entry(end.saturating_add(1)).or_default().closes += 1;
    }

    /// Undo a previous `add_interval`. Removing an interval that was never
    /// added leaves the sum inconsistent, which the next scan reports.
    pub fn remove_interval(&mut self, start: i32, end: i32) {
        let (start, end) = order(start, end);
        self.bump(start, -1, 0);
        self.bump(end.saturating_add(1), 0, -1);
    }

    fn bump(&mut self, pos: i32, opens: i32, closes: i32) {
        let change = self.changes.entry(pos).or_default();
        change.opens += opens;
        change.closes += closes;
        if change.is_empty() {
            self.changes.remove(&pos);
        }
    }

    /// Fold another sum into this one.
    pub fn combine_with(&mut self, other: &OverlapSum) {
        for (&pos, change) in &other.changes {
            self.bump(pos, change.opens, change.closes);
        }
    }

    /// `(position, delta)` for every change point, in coordinate order.
    pub fn changes(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.changes
            .iter()
            .map(|(&pos, change)| (pos, change.delta()))
            .filter(|&(_, delta)| delta != 0)
    }

    /// Depth after each change point: `(position, depth from here on)`.
    pub fn steps(&self) -> Result<Vec<(i32, i32)>> {
        let mut steps = Vec::with_capacity(self.changes.len());
        let mut running = 0;
        for (&pos, change) in &self.changes {
            running += change.delta();
            check_depth(pos, running)?;
            steps.push((pos, running));
        }
        check_total(running)?;
        Ok(steps)
    }

    /// Depth at a single coordinate.
    pub fn depth_at(&self, pos: i32) -> Result<i32> {
        let mut running = 0;
        for (&p, change) in self.changes.range(..=pos) {
            running += change.delta();
            check_depth(p, running)?;
        }
        Ok(running)
    }

    pub fn max_overlap(&self) -> Result<i32> {
        let mut running = 0;
        let mut max = 0;
        for (&pos, change) in &self.changes {
            running += change.delta();
            check_depth(pos, running)?;
            max = max.max(running);
        }
        check_total(running)?;
        Ok(max)
    }

    /// Maximum depth restricted to `[start, end]`.
    pub fn max_overlap_in(&self, start: i32, end: i32) -> Result<i32> {
        let (start, end) = order(start, end);
        let mut running = self.depth_at(start)?;
        let mut max = running;
        if end == start {
            return Ok(max);
        }
        for (&pos, change) in self.changes.range(start + 1..=end) {
            running += change.delta();
            check_depth(pos, running)?;
            max = max.max(running);
        }
        Ok(max)
    }

    /// Number of intervals touching `[start, end]`: those still open at
    /// `start` plus those opening inside `(start, end]`.
    pub fn count_overlapping(&self, start: i32, end: i32) -> Result<i32> {
        let (start, end) = order(start, end);
        let open_at_start = self.depth_at(start)?;
        if end == start {
            return Ok(open_at_start);
        }
        let opened_inside: i32 = self
            .changes
            .range(start + 1..=end)
            .map(|(_, change)| change.opens)
            .sum();
        Ok(open_at_start + opened_inside)
    }

    /// Maximal inclusive sub-intervals where the depth is at least `threshold`.
    pub fn collect(&self, threshold: i32) -> Result<Vec<(i32, i32)>> {
        if threshold < 1 {
            return Err(ReadDbError::InvalidArgument(format!(
                "Overlap threshold must be at least 1, got {}",
                threshold
            )));
        }
        let mut regions = Vec::new();
        let mut running = 0;
        let mut open: Option<i32> = None;
        for (&pos, change) in &self.changes {
            let before = running;
            running += change.delta();
            check_depth(pos, running)?;
            if before < threshold && running >= threshold {
                open = Some(pos);
            } else if before >= threshold && running < threshold {
                if let Some(start) = open.take() {
                    regions.push((start, pos - 1));
                }
            }
        }
        check_total(running)?;
        Ok(regions)
    }

    /// True if some coordinate has depth of at least `threshold` in both sums.
    pub fn has_overlap(&self, other: &OverlapSum, threshold: i32) -> Result<bool> {
        let mut mine = self.changes.iter().peekable();
        let mut theirs = other.changes.iter().peekable();
        let (mut a, mut b) = (0, 0);
        loop {
            let pos = match (mine.peek().map(|e| *e.0), theirs.peek().map(|e| *e.0)) {
                (Some(p), Some(q)) => p.min(q),
                (Some(p), None) => p,
                (None, Some(q)) => q,
                (None, None) => return Ok(false),
            };
            if let Some((_, change)) = mine.next_if(|e| *e.0 == pos) {
                a += change.delta();
                check_depth(pos, a)?;
            }
            if let Some((_, change)) = theirs.next_if(|e| *e.0 == pos) {
                b += change.delta();
                check_depth(pos, b)?;
            }
            if a >= threshold && b >= threshold {
                return Ok(true);
            }
        }
    }
}

fn check_depth(pos: i32, depth: i32) -> Result<()> {
    if depth < 0 {
        return Err(ReadDbError::Invariant(format!(
            "coverage depth {} at position {} is negative",
            depth, pos
        )));
    }
    Ok(())
}

fn check_total(total: i32) -> Result<()> {
    if total != 0 {
        return Err(ReadDbError::Invariant(format!(
            "change points sum to {} instead of 0",
            total
        )));
    }
    Ok(())
}

const WEIGHT_EPSILON: f64 = 1e-6;

/// Weighted variant of [`OverlapSum`]: each interval carries a fractional
/// weight (1 / multiplicity for multi-mapped reads).
#[derive(Debug, Clone, Default)]
pub struct WeightedOverlapSum {
    changes: BTreeMap<i32, f64>,
    added: f64,
}

impl WeightedOverlapSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interval(&mut self, start: i32, end: i32, weight: f64) {
        let (start, end) = order(start, end);
        *self.changes.entry(start).or_default() += weight;
        *self.changes.entry(end.saturating_add(1)).or_default() -= weight;
        self.added += weight.abs();
    }

    pub fn combine_with(&mut self, other: &WeightedOverlapSum) {
        for (&pos, &delta) in &other.changes {
            *self.changes.entry(pos).or_default() += delta;
        }
        self.added += other.added;
    }

    fn tolerance(&self) -> f64 {
        WEIGHT_EPSILON * self.added.max(1.0)
    }

    fn check(&self, pos: i32, running: f64) -> Result<()> {
        if running < -self.tolerance() {
            return Err(ReadDbError::Invariant(format!(
                "weighted coverage {} at position {} is negative",
                running, pos
            )));
        }
        Ok(())
    }

    fn check_total(&self, total: f64) -> Result<()> {
        if total.abs() > self.tolerance() {
            return Err(ReadDbError::Invariant(format!(
                "weighted change points sum to {} instead of 0",
                total
            )));
        }
        Ok(())
    }

    pub fn steps(&self) -> Result<Vec<(i32, f64)>> {
        let mut steps = Vec::with_capacity(self.changes.len());
        let mut running = 0.0;
        for (&pos, &delta) in &self.changes {
            running += delta;
            self.check(pos, running)?;
            steps.push((pos, running.max(0.0)));
        }
        self.check_total(running)?;
        Ok(steps)
    }

    pub fn max_overlap(&self) -> Result<f64> {
        Ok(self
            .steps()?
            .into_iter()
            .map(|(_, depth)| depth)
            .fold(0.0, f64::max))
    }

    pub fn collect(&self, threshold: f64) -> Result<Vec<(i32, i32)>> {
        if threshold <= 0.0 {
            return Err(ReadDbError::InvalidArgument(format!(
                "Weighted overlap threshold must be positive, got {}",
                threshold
            )));
        }
        let mut regions = Vec::new();
        let mut open: Option<i32> = None;
        let mut before = 0.0;
        for (pos, depth) in self.steps()? {
            let above = depth + WEIGHT_EPSILON >= threshold;
            let was_above = before + WEIGHT_EPSILON >= threshold;
            if !was_above && above {
                open = Some(pos);
            } else if was_above && !above {
                if let Some(start) = open.take() {
                    regions.push((start, pos - 1));
                }
            }
            before = depth;
        }
        Ok(regions)
    }
}
