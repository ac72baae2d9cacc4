//! Row-group filter.
//!
//! Turns a bound constraint set into the exact set of matching rows of one row group.
//! Row groups are first tested against column statistics and dictionaries, which can
//! eliminate the whole group without a page read. Surviving groups are scanned
//! constraint by constraint in cost order, each scan reading only the rows still
//! selected by the previous ones.

use crate::columnar::{all_rows, ColumnStatistics, RowGroupReader, RowSet};
use crate::constraint::{Constraint, Predicate};
use crate::context::QueryContext;
use crate::error::{ColumnarError, QueryError};
use crate::schema::{Binding, BoundConstraintSet};
use crate::telemetry::{query_metrics, PruneReason, QueryEvent, QueryEventListener};

/// Filters row groups of one block against a shared, immutable constraint set.
#[derive(Debug, Clone, Copy)]
pub struct RowGroupFilter<'a> {
    constraints: &'a BoundConstraintSet,
    listener: &'a dyn QueryEventListener,
}

impl<'a> RowGroupFilter<'a> {
    pub fn new(constraints: &'a BoundConstraintSet, listener: &'a dyn QueryEventListener) -> Self {
        Self {
            constraints,
            listener,
        }
    }

    /// Returns exactly the rows of `rg` that satisfy every constraint.
    pub fn filter(
        &self,
        ctx: &QueryContext,
        row_group: usize,
        rg: &dyn RowGroupReader,
    ) -> Result<RowSet, QueryError> {
        let num_rows = rg.num_rows();
        if num_rows == 0 || self.constraints.is_unsatisfiable() {
            return Ok(RowSet::new());
        }
        let wrap = |source: ColumnarError| QueryError::Filter { row_group, source };

        for bound in self.constraints.iter() {
            let Binding::Column(column) = bound.binding else {
                continue;
            };
            if let Some(reason) = prune(&bound.constraint, rg, column, num_rows).map_err(wrap)? {
                query_metrics::record_row_group_pruned();
                self.listener.on_event(QueryEvent::RowGroupPruned {
                    row_group,
                    label: bound.constraint.label.clone(),
                    reason,
                });
                return Ok(RowSet::new());
            }
        }

        let mut candidates = all_rows(num_rows);
        let mut scanned = false;
        for bound in self.constraints.iter() {
            let Binding::Column(column) = bound.binding else {
                continue;
            };
            if candidates.is_empty() {
                break;
            }
            ctx.check()?;
            let values = rg.read_utf8(column, &candidates).map_err(wrap)?;
            if values.len() as u64 != candidates.len() {
                return Err(wrap(ColumnarError::Corrupt(format!(
                    "column {} returned {} values for {} rows",
                    column,
                    values.len(),
                    candidates.len()
                ))));
            }
            scanned = true;
            candidates = candidates
                .iter()
                .zip(values.iter())
                .filter(|(_, v)| bound.constraint.matches(v.as_deref().unwrap_or("")))
                .map(|(row, _)| row)
                .collect();
        }
        if scanned {
            query_metrics::record_row_group_scanned();
        }
        Ok(candidates)
    }
}

/// Metadata-only test: `Some(reason)` when no row of the group can satisfy `c`.
///
/// Null cells decode to `""`, so a predicate accepting `""` can only be pruned when
/// statistics prove the column holds no nulls.
fn prune(
    c: &Constraint,
    rg: &dyn RowGroupReader,
    column: usize,
    num_rows: u32,
) -> Result<Option<PruneReason>, ColumnarError> {
    if matches!(c.predicate, Predicate::Regex(_)) {
        return Ok(None);
    }
    let stats = rg.statistics(column)?;
    let all_null = stats.as_ref().is_some_and(|s| s.null_count == num_rows);
    let no_nulls = stats.as_ref().is_some_and(|s| s.null_count == 0);

    match (&c.predicate, c.negated) {
        (Predicate::Present, false) if all_null => Ok(Some(PruneReason::AllNull)),
        (Predicate::Present, true) | (Predicate::Equal(_), false) if c.matches("") => {
            // Only the empty value matches.
            let empty_stored = stats.as_ref().map_or(true, |s| s.may_contain(""));
            if no_nulls && !empty_stored {
                Ok(Some(PruneReason::NoNulls))
            } else {
                Ok(None)
            }
        }
        (Predicate::Equal(v), false) => {
            if all_null {
                return Ok(Some(PruneReason::AllNull));
            }
            value_absent(rg, column, stats.as_ref(), v)
        }
        (Predicate::In(set), false) => {
            if set.contains("") && !no_nulls {
                return Ok(None);
            }
            if all_null && !set.contains("") {
                return Ok(Some(PruneReason::AllNull));
            }
            let mut reason = PruneReason::Statistics;
            for v in set {
                match value_absent(rg, column, stats.as_ref(), v)? {
                    None => return Ok(None),
                    Some(PruneReason::Dictionary) => reason = PruneReason::Dictionary,
                    Some(_) => {}
                }
            }
            Ok(Some(reason))
        }
        (Predicate::Equal(v), true) => {
            // Every row holds exactly `v`.
            let constant = stats.as_ref().is_some_and(|s| {
                s.null_count == 0
                    && s.min.as_deref() == Some(v.as_str())
                    && s.max.as_deref() == Some(v.as_str())
            });
            Ok(constant.then_some(PruneReason::Statistics))
        }
        _ => Ok(None),
    }
}

/// `Some(reason)` when `value` provably does not occur as a stored value.
fn value_absent(
    rg: &dyn RowGroupReader,
    column: usize,
    stats: Option<&ColumnStatistics>,
    value: &str,
) -> Result<Option<PruneReason>, ColumnarError> {
    if stats.is_some_and(|s| !s.may_contain(value)) {
        return Ok(Some(PruneReason::Statistics));
    }
    match rg.dictionary(column)? {
        Some(dict) if !dict.iter().any(|d| d == value) => Ok(Some(PruneReason::Dictionary)),
        _ => Ok(None),
    }
}
