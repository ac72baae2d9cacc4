use crate::context::QueryContext;
use crate::error::QueryError;
use crate::types::Timestamp;
use rayon::prelude::*;

/// Validates a half-open `[start, end)` query window.
pub(crate) fn check_time_range(start: Timestamp, end: Timestamp) -> Result<(), QueryError> {
    if start >= end {
        return Err(QueryError::InvalidTimeRange { start, end });
    }
    Ok(())
}

/// Runs `f` over the units `0..n` (blocks or row groups) and collects the results in
/// unit order.
///
/// The context is checked before each unit starts. The first error wins and the
/// remaining units are abandoned; in parallel mode rayon stops handing out new units
/// once one has failed.
pub(crate) fn fan_out<T, F>(
    ctx: &QueryContext,
    n: usize,
    parallel: bool,
    f: F,
) -> Result<Vec<T>, QueryError>
where
    T: Send,
    F: Fn(usize) -> Result<T, QueryError> + Sync + Send,
{
    let unit = |i: usize| {
        ctx.check()?;
        f(i)
    };
    if parallel && n > 1 {
        (0..n).into_par_iter().map(unit).collect()
    } else {
        (0..n).map(unit).collect()
    }
}
