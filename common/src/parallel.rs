//! Concurrency-limited parallel iteration utilities.
//!
//! Wraps rayon's `par_iter` to process items in parallel while limiting
//! the number of items in flight at once (e.g. to cap memory or IO pressure).

use rayon::prelude::*;

/// Maps `f` over `items` in parallel, with at most `max_concurrent` items in
/// flight. Output order matches input order.
///
/// Stops at the first chunk that contains an error and returns it; later
/// chunks are never started. Items within the failing chunk may still run.
///
/// # Panics
///
/// Panics if `max_concurrent` is 0.
pub fn try_par_map_limited<T, R, E, F>(
    items: &[T],
    max_concurrent: usize,
    f: F,
) -> Result<Vec<R>, E>
where
    T: Sync,
    R: Send,
    E: Send,
    F: Fn(&T) -> Result<R, E> + Sync,
{
    assert!(max_concurrent > 0, "max_concurrent must be > 0");

    let mut results = Vec::with_capacity(items.len());
    for chunk in items.chunks(max_concurrent) {
        let chunk_results: Result<Vec<R>, E> = chunk.par_iter().map(&f).collect();
        results.extend(chunk_results?);
    }
    Ok(results)
}

/// Sequential counterpart of [`try_par_map_limited`], used when the caller
/// opts out of parallelism but wants the same control flow.
pub fn try_map_sequential<T, R, E, F>(items: &[T], f: F) -> Result<Vec<R>, E>
where
    F: Fn(&T) -> Result<R, E>,
{
    items.iter().map(f).collect()
}
