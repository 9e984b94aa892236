use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Runs `operation` until it succeeds, retrying on errors for which
/// `condition` returns true. Between attempts it sleeps for the next interval
/// produced by the backoff strategy; when the strategy is exhausted (or the
/// error is non-retryable) the last error is returned.
///
/// The first run is not a retry: a strategy yielding `n` intervals allows
/// `n + 1` attempts in total.
pub async fn retry<I, Op, Fut, C, T, E>(
    intervals: I,
    mut operation: Op,
    condition: C,
) -> Result<T, E>
where
    I: IntoIterator<Item = Duration>,
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
{
    let mut intervals = intervals.into_iter();
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !condition(&err) {
                    return Err(err);
                }
                match intervals.next() {
                    Some(cool_off) => sleep(cool_off).await,
                    None => return Err(err),
                }
            }
        }
    }
}
