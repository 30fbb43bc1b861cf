use std::future::Future;

use futures::future::try_join_all;

/// Runs `f` for every input in chunks of `chunk_size` concurrent futures.
///
/// The futures of one chunk are polled concurrently, the next chunk is only started once the
/// previous one completed. The results keep the order of `inputs`. The first error aborts the
/// remaining work and is returned.
///
/// A `chunk_size` of `0` is treated as `1`.
pub async fn join_chunked<I, F, Fut, T, E>(inputs: I, chunk_size: usize, mut f: F) -> Result<Vec<T>, E>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let chunk_size = chunk_size.max(1);
    let mut inputs = inputs.into_iter().peekable();
    let mut results = Vec::with_capacity(inputs.size_hint().0);

    while inputs.peek().is_some() {
        let chunk: Vec<_> = inputs.by_ref().take(chunk_size).map(&mut f).collect();
        results.extend(try_join_all(chunk).await?);
    }

    Ok(results)
}
