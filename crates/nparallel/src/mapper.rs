//! Bounded-concurrency mapping over ordered sequences.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::try_join_all;

use crate::gate::AdmissionGate;

#[derive(Debug, thiserror::Error)]
pub enum BoundedMapError<E> {
    /// The concurrency limit was below one. Checked before any unit of work
    /// is created; the transform is never invoked.
    #[error("concurrency limit must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    /// A transform failed. The first failure observed wins; outcomes of the
    /// remaining units are discarded.
    #[error("transform failed for element {index}")]
    Transform {
        index: usize,
        #[source]
        source: E,
    },
}

/// Map `sequence` through an async `transform`, running at most
/// `concurrency` transformations at a time.
///
/// Every element gets its own unit of work up front (memory grows with the
/// input length), but only `concurrency` of them run their transform at any
/// instant; the rest wait on an [`AdmissionGate`] and are admitted strictly
/// in index order. Results come back in input order regardless of which
/// units finish first, and the first transform failure fails the whole call.
///
/// The transform receives the element, its index, and the full input
/// sequence.
pub async fn bounded_map<T, U, E, F, Fut>(
    sequence: Vec<T>,
    concurrency: usize,
    transform: F,
) -> Result<Vec<U>, BoundedMapError<E>>
where
    T: Clone,
    F: Fn(T, usize, Arc<[T]>) -> Fut,
    Fut: Future<Output = Result<U, E>>,
{
    let capacity = NonZeroUsize::new(concurrency)
        .ok_or(BoundedMapError::InvalidConcurrency(concurrency))?;

    if sequence.is_empty() {
        return Ok(Vec::new());
    }

    tracing::trace!(
        len = sequence.len(),
        concurrency,
        "mapping with bounded concurrency"
    );

    let gate = AdmissionGate::new(capacity);
    let sequence: Arc<[T]> = sequence.into();

    let units: Vec<_> = sequence
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, value)| {
            let gate = &gate;
            let transform = &transform;
            let sequence = Arc::clone(&sequence);
            async move {
                let _permit = gate.admit().await;
                transform(value, index, sequence)
                    .await
                    .map_err(|source| BoundedMapError::Transform { index, source })
            }
        })
        .collect();

    try_join_all(units).await
}

/// [`bounded_map`] as a method on slices (and, through deref, `Vec`).
pub trait BoundedMapExt<T> {
    /// Map the receiver through `transform` with at most `concurrency`
    /// transformations running at once. Sugar over [`bounded_map`].
    fn bounded_map<U, E, F, Fut>(
        &self,
        concurrency: usize,
        transform: F,
    ) -> impl Future<Output = Result<Vec<U>, BoundedMapError<E>>>
    where
        F: Fn(T, usize, Arc<[T]>) -> Fut,
        Fut: Future<Output = Result<U, E>>;
}

impl<T: Clone> BoundedMapExt<T> for [T] {
    fn bounded_map<U, E, F, Fut>(
        &self,
        concurrency: usize,
        transform: F,
    ) -> impl Future<Output = Result<Vec<U>, BoundedMapError<E>>>
    where
        F: Fn(T, usize, Arc<[T]>) -> Fut,
        Fut: Future<Output = Result<U, E>>,
    {
        bounded_map(self.to_vec(), concurrency, transform)
    }
}
