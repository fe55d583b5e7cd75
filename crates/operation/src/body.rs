//! The work an Operation performs.

use crate::operation::Operation;
use async_trait::async_trait;
use std::future::Future;
use xenops_core::OperationError;

/// Supplies the work behind an [`Operation`].
///
/// `run` returns `Ok` for success, [`OperationError::Cancelled`] when it
/// stopped because cancellation was requested, and any other error for a
/// failure. The operation maps the result onto its terminal state; bodies may
/// also drive progress and description through the handle they are given.
#[async_trait]
pub trait OperationBody: Send + Sync {
    /// Perform the work.
    async fn run(&self, operation: &Operation) -> Result<(), OperationError>;

    /// Whether a cancellation request can be acted on right now. A refused
    /// request leaves the operation untouched. Must not call back into
    /// `operation`'s setters.
    fn accepts_cancel(&self, _operation: &Operation) -> bool {
        true
    }

    /// Called synchronously after a cancellation request was accepted.
    fn on_cancel(&self, _operation: &Operation) {}

    /// Remove anything that would make a restarted console mistake this
    /// operation's remote work for its own.
    async fn prepare_for_restart(&self, _operation: &Operation) {}
}

/// Body built from an async closure.
pub struct FnBody<F>(F);

impl<F> FnBody<F> {
    /// Wrap a closure.
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(Operation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
    {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> OperationBody for FnBody<F>
where
    F: Fn(Operation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
{
    async fn run(&self, operation: &Operation) -> Result<(), OperationError> {
        (self.0)(operation.clone()).await
    }
}
