//! Dynamic resolve/reject adapter (§9 compatibility shim).
//!
//! The typed scheduler API has the job closure return an [`Outcome`] directly, making "must
//! resolve or reject exactly once" a property of the return type. Embedders porting
//! callback-style code (`resolve(value)` / `reject(delegate)`) can use [`any_job`] to bridge
//! instead of restructuring their closure to return a value: it runs the callback-style closure,
//! and if neither [`JobContext::resolve`] nor [`JobContext::reject`] fired by the time it
//! returns, the attempt fails with [`LimiterError::NoResolution`].

use std::sync::{Arc, Mutex};
use std::future::Future;

use crate::{
    error::LimiterError,
    model::Usage,
    scheduler::{JobFn, Outcome},
};

/// Handle passed to an [`any_job`]-adapted closure for reporting its outcome.
pub struct JobContext<T> {
    state: Arc<Mutex<Option<(Outcome<T>, Usage)>>>,
}

impl<T> Clone for JobContext<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> JobContext<T> {
    /// Resolve this attempt with `value`, having consumed `usage`. A second call (resolve or
    /// reject) overwrites the first, mirroring "last write wins" for callback-style code that
    /// double-fires by mistake.
    pub fn resolve(&self, value: T, usage: Usage) {
        *self.state.lock().expect("job context mutex poisoned") = Some((Outcome::Resolved(value), usage));
    }

    /// Reject this attempt, having consumed `usage`. `delegate` controls whether the scheduler
    /// tries the next model in the chain.
    pub fn reject(&self, usage: Usage, delegate: bool) {
        *self.state.lock().expect("job context mutex poisoned") = Some((Outcome::Rejected { delegate }, usage));
    }
}

/// Adapt a callback-style job closure `(model_id, ctx) -> impl Future<Output = ()>` into a
/// [`JobFn`] suitable for [`crate::scheduler::JobRequest::job`].
pub fn any_job<T, F, Fut>(f: F) -> JobFn<T>
where
    T: Send + 'static,
    F: Fn(String, JobContext<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |model_id: String| {
        let state: Arc<Mutex<Option<(Outcome<T>, Usage)>>> = Arc::new(Mutex::new(None));
        let ctx = JobContext { state: state.clone() };
        let attempt = f(model_id, ctx);
        Box::pin(async move {
            attempt.await;
            state
                .lock()
                .expect("job context mutex poisoned")
                .take()
                .ok_or_else(|| LimiterError::NoResolution.to_string())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_carries_value_through() {
        let job = any_job(|_model_id, ctx: JobContext<&'static str>| async move {
            ctx.resolve("done", Usage::default());
        });
        let (outcome, _usage) = job("model-a".to_string()).await.unwrap();
        match outcome {
            Outcome::Resolved(value) => assert_eq!(value, "done"),
            Outcome::Rejected { .. } => panic!("expected resolution"),
        }
    }

    #[tokio::test]
    async fn missing_resolution_is_an_error() {
        let job = any_job(|_model_id, _ctx: JobContext<()>| async move {});
        let err = job("model-a".to_string()).await.unwrap_err();
        assert_eq!(err, LimiterError::NoResolution.to_string());
    }
}
