//! Uniform release contract for everything the bridge owns.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BridgeError;

/// A resource with an explicit, idempotent async release.
#[async_trait]
pub trait Disposable: Send + Sync {
    async fn dispose(&self) -> Result<(), BridgeError>;
}

/// Fold disposal failures into a single result.
///
/// No failures is `Ok`, one failure is returned as-is, several become
/// [`BridgeError::Aggregate`].
pub fn collect_dispose_errors(mut errors: Vec<BridgeError>) -> Result<(), BridgeError> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(BridgeError::Aggregate(errors)),
    }
}

/// Dispose every resource in order, continuing past failures.
pub async fn dispose_all(resources: Vec<Arc<dyn Disposable>>) -> Result<(), BridgeError> {
    let mut errors = Vec::new();
    for resource in resources {
        if let Err(e) = resource.dispose().await {
            tracing::warn!(error = %e, "Resource disposal failed");
            errors.push(e);
        }
    }
    collect_dispose_errors(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
        fail: Option<&'static str>,
    }

    #[async_trait]
    impl Disposable for Counting {
        async fn dispose(&self) -> Result<(), BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail {
                Some(msg) => Err(BridgeError::execution("DisposeError", msg)),
                None => Ok(()),
            }
        }
    }

    #[test]
    fn collect_single_error_is_returned_directly() {
        let err = collect_dispose_errors(vec![BridgeError::timeout("x")]).unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
        assert!(collect_dispose_errors(Vec::new()).is_ok());
    }

    #[tokio::test]
    async fn dispose_all_continues_past_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resources: Vec<Arc<dyn Disposable>> = vec![
            Arc::new(Counting { calls: Arc::clone(&calls), fail: Some("first") }),
            Arc::new(Counting { calls: Arc::clone(&calls), fail: None }),
            Arc::new(Counting { calls: Arc::clone(&calls), fail: Some("third") }),
        ];

        let err = dispose_all(resources).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            BridgeError::Aggregate(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {other}"),
        }
    }
}
