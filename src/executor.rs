//! Request Executor
//!
//! Runs each request as one unit of work against the shared repository:
//! a fresh [`TransactionContext`], the request body on a blocking worker,
//! then commit on success or rollback on failure. A semaphore caps the
//! number of request scopes alive at once.

use crate::config::CoreConfig;
use crate::error::{Error, Result};
use crate::repository::Repository;
use crate::transaction::TransactionContext;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Bounded runner of request-scoped transactions
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    repo: Arc<Repository>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl RequestExecutor {
    pub fn new(repo: Arc<Repository>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            repo,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn from_config(repo: Arc<Repository>, config: &CoreConfig) -> Self {
        Self::new(repo, config.max_concurrent_requests)
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Request scopes that may start without waiting
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run `request` in its own transaction context.
    ///
    /// The context is committed when `request` returns `Ok`. An error from
    /// the request or from the commit rolls every tracked object back
    /// before the error is returned.
    pub async fn execute<T, F>(&self, name: &str, request: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Repository, &TransactionContext) -> Result<T> + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("request executor is closed".to_string()))?;

        let repo = self.repo.clone();
        let name = name.to_string();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let started = Instant::now();
            let ctx = repo.new_context();

            let outcome = request(repo.as_ref(), &ctx).and_then(|value| ctx.commit().map(|()| value));
            match outcome {
                Ok(value) => {
                    debug!(
                        request = %name,
                        ctx = ctx.id(),
                        elapsed_us = started.elapsed().as_micros() as u64,
                        "Request committed"
                    );
                    Ok(value)
                }
                Err(e) => {
                    ctx.rollback();
                    warn!(request = %name, ctx = ctx.id(), error = %e, "Request rolled back");
                    Err(e)
                }
            }
        });

        task.await
            .map_err(|e| Error::Internal(format!("request task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{NodeArgs, NodeName};
    use crate::persistence::ControllerDatabase;
    use crate::security::AccessContext;
    use assert_matches::assert_matches;

    fn executor(max: usize) -> (Arc<ControllerDatabase>, RequestExecutor) {
        let db = ControllerDatabase::in_memory();
        let repo = Repository::controller(db.clone(), &CoreConfig::default()).unwrap();
        (db, RequestExecutor::new(repo, max))
    }

    fn create_node(
        name: &'static str,
    ) -> impl FnOnce(&Repository, &TransactionContext) -> Result<NodeName> + Send + 'static {
        move |repo, ctx| {
            let name = NodeName::new(name)?;
            repo.get_node(&AccessContext::system(), ctx, &name, NodeArgs::default(), true, true)?;
            Ok(name)
        }
    }

    #[tokio::test]
    async fn test_success_commits() {
        let (db, exec) = executor(4);

        let name = exec.execute("create-node", create_node("alpha")).await.unwrap();
        assert_eq!(db.row_count("NODES"), 1);
        assert!(exec.repository().node(&name).unwrap().is_some());
        assert_eq!(exec.repository().stats().commits, 1);
        assert_eq!(exec.available_permits(), 4);
    }

    #[tokio::test]
    async fn test_error_rolls_back() {
        let (db, exec) = executor(4);

        let result: Result<()> = exec
            .execute("create-then-fail", |repo, ctx| {
                create_node("alpha")(repo, ctx)?;
                Err(Error::InvalidValue("rejected by request".into()))
            })
            .await;
        assert_matches!(result, Err(Error::InvalidValue(_)));
        assert_eq!(db.row_count("NODES"), 0);
        assert!(exec.repository().nodes().is_empty());
        assert_eq!(exec.repository().stats().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back() {
        let (db, exec) = executor(4);
        db.set_available(false);

        let result = exec.execute("create-node", create_node("alpha")).await;
        assert_matches!(result, Err(Error::BackendUnavailable { .. }));
        assert!(exec.repository().nodes().is_empty());

        db.set_available(true);
        exec.execute("create-node", create_node("alpha")).await.unwrap();
        assert_eq!(db.row_count("NODES"), 1);
    }

    #[tokio::test]
    async fn test_panicking_request_is_internal_error() {
        let (_db, exec) = executor(1);

        let result: Result<()> = exec
            .execute("panics", |_, _| panic!("request body panicked"))
            .await;
        assert_matches!(result, Err(Error::Internal(_)));
        assert_eq!(exec.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests() {
        let (db, exec) = executor(2);
        let names = ["n1", "n2", "n3", "n4", "n5", "n6"];

        let handles: Vec<_> = names
            .iter()
            .map(|&name| {
                let exec = exec.clone();
                tokio::spawn(async move { exec.execute("create-node", create_node(name)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(db.row_count("NODES"), names.len());
        assert_eq!(exec.max_concurrent(), 2);
    }
}
