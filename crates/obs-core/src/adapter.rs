//! Reconnecting holder for hardware adapters.

use crate::daemon::TickContext;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use tracing::info;

/// Builds a connected adapter. Called again after every failure.
pub type Connector<T> = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<Arc<T>>> + Send + Sync>;

/// One named adapter owned by a worker.
///
/// `ensure` is called on every re-sync and reconnects a missing adapter. Any failed call
/// goes through `fail`, which drops the adapter so the next re-sync reconnects it.
pub struct AdapterSlot<T: ?Sized> {
    name: String,
    connector: Connector<T>,
    adapter: Option<Arc<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> AdapterSlot<T> {
    pub fn new(name: impl Into<String>, connector: Connector<T>) -> Self {
        Self {
            name: name.into(),
            connector,
            adapter: None,
        }
    }

    /// A slot whose connector always hands back the same adapter instance.
    pub fn fixed(name: impl Into<String>, adapter: Arc<T>) -> Self {
        let connector: Connector<T> = Box::new(move || {
            let adapter = Arc::clone(&adapter);
            async move { Ok::<_, anyhow::Error>(adapter) }.boxed()
        });
        Self::new(name, connector)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.adapter.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.adapter.is_some()
    }

    /// Return the adapter, connecting first if needed. A failed connect marks the slot bad.
    pub async fn ensure(&mut self, ctx: &mut TickContext) -> Option<Arc<T>> {
        if self.adapter.is_none() {
            match (self.connector)().await {
                Ok(adapter) => {
                    info!(adapter = %self.name, "Connected to hardware");
                    self.adapter = Some(adapter);
                }
                Err(err) => {
                    ctx.hardware_failed(&self.name, &err);
                    return None;
                }
            }
        }
        self.adapter.clone()
    }

    /// Record a failed call and drop the connection.
    pub fn fail(&mut self, ctx: &mut TickContext, err: &anyhow::Error) {
        ctx.hardware_failed(&self.name, err);
        self.adapter = None;
    }

    pub fn ok(&self, ctx: &mut TickContext) {
        ctx.hardware_ok(&self.name);
    }

    /// Run one adapter call, recording success or failure.
    pub async fn call<R, F>(&mut self, ctx: &mut TickContext, f: F) -> Option<R>
    where
        F: FnOnce(Arc<T>) -> BoxFuture<'static, anyhow::Result<R>>,
    {
        let adapter = self.ensure(ctx).await?;
        match f(adapter).await {
            Ok(value) => {
                self.ok(ctx);
                Some(value)
            }
            Err(err) => {
                self.fail(ctx, &err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_reconnects_after_failure() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let connector: Connector<u32> = Box::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    anyhow::bail!("port busy")
                }
                Ok(Arc::new(n))
            }
            .boxed()
        });
        let mut slot = AdapterSlot::new("widget", connector);
        let mut ctx = TickContext::new();

        assert!(slot.ensure(&mut ctx).await.is_none());
        assert!(ctx.health.bad_hardware.contains("widget"));

        let adapter = slot.ensure(&mut ctx).await.unwrap();
        assert_eq!(*adapter, 1);

        let value = slot
            .call(&mut ctx, |a| async move { Ok(*a * 10) }.boxed())
            .await;
        assert_eq!(value, Some(10));
        assert!(ctx.health.is_ok());

        let failed: Option<()> = slot
            .call(&mut ctx, |_| async { Err(anyhow::anyhow!("timeout")) }.boxed())
            .await;
        assert!(failed.is_none());
        assert!(!slot.is_connected());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
