// Background expiration sweep

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::registry::{LeaseRegistry, LeasedResource};

/// Periodically sweeps a registry for expired leases until stopped.
#[derive(Debug)]
pub struct LeaseExpirer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LeaseExpirer {
    pub fn spawn<R: LeasedResource>(registry: Arc<LeaseRegistry<R>>, interval: Duration) -> Self {
        let (shutdown, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = registry.sweep();
                        if !expired.is_empty() {
                            debug!("Sweep removed {:?}", expired);
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
        });

        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}
