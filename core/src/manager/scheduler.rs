//! Periodic eviction of idle trees and users

use super::UserManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

/// Handle to a running timeout check loop
pub struct TimeoutScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TimeoutScheduler {
    /// Stop the loop and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!("Timeout scheduler ended abnormally: {}", e);
        }
    }
}

/// Every `period`, evict idle trees and then idle users
pub fn spawn_timeout_checks(manager: Arc<UserManager>, period: Duration) -> TimeoutScheduler {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    manager.check_all_trees_timeout().await;
                    let evicted = manager.check_all_users_timeout().await;
                    if !evicted.is_empty() {
                        tracing::debug!("Evicted {} idle users", evicted.len());
                    }
                }
            }
        }
    });

    TimeoutScheduler { shutdown, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::manager::ManagerConfig;

    #[tokio::test]
    async fn test_scheduler_evicts_idle_users() {
        let manager = Arc::new(UserManager::new(
            ManagerConfig::default()
                .with_user_timeout(Duration::ZERO)
                .with_tree_timeout(Duration::ZERO),
        ));
        manager.add_user_local("user", Some(Settings::new())).await.unwrap();

        let scheduler = spawn_timeout_checks(manager.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!manager.user_exists("user").await);

        scheduler.shutdown().await;
    }
}
