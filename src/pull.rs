//! Pull coordination
//!
//! Builds in one process that ask for the same base image share a single
//! fetch. The first caller becomes the leader and fetches; later callers
//! wait for the leader to finish and then resolve the image by lookup.

use crate::store::lock::with;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Process-scoped map of in-flight pulls
#[derive(Debug, Default)]
pub struct PullCoordinator {
    pulls: Mutex<HashMap<String, (u64, watch::Receiver<bool>)>>,
    generation: AtomicU64,
}

/// Outcome of asking to pull an image
pub enum PullTicket {
    /// This caller must fetch; waiters are released when the ticket drops
    Leader(PullLeader),
    /// Another caller is fetching; wait, then look the image up
    Waiter(watch::Receiver<bool>),
}

/// Held by the fetching caller
///
/// Dropping it signals completion, whether the fetch succeeded or not, and
/// removes the entry so the next build starts a fresh pull.
pub struct PullLeader {
    coordinator: Arc<PullCoordinator>,
    image: String,
    generation: u64,
    done: watch::Sender<bool>,
}

impl Drop for PullLeader {
    fn drop(&mut self) {
        with(&self.coordinator.pulls, |pulls| {
            if pulls.get(&self.image).map(|(g, _)| *g) == Some(self.generation) {
                pulls.remove(&self.image);
            }
        });
        let _ = self.done.send(true);
    }
}

impl PullCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register interest in `image`
    pub fn begin(self: &Arc<Self>, image: &str) -> PullTicket {
        with(&self.pulls, |pulls| {
            if let Some((_, rx)) = pulls.get(image) {
                return PullTicket::Waiter(rx.clone());
            }
            let generation = self.generation.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = watch::channel(false);
            pulls.insert(image.to_string(), (generation, rx));
            PullTicket::Leader(PullLeader {
                coordinator: Arc::clone(self),
                image: image.to_string(),
                generation,
                done: tx,
            })
        })
    }

    /// Forget every in-flight pull
    pub fn reset(&self) {
        with(&self.pulls, |pulls| pulls.clear());
    }

    /// Number of pulls currently in flight
    pub fn in_flight(&self) -> usize {
        with(&self.pulls, |pulls| pulls.len())
    }
}

/// Wait for a leader to finish
///
/// A leader that vanished without sending still counts as finished.
pub async fn wait(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|done| *done).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn fetch(coordinator: Arc<PullCoordinator>, fetches: Arc<AtomicUsize>) -> &'static str {
        match coordinator.begin("debian") {
            PullTicket::Leader(leader) => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                fetches.fetch_add(1, Ordering::SeqCst);
                drop(leader);
                "fetched"
            }
            PullTicket::Waiter(rx) => {
                wait(rx).await;
                "looked up"
            }
        }
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let coordinator = PullCoordinator::new();
        let fetches = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            fetch(coordinator.clone(), fetches.clone()),
            fetch(coordinator.clone(), fetches.clone())
        );

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        let mut outcomes = [a, b];
        outcomes.sort();
        assert_eq!(outcomes, ["fetched", "looked up"]);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn failed_leader_still_releases_waiters() {
        let coordinator = PullCoordinator::new();
        let leader = match coordinator.begin("alpine") {
            PullTicket::Leader(leader) => leader,
            PullTicket::Waiter(_) => panic!("first caller must lead"),
        };
        let rx = match coordinator.begin("alpine") {
            PullTicket::Waiter(rx) => rx,
            PullTicket::Leader(_) => panic!("second caller must wait"),
        };

        let waiter = tokio::spawn(wait(rx));
        drop(leader);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn entries_are_single_use() {
        let coordinator = PullCoordinator::new();
        let first = coordinator.begin("busybox");
        assert!(matches!(first, PullTicket::Leader(_)));
        drop(first);
        assert!(matches!(coordinator.begin("busybox"), PullTicket::Leader(_)));
    }

    #[test]
    fn reset_forgets_pulls() {
        let coordinator = PullCoordinator::new();
        let stale = coordinator.begin("fedora");
        coordinator.reset();
        assert_eq!(coordinator.in_flight(), 0);

        let fresh = coordinator.begin("fedora");
        assert!(matches!(fresh, PullTicket::Leader(_)));
        drop(stale);
        assert_eq!(coordinator.in_flight(), 1);
        drop(fresh);
        assert_eq!(coordinator.in_flight(), 0);
    }
}
