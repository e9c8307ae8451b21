use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::db::store::Store;
use crate::error::{Error, Result};

/// Hands out host TCP ports from a fixed range, backed by the Store's
/// reservation table. The allocate path is serialized under a process-wide
/// mutex so "pick the smallest free port" is linearizable; the allocator
/// reasons only about its own reservations, never about what the OS thinks
/// is bound.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    store: Store,
    range: RangeInclusive<u16>,
    lock: Arc<Mutex<()>>,
}

impl PortAllocator {
    pub fn new(store: Store, range: RangeInclusive<u16>) -> Self {
        Self {
            store,
            range,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Allocate the lowest free port in the range and bind it to
    /// `instance_id`. Fails with `PortsExhausted` when the range is full,
    /// without side effects.
    pub async fn allocate(&self, instance_id: &str) -> Result<u16> {
        let _guard = self.lock.lock().await;

        let reserved: BTreeSet<u16> = self
            .store
            .list_reservations()
            .await?
            .into_iter()
            .map(|r| r.port as u16)
            .collect();

        let port = self
            .range
            .clone()
            .find(|p| !reserved.contains(p))
            .ok_or(Error::PortsExhausted)?;

        self.store.reserve_port(port, instance_id).await?;
        debug!(port, instance = %instance_id, "Allocated port");
        Ok(port)
    }

    /// Returns true if a reservation existed and was released.
    pub async fn release(&self, port: u16) -> Result<bool> {
        let released = self.store.release_port(port).await?;
        if released {
            debug!(port, "Released port");
        }
        Ok(released)
    }

    pub async fn lookup(&self, instance_id: &str) -> Result<Option<u16>> {
        self.store.port_for_instance(instance_id).await
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn allocator(range: RangeInclusive<u16>) -> PortAllocator {
        let store = Store::new(&Database::test_db().await);
        PortAllocator::new(store, range)
    }

    #[tokio::test]
    async fn allocates_lowest_free() {
        let ports = allocator(8001..=8005).await;
        assert_eq!(ports.allocate("a").await.unwrap(), 8001);
        assert_eq!(ports.allocate("b").await.unwrap(), 8002);
    }

    #[tokio::test]
    async fn released_port_is_reused() {
        let ports = allocator(8001..=8005).await;
        ports.allocate("a").await.unwrap();
        ports.allocate("b").await.unwrap();

        assert!(ports.release(8001).await.unwrap());
        assert_eq!(ports.allocate("c").await.unwrap(), 8001);
    }

    #[tokio::test]
    async fn fills_holes_before_extending() {
        let ports = allocator(8001..=8005).await;
        for id in ["a", "b", "c"] {
            ports.allocate(id).await.unwrap();
        }
        ports.release(8002).await.unwrap();

        assert_eq!(ports.allocate("d").await.unwrap(), 8002);
        assert_eq!(ports.allocate("e").await.unwrap(), 8004);
    }

    #[tokio::test]
    async fn exhausted_range_fails_without_side_effects() {
        let ports = allocator(8001..=8002).await;
        ports.allocate("a").await.unwrap();
        ports.allocate("b").await.unwrap();

        let err = ports.allocate("c").await.unwrap_err();
        assert!(matches!(err, Error::PortsExhausted));

        // No phantom reservation was written for "c".
        assert!(ports.lookup("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_of_absent_port_reports_absent() {
        let ports = allocator(8001..=8002).await;
        assert!(!ports.release(8001).await.unwrap());
    }

    #[tokio::test]
    async fn lookup_finds_owner() {
        let ports = allocator(8001..=8005).await;
        let p = ports.allocate("a").await.unwrap();
        assert_eq!(ports.lookup("a").await.unwrap(), Some(p));
        assert_eq!(ports.lookup("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_allocations_get_distinct_ports() {
        let ports = allocator(8001..=8050).await;
        let mut handles = Vec::new();
        for i in 0..20 {
            let ports = ports.clone();
            handles.push(tokio::spawn(async move {
                ports.allocate(&format!("inst-{i}")).await.unwrap()
            }));
        }

        let mut seen = BTreeSet::new();
        for handle in handles {
            let port = handle.await.unwrap();
            assert!(seen.insert(port), "port {port} handed out twice");
        }
        assert_eq!(seen.len(), 20);
    }
}
