//! Capacity accounting for local model instances

use gantry_core::{GantryError, GantryResult};
use std::collections::HashMap;
use tracing::{debug, info};

/// Resources held by one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub memory: u64,
    pub port: u16,
}

/// Tracks memory and worker ports claimed by live instances
pub struct MemoryAllocator {
    /// Memory budget in bytes; `None` is unlimited
    total_memory: Option<u64>,
    /// Maximum number of concurrent instances
    max_instances: u32,
    /// First worker port
    base_port: u16,
    /// Reservations indexed by instance id
    reservations: HashMap<String, Reservation>,
}

impl MemoryAllocator {
    pub fn new(total_memory: Option<u64>, max_instances: u32, base_port: u16) -> Self {
        info!(
            total_memory = ?total_memory,
            max_instances = max_instances,
            base_port = base_port,
            "Capacity allocator initialized"
        );
        Self {
            total_memory,
            max_instances,
            base_port,
            reservations: HashMap::new(),
        }
    }

    /// Bytes currently reserved
    pub fn used_memory(&self) -> u64 {
        self.reservations.values().map(|r| r.memory).sum()
    }

    /// Bytes still available; `None` is unlimited
    pub fn available_memory(&self) -> Option<u64> {
        self.total_memory
            .map(|total| total.saturating_sub(self.used_memory()))
    }

    pub fn instance_count(&self) -> usize {
        self.reservations.len()
    }

    /// Whether another instance needing `memory` bytes would fit
    pub fn can_fit(&self, memory: u64) -> bool {
        self.check(memory).is_ok()
    }

    fn check(&self, memory: u64) -> GantryResult<()> {
        if self.reservations.len() >= self.max_instances as usize {
            return Err(GantryError::ResourceExhausted(format!(
                "instance limit reached: {} running",
                self.max_instances
            )));
        }
        if let Some(available) = self.available_memory() {
            if memory > available {
                return Err(GantryError::ResourceExhausted(format!(
                    "not enough memory: requested {}, available {}",
                    memory, available
                )));
            }
        }
        Ok(())
    }

    fn free_port(&self) -> Option<u16> {
        (0..self.max_instances)
            .filter_map(|offset| self.base_port.checked_add(u16::try_from(offset).ok()?))
            .find(|port| !self.reservations.values().any(|r| r.port == *port))
    }

    /// Reserve memory and a worker port for an instance.
    ///
    /// Reserving again for the same id returns the existing reservation.
    pub fn reserve(&mut self, instance_id: &str, memory: u64) -> GantryResult<Reservation> {
        if let Some(existing) = self.reservations.get(instance_id) {
            return Ok(*existing);
        }
        self.check(memory)?;
        let port = self.free_port().ok_or_else(|| {
            GantryError::ResourceExhausted("no worker port available".to_string())
        })?;

        let reservation = Reservation { memory, port };
        self.reservations.insert(instance_id.to_string(), reservation);
        debug!(
            instance_id = %instance_id,
            memory = memory,
            port = port,
            "Reserved capacity"
        );
        Ok(reservation)
    }

    /// Release an instance's reservation
    pub fn release(&mut self, instance_id: &str) -> Option<Reservation> {
        let released = self.reservations.remove(instance_id);
        if released.is_some() {
            debug!(instance_id = %instance_id, "Released capacity");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1_000_000_000;

    #[test]
    fn test_unlimited_memory() {
        let mut allocator = MemoryAllocator::new(None, 4, 31000);
        assert_eq!(allocator.available_memory(), None);

        let r = allocator.reserve("a", 100 * GB).unwrap();
        assert_eq!(r.port, 31000);
        assert_eq!(allocator.used_memory(), 100 * GB);
    }

    #[test]
    fn test_memory_budget() {
        let mut allocator = MemoryAllocator::new(Some(32 * GB), 4, 31000);
        allocator.reserve("a", 24 * GB).unwrap();
        assert_eq!(allocator.available_memory(), Some(8 * GB));

        assert!(allocator.can_fit(8 * GB));
        let err = allocator.reserve("b", 12 * GB).unwrap_err();
        assert!(matches!(err, GantryError::ResourceExhausted(_)));
    }

    #[test]
    fn test_instance_cap_and_ports() {
        let mut allocator = MemoryAllocator::new(None, 2, 31000);
        let a = allocator.reserve("a", GB).unwrap();
        let b = allocator.reserve("b", GB).unwrap();
        assert_ne!(a.port, b.port);
        assert!(allocator.reserve("c", GB).is_err());

        // same id is idempotent
        assert_eq!(allocator.reserve("a", GB).unwrap(), a);
        assert_eq!(allocator.instance_count(), 2);
    }

    #[test]
    fn test_release_frees_port_and_memory() {
        let mut allocator = MemoryAllocator::new(Some(16 * GB), 2, 31000);
        let a = allocator.reserve("a", 8 * GB).unwrap();
        allocator.reserve("b", 8 * GB).unwrap();

        assert_eq!(allocator.release("a"), Some(a));
        assert!(allocator.release("a").is_none());

        let c = allocator.reserve("c", 8 * GB).unwrap();
        assert_eq!(c.port, a.port);
    }

    #[test]
    fn test_zero_instances_allows_nothing() {
        let mut allocator = MemoryAllocator::new(None, 0, 31000);
        assert!(!allocator.can_fit(0));
        assert!(allocator.reserve("a", 0).is_err());
    }
}
