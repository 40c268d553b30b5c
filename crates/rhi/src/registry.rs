//! Process-wide record of live device allocations.
//!
//! The registry is a passive observer: the memory facade notifies it on
//! every allocate and free, and it never touches GPU memory itself. Its job
//! is diagnostics (live totals, leak reports at shutdown).
//!
//! A record's identity is the pair `(memory_type_index, device_memory)`.
//! The registry never holds two records with the same identity; a new
//! allocation that reuses a handle replaces the stale record.
//!
//! # Example
//!
//! ```
//! use cadence_rhi::registry::{AllocationObserver, AllocationRegistry, DeviceAllocationRecord};
//! use cadence_rhi::vk::{self, Handle};
//!
//! let registry = AllocationRegistry::new();
//! let record = DeviceAllocationRecord::new(0, vk::DeviceMemory::from_raw(7), 4096, "depth");
//!
//! registry.on_allocate(&record);
//! assert_eq!(registry.live_count(), 1);
//! registry.on_free(&record);
//! assert_eq!(registry.live_count(), 0);
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use ash::vk;
use tracing::{debug, warn};

/// One live device memory allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceAllocationRecord {
    pub memory_type_index: u32,
    pub device_memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    /// Debug label supplied by the allocating component.
    pub tag: String,
}

impl DeviceAllocationRecord {
    pub fn new(
        memory_type_index: u32,
        device_memory: vk::DeviceMemory,
        size: vk::DeviceSize,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            memory_type_index,
            device_memory,
            size,
            tag: tag.into(),
        }
    }

    /// The pair that identifies this allocation.
    #[inline]
    pub fn identity(&self) -> (u32, vk::DeviceMemory) {
        (self.memory_type_index, self.device_memory)
    }
}

/// Receives allocate/free notifications from the memory facade.
pub trait AllocationObserver: Send + Sync {
    fn on_allocate(&self, record: &DeviceAllocationRecord);
    fn on_free(&self, record: &DeviceAllocationRecord);
}

/// Lock-serialized list of live allocation records.
#[derive(Debug, Default)]
pub struct AllocationRegistry {
    records: Mutex<Vec<DeviceAllocationRecord>>,
}

static SHARED: OnceLock<Arc<AllocationRegistry>> = OnceLock::new();

impl AllocationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    ///
    /// Components that are handed a registry should use that one; this
    /// accessor is for callers that have no context to receive it from.
    pub fn shared() -> Arc<AllocationRegistry> {
        SHARED.get_or_init(|| Arc::new(AllocationRegistry::new())).clone()
    }

    /// Borrowing form of [`AllocationRegistry::shared`].
    pub fn get() -> &'static AllocationRegistry {
        SHARED.get_or_init(|| Arc::new(AllocationRegistry::new()))
    }

    fn records(&self) -> MutexGuard<'_, Vec<DeviceAllocationRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of every live record.
    pub fn snapshot(&self) -> Vec<DeviceAllocationRecord> {
        self.records().clone()
    }

    /// Number of live records.
    pub fn live_count(&self) -> usize {
        self.records().len()
    }

    /// Sum of live record sizes in bytes.
    pub fn live_bytes(&self) -> vk::DeviceSize {
        self.records().iter().map(|r| r.size).sum()
    }

    /// Live bytes grouped by memory type index.
    pub fn bytes_by_memory_type(&self) -> BTreeMap<u32, vk::DeviceSize> {
        let mut totals = BTreeMap::new();
        for record in self.records().iter() {
            *totals.entry(record.memory_type_index).or_insert(0) += record.size;
        }
        totals
    }

    /// Drops every record without notifying anyone.
    ///
    /// Used when the device that owned the memory is torn down wholesale.
    pub fn clear(&self) {
        let mut records = self.records();
        if !records.is_empty() {
            debug!("Clearing {} allocation record(s)", records.len());
        }
        records.clear();
    }

    /// Logs every remaining record at `warn` level and returns how many there were.
    pub fn report_leaks(&self) -> usize {
        let records = self.records();
        for record in records.iter() {
            warn!(
                "Leaked allocation '{}': {} bytes, memory type {}, memory {:?}",
                record.tag, record.size, record.memory_type_index, record.device_memory
            );
        }
        records.len()
    }
}

impl AllocationObserver for AllocationRegistry {
    fn on_allocate(&self, record: &DeviceAllocationRecord) {
        let mut records = self.records();
        let identity = record.identity();
        records.retain(|r| r.identity() != identity);
        records.push(record.clone());
    }

    fn on_free(&self, record: &DeviceAllocationRecord) {
        let identity = record.identity();
        self.records().retain(|r| r.identity() != identity);
    }
}

/// Observer that logs every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl AllocationObserver for TracingObserver {
    fn on_allocate(&self, record: &DeviceAllocationRecord) {
        debug!(
            "Allocated '{}': {} bytes from memory type {}",
            record.tag, record.size, record.memory_type_index
        );
    }

    fn on_free(&self, record: &DeviceAllocationRecord) {
        debug!(
            "Freed '{}': {} bytes from memory type {}",
            record.tag, record.size, record.memory_type_index
        );
    }
}

/// Fans notifications out to several observers in insertion order.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn AllocationObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observer; builder style.
    pub fn with(mut self, observer: Arc<dyn AllocationObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl AllocationObserver for ObserverSet {
    fn on_allocate(&self, record: &DeviceAllocationRecord) {
        for observer in &self.observers {
            observer.on_allocate(record);
        }
    }

    fn on_free(&self, record: &DeviceAllocationRecord) {
        for observer in &self.observers {
            observer.on_free(record);
        }
    }
}
