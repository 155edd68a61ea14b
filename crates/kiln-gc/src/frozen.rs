//! Registry of frozen read-only segments.
//!
//! The compiler emits pre-initialized object regions (string literals,
//! interned data) and registers them here at startup. Frozen segments are
//! neither marked nor swept; the collector only needs to recognize their
//! addresses so traversal stops cleanly at a frozen target. Records are
//! never destroyed.

/// Opaque identifier of a registered frozen segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrozenId(usize);

impl FrozenId {
    /// Raw value for the ABI surface; never zero.
    #[must_use]
    pub const fn to_raw(self) -> usize {
        self.0
    }

    /// Rebuild an id from its raw ABI value.
    #[must_use]
    pub const fn from_raw(raw: usize) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }
}

#[derive(Debug)]
struct Record {
    start: usize,
    alloc_size: usize,
    #[allow(dead_code)]
    commit_size: usize,
    #[allow(dead_code)]
    reserved_size: usize,
}

/// All registered frozen segments. Playing the role of the bump-allocated
/// metadata region: append-only, records live for the process lifetime.
#[derive(Debug, Default)]
pub struct FrozenRegistry {
    records: Vec<Record>,
}

impl FrozenRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Register a frozen segment and return its id.
    pub fn register(
        &mut self,
        start: usize,
        alloc_size: usize,
        commit_size: usize,
        reserved_size: usize,
    ) -> FrozenId {
        self.records.push(Record {
            start,
            alloc_size,
            commit_size,
            reserved_size,
        });
        FrozenId(self.records.len())
    }

    /// Update the allocated and committed sizes of a registered segment.
    /// Returns false for an unknown id.
    pub fn update(&mut self, id: FrozenId, alloc_size: usize, commit_size: usize) -> bool {
        let Some(record) = self.records.get_mut(id.0 - 1) else {
            return false;
        };
        record.alloc_size = alloc_size;
        record.commit_size = commit_size;
        true
    }

    /// Whether `addr` lies inside the allocated portion of any frozen
    /// segment.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.records
            .iter()
            .any(|r| addr >= r.start && addr < r.start + r.alloc_size)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut reg = FrozenRegistry::new();
        let id = reg.register(0x1000, 0x800, 0x1000, 0x4000);
        assert_eq!(id.to_raw(), 1);
        assert!(reg.contains(0x1000));
        assert!(reg.contains(0x17FF));
        assert!(!reg.contains(0x1800));
        assert!(!reg.contains(0xFFF));
    }

    #[test]
    fn update_extends_the_allocated_portion() {
        let mut reg = FrozenRegistry::new();
        let id = reg.register(0x1000, 0x100, 0x1000, 0x4000);
        assert!(!reg.contains(0x1200));
        assert!(reg.update(id, 0x400, 0x1000));
        assert!(reg.contains(0x1200));
        assert!(!reg.update(FrozenId(99), 0x400, 0x1000));
    }

    #[test]
    fn raw_id_zero_is_invalid() {
        assert!(FrozenId::from_raw(0).is_none());
        assert_eq!(FrozenId::from_raw(3).map(FrozenId::to_raw), Some(3));
    }
}
