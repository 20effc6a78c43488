//! Per-owner instance quota

use super::instance::InstanceRecord;
use crate::error::RegistryError;
use crate::persistence::InstanceRegistry;

/// Counts an owner's registered instances against the configured limit
#[derive(Debug, Clone, Copy)]
pub struct QuotaEnforcer {
    limit: usize,
}

impl QuotaEnforcer {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn count_active(
        &self,
        registry: &InstanceRegistry,
        owner: &str,
    ) -> Result<usize, RegistryError> {
        Ok(registry.list_by_owner(owner)?.len())
    }

    pub fn is_at_limit(
        &self,
        registry: &InstanceRegistry,
        owner: &str,
    ) -> Result<bool, RegistryError> {
        Ok(self.count_active(registry, owner)? >= self.limit)
    }

    /// Register `record` only if its owner is still below the limit
    pub fn admit(
        &self,
        registry: &InstanceRegistry,
        record: &InstanceRecord,
    ) -> Result<(), RegistryError> {
        registry.insert_within_quota(record, self.limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_is_inclusive() {
        let registry = InstanceRegistry::open_in_memory().unwrap();
        let quota = QuotaEnforcer::new(2);

        assert!(!quota.is_at_limit(&registry, "alice").unwrap());
        registry.insert(&InstanceRecord::new("alice", "a1", "ssh a1@host")).unwrap();
        assert!(!quota.is_at_limit(&registry, "alice").unwrap());
        registry.insert(&InstanceRecord::new("alice", "a2", "ssh a2@host")).unwrap();
        assert!(quota.is_at_limit(&registry, "alice").unwrap());

        // Other owners are counted separately
        assert_eq!(quota.count_active(&registry, "bob").unwrap(), 0);
    }

    #[test]
    fn test_admit_rejects_over_limit() {
        let registry = InstanceRegistry::open_in_memory().unwrap();
        let quota = QuotaEnforcer::new(1);

        quota.admit(&registry, &InstanceRecord::new("alice", "a1", "ssh a1@host")).unwrap();
        assert!(matches!(
            quota.admit(&registry, &InstanceRecord::new("alice", "a2", "ssh a2@host")),
            Err(RegistryError::QuotaFull { limit: 1, .. })
        ));
        assert_eq!(quota.count_active(&registry, "alice").unwrap(), 1);
    }

    #[test]
    fn test_zero_limit_blocks_everyone() {
        let registry = InstanceRegistry::open_in_memory().unwrap();
        assert!(QuotaEnforcer::new(0).is_at_limit(&registry, "alice").unwrap());
    }
}
