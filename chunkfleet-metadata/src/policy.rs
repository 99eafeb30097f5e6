//! Distribution policy management
//!
//! At most one policy is active. Activations within one manager are
//! serialized so two concurrent activations cannot both win.

use crate::models::{DistributionPolicy, NewPolicy, PolicyUpdate};
use chrono::Utc;
use chunkfleet_core::{
    EntityKind, FleetError, Result, DEFAULT_POLICY_MIN_REPLICAS, DEFAULT_REBALANCE_THRESHOLD,
    FALLBACK_MIN_REPLICAS,
};
use chunkfleet_storage::{Query, RecordStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument};

/// Policy manager
pub struct PolicyManager<S> {
    store: Arc<S>,

    /// Held while deactivating others and activating one
    activation: Arc<Mutex<()>>,
}

impl<S> Clone for PolicyManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            activation: self.activation.clone(),
        }
    }
}

impl<S: RecordStore> PolicyManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            activation: Arc::new(Mutex::new(())),
        }
    }

    /// Create an inactive policy
    pub async fn create_policy(&self, new: NewPolicy) -> Result<DistributionPolicy> {
        let now = Utc::now();
        let policy = DistributionPolicy {
            id: EntityKind::Policy.new_id(),
            name: new.name,
            min_replicas: new.min_replicas.unwrap_or(DEFAULT_POLICY_MIN_REPLICAS),
            rebalance_threshold: new.rebalance_threshold.unwrap_or(DEFAULT_REBALANCE_THRESHOLD),
            priority_based_placement: new.priority_based_placement,
            locality_aware: new.locality_aware,
            is_active: false,
            created_at: now,
            updated_at: now,
        };
        validate_policy(&policy)?;

        self.store.insert(policy.clone()).await?;
        info!(policy_id = %policy.id, name = %policy.name, "Policy created");
        Ok(policy)
    }

    /// Apply a partial update; setting `is_active` deactivates all others
    #[instrument(skip(self, update))]
    pub async fn update_policy(&self, policy_id: &str, update: PolicyUpdate) -> Result<DistributionPolicy> {
        let activating = update.is_active == Some(true);
        let _guard = if activating {
            Some(self.activation.lock().await)
        } else {
            None
        };

        // Validate before touching other policies
        let mut preview = self.get_policy(policy_id).await?;
        apply_update(&mut preview, &update);
        validate_policy(&preview)?;

        if activating {
            self.deactivate_all_except(policy_id).await?;
        }

        let policy = self
            .store
            .update::<DistributionPolicy, _>(policy_id, move |p| {
                apply_update(p, &update);
                p.updated_at = Utc::now();
                validate_policy(p)
            })
            .await?;

        info!(policy_id, is_active = policy.is_active, "Policy updated");
        Ok(policy)
    }

    /// Make the policy the single active one
    pub async fn activate_policy(&self, policy_id: &str) -> Result<DistributionPolicy> {
        self.update_policy(
            policy_id,
            PolicyUpdate {
                is_active: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete an inactive policy
    pub async fn delete_policy(&self, policy_id: &str) -> Result<DistributionPolicy> {
        let _guard = self.activation.lock().await;

        let policy = self.get_policy(policy_id).await?;
        if policy.is_active {
            return Err(FleetError::InvalidState(
                "cannot delete the active policy".into(),
            ));
        }

        let deleted = self.store.delete(policy_id).await?;
        info!(policy_id, "Policy deleted");
        Ok(deleted)
    }

    pub async fn get_policy(&self, policy_id: &str) -> Result<DistributionPolicy> {
        self.store
            .get(policy_id)
            .await?
            .ok_or_else(|| FleetError::not_found(EntityKind::Policy, policy_id))
    }

    /// Policies, active first, then by name
    pub async fn list_policies(&self) -> Result<Vec<DistributionPolicy>> {
        self.store
            .query(Query::<DistributionPolicy>::all().order_by(|a, b| {
                b.is_active.cmp(&a.is_active).then_with(|| a.name.cmp(&b.name))
            }))
            .await
    }

    pub async fn active_policy(&self) -> Result<Option<DistributionPolicy>> {
        Ok(self
            .store
            .query(Query::<DistributionPolicy>::all().filter(|p| p.is_active).limit(1))
            .await?
            .into_iter()
            .next())
    }

    /// Replica target of the active policy (1 without one)
    pub async fn active_min_replicas(&self) -> Result<u32> {
        Ok(self
            .active_policy()
            .await?
            .map(|p| p.min_replicas)
            .unwrap_or(FALLBACK_MIN_REPLICAS))
    }

    async fn deactivate_all_except(&self, policy_id: &str) -> Result<()> {
        let keep = policy_id.to_string();
        let active = self
            .store
            .query(Query::<DistributionPolicy>::all().filter(move |p| p.is_active && p.id != keep))
            .await?;

        for policy in active {
            self.store
                .update::<DistributionPolicy, _>(&policy.id, |p| {
                    p.is_active = false;
                    p.updated_at = Utc::now();
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }
}

fn apply_update(policy: &mut DistributionPolicy, update: &PolicyUpdate) {
    if let Some(name) = &update.name {
        policy.name = name.clone();
    }
    if let Some(min) = update.min_replicas {
        policy.min_replicas = min;
    }
    if let Some(threshold) = update.rebalance_threshold {
        policy.rebalance_threshold = threshold;
    }
    if let Some(flag) = update.priority_based_placement {
        policy.priority_based_placement = flag;
    }
    if let Some(flag) = update.locality_aware {
        policy.locality_aware = flag;
    }
    if let Some(active) = update.is_active {
        policy.is_active = active;
    }
}

fn validate_policy(policy: &DistributionPolicy) -> Result<()> {
    if policy.name.trim().is_empty() {
        return Err(FleetError::InvalidRequest("policy name is required".into()));
    }
    if policy.min_replicas < 1 {
        return Err(FleetError::InvalidRequest(
            "min replicas must be at least 1".into(),
        ));
    }
    if !(1..=100).contains(&policy.rebalance_threshold) {
        return Err(FleetError::InvalidRequest(
            "rebalance threshold must be between 1 and 100".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkfleet_storage::MemoryStore;

    fn manager() -> PolicyManager<MemoryStore> {
        PolicyManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_create_defaults() {
        let manager = manager();
        let policy = manager.create_policy(NewPolicy::new("standard")).await.unwrap();
        assert_eq!(policy.min_replicas, 2);
        assert_eq!(policy.rebalance_threshold, 75);
        assert!(!policy.is_active);

        assert!(manager.active_policy().await.unwrap().is_none());
        assert_eq!(manager.active_min_replicas().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let manager = manager();
        assert!(manager
            .create_policy(NewPolicy::new("p").with_min_replicas(0))
            .await
            .is_err());
        assert!(manager
            .create_policy(NewPolicy::new("p").with_threshold(0))
            .await
            .is_err());
        assert!(manager.create_policy(NewPolicy::new("")).await.is_err());
    }

    #[tokio::test]
    async fn test_single_active_policy() {
        let manager = manager();
        let a = manager.create_policy(NewPolicy::new("a")).await.unwrap();
        let b = manager
            .create_policy(NewPolicy::new("b").with_min_replicas(3))
            .await
            .unwrap();

        manager.activate_policy(&a.id).await.unwrap();
        manager.activate_policy(&b.id).await.unwrap();

        let active: Vec<_> = manager
            .list_policies()
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);
        assert_eq!(manager.active_min_replicas().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_activations_leave_one_active() {
        let manager = manager();
        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(
                manager
                    .create_policy(NewPolicy::new(format!("p{}", i)))
                    .await
                    .unwrap()
                    .id,
            );
        }

        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.activate_policy(&id).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let active = manager
            .list_policies()
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.is_active)
            .count();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn test_delete_active_rejected() {
        let manager = manager();
        let policy = manager.create_policy(NewPolicy::new("a")).await.unwrap();
        manager.activate_policy(&policy.id).await.unwrap();

        assert!(matches!(
            manager.delete_policy(&policy.id).await,
            Err(FleetError::InvalidState(_))
        ));

        manager
            .update_policy(
                &policy.id,
                PolicyUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(manager.delete_policy(&policy.id).await.is_ok());
    }
}
