use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::protocol::PortBinding;

/// Observed-state record for one container that belongs to a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub beamo_id: String,
    pub container_id: String,
    pub container_name: String,
    pub image_id: String,
    #[serde(default)]
    pub active_port_bindings: Vec<PortBinding>,
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Instances are the same instance when they track the same container.
impl PartialEq for ServiceInstance {
    fn eq(&self, other: &Self) -> bool {
        self.container_id == other.container_id
    }
}

impl Eq for ServiceInstance {}

impl ServiceInstance {
    /// Field-by-field comparison, unlike `==` which only compares container ids.
    pub fn same_state(&self, other: &Self) -> bool {
        self.beamo_id == other.beamo_id
            && self.container_id == other.container_id
            && self.container_name == other.container_name
            && self.image_id == other.image_id
            && self.active_port_bindings == other.active_port_bindings
            && self.is_running == other.is_running
            && self.created_at == other.created_at
    }
}

/// Existence changes made outside a poll, stamped with the generation they happened at.
/// A poll only overrides existence for containers nobody created or removed since it listed.
#[derive(Debug, Clone, Default)]
struct ExistenceMarks {
    generation: u64,
    polls_in_flight: usize,
    tracked: HashMap<String, u64>,
    removed: HashMap<String, u64>,
}

impl ExistenceMarks {
    fn stamp(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

/// Observed-state aggregate. A cache reconciled against the daemon, never a source of truth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    #[serde(default)]
    pub existing_local_service_instances: Vec<ServiceInstance>,
    #[serde(skip)]
    marks: ExistenceMarks,
}

impl Runtime {
    pub fn instances(&self) -> &[ServiceInstance] {
        &self.existing_local_service_instances
    }

    pub fn find_by_container_id(&self, container_id: &str) -> Option<&ServiceInstance> {
        self.existing_local_service_instances
            .iter()
            .find(|si| si.container_id == container_id)
    }

    pub fn find_by_container_id_mut(&mut self, container_id: &str) -> Option<&mut ServiceInstance> {
        self.existing_local_service_instances
            .iter_mut()
            .find(|si| si.container_id == container_id)
    }

    pub fn find_by_container_name(&self, container_name: &str) -> Option<&ServiceInstance> {
        self.existing_local_service_instances
            .iter()
            .find(|si| si.container_name == container_name)
    }

    pub fn instances_for(&self, beamo_id: &str) -> Vec<&ServiceInstance> {
        self.existing_local_service_instances
            .iter()
            .filter(|si| si.beamo_id == beamo_id)
            .collect()
    }

    /// Insert a new instance, or update the existing one with the same container id in place.
    pub fn upsert(&mut self, instance: ServiceInstance) {
        match self.find_by_container_id_mut(&instance.container_id) {
            Some(existing) => {
                existing.beamo_id = instance.beamo_id;
                existing.container_name = instance.container_name;
                existing.image_id = instance.image_id;
                existing.active_port_bindings = instance.active_port_bindings;
                existing.is_running = instance.is_running;
                if instance.created_at.is_some() {
                    existing.created_at = instance.created_at;
                }
            }
            None => self.existing_local_service_instances.push(instance),
        }
    }

    /// Upsert for a container that was just created or first seen through an event.
    /// A poll whose listing predates this call keeps the instance.
    pub fn track(&mut self, instance: ServiceInstance) {
        let generation = self.marks.stamp();
        self.marks.tracked.insert(instance.container_id.clone(), generation);
        self.marks.removed.remove(&instance.container_id);
        self.upsert(instance);
    }

    /// Remove the instance tracking the given container. Returns the removed instance.
    ///
    /// The removal is remembered, so a poll whose listing predates it will not bring the
    /// container back.
    pub fn remove_container(&mut self, container_id: &str) -> Option<ServiceInstance> {
        let generation = self.marks.stamp();
        self.marks.removed.insert(container_id.to_string(), generation);
        self.marks.tracked.remove(container_id);
        let idx = self
            .existing_local_service_instances
            .iter()
            .position(|si| si.container_id == container_id)?;
        Some(self.existing_local_service_instances.remove(idx))
    }

    /// Call before listing containers; pass the result to the snapshot apply.
    pub fn begin_poll(&mut self) -> u64 {
        self.marks.polls_in_flight += 1;
        self.marks.generation
    }

    /// Ends a poll started with [`Runtime::begin_poll`], applied or not. Marks are dropped once
    /// no poll can still need them.
    pub fn finish_poll(&mut self) {
        self.marks.polls_in_flight = self.marks.polls_in_flight.saturating_sub(1);
        if self.marks.polls_in_flight == 0 {
            self.marks.tracked.clear();
            self.marks.removed.clear();
        }
    }

    pub fn tracked_since(&self, container_id: &str, generation: u64) -> bool {
        self.marks.tracked.get(container_id).is_some_and(|&g| g > generation)
    }

    pub fn removed_since(&self, container_id: &str, generation: u64) -> bool {
        self.marks.removed.get(container_id).is_some_and(|&g| g > generation)
    }

    pub fn is_service_running(&self, beamo_id: &str) -> bool {
        self.existing_local_service_instances
            .iter()
            .any(|si| si.beamo_id == beamo_id && si.is_running)
    }

    pub fn is_container_running(&self, beamo_id: &str, container_name: &str) -> bool {
        self.existing_local_service_instances
            .iter()
            .any(|si| si.beamo_id == beamo_id && si.container_name == container_name && si.is_running)
    }

    /// Same instances with the same field values, ignoring order.
    pub fn same_state(&self, other: &Self) -> bool {
        self.existing_local_service_instances.len() == other.existing_local_service_instances.len()
            && self.existing_local_service_instances.iter().all(|si| {
                other
                    .find_by_container_id(&si.container_id)
                    .is_some_and(|o| o.same_state(si))
            })
    }
}
