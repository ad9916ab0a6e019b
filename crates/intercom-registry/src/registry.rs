//! Service registry: name -> instances, with heartbeat-based liveness.
//!
//! Every instance is keyed by `(service_name, instance_id)`. An instance is
//! healthy while its last heartbeat is younger than the staleness window;
//! healthy-only discovery never returns anything else.
//!
//! The whole map sits behind one reader/writer lock. Entry counts are small
//! (a handful of services), so per-entry locking buys nothing.

use intercom_core::{
    Clock, Error, InstanceKey, InstanceStatus, RegistryConfig, Result, ServiceInstance,
    SystemClock,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info};

type ServiceMap = HashMap<String, BTreeMap<String, ServiceInstance>>;

pub struct ServiceRegistry {
    services: RwLock<ServiceMap>,
    staleness_window: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(&RegistryConfig::default())
    }
}

impl ServiceRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            staleness_window: config.staleness_window(),
            clock,
        }
    }

    pub fn staleness_window(&self) -> Duration {
        self.staleness_window
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn read(&self) -> RwLockReadGuard<'_, ServiceMap> {
        self.services.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ServiceMap> {
        self.services.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new instance. Fails if `(name, instance_id)` is already taken.
    pub fn register(
        &self,
        name: &str,
        instance_id: &str,
        host: &str,
        port: u16,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ServiceInstance> {
        if name.is_empty() || instance_id.is_empty() {
            return Err(Error::invalid_request(
                "service name and instance id must be non-empty",
            ));
        }

        let now = self.clock.now();
        let mut services = self.write();
        let instances = services.entry(name.to_string()).or_default();
        if instances.contains_key(instance_id) {
            return Err(Error::duplicate_instance(name, instance_id));
        }

        let instance = ServiceInstance::new(name, instance_id, host, port, metadata, now);
        instances.insert(instance_id.to_string(), instance.clone());
        info!(
            "Registered {}/{} at {} ({} instance(s))",
            name,
            instance_id,
            instance.address(),
            instances.len()
        );
        Ok(instance)
    }

    /// Remove an instance. Returns false if it was not registered.
    /// Removing the last instance of a service removes the service.
    pub fn deregister(&self, name: &str, instance_id: &str) -> bool {
        let mut services = self.write();
        let Some(instances) = services.get_mut(name) else {
            return false;
        };
        if instances.remove(instance_id).is_none() {
            return false;
        }
        if instances.is_empty() {
            services.remove(name);
        }
        info!("Deregistered {}/{}", name, instance_id);
        true
    }

    /// Snapshot of a service's instances, ordered by instance id.
    pub fn discover(&self, name: &str, healthy_only: bool) -> Vec<ServiceInstance> {
        let now = self.clock.now();
        self.read()
            .get(name)
            .map(|instances| {
                instances
                    .values()
                    .filter(|i| !healthy_only || i.is_healthy_at(now, self.staleness_window))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Refresh an instance's liveness. Returns false if it is not registered.
    pub fn heartbeat(&self, name: &str, instance_id: &str) -> bool {
        let now = self.clock.now();
        match self
            .write()
            .get_mut(name)
            .and_then(|instances| instances.get_mut(instance_id))
        {
            Some(instance) => {
                instance.last_heartbeat = now;
                debug!("Heartbeat {}/{}", name, instance_id);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str, instance_id: &str) -> Option<ServiceInstance> {
        self.read()
            .get(name)
            .and_then(|instances| instances.get(instance_id))
            .cloned()
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every instance of every service, ordered by service then instance id.
    pub fn all(&self, healthy_only: bool) -> Vec<ServiceInstance> {
        let now = self.clock.now();
        let services = self.read();
        let mut out: Vec<ServiceInstance> = services
            .values()
            .flat_map(|instances| instances.values())
            .filter(|i| !healthy_only || i.is_healthy_at(now, self.staleness_window))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (a.service_name.as_str(), a.instance_id.as_str())
                .cmp(&(b.service_name.as_str(), b.instance_id.as_str()))
        });
        out
    }

    pub fn is_healthy(&self, instance: &ServiceInstance) -> bool {
        instance.is_healthy_at(self.clock.now(), self.staleness_window)
    }

    pub fn len(&self) -> usize {
        self.read().values().map(|instances| instances.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every unhealthy instance and return what was removed.
    pub fn reap_stale(&self) -> Vec<ServiceInstance> {
        let now = self.clock.now();
        let mut services = self.write();
        let mut removed = Vec::new();
        for instances in services.values_mut() {
            let stale: Vec<String> = instances
                .iter()
                .filter(|(_, i)| !i.is_healthy_at(now, self.staleness_window))
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                if let Some(instance) = instances.remove(&id) {
                    removed.push(instance);
                }
            }
        }
        services.retain(|_, instances| !instances.is_empty());
        removed
    }

    /// Mark a healthy idle instance busy. Returns false if it is busy or unhealthy.
    pub fn try_claim(&self, key: &InstanceKey) -> Result<bool> {
        let now = self.clock.now();
        let mut services = self.write();
        let instance = lookup_mut(&mut services, key)?;
        if !instance.is_idle() || !instance.is_healthy_at(now, self.staleness_window) {
            return Ok(false);
        }
        instance.status = InstanceStatus::Busy;
        Ok(true)
    }

    pub fn set_status(&self, key: &InstanceKey, status: InstanceStatus) -> Result<()> {
        let mut services = self.write();
        lookup_mut(&mut services, key)?.status = status;
        Ok(())
    }

    /// Count a finished task against the instance and mark it idle again.
    pub fn record_completion(&self, key: &InstanceKey) -> Result<()> {
        let mut services = self.write();
        let instance = lookup_mut(&mut services, key)?;
        instance.completed_tasks += 1;
        instance.status = InstanceStatus::Idle;
        Ok(())
    }
}

fn lookup_mut<'a>(
    services: &'a mut ServiceMap,
    key: &InstanceKey,
) -> Result<&'a mut ServiceInstance> {
    services
        .get_mut(&key.service)
        .and_then(|instances| instances.get_mut(&key.instance_id))
        .ok_or_else(|| Error::instance_not_found(&key.service, &key.instance_id))
}
