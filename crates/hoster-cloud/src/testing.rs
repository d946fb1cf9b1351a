//! Scriptable in-memory `CloudProvider` for provisioner tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{CloudError, Result};
use crate::provider::{
    CloudProvider, Instance, InstanceRequest, InstanceSize, InstanceStatus, Region,
};

#[derive(Debug, Clone)]
struct MockInstance {
    name: String,
    status: InstanceStatus,
    public_ip: Option<String>,
    /// `get_instance` calls remaining before the instance reports running.
    polls_until_ready: u32,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    instances: BTreeMap<String, MockInstance>,
    keys: BTreeMap<String, String>,
    /// IP handed to instances once they become ready.
    ready_ip: Option<String>,
    polls_until_ready: u32,
    fail_create: bool,
    created: u32,
    destroyed: u32,
}

/// Mock provider: instances become `Running` with the configured IP after a
/// configurable number of status polls, mirroring real boot latency.
#[derive(Debug, Default)]
pub struct MockCloudProvider {
    inner: Mutex<Inner>,
}

impl MockCloudProvider {
    pub fn new() -> Self {
        let provider = Self::default();
        provider.inner.lock().ready_ip = Some("203.0.113.50".to_string());
        provider
    }

    pub fn set_ready_ip(&self, ip: &str) {
        self.inner.lock().ready_ip = Some(ip.to_string());
    }

    /// Instances answer `Provisioning` for this many polls before running.
    pub fn set_polls_until_ready(&self, polls: u32) {
        self.inner.lock().polls_until_ready = polls;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.inner.lock().fail_create = fail;
    }

    /// Pre-seed an instance, as if created before a process restart.
    pub fn seed_instance(&self, id: &str, status: InstanceStatus, public_ip: Option<&str>) {
        self.inner.lock().instances.insert(
            id.to_string(),
            MockInstance {
                name: format!("seeded-{id}"),
                status,
                public_ip: public_ip.map(ToString::to_string),
                polls_until_ready: 0,
            },
        );
    }

    pub fn created_count(&self) -> u32 {
        self.inner.lock().created
    }

    pub fn destroyed_count(&self) -> u32 {
        self.inner.lock().destroyed
    }

    pub fn registered_keys(&self) -> Vec<String> {
        self.inner.lock().keys.keys().cloned().collect()
    }
}

#[async_trait]
impl CloudProvider for MockCloudProvider {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn list_regions(&self) -> Result<Vec<Region>> {
        Ok(vec![Region {
            slug: "tst1".to_string(),
            name: "Testing 1".to_string(),
            available: true,
        }])
    }

    async fn list_sizes(&self, _region: &str) -> Result<Vec<InstanceSize>> {
        Ok(vec![InstanceSize {
            slug: "t-2vcpu-4gb".to_string(),
            vcpus: 2,
            memory_mb: 4096,
            disk_gb: 80,
            price_monthly_cents: Some(2400),
        }])
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<String> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = format!("key-{}", inner.next_id);
        inner.keys.insert(id.clone(), format!("{name}:{public_key}"));
        Ok(id)
    }

    async fn delete_ssh_key(&self, id: &str) -> Result<()> {
        self.inner.lock().keys.remove(id);
        Ok(())
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<Instance> {
        let mut inner = self.inner.lock();
        if inner.fail_create {
            return Err(CloudError::Api {
                status: 500,
                message: "mock create failure".to_string(),
            });
        }
        inner.next_id += 1;
        inner.created += 1;
        let id = format!("instance-{}", inner.next_id);
        let polls = inner.polls_until_ready;
        let public_ip = (polls == 0).then(|| inner.ready_ip.clone()).flatten();
        inner.instances.insert(
            id.clone(),
            MockInstance {
                name: request.name.clone(),
                status: if polls == 0 {
                    InstanceStatus::Running
                } else {
                    InstanceStatus::Provisioning
                },
                public_ip,
                polls_until_ready: polls,
            },
        );
        Ok(Instance {
            id,
            status: InstanceStatus::Provisioning,
            public_ip: None,
        })
    }

    async fn get_instance(&self, id: &str) -> Result<Instance> {
        let mut inner = self.inner.lock();
        let ready_ip = inner.ready_ip.clone();
        let instance = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| CloudError::NotFound {
                entity: "instance",
                id: id.to_string(),
            })?;
        if instance.status == InstanceStatus::Provisioning {
            if instance.polls_until_ready > 0 {
                instance.polls_until_ready -= 1;
            }
            if instance.polls_until_ready == 0 {
                instance.status = InstanceStatus::Running;
                instance.public_ip = ready_ip;
            }
        }
        Ok(Instance {
            id: id.to_string(),
            status: instance.status,
            public_ip: instance.public_ip.clone(),
        })
    }

    async fn destroy_instance(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.instances.remove(id).is_some() {
            inner.destroyed += 1;
        }
        // Absent instances destroy successfully; destruction is idempotent.
        Ok(())
    }
}
