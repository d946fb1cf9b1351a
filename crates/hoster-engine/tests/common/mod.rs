//! Shared harness: engine wired to the in-memory store, mock docker, mock
//! cloud, mock DNS, and a collecting billing sink.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use hoster_cloud::testing::MockCloudProvider;
use hoster_cloud::CloudProvider;
use hoster_core::auth::{AuthContext, PlanLimits};
use hoster_core::config::{HosterConfig, PortRange};
use hoster_core::resources::ResourceSpec;
use hoster_core::Result;
use hoster_engine::services::{NewDeployment, NewTemplate};
use hoster_engine::testing::{CollectingUsageSink, MockDnsResolver};
use hoster_engine::vault::CryptoVault;
use hoster_engine::{Engine, ProviderFactory};
use hoster_runtime::pool::NodePool;
use hoster_runtime::testing::MockContainerClient;
use hoster_store::model::{Node, NodeStatus, Template};
use hoster_store::{MemoryStore, Store, StoreError, StoreTx};

/// Hands out the same mock cloud regardless of provider kind or payload.
struct MockProviderFactory(Arc<MockCloudProvider>);

impl ProviderFactory for MockProviderFactory {
    fn provider(&self, _kind: &str, _payload: &str) -> Result<Arc<dyn CloudProvider>> {
        Ok(Arc::clone(&self.0) as Arc<dyn CloudProvider>)
    }
}

pub struct Harness {
    pub engine: Engine<MemoryStore>,
    pub docker: Arc<MockContainerClient>,
    pub cloud: Arc<MockCloudProvider>,
    pub dns: Arc<MockDnsResolver>,
    pub sink: Arc<CollectingUsageSink>,
    _config_dir: tempfile::TempDir,
}

pub async fn harness() -> Harness {
    harness_with_ports(PortRange::default()).await
}

pub async fn harness_with_ports(proxy_ports: PortRange) -> Harness {
    let config_dir = tempfile::tempdir().expect("config dir");
    let config = HosterConfig {
        base_domain: "apps.example.com".to_string(),
        local_node_host: "local.test".to_string(),
        local_container_socket: "/var/run/docker.sock".to_string(),
        config_dir: config_dir.path().to_path_buf(),
        proxy_ports,
        workers: Default::default(),
        dns_resolvers: vec![std::net::IpAddr::from([127, 0, 0, 1])],
    };

    let docker = Arc::new(MockContainerClient::new());
    let cloud = Arc::new(MockCloudProvider::new());
    let dns = Arc::new(MockDnsResolver::new());
    let sink = Arc::new(CollectingUsageSink::new());
    let pool = Arc::new(
        NodePool::new(&config.local_node_host, &config.local_container_socket).expect("pool"),
    );

    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        pool,
        Arc::new(CryptoVault::new(&[7u8; 32])),
        config,
        Arc::new(MockProviderFactory(Arc::clone(&cloud))),
        Arc::clone(&sink) as Arc<dyn hoster_engine::UsageSink>,
        Arc::clone(&dns) as Arc<dyn hoster_engine::dns::DnsResolver>,
    )
    .expect("engine");

    Harness {
        engine,
        docker,
        cloud,
        dns,
        sink,
        _config_dir: config_dir,
    }
}

pub fn auth(user_id: i64) -> AuthContext {
    AuthContext {
        authenticated: true,
        user_id,
        reference_id: format!("auth|user-{user_id}"),
        plan_id: "pro".to_string(),
        plan_limits: PlanLimits {
            max_deployments: 10,
            max_cpu_cores: 32.0,
            max_memory_mb: 65_536,
            max_nodes: 10,
        },
    }
}

pub const NGINX_COMPOSE: &str = "services:\n  web:\n    image: nginx:alpine\n    ports:\n      - '8080:80'\n";

pub async fn published_template(h: &Harness, creator: &AuthContext, slug: &str) -> Template {
    let template = h
        .engine
        .create_template(
            creator,
            NewTemplate {
                slug: slug.to_string(),
                name: slug.to_string(),
                version: "1.0.0".to_string(),
                compose_spec: NGINX_COMPOSE.to_string(),
                variables: vec![],
                config_files: vec![],
                required_capabilities: ["standard".to_string()].into(),
                resources: ResourceSpec::new(1.0, 512, 1024),
                category: None,
                tags: vec![],
                price_cents: 0,
            },
        )
        .await
        .expect("create template");
    h.engine
        .publish_template(creator, &template.reference_id)
        .await
        .expect("publish template")
}

/// Register a node, force it online, and wire the mock docker client into
/// the pool under its reference.
pub async fn online_node(
    h: &Harness,
    creator: &AuthContext,
    name: &str,
    capacity: ResourceSpec,
) -> Node {
    let node = h
        .engine
        .register_node(
            creator,
            hoster_engine::services::NewNode {
                name: name.to_string(),
                ssh_host: "203.0.113.10".to_string(),
                ssh_port: 22,
                ssh_user: "root".to_string(),
                ssh_key_ref: String::new(),
                container_socket: "/var/run/docker.sock".to_string(),
                capabilities: caps(&["standard"]),
                capacity,
                base_domain: String::new(),
                public_ips: vec!["203.0.113.10".parse().unwrap()],
            },
        )
        .await
        .expect("register node");

    let node_id = node.id;
    let node = h
        .engine
        .store()
        .with_tx(move |tx| {
            let mut node = tx.node(node_id)?;
            node.status = NodeStatus::Online;
            tx.update_node(&node)?;
            Ok::<_, StoreError>(node)
        })
        .await
        .expect("force node online");

    h.engine
        .pool()
        .register(&node.reference_id, Arc::clone(&h.docker) as _)
        .await;
    node
}

pub fn caps(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(ToString::to_string).collect()
}

pub async fn create_deployment(
    h: &Harness,
    customer: &AuthContext,
    template: &Template,
    name: &str,
) -> hoster_store::model::Deployment {
    h.engine
        .create_deployment(
            customer,
            NewDeployment {
                template_ref: template.reference_id.clone(),
                name: name.to_string(),
                variables: Default::default(),
            },
        )
        .await
        .expect("create deployment")
}
