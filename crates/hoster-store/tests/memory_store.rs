//! Transactional behavior of the in-memory store.

use std::collections::BTreeSet;

use chrono::Utc;
use hoster_core::id::{self, ResourceKind};
use hoster_core::resources::{Capacity, ResourceSpec};
use hoster_store::model::{
    CloudCredential, CloudProvision, Deployment, DeploymentDomain, DeploymentStatus, Node,
    NodeStatus, ProvisionStatus, SshKey, Template, UsageEvent,
};
use hoster_store::{MemoryStore, Store, StoreError, StoreTx};

fn template(slug: &str, creator_id: i64) -> Template {
    Template {
        id: 0,
        reference_id: id::new_ref(ResourceKind::Template),
        creator_id,
        slug: slug.to_string(),
        name: slug.to_string(),
        version: "1.0.0".to_string(),
        compose_spec: "services:\n  web:\n    image: nginx:alpine\n".to_string(),
        variables: vec![],
        config_files: vec![],
        required_capabilities: BTreeSet::new(),
        resources: ResourceSpec::new(1.0, 512, 1024),
        published: false,
        category: None,
        tags: vec![],
        price_cents: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn deployment(name: &str, customer_id: i64, template_id: i64) -> Deployment {
    Deployment {
        id: 0,
        reference_id: id::new_ref(ResourceKind::Deployment),
        customer_id,
        template_id,
        template_ref: String::new(),
        template_version: "1.0.0".to_string(),
        name: name.to_string(),
        variables: Default::default(),
        domains: vec![],
        containers: vec![],
        node_id: None,
        proxy_port: None,
        resources: ResourceSpec::new(1.0, 512, 1024),
        status: DeploymentStatus::Pending,
        error_message: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn node(name: &str, creator_id: i64) -> Node {
    Node {
        id: 0,
        reference_id: id::new_ref(ResourceKind::Node),
        creator_id,
        name: name.to_string(),
        ssh_host: "203.0.113.10".to_string(),
        ssh_port: 22,
        ssh_user: "root".to_string(),
        ssh_key_id: None,
        ssh_key_ref: String::new(),
        container_socket: "/var/run/docker.sock".to_string(),
        status: NodeStatus::Online,
        capabilities: ["standard".to_string()].into(),
        capacity: Capacity::new(ResourceSpec::new(4.0, 8192, 100_000)),
        base_domain: "apps.example.com".to_string(),
        public_ips: vec![],
        provision_id: None,
        last_health_check: None,
        error_message: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn commit_on_ok_rollback_on_err() {
    let store = MemoryStore::new();

    let result: Result<(), StoreError> = store
        .with_tx(|tx| {
            tx.insert_template(&mut template("doomed", 1))?;
            Err(StoreError::InvalidData {
                op: "test",
                entity: "template",
                reason: "abort".to_string(),
            })
        })
        .await;
    assert!(result.is_err());

    let count: Result<usize, StoreError> =
        store.with_tx(|tx| Ok(tx.list_templates()?.len())).await;
    assert_eq!(count.unwrap(), 0, "rolled-back insert must not be visible");

    store
        .with_tx(|tx| tx.insert_template(&mut template("kept", 1)))
        .await
        .unwrap();
    let count: usize = store
        .with_tx(|tx| Ok::<_, StoreError>(tx.list_templates()?.len()))
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn write_read_back_equals_modulo_assigned_fields() {
    let store = MemoryStore::new();
    let mut tmpl = template("roundtrip", 7);
    let written = store
        .with_tx(|tx| {
            tx.insert_template(&mut tmpl)?;
            Ok::<_, StoreError>(tmpl.clone())
        })
        .await
        .unwrap();
    assert_ne!(written.id, 0);

    let read = store
        .with_tx(|tx| tx.template(written.id))
        .await
        .unwrap();
    assert_eq!(read, written);
}

#[tokio::test]
async fn duplicate_slug_rejected() {
    let store = MemoryStore::new();
    store
        .with_tx(|tx| tx.insert_template(&mut template("web", 1)))
        .await
        .unwrap();
    let err = store
        .with_tx(|tx| tx.insert_template(&mut template("web", 2)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateSlug { .. }));
}

#[tokio::test]
async fn reference_id_resolution_populates_integer_fk() {
    let store = MemoryStore::new();
    let tmpl_ref = store
        .with_tx(|tx| {
            let mut t = template("refres", 1);
            tx.insert_template(&mut t)?;
            Ok::<_, StoreError>(t.reference_id)
        })
        .await
        .unwrap();

    let depl = store
        .with_tx(move |tx| {
            let mut d = deployment("shop", 2, 0);
            d.template_ref = tmpl_ref;
            tx.insert_deployment(&mut d)?;
            Ok::<_, StoreError>(d)
        })
        .await
        .unwrap();
    assert_ne!(depl.template_id, 0, "store must resolve ref to integer id");
}

#[tokio::test]
async fn template_delete_blocked_then_allowed() {
    let store = MemoryStore::new();
    let (tmpl_id, depl_id) = store
        .with_tx(|tx| {
            let mut t = template("guarded", 1);
            tx.insert_template(&mut t)?;
            let mut d = deployment("blocker", 2, t.id);
            tx.insert_deployment(&mut d)?;
            Ok::<_, StoreError>((t.id, d.id))
        })
        .await
        .unwrap();

    let err = store
        .with_tx(move |tx| tx.delete_template(tmpl_id))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ForeignKey { .. }));

    store
        .with_tx(move |tx| {
            let mut d = tx.deployment(depl_id)?;
            d.status = DeploymentStatus::Deleted;
            tx.update_deployment(&d)
        })
        .await
        .unwrap();
    store
        .with_tx(move |tx| tx.delete_template(tmpl_id))
        .await
        .unwrap();
}

#[tokio::test]
async fn resolve_user_is_idempotent_and_updates_nonempty() {
    let store = MemoryStore::new();
    let first: i64 = store
        .with_tx(|tx| tx.resolve_user("auth0|u1", "a@example.com", "Alice", "free"))
        .await
        .unwrap();
    let second: i64 = store
        .with_tx(|tx| tx.resolve_user("auth0|u1", "", "", "pro"))
        .await
        .unwrap();
    assert_eq!(first, second);

    let user = store.with_tx(move |tx| tx.user(first)).await.unwrap();
    assert_eq!(user.email, "a@example.com", "empty fields must not clobber");
    assert_eq!(user.plan_id, "pro", "non-empty fields must update");
}

#[tokio::test]
async fn deployment_lookup_by_domain() {
    let store = MemoryStore::new();
    let depl_ref = store
        .with_tx(|tx| {
            let mut t = template("domains", 1);
            tx.insert_template(&mut t)?;
            let mut d = deployment("shop", 2, t.id);
            d.domains = vec![
                DeploymentDomain::auto("shop-ab12cd34.apps.example.com", Utc::now()),
                DeploymentDomain::custom("shop.example.com"),
            ];
            tx.insert_deployment(&mut d)?;
            Ok::<_, StoreError>(d.reference_id)
        })
        .await
        .unwrap();

    let found = store
        .with_tx(|tx| tx.deployment_by_domain("shop.example.com"))
        .await
        .unwrap();
    assert_eq!(found.reference_id, depl_ref);

    let missing = store
        .with_tx(|tx| tx.deployment_by_domain("absent.example.com"))
        .await;
    assert!(matches!(missing, Err(StoreError::NotFound { .. })));
}

#[tokio::test]
async fn used_proxy_ports_ignore_deleted() {
    let store = MemoryStore::new();
    let (ports, routable) = store
        .with_tx(|tx| {
            let mut t = template("ports", 1);
            tx.insert_template(&mut t)?;
            let mut n = node("n1", 1);
            tx.insert_node(&mut n)?;

            for (name, port, status) in [
                ("a", 10_000, DeploymentStatus::Running),
                ("b", 10_001, DeploymentStatus::Stopped),
                ("c", 10_002, DeploymentStatus::Deleted),
            ] {
                let mut d = deployment(name, 2, t.id);
                d.node_id = Some(n.id);
                d.proxy_port = Some(port);
                d.status = status;
                tx.insert_deployment(&mut d)?;
            }
            Ok::<_, StoreError>((tx.used_proxy_ports(n.id)?, tx.count_routable_deployments()?))
        })
        .await
        .unwrap();
    assert_eq!(ports, vec![10_000, 10_001], "deleted rows release ports");
    assert_eq!(routable, 1, "only running deployments with a port are routable");
}

#[tokio::test]
async fn unreported_events_ordered_and_marked_once() {
    let store = MemoryStore::new();
    let base = Utc::now();
    let ids: Vec<i64> = store
        .with_tx(|tx| {
            let mut out = vec![];
            for (offset, ref_suffix) in [(30i64, "c"), (10, "a"), (20, "b")] {
                let mut e = UsageEvent {
                    id: 0,
                    reference_id: format!("evt_0000000{ref_suffix}"),
                    user_id: 1,
                    event_type: "deployment.start".to_string(),
                    resource_id: "depl_abcd1234".to_string(),
                    resource_type: "deployment".to_string(),
                    quantity: 1.0,
                    metadata: Default::default(),
                    timestamp: base + chrono::Duration::seconds(offset),
                    reported_at: None,
                };
                tx.append_usage_event(&mut e)?;
                out.push(e.id);
            }
            Ok::<_, StoreError>(out)
        })
        .await
        .unwrap();

    let batch = store
        .with_tx(|tx| tx.unreported_events(100))
        .await
        .unwrap();
    let stamps: Vec<_> = batch.iter().map(|e| e.timestamp).collect();
    let mut sorted = stamps.clone();
    sorted.sort();
    assert_eq!(stamps, sorted, "batch must be in timestamp order");

    let reported_at = Utc::now();
    store
        .with_tx(move |tx| tx.mark_events_reported(&ids, reported_at))
        .await
        .unwrap();

    let remaining = store
        .with_tx(|tx| tx.unreported_events(100))
        .await
        .unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn credential_delete_blocked_by_active_provision() {
    let store = MemoryStore::new();
    let (cred_id, prov_id) = store
        .with_tx(|tx| {
            let mut c = CloudCredential {
                id: 0,
                reference_id: id::new_ref(ResourceKind::Credential),
                creator_id: 1,
                provider: "digitalocean".to_string(),
                name: "do-main".to_string(),
                encrypted_payload: vec![1, 2, 3],
                default_region: "nyc3".to_string(),
                created_at: Utc::now(),
            };
            tx.insert_credential(&mut c)?;
            let mut p = CloudProvision {
                id: 0,
                reference_id: id::new_ref(ResourceKind::Provision),
                creator_id: 1,
                credential_id: c.id,
                credential_ref: String::new(),
                provider: "digitalocean".to_string(),
                instance_name: "worker-1".to_string(),
                region: "nyc3".to_string(),
                size: "s-2vcpu-4gb".to_string(),
                provider_instance_id: None,
                provider_key_id: None,
                public_ip: None,
                ssh_key_id: None,
                node_id: None,
                status: ProvisionStatus::Pending,
                current_step: None,
                error_message: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            tx.insert_provision(&mut p)?;
            Ok::<_, StoreError>((c.id, p.id))
        })
        .await
        .unwrap();

    let err = store
        .with_tx(move |tx| tx.delete_credential(cred_id))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ForeignKey { .. }));

    store
        .with_tx(move |tx| {
            let mut p = tx.provision(prov_id)?;
            p.status = ProvisionStatus::Destroyed;
            tx.update_provision(&p)
        })
        .await
        .unwrap();
    store
        .with_tx(move |tx| tx.delete_credential(cred_id))
        .await
        .unwrap();
}

#[tokio::test]
async fn ssh_key_delete_blocked_while_node_references_it() {
    let store = MemoryStore::new();
    let key_id = store
        .with_tx(|tx| {
            let mut k = SshKey {
                id: 0,
                reference_id: id::new_ref(ResourceKind::SshKey),
                creator_id: 1,
                name: "bootstrap".to_string(),
                public_key: "ssh-ed25519 AAAA test".to_string(),
                fingerprint: "SHA256:abc".to_string(),
                encrypted_private_key: vec![9, 9],
                created_at: Utc::now(),
            };
            tx.insert_ssh_key(&mut k)?;
            let mut n = node("keyed", 1);
            n.ssh_key_id = Some(k.id);
            tx.insert_node(&mut n)?;
            Ok::<_, StoreError>(k.id)
        })
        .await
        .unwrap();

    let err = store
        .with_tx(move |tx| tx.delete_ssh_key(key_id))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ForeignKey { .. }));
}

#[tokio::test]
async fn node_name_unique_per_creator() {
    let store = MemoryStore::new();
    store
        .with_tx(|tx| tx.insert_node(&mut node("n1", 1)))
        .await
        .unwrap();
    let err = store
        .with_tx(|tx| tx.insert_node(&mut node("n1", 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateId { .. }));

    // Same name under a different creator is fine.
    store
        .with_tx(|tx| tx.insert_node(&mut node("n1", 2)))
        .await
        .unwrap();
}
