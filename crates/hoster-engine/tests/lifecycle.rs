//! End-to-end deployment lifecycle against the in-memory store and mock
//! container runtime.

mod common;

use common::{auth, caps, create_deployment, harness, harness_with_ports, online_node, published_template};
use hoster_core::config::PortRange;
use hoster_core::resources::ResourceSpec;
use hoster_core::Error;
use hoster_engine::services::NewDeployment;
use hoster_engine::workers::HealthWorker;
use hoster_store::model::DeploymentStatus;

#[tokio::test]
async fn happy_deploy_traverses_states_and_lands_on_the_node() {
    let h = harness().await;
    let operator = auth(1);
    let customer = auth(2);

    let template = published_template(&h, &operator, "web").await;
    let node = online_node(&h, &operator, "n1", ResourceSpec::new(4.0, 8192, 100_000)).await;

    let deployment = create_deployment(&h, &customer, &template, "shop").await;
    assert_eq!(deployment.status, DeploymentStatus::Pending);
    assert!(
        deployment.domains[0].hostname.starts_with("shop-"),
        "auto-domain is derived from the name"
    );

    let running = h
        .engine
        .start_deployment(&customer, &deployment.reference_id)
        .await
        .expect("start");

    assert_eq!(running.status, DeploymentStatus::Running);
    assert_eq!(running.node_id, Some(node.id));
    let port = running.proxy_port.expect("proxy port allocated");
    assert!((10_000..=20_000).contains(&port));
    assert_eq!(running.containers.len(), 1);
    assert_eq!(running.containers[0].service_name, "web");
    assert!(!running.containers[0].container_id.is_empty());

    // The observable path: pending → scheduled → starting → running, one
    // persisted transition per step.
    let events = h
        .engine
        .deployment_events(&customer, &running.reference_id, 50)
        .await
        .expect("events");
    let transitions: Vec<&str> = events
        .iter()
        .rev()
        .map(|e| e.event_type.as_str())
        .filter(|t| t.starts_with("deployment."))
        .collect();
    assert_eq!(
        transitions,
        vec![
            "deployment.created",
            "deployment.scheduled",
            "deployment.starting",
            "deployment.running",
        ]
    );

    // Mock runtime saw the full protocol in order.
    let ops = h.docker.operations();
    let pull_at = ops.iter().position(|op| op.starts_with("pull")).unwrap();
    let create_at = ops.iter().position(|op| op.starts_with("create web")).unwrap();
    let start_at = ops.iter().position(|op| op.starts_with("start")).unwrap();
    assert!(pull_at < create_at && create_at < start_at);

    // Health tick derives used capacity from the scheduled deployment.
    let mut health = HealthWorker::new(h.engine.clone(), std::time::Duration::from_secs(30));
    health.tick().await.expect("health tick");
    let node = h.engine.get_node(&operator, &node.reference_id).await.unwrap();
    assert!((node.capacity.used.cpu_cores - 1.0).abs() < f64::EPSILON);
    assert_eq!(node.capacity.used.memory_mb, 512);
}

#[tokio::test]
async fn stop_then_second_stop_is_invalid_transition() {
    let h = harness().await;
    let operator = auth(1);
    let customer = auth(2);
    let template = published_template(&h, &operator, "web").await;
    online_node(&h, &operator, "n1", ResourceSpec::new(4.0, 8192, 100_000)).await;

    let deployment = create_deployment(&h, &customer, &template, "shop").await;
    h.engine
        .start_deployment(&customer, &deployment.reference_id)
        .await
        .unwrap();

    let stopped = h
        .engine
        .stop_deployment(&customer, &deployment.reference_id)
        .await
        .expect("first stop succeeds");
    assert_eq!(stopped.status, DeploymentStatus::Stopped);

    let err = h
        .engine
        .stop_deployment(&customer, &deployment.reference_id)
        .await
        .expect_err("second stop must not silently succeed");
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[tokio::test]
async fn restart_reuses_node_and_port() {
    let h = harness().await;
    let operator = auth(1);
    let customer = auth(2);
    let template = published_template(&h, &operator, "web").await;
    online_node(&h, &operator, "n1", ResourceSpec::new(4.0, 8192, 100_000)).await;

    let deployment = create_deployment(&h, &customer, &template, "shop").await;
    let first = h
        .engine
        .start_deployment(&customer, &deployment.reference_id)
        .await
        .unwrap();
    h.engine
        .stop_deployment(&customer, &deployment.reference_id)
        .await
        .unwrap();

    let second = h
        .engine
        .start_deployment(&customer, &deployment.reference_id)
        .await
        .expect("restart from stopped");
    assert_eq!(second.node_id, first.node_id);
    assert_eq!(second.proxy_port, first.proxy_port);
}

#[tokio::test]
async fn port_exhaustion_fails_without_reserving() {
    let h = harness_with_ports(PortRange {
        start: 10_000,
        end: 10_002,
    })
    .await;
    let operator = auth(1);
    let customer = auth(2);
    let template = published_template(&h, &operator, "web").await;
    online_node(&h, &operator, "n1", ResourceSpec::new(32.0, 65_536, 1_000_000)).await;

    for name in ["a1", "a2", "a3"] {
        let d = create_deployment(&h, &customer, &template, name).await;
        h.engine
            .start_deployment(&customer, &d.reference_id)
            .await
            .expect("ports available");
    }

    let overflow = create_deployment(&h, &customer, &template, "a4").await;
    let err = h
        .engine
        .start_deployment(&customer, &overflow.reference_id)
        .await
        .expect_err("range is saturated");
    assert!(matches!(err, Error::PortExhaustion { .. }));

    let after = h
        .engine
        .get_deployment(&customer, &overflow.reference_id)
        .await
        .unwrap();
    assert_eq!(after.status, DeploymentStatus::Failed);
    assert_eq!(after.proxy_port, None, "no port may leak on failure");
}

#[tokio::test]
async fn missing_image_fails_the_deployment_with_reason() {
    let h = harness().await;
    let operator = auth(1);
    let customer = auth(2);
    let template = published_template(&h, &operator, "web").await;
    online_node(&h, &operator, "n1", ResourceSpec::new(4.0, 8192, 100_000)).await;
    h.docker.set_missing_image("nginx:alpine");

    let deployment = create_deployment(&h, &customer, &template, "shop").await;
    let err = h
        .engine
        .start_deployment(&customer, &deployment.reference_id)
        .await
        .expect_err("image cannot be pulled");
    assert!(matches!(err, Error::Validation { .. }));

    let after = h
        .engine
        .get_deployment(&customer, &deployment.reference_id)
        .await
        .unwrap();
    assert_eq!(after.status, DeploymentStatus::Failed);
    assert!(
        after
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("nginx:alpine")),
        "the owner must see which image failed"
    );
}

#[tokio::test]
async fn transient_pull_flakes_are_retried() {
    let h = harness().await;
    let operator = auth(1);
    let customer = auth(2);
    let template = published_template(&h, &operator, "web").await;
    online_node(&h, &operator, "n1", ResourceSpec::new(4.0, 8192, 100_000)).await;
    h.docker.set_flaky_pull("nginx:alpine", 2);

    let deployment = create_deployment(&h, &customer, &template, "shop").await;
    let running = h
        .engine
        .start_deployment(&customer, &deployment.reference_id)
        .await
        .expect("third pull attempt succeeds");
    assert_eq!(running.status, DeploymentStatus::Running);
}

#[tokio::test]
async fn failed_start_cleans_up_partial_containers() {
    let h = harness().await;
    let operator = auth(1);
    let customer = auth(2);

    let template = {
        use hoster_engine::services::NewTemplate;
        let t = h
            .engine
            .create_template(
                &operator,
                NewTemplate {
                    slug: "two-tier".to_string(),
                    name: "Two tier".to_string(),
                    version: "1.0.0".to_string(),
                    compose_spec: "services:\n  db:\n    image: postgres:16\n  web:\n    image: nginx:alpine\n"
                        .to_string(),
                    variables: vec![],
                    config_files: vec![],
                    required_capabilities: caps(&["standard"]),
                    resources: ResourceSpec::new(1.0, 512, 1024),
                    category: None,
                    tags: vec![],
                    price_cents: 0,
                },
            )
            .await
            .unwrap();
        h.engine.publish_template(&operator, &t.reference_id).await.unwrap()
    };
    online_node(&h, &operator, "n1", ResourceSpec::new(4.0, 8192, 100_000)).await;

    // db starts, web fails: the already-started db must be cleaned up.
    let deployment = create_deployment(&h, &customer, &template, "shop").await;
    h.docker
        .set_fail_start(&format!("{}_web", deployment.reference_id));

    let err = h
        .engine
        .start_deployment(&customer, &deployment.reference_id)
        .await
        .expect_err("web fails to start");
    drop(err);

    assert!(
        h.docker.containers().is_empty(),
        "partial containers must be removed after a failed start"
    );
    let after = h
        .engine
        .get_deployment(&customer, &deployment.reference_id)
        .await
        .unwrap();
    assert_eq!(after.status, DeploymentStatus::Failed);
}

#[tokio::test]
async fn template_deletion_blocked_until_deployment_deleted() {
    let h = harness().await;
    let operator = auth(1);
    let customer = auth(2);
    let template = published_template(&h, &operator, "web").await;
    online_node(&h, &operator, "n1", ResourceSpec::new(4.0, 8192, 100_000)).await;

    let deployment = create_deployment(&h, &customer, &template, "shop").await;

    let err = h
        .engine
        .delete_template(&operator, &template.reference_id)
        .await
        .expect_err("deployment still references the template");
    assert!(matches!(err, Error::Conflict { .. }));

    h.engine
        .delete_deployment(&customer, &deployment.reference_id)
        .await
        .expect("delete pending deployment");
    h.engine
        .delete_template(&operator, &template.reference_id)
        .await
        .expect("no live references remain");
}

#[tokio::test]
async fn template_visibility_follows_publication() {
    let h = harness().await;
    let creator = auth(1);
    let stranger = auth(2);

    let template = h
        .engine
        .create_template(
            &creator,
            hoster_engine::services::NewTemplate {
                slug: "private".to_string(),
                name: "Private".to_string(),
                version: "1.0.0".to_string(),
                compose_spec: common::NGINX_COMPOSE.to_string(),
                variables: vec![],
                config_files: vec![],
                required_capabilities: Default::default(),
                resources: ResourceSpec::default(),
                category: None,
                tags: vec![],
                price_cents: 0,
            },
        )
        .await
        .unwrap();

    // Unpublished: invisible to others, indistinguishable from absent.
    let err = h
        .engine
        .get_template(&stranger, &template.reference_id)
        .await
        .expect_err("must not leak existence");
    assert!(matches!(err, Error::NotFound { .. }));

    h.engine
        .publish_template(&creator, &template.reference_id)
        .await
        .unwrap();

    // Published: viewable by anyone, modifiable only by the creator.
    h.engine
        .get_template(&stranger, &template.reference_id)
        .await
        .expect("published templates are public");
    let err = h
        .engine
        .update_template(
            &stranger,
            &template.reference_id,
            hoster_engine::services::TemplateUpdate {
                price_cents: Some(100),
                ..Default::default()
            },
        )
        .await
        .expect_err("strangers cannot modify");
    assert!(matches!(err, Error::Forbidden { .. }));
}

#[tokio::test]
async fn published_template_content_is_frozen() {
    let h = harness().await;
    let creator = auth(1);
    let template = published_template(&h, &creator, "web").await;

    let err = h
        .engine
        .update_template(
            &creator,
            &template.reference_id,
            hoster_engine::services::TemplateUpdate {
                compose_spec: Some("services:\n  web:\n    image: nginx:1.27\n".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect_err("content is immutable after publish");
    assert!(matches!(err, Error::Validation { .. }));

    // Catalog fields stay mutable.
    let updated = h
        .engine
        .update_template(
            &creator,
            &template.reference_id,
            hoster_engine::services::TemplateUpdate {
                category: Some("webservers".to_string()),
                price_cents: Some(500),
                ..Default::default()
            },
        )
        .await
        .expect("catalog update");
    assert_eq!(updated.category.as_deref(), Some("webservers"));
    assert_eq!(updated.price_cents, 500);
}

#[tokio::test]
async fn capability_mismatch_yields_no_eligible_node() {
    let h = harness().await;
    let operator = auth(1);
    let customer = auth(2);

    let template = {
        let t = h
            .engine
            .create_template(
                &operator,
                hoster_engine::services::NewTemplate {
                    slug: "gpu-job".to_string(),
                    name: "GPU job".to_string(),
                    version: "1.0.0".to_string(),
                    compose_spec: common::NGINX_COMPOSE.to_string(),
                    variables: vec![],
                    config_files: vec![],
                    required_capabilities: caps(&["gpu"]),
                    resources: ResourceSpec::new(1.0, 512, 1024),
                    category: None,
                    tags: vec![],
                    price_cents: 0,
                },
            )
            .await
            .unwrap();
        h.engine.publish_template(&operator, &t.reference_id).await.unwrap()
    };
    online_node(&h, &operator, "n1", ResourceSpec::new(4.0, 8192, 100_000)).await;

    let deployment = create_deployment(&h, &customer, &template, "shop").await;
    let err = h
        .engine
        .start_deployment(&customer, &deployment.reference_id)
        .await
        .expect_err("no gpu node exists");
    assert!(matches!(err, Error::NoEligibleNode { .. }));
}

#[tokio::test]
async fn plan_limit_caps_live_deployments() {
    let h = harness().await;
    let operator = auth(1);
    let mut customer = auth(2);
    customer.plan_limits.max_deployments = 1;

    let template = published_template(&h, &operator, "web").await;
    create_deployment(&h, &customer, &template, "one").await;

    let err = h
        .engine
        .create_deployment(
            &customer,
            NewDeployment {
                template_ref: template.reference_id.clone(),
                name: "two".to_string(),
                variables: Default::default(),
            },
        )
        .await
        .expect_err("plan allows one deployment");
    assert!(matches!(err, Error::Forbidden { .. }));
}
