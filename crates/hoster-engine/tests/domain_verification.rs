//! Custom-domain verification: CNAME and A methods, instructions, and the
//! reverify worker's drop-to-failed path.

mod common;

use common::{auth, create_deployment, harness, online_node, published_template};
use chrono::{Duration, Utc};
use hoster_core::resources::ResourceSpec;
use hoster_core::Error;
use hoster_engine::dns::ResolvedRecords;
use hoster_engine::domains::VerifyMethod;
use hoster_engine::workers::DomainVerifyWorker;
use hoster_store::model::VerificationStatus;
use hoster_store::{Store, StoreError, StoreTx};

const CUSTOM: &str = "shop.example.com";

#[tokio::test]
async fn cname_verification_then_drop_on_reverify() {
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
    let auto_domain = deployment.domains[0].hostname.clone();

    let instructions = h
        .engine
        .add_domain(&customer, &deployment.reference_id, CUSTOM)
        .await
        .expect("attach domain");
    assert_eq!(instructions[0], format!("CNAME {CUSTOM} -> {auto_domain}"));
    assert_eq!(instructions[1], format!("A {CUSTOM} -> 203.0.113.10"));

    // Correct CNAME: verified via the CNAME method.
    h.dns.set(
        CUSTOM,
        ResolvedRecords {
            a: vec![],
            cname: Some(format!("{auto_domain}.")),
        },
    );
    let verdict = h
        .engine
        .verify_domain(&customer, &deployment.reference_id, CUSTOM)
        .await
        .expect("verification ran");
    assert!(verdict.verified);
    assert_eq!(verdict.method, Some(VerifyMethod::Cname));

    let stored = h
        .engine
        .get_deployment(&customer, &deployment.reference_id)
        .await
        .unwrap();
    let domain = stored.domain(CUSTOM).unwrap();
    assert_eq!(domain.verification_status, VerificationStatus::Verified);
    assert!(domain.verified_at.is_some());
    assert_eq!(domain.verified_method.as_deref(), Some("CNAME"));

    // The operator's DNS now points somewhere foreign. Age the verification
    // past the 24h recheck window and let the worker rediscover it.
    h.dns.set(
        CUSTOM,
        ResolvedRecords {
            a: vec!["198.51.100.1".parse().unwrap()],
            cname: None,
        },
    );
    let deployment_id = stored.id;
    h.engine
        .store()
        .with_tx(move |tx| {
            let mut d = tx.deployment(deployment_id)?;
            let domain = d.domain_mut(CUSTOM).expect("domain present");
            domain.verified_at = Some(Utc::now() - Duration::hours(25));
            tx.update_deployment(&d)?;
            Ok::<_, StoreError>(())
        })
        .await
        .unwrap();

    let worker = DomainVerifyWorker::new(h.engine.clone(), std::time::Duration::from_secs(300));
    worker.tick().await.expect("reverify tick");

    let stored = h
        .engine
        .get_deployment(&customer, &deployment.reference_id)
        .await
        .unwrap();
    let domain = stored.domain(CUSTOM).unwrap();
    assert_eq!(domain.verification_status, VerificationStatus::Failed);
    assert!(domain.last_check_error.is_some());

    let events = h
        .engine
        .deployment_events(&customer, &deployment.reference_id, 50)
        .await
        .unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.event_type == "container.domain_unverified"),
        "the drop must leave an audit event"
    );
}

#[tokio::test]
async fn a_record_method_verifies_against_node_addresses() {
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
    h.engine
        .add_domain(&customer, &deployment.reference_id, CUSTOM)
        .await
        .unwrap();

    h.dns.set(
        CUSTOM,
        ResolvedRecords {
            a: vec!["203.0.113.10".parse().unwrap()],
            cname: None,
        },
    );
    let verdict = h
        .engine
        .verify_domain(&customer, &deployment.reference_id, CUSTOM)
        .await
        .unwrap();
    assert!(verdict.verified);
    assert_eq!(verdict.method, Some(VerifyMethod::A));
}

#[tokio::test]
async fn unverified_domains_are_retried_by_the_worker() {
    let h = harness().await;
    let operator = auth(1);
    let customer = auth(2);
    let template = published_template(&h, &operator, "web").await;
    online_node(&h, &operator, "n1", ResourceSpec::new(4.0, 8192, 100_000)).await;

    let deployment = create_deployment(&h, &customer, &template, "shop").await;
    let auto_domain = deployment.domains[0].hostname.clone();
    h.engine
        .add_domain(&customer, &deployment.reference_id, CUSTOM)
        .await
        .unwrap();

    // First worker pass: no DNS yet, the domain stays pending/failed.
    let worker = DomainVerifyWorker::new(h.engine.clone(), std::time::Duration::from_secs(300));
    worker.tick().await.unwrap();
    let stored = h
        .engine
        .get_deployment(&customer, &deployment.reference_id)
        .await
        .unwrap();
    assert_ne!(
        stored.domain(CUSTOM).unwrap().verification_status,
        VerificationStatus::Verified
    );

    // Operator sets up DNS; age the last attempt past the 30s retry gate.
    h.dns.set(
        CUSTOM,
        ResolvedRecords {
            a: vec![],
            cname: Some(auto_domain),
        },
    );
    let deployment_id = stored.id;
    h.engine
        .store()
        .with_tx(move |tx| {
            let mut d = tx.deployment(deployment_id)?;
            if let Some(domain) = d.domain_mut(CUSTOM) {
                domain.last_checked_at = Some(Utc::now() - Duration::seconds(45));
            }
            tx.update_deployment(&d)?;
            Ok::<_, StoreError>(())
        })
        .await
        .unwrap();

    worker.tick().await.unwrap();
    let stored = h
        .engine
        .get_deployment(&customer, &deployment.reference_id)
        .await
        .unwrap();
    assert_eq!(
        stored.domain(CUSTOM).unwrap().verification_status,
        VerificationStatus::Verified
    );
}

#[tokio::test]
async fn domain_uniqueness_and_auto_domain_protection() {
    let h = harness().await;
    let operator = auth(1);
    let customer = auth(2);
    let template = published_template(&h, &operator, "web").await;
    online_node(&h, &operator, "n1", ResourceSpec::new(4.0, 8192, 100_000)).await;

    let first = create_deployment(&h, &customer, &template, "one").await;
    let second = create_deployment(&h, &customer, &template, "two").await;

    h.engine
        .add_domain(&customer, &first.reference_id, CUSTOM)
        .await
        .unwrap();
    let err = h
        .engine
        .add_domain(&customer, &second.reference_id, CUSTOM)
        .await
        .expect_err("one hostname, one deployment");
    assert!(matches!(err, Error::Conflict { .. }));

    let auto = first.domains[0].hostname.clone();
    let err = h
        .engine
        .remove_domain(&customer, &first.reference_id, &auto)
        .await
        .expect_err("auto-domain is not removable");
    assert!(matches!(err, Error::Validation { .. }));

    h.engine
        .remove_domain(&customer, &first.reference_id, CUSTOM)
        .await
        .expect("custom domains are removable");
}
