//! Owner reconciliation against the in-memory cluster

mod common;

use common::*;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use qliksense_operator::controller::cluster::ResourceKind;
use qliksense_operator::controller::owner::reconcile_owners;
use qliksense_operator::crd::QliksenseSpec;

fn seed(cluster: &FakeCluster) {
    for (kind, name) in [
        (ResourceKind::of::<Deployment>(), "engine"),
        (ResourceKind::of::<StatefulSet>(), "mongodb"),
        (ResourceKind::of::<ConfigMap>(), "engine-configs"),
        (engine_kind(), "reload-engine"),
    ] {
        cluster.insert_object(&kind, tracked_object(&kind, name, "qlik-default"));
    }
    // Belongs to another release
    let deployment = ResourceKind::of::<Deployment>();
    cluster.insert_object(&deployment, tracked_object(&deployment, "hub", "qlik-other"));
}

#[tokio::test]
async fn test_second_pass_makes_no_writes() {
    let cluster = FakeCluster::new();
    seed(&cluster);
    let q = qliksense("qlik-default", QliksenseSpec::default());

    let updated = reconcile_owners(cluster.as_ref(), &q, &[engine_kind()]).await.unwrap();
    assert_eq!(updated, 4);
    assert_eq!(cluster.writes().set_owner, 4);

    cluster.reset_writes();
    let updated = reconcile_owners(cluster.as_ref(), &q, &[engine_kind()]).await.unwrap();
    assert_eq!(updated, 0);
    assert_eq!(cluster.writes().total(), 0);

    let hub = cluster
        .objects(&ResourceKind::of::<Deployment>())
        .into_iter()
        .find(|o| o.name_any() == "hub")
        .unwrap();
    assert!(hub.owner_references().is_empty());
}

#[tokio::test]
async fn test_missing_dynamic_kind_is_skipped() {
    let cluster = FakeCluster::new();
    seed(&cluster);
    let missing = ResourceKind::parse("qixmanager.qlik.com/v1/Reload/reloads").unwrap();
    cluster.remove_kind(&missing);
    let q = qliksense("qlik-default", QliksenseSpec::default());

    let updated = reconcile_owners(cluster.as_ref(), &q, &[missing, engine_kind()])
        .await
        .unwrap();
    assert_eq!(updated, 4);
}

#[tokio::test]
async fn test_missing_builtin_kind_is_an_error() {
    let cluster = FakeCluster::new();
    cluster.remove_kind(&ResourceKind::of::<Deployment>());
    let q = qliksense("qlik-default", QliksenseSpec::default());

    assert!(reconcile_owners(cluster.as_ref(), &q, &[]).await.is_err());
}

#[tokio::test]
async fn test_foreign_controller_is_left_alone() {
    let cluster = FakeCluster::new();
    let kind = ResourceKind::of::<Deployment>();
    let mut object = tracked_object(&kind, "engine", "qlik-default");
    object.owner_references_mut().push(OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "ReplicaSet".to_string(),
        name: "engine-abc".to_string(),
        uid: "uid-foreign".to_string(),
        controller: Some(true),
        ..OwnerReference::default()
    });
    cluster.insert_object(&kind, object);
    let q = qliksense("qlik-default", QliksenseSpec::default());

    let updated = reconcile_owners(cluster.as_ref(), &q, &[]).await.unwrap();
    assert_eq!(updated, 0);
    assert_eq!(cluster.objects(&kind)[0].owner_references().len(), 1);
}
