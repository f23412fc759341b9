//! Retriever-driven cleanup passes and the one-shot startup runnables.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

use app_routing_operator::controller::manager::Runnable;
use app_routing_operator::controller::startup::{
    DefaultNginxController, LegacyCleanup, legacy_retriever,
};
use app_routing_operator::crd::{DEFAULT_INGRESS_CLASS, NginxIngressController};
use app_routing_operator::resources::common::{
    COMPONENT_LABEL, managed_meta, top_level_labels,
};
use app_routing_operator::resources::lifecycle::clean;
use app_routing_operator::resources::retriever::{CleanRetriever, StaticTypeMapper};
use app_routing_operator::resources::store::{GroupKind, ManagedObject, ResourceType};

use crate::fake_store::FakeStore;

const NS: &str = "app-routing-system";

fn deployment(name: &str, component: &str) -> ManagedObject {
    let mut labels = top_level_labels();
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    ManagedObject::from_typed(&Deployment {
        metadata: managed_meta(name, Some(NS), labels, None),
        ..Default::default()
    })
    .unwrap()
}

fn namespace(name: &str) -> ManagedObject {
    ManagedObject::from_typed(&Namespace {
        metadata: managed_meta(name, None, top_level_labels(), None),
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_clean_exempts_namespaces() {
    let store = FakeStore::new();
    store.insert(namespace(NS));
    store.insert(
        ManagedObject::from_typed(&ConfigMap {
            metadata: managed_meta("leftover", Some(NS), top_level_labels(), None),
            ..Default::default()
        })
        .unwrap(),
    );
    let retriever = CleanRetriever::from_group_kinds(
        top_level_labels(),
        [GroupKind::of::<Namespace>(), GroupKind::of::<ConfigMap>()],
    );

    clean(&store, &StaticTypeMapper::builtin(), &retriever)
        .await
        .unwrap();

    assert!(store.contains(&ResourceType::of::<Namespace>(), None, NS));
    assert!(!store.contains(&ResourceType::of::<ConfigMap>(), Some(NS), "leftover"));
}

#[tokio::test]
async fn test_clean_of_empty_retriever_is_a_no_op() {
    let store = FakeStore::new();
    store.insert(deployment("nginx", "ingress-controller"));

    clean(&store, &StaticTypeMapper::builtin(), &CleanRetriever::empty())
        .await
        .unwrap();

    assert!(store.ops().is_empty());
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_clean_deduplicates_overlapping_descriptors() {
    let store = FakeStore::new();
    store.insert(deployment("old", "osm-integration"));
    let retriever = legacy_retriever().add(&legacy_retriever());

    clean(&store, &StaticTypeMapper::builtin(), &retriever)
        .await
        .unwrap();

    assert_eq!(store.deletes(), vec!["old".to_string()]);
}

#[tokio::test]
async fn test_legacy_cleanup_only_touches_retired_components() {
    let store = Arc::new(FakeStore::new());
    store.insert(deployment("osm-bridge", "osm-integration"));
    store.insert(deployment("placeholder", "keyvault-placeholder"));
    store.insert(deployment("nginx", "ingress-controller"));
    store.insert(namespace(NS));

    let runnable = LegacyCleanup::new(store.clone(), Arc::new(StaticTypeMapper::builtin()));
    runnable.start(CancellationToken::new()).await.unwrap();

    let deployments = ResourceType::of::<Deployment>();
    assert!(!store.contains(&deployments, Some(NS), "osm-bridge"));
    assert!(!store.contains(&deployments, Some(NS), "placeholder"));
    assert!(store.contains(&deployments, Some(NS), "nginx"));
    assert!(store.contains(&ResourceType::of::<Namespace>(), None, NS));
    assert!(runnable.need_leader_election());
}

#[tokio::test]
async fn test_default_nginx_controller_is_created_once() {
    let store = Arc::new(FakeStore::new());
    let runnable = DefaultNginxController::new(store.clone());

    runnable.start(CancellationToken::new()).await.unwrap();
    runnable.start(CancellationToken::new()).await.unwrap();

    assert_eq!(store.len(), 1);
    let object = store
        .object(&ResourceType::of::<NginxIngressController>(), None, "default")
        .unwrap();
    assert_eq!(object.labels(), &top_level_labels());
    assert_eq!(object.data["spec"]["ingressClassName"], DEFAULT_INGRESS_CLASS);
}

#[tokio::test]
async fn test_startup_runnable_stops_on_shutdown() {
    let store = Arc::new(FakeStore::new());
    store.fail_writes_to("default");
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let result = DefaultNginxController::new(store)
        .start(shutdown)
        .await;

    assert!(matches!(
        result,
        Err(app_routing_operator::controller::error::Error::Cancelled)
    ));
}
