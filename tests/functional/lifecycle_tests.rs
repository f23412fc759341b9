//! Lifecycle protocol against the in-memory store.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use app_routing_operator::resources::common::{
    NAME_LABEL, managed_meta, standard_labels, top_level_labels,
};
use app_routing_operator::resources::lifecycle::{reconcile_set, upsert};
use app_routing_operator::resources::retriever::{CleanRetriever, StaticTypeMapper, TypeDescriptor};
use app_routing_operator::resources::store::{GroupKind, ManagedObject, ResourceType};

use crate::fake_store::{FakeStore, Op};

const NS: &str = "app-routing-system";

fn config_map(name: &str, labels: BTreeMap<String, String>) -> ManagedObject {
    ManagedObject::from_typed(&ConfigMap {
        metadata: managed_meta(name, Some(NS), labels, None),
        ..Default::default()
    })
    .unwrap()
}

fn owned(name: &str) -> ManagedObject {
    config_map(name, standard_labels("web", "test"))
}

fn observed_config_maps(labels: BTreeMap<String, String>) -> Vec<TypeDescriptor> {
    CleanRetriever::from_group_kinds(labels, [GroupKind::of::<ConfigMap>()])
        .retrieve(&StaticTypeMapper::builtin())
        .unwrap()
}

#[tokio::test]
async fn test_upsert_is_idempotent() {
    let store = FakeStore::new();
    let object = owned("settings");

    upsert(&store, &object).await.unwrap();
    upsert(&store, &object).await.unwrap();

    assert_eq!(store.len(), 1);
    assert_eq!(
        store.ops(),
        vec![Op::Apply("settings".into()), Op::Apply("settings".into())]
    );
}

#[tokio::test]
async fn test_upsert_creates_when_apply_reports_missing() {
    let store = FakeStore::new().apply_requires_existing();
    let object = owned("settings");

    upsert(&store, &object).await.unwrap();
    upsert(&store, &object).await.unwrap();

    assert_eq!(
        store.ops(),
        vec![Op::Create("settings".into()), Op::Apply("settings".into())]
    );
}

#[tokio::test]
async fn test_reconcile_set_continues_past_upsert_failures() {
    let store = FakeStore::new();
    store.fail_writes_to("b");

    let result = reconcile_set(&store, &[owned("a"), owned("b"), owned("c")], &[]).await;

    assert!(result.is_err());
    let cm = ResourceType::of::<ConfigMap>();
    assert!(store.contains(&cm, Some(NS), "a"));
    assert!(!store.contains(&cm, Some(NS), "b"));
    assert!(store.contains(&cm, Some(NS), "c"));
}

#[tokio::test]
async fn test_reconcile_set_deletes_stale_owned_objects() {
    let store = FakeStore::new();
    store.insert(owned("stale"));
    let desired = [owned("kept")];

    reconcile_set(&store, &desired, &observed_config_maps(standard_labels("web", "test")))
        .await
        .unwrap();

    let cm = ResourceType::of::<ConfigMap>();
    assert!(store.contains(&cm, Some(NS), "kept"));
    assert!(!store.contains(&cm, Some(NS), "stale"));
    assert_eq!(store.deletes(), vec!["stale".to_string()]);
}

#[tokio::test]
async fn test_reconcile_set_never_deletes_unowned_objects() {
    let store = FakeStore::new();
    // Matches the observed selector but lacks the managed-by label.
    let selector = BTreeMap::from([(NAME_LABEL.to_string(), "web".to_string())]);
    store.insert(config_map("user-owned", selector.clone()));

    reconcile_set(&store, &[], &observed_config_maps(selector))
        .await
        .unwrap();

    assert!(store.contains(&ResourceType::of::<ConfigMap>(), Some(NS), "user-owned"));
    assert!(store.deletes().is_empty());
}

#[tokio::test]
async fn test_reconcile_set_never_deletes_namespaces() {
    let store = FakeStore::new();
    store.insert(
        ManagedObject::from_typed(&Namespace {
            metadata: ObjectMeta {
                name: Some(NS.to_string()),
                labels: Some(top_level_labels()),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap(),
    );
    let observed = CleanRetriever::from_group_kinds(top_level_labels(), [GroupKind::of::<Namespace>()])
        .retrieve(&StaticTypeMapper::builtin())
        .unwrap();

    reconcile_set(&store, &[], &observed).await.unwrap();

    assert!(store.contains(&ResourceType::of::<Namespace>(), None, NS));
}

#[tokio::test]
async fn test_reconcile_set_aggregates_delete_failures() {
    let store = FakeStore::new();
    store.insert(owned("stuck"));
    store.insert(owned("gone"));
    store.fail_writes_to("stuck");

    let result = reconcile_set(&store, &[], &observed_config_maps(top_level_labels())).await;

    assert!(result.is_err());
    let cm = ResourceType::of::<ConfigMap>();
    assert!(store.contains(&cm, Some(NS), "stuck"));
    assert!(!store.contains(&cm, Some(NS), "gone"));
}

#[tokio::test]
async fn test_reconcile_set_deletes_once_across_versions() {
    let store = FakeStore::new().graceful_deletes();
    store.insert(owned("stale"));
    let labels = standard_labels("web", "test");
    let v1 = ResourceType::of::<ConfigMap>();
    let mut beta = v1.clone();
    beta.version = "v1beta1".to_string();
    let observed = [
        TypeDescriptor {
            resource: v1,
            labels: labels.clone(),
        },
        TypeDescriptor {
            resource: beta,
            labels,
        },
    ];

    reconcile_set(&store, &[], &observed).await.unwrap();

    assert_eq!(store.deletes(), vec!["stale".to_string()]);
}
