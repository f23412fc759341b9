// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for app-routing-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation through the public API.

mod crd_tests {
    use app_routing_operator::crd::{
        Condition, ConditionType, DEFAULT_CONTROLLER_NAME, DEFAULT_INGRESS_CLASS,
        NginxIngressController, NginxIngressControllerSpec,
    };

    #[test]
    fn test_condition_available() {
        let condition = Condition::available(true, "Reconciled", "All objects applied", Some(1));
        assert_eq!(condition.r#type, "Available");
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, "Reconciled");
        assert_eq!(condition.observed_generation, Some(1));
    }

    #[test]
    fn test_condition_degraded() {
        let condition = Condition::degraded(true, "ApplyFailed", "Deployment rejected", Some(3));
        assert_eq!(condition.r#type, ConditionType::Degraded.to_string());
        assert_eq!(condition.status, "True");
    }

    #[test]
    fn test_default_instance() {
        let nic = NginxIngressController::default_instance();
        assert_eq!(nic.metadata.name.as_deref(), Some(DEFAULT_CONTROLLER_NAME));
        assert_eq!(nic.spec.ingress_class_name, DEFAULT_INGRESS_CLASS);
        assert_eq!(nic.resource_name(), "nginx");
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let nic = NginxIngressController::new(
            "internal",
            NginxIngressControllerSpec {
                ingress_class_name: "internal".to_string(),
                controller_name_prefix: "nginx".to_string(),
                default_ssl_certificate: None,
            },
        );
        let value = serde_json::to_value(&nic).unwrap();
        assert_eq!(value["spec"]["ingressClassName"], "internal");
        assert_eq!(value["spec"]["controllerNamePrefix"], "nginx");
        assert!(value["spec"].get("defaultSSLCertificate").is_none());
    }
}

mod error_tests {
    use std::time::Duration;

    use app_routing_operator::controller::error::Error;

    fn api(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::core::Status::failure("", "").with_code(code).boxed()))
    }

    #[test]
    fn test_classification() {
        assert!(api(404).is_not_found());
        assert!(api(409).is_conflict());
        assert!(api(429).is_retryable());
        assert!(api(503).is_retryable());
        assert!(!api(400).is_retryable());
        assert!(!Error::Validation("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_requeue_after() {
        assert_eq!(api(409).requeue_after(), Duration::from_secs(1));
        assert_eq!(api(500).requeue_after(), Duration::from_secs(30));
        assert_eq!(
            Error::Validation("bad".to_string()).requeue_after(),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_from_batch() {
        assert!(Error::from_batch(Vec::new()).is_ok());
        assert!(matches!(
            Error::from_batch(vec![api(500)]),
            Err(Error::Kube(_))
        ));
        let err = Error::from_batch(vec![api(404), api(404)]).unwrap_err();
        assert!(matches!(&err, Error::Aggregate(errors) if errors.len() == 2));
        assert!(err.is_not_found());
    }
}

mod labels_tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use app_routing_operator::resources::common::{
        MANAGED_BY_LABEL, is_managed, label_selector, standard_labels, top_level_labels,
    };

    #[test]
    fn test_managed_requires_top_level_labels() {
        let mut meta = ObjectMeta {
            labels: Some(standard_labels("nginx", "ingress-controller")),
            ..Default::default()
        };
        assert!(is_managed(&meta));

        meta.labels = Some(BTreeMap::from([(
            MANAGED_BY_LABEL.to_string(),
            "someone-else".to_string(),
        )]));
        assert!(!is_managed(&meta));

        meta.labels = None;
        assert!(!is_managed(&meta));
    }

    #[test]
    fn test_label_selector() {
        assert_eq!(
            label_selector(&top_level_labels()),
            "app.kubernetes.io/managed-by=aks-app-routing-operator"
        );
    }
}

mod config_tests {
    use clap::Parser;

    use app_routing_operator::config::Config;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::try_parse_from(["app-routing-operator"]).unwrap();
        config.validate().unwrap();
        let watchdog = config.watchdog();
        assert_eq!(watchdog.min_votes_before_eviction, 3);
        assert_eq!(watchdog.min_percent_over_avg_before_vote, 200.0);
        assert_eq!(watchdog.vote_ttl.as_secs(), 600);
        assert_eq!(watchdog.min_pod_age.as_secs(), 300);
    }

    #[test]
    fn test_threshold_must_exceed_average() {
        let config = Config::try_parse_from([
            "app-routing-operator",
            "--watchdog-min-percent-over-avg",
            "90",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }
}

mod nginx_resources_tests {
    use app_routing_operator::crd::NginxIngressController;
    use app_routing_operator::resources::nginx::desired_resources;

    #[test]
    fn test_object_graph_kinds() {
        let nic = NginxIngressController::default_instance();
        let kinds: Vec<String> = desired_resources(&nic, "app-routing-system")
            .unwrap()
            .into_iter()
            .map(|o| o.resource.kind)
            .collect();
        assert_eq!(
            kinds,
            [
                "IngressClass",
                "ServiceAccount",
                "ClusterRole",
                "ClusterRoleBinding",
                "Deployment",
                "Service",
                "PodDisruptionBudget",
            ]
        );
    }
}
