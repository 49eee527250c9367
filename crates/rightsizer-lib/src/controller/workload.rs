//! Workload objects the controller can write resources back to

use crate::models::{WorkloadKind, WorkloadRef};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};
use kube::ResourceExt;
use std::collections::BTreeMap;

/// An updatable workload, one variant per supported kind
#[derive(Debug, Clone, PartialEq)]
pub enum Workload {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::StatefulSet(_) => WorkloadKind::StatefulSet,
            Workload::DaemonSet(_) => WorkloadKind::DaemonSet,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Workload::Deployment(d) => d.name_any(),
            Workload::StatefulSet(s) => s.name_any(),
            Workload::DaemonSet(d) => d.name_any(),
        }
    }

    pub fn namespace(&self) -> String {
        let ns = match self {
            Workload::Deployment(d) => d.namespace(),
            Workload::StatefulSet(s) => s.namespace(),
            Workload::DaemonSet(d) => d.namespace(),
        };
        ns.unwrap_or_default()
    }

    pub fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef::new(self.namespace(), self.kind(), self.name())
    }

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Workload::Deployment(d) => d.spec.as_ref().map(|s| &s.template),
            Workload::StatefulSet(s) => s.spec.as_ref().map(|s| &s.template),
            Workload::DaemonSet(d) => d.spec.as_ref().map(|s| &s.template),
        }
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        match self {
            Workload::Deployment(d) => d.spec.as_mut().map(|s| &mut s.template),
            Workload::StatefulSet(s) => s.spec.as_mut().map(|s| &mut s.template),
            Workload::DaemonSet(d) => d.spec.as_mut().map(|s| &mut s.template),
        }
    }

    /// Containers of the pod template
    pub fn containers(&self) -> &[Container] {
        self.pod_template()
            .and_then(|t| t.spec.as_ref())
            .map(|s| s.containers.as_slice())
            .unwrap_or_default()
    }

    pub fn containers_mut(&mut self) -> Option<&mut Vec<Container>> {
        self.pod_template_mut()
            .and_then(|t| t.spec.as_mut())
            .map(|s| &mut s.containers)
    }

    /// Labels stamped on the pods this workload creates
    pub fn template_labels(&self) -> BTreeMap<String, String> {
        self.pod_template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DaemonSetSpec, DeploymentSpec, StatefulSetSpec};
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn template(app: &str) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    fn deployment() -> Workload {
        Workload::Deployment(Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: template("web"),
                ..Default::default()
            }),
            status: None,
        })
    }

    #[test]
    fn test_identity_and_template() {
        let w = deployment();
        assert_eq!(w.kind(), WorkloadKind::Deployment);
        assert_eq!(w.workload_ref().to_string(), "shop/Deployment/web");
        assert_eq!(w.containers().len(), 1);
        assert_eq!(w.template_labels()["app"], "web");
    }

    #[test]
    fn test_containers_mut_reaches_every_kind() {
        let mut workloads = vec![
            deployment(),
            Workload::StatefulSet(StatefulSet {
                metadata: ObjectMeta {
                    name: Some("db".to_string()),
                    ..Default::default()
                },
                spec: Some(StatefulSetSpec {
                    template: template("db"),
                    ..Default::default()
                }),
                status: None,
            }),
            Workload::DaemonSet(DaemonSet {
                metadata: ObjectMeta {
                    name: Some("agent".to_string()),
                    ..Default::default()
                },
                spec: Some(DaemonSetSpec {
                    template: template("agent"),
                    ..Default::default()
                }),
                status: None,
            }),
        ];

        for w in &mut workloads {
            w.containers_mut().unwrap()[0].image = Some("app:2".to_string());
            assert_eq!(w.containers()[0].image.as_deref(), Some("app:2"));
        }
        assert_eq!(workloads[1].kind(), WorkloadKind::StatefulSet);
        assert_eq!(workloads[2].template_labels()["app"], "agent");
    }

    #[test]
    fn test_missing_spec_has_no_containers() {
        let mut w = Workload::DaemonSet(DaemonSet::default());
        assert!(w.containers().is_empty());
        assert!(w.containers_mut().is_none());
    }
}
