//! Anomaly classification.
//!
//! Turns the samples matched by a rule into typed records, one per sample.
//! Order is preserved and nothing is deduplicated.

use serde::{Deserialize, Serialize};

use crate::config::RecoveryKind;
use crate::error::{Error, Result};
use crate::query::{Labels, QueryResult};

/// A faulty pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodAnomaly {
    pub name: String,
    pub namespace: String,
    pub instance: String,
}

/// A faulty host service, located through the pod that reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAnomaly {
    pub service_name: String,
    pub pod_name: String,
    pub instance: String,
}

/// A single detected faulty workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AnomalyRecord {
    Pod(PodAnomaly),
    Service(ServiceAnomaly),
}

impl AnomalyRecord {
    pub fn kind(&self) -> RecoveryKind {
        match self {
            Self::Pod(_) => RecoveryKind::Pod,
            Self::Service(_) => RecoveryKind::Service,
        }
    }

    /// Name of the pod the record points at.
    pub fn pod_name(&self) -> &str {
        match self {
            Self::Pod(pod) => &pod.name,
            Self::Service(service) => &service.pod_name,
        }
    }

    fn from_labels(labels: &Labels, kind: RecoveryKind) -> Self {
        let label = |key: &str| labels.get(key).cloned().unwrap_or_default();
        match kind {
            RecoveryKind::Pod => Self::Pod(PodAnomaly {
                name: label("pod"),
                namespace: label("namespace"),
                instance: label("instance"),
            }),
            RecoveryKind::Service => Self::Service(ServiceAnomaly {
                service_name: label("name"),
                pod_name: label("pod"),
                instance: label("instance"),
            }),
        }
    }
}

impl std::fmt::Display for AnomalyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pod(pod) => write!(f, "pod {}/{}", pod.namespace, pod.name),
            Self::Service(svc) => write!(f, "service {} (pod {})", svc.service_name, svc.pod_name),
        }
    }
}

/// Classify every sample of `result` as a service or pod anomaly.
pub fn classify(result: &QueryResult, is_service: bool) -> Result<Vec<AnomalyRecord>> {
    let kind = if is_service {
        RecoveryKind::Service
    } else {
        RecoveryKind::Pod
    };
    classify_as(result, kind)
}

/// Classify every sample of `result` as an anomaly of `kind`.
pub fn classify_as(result: &QueryResult, kind: RecoveryKind) -> Result<Vec<AnomalyRecord>> {
    let label_sets = result
        .label_sets()
        .ok_or_else(|| Error::UnsupportedResultKind(result.kind().to_string()))?;

    Ok(label_sets
        .into_iter()
        .map(|labels| AnomalyRecord::from_labels(labels, kind))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Sample, Series};

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn vector(sets: Vec<Labels>) -> QueryResult {
        QueryResult::Vector(
            sets.into_iter()
                .map(|metric| Sample {
                    metric,
                    value: (0.0, "1".to_string()),
                })
                .collect(),
        )
    }

    #[test]
    fn test_pod_records_match_samples() {
        let sets = vec![
            labels(&[("pod", "api-0"), ("namespace", "prod"), ("instance", "10.0.0.1:9100")]),
            labels(&[("pod", "api-1"), ("namespace", "prod"), ("instance", "10.0.0.2:9100")]),
            labels(&[("pod", "db-0"), ("namespace", "data")]),
        ];
        let records = classify(&vector(sets.clone()), false).unwrap();

        assert_eq!(records.len(), sets.len());
        for (record, source) in records.iter().zip(&sets) {
            let AnomalyRecord::Pod(pod) = record else {
                panic!("expected pod record, got {record:?}");
            };
            assert_eq!(&pod.name, source.get("pod").unwrap());
            assert_eq!(&pod.namespace, source.get("namespace").unwrap());
            assert_eq!(
                pod.instance,
                source.get("instance").cloned().unwrap_or_default()
            );
        }
    }

    #[test]
    fn test_service_records_from_matrix() {
        let result = QueryResult::Matrix(vec![Series {
            metric: labels(&[("name", "kubelet"), ("pod", "node-exporter-x1"), ("instance", "n1")]),
            values: vec![(0.0, "0".to_string())],
        }]);

        let records = classify(&result, true).unwrap();
        assert_eq!(
            records,
            vec![AnomalyRecord::Service(ServiceAnomaly {
                service_name: "kubelet".to_string(),
                pod_name: "node-exporter-x1".to_string(),
                instance: "n1".to_string(),
            })]
        );
        assert_eq!(records[0].kind(), RecoveryKind::Service);
        assert_eq!(records[0].pod_name(), "node-exporter-x1");
    }

    #[test]
    fn test_duplicates_are_kept_in_order() {
        let same = labels(&[("pod", "api-0"), ("namespace", "prod")]);
        let other = labels(&[("pod", "api-1"), ("namespace", "prod")]);
        let records = classify(&vector(vec![same.clone(), other, same]), false).unwrap();

        let names: Vec<_> = records.iter().map(AnomalyRecord::pod_name).collect();
        assert_eq!(names, vec!["api-0", "api-1", "api-0"]);
    }

    #[test]
    fn test_empty_result_is_not_an_error() {
        assert!(classify(&QueryResult::Vector(vec![]), false).unwrap().is_empty());
        assert!(classify(&QueryResult::Matrix(vec![]), true).unwrap().is_empty());
    }

    #[test]
    fn test_scalar_is_unsupported() {
        let err = classify(&QueryResult::Scalar((0.0, "1".to_string())), false).unwrap_err();
        assert!(matches!(err, Error::UnsupportedResultKind(kind) if kind == "scalar"));
    }
}
