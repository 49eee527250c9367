//! Label selectors
//!
//! Converts a `LabelSelector` from a policy into a validated [`Selector`]
//! that can be rendered for list calls against the API server and matched
//! in-process against cached objects.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::In(k, vs) => labels.get(k).map_or(false, |v| vs.contains(v)),
            Requirement::NotIn(k, vs) => labels.get(k).map_or(true, |v| !vs.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{}={}", k, v),
            Requirement::In(k, vs) => write!(f, "{} in ({})", k, vs.join(",")),
            Requirement::NotIn(k, vs) => write!(f, "{} notin ({})", k, vs.join(",")),
            Requirement::Exists(k) => write!(f, "{}", k),
            Requirement::DoesNotExist(k) => write!(f, "!{}", k),
        }
    }
}

/// A validated label selector. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    /// Selector that matches every object
    pub fn everything() -> Self {
        Self::default()
    }

    /// Validate and convert a `LabelSelector`
    pub fn from_label_selector(selector: &LabelSelector) -> Result<Self> {
        let mut requirements = Vec::new();

        if let Some(labels) = &selector.match_labels {
            for (k, v) in labels {
                validate_key(k)?;
                requirements.push(Requirement::Equals(k.clone(), v.clone()));
            }
        }

        for expr in selector.match_expressions.iter().flatten() {
            validate_key(&expr.key)?;
            let values = expr.values.clone().unwrap_or_default();
            let req = match expr.operator.as_str() {
                "In" | "NotIn" if values.is_empty() => {
                    return Err(Error::Selector(format!(
                        "operator {} on key {:?} requires at least one value",
                        expr.operator, expr.key
                    )));
                }
                "Exists" | "DoesNotExist" if !values.is_empty() => {
                    return Err(Error::Selector(format!(
                        "operator {} on key {:?} must not have values",
                        expr.operator, expr.key
                    )));
                }
                "In" => Requirement::In(expr.key.clone(), values),
                "NotIn" => Requirement::NotIn(expr.key.clone(), values),
                "Exists" => Requirement::Exists(expr.key.clone()),
                "DoesNotExist" => Requirement::DoesNotExist(expr.key.clone()),
                other => {
                    return Err(Error::Selector(format!(
                        "unknown operator {:?} on key {:?}",
                        other, expr.key
                    )));
                }
            };
            requirements.push(req);
        }

        Ok(Self { requirements })
    }

    /// Convert an optional selector, treating absence as "everything"
    pub fn from_optional(selector: Option<&LabelSelector>) -> Result<Self> {
        selector
            .map(Self::from_label_selector)
            .transpose()
            .map(Option::unwrap_or_default)
    }

    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 253
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(())
    } else {
        Err(Error::Selector(format!("invalid label key {:?}", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expr(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: op.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn test_match_labels_and_expressions() {
        let sel = Selector::from_label_selector(&LabelSelector {
            match_labels: Some(labels(&[("app", "web")])),
            match_expressions: Some(vec![
                expr("tier", "In", &["frontend", "edge"]),
                expr("legacy", "DoesNotExist", &[]),
            ]),
        })
        .unwrap();

        assert!(sel.matches(&labels(&[("app", "web"), ("tier", "edge")])));
        assert!(!sel.matches(&labels(&[("app", "web"), ("tier", "backend")])));
        assert!(!sel.matches(&labels(&[("app", "web"), ("tier", "edge"), ("legacy", "1")])));
        assert_eq!(sel.to_string(), "app=web,tier in (frontend,edge),!legacy");
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let sel = Selector::from_optional(None).unwrap();
        assert!(sel.is_everything());
        assert!(sel.matches(&BTreeMap::new()));
        assert_eq!(sel.to_string(), "");
    }

    #[test]
    fn test_invalid_operator_is_selector_error() {
        let err = Selector::from_label_selector(&LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![expr("app", "Like", &["web"])]),
        })
        .unwrap_err();
        assert!(matches!(err, Error::Selector(_)));
    }

    #[test]
    fn test_in_without_values_is_rejected() {
        let result = Selector::from_label_selector(&LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![expr("app", "In", &[])]),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_not_in_matches_missing_key() {
        let sel = Selector::from_label_selector(&LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![expr("env", "NotIn", &["prod"])]),
        })
        .unwrap();
        assert!(sel.matches(&BTreeMap::new()));
        assert!(!sel.matches(&labels(&[("env", "prod")])));
    }
}
