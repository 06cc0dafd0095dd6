//! Node labels interpreted by the monitor
//!
//! Label values are decoded exactly once, at the watch boundary, into
//! [`NodeLabelState`]. Nothing downstream compares raw label strings.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;

use crate::error::Error;

/// Label enabling, soft-disabling or uninstalling the stack on a node
pub const ENABLEMENT_LABEL: &str = "px/enabled";

/// Label carrying a one-shot service control request
pub const SERVICE_LABEL: &str = "px/service";

/// Canonical value written back after an uninstall
pub const DISABLED_VALUE: &str = "false";

const UNINSTALL_VALUES: [&str; 3] = ["uninstall", "remove", "rm"];

/// Decoded value of [`ENABLEMENT_LABEL`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Enablement {
    /// Label absent or any value not recognised as disabling
    #[default]
    Enabled,
    /// `false`: disabled, cleanup is left to an external controller
    SoftDisabled,
    /// `uninstall`, `remove` or `rm`
    UninstallRequested,
}

impl Enablement {
    pub fn parse(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Enablement::Enabled;
        };
        let value = value.trim().to_ascii_lowercase();
        if value == DISABLED_VALUE {
            Enablement::SoftDisabled
        } else if UNINSTALL_VALUES.contains(&value.as_str()) {
            Enablement::UninstallRequested
        } else {
            Enablement::Enabled
        }
    }

    pub fn is_disabled(self) -> bool {
        !matches!(self, Enablement::Enabled)
    }
}

/// Lifecycle verbs accepted through labels and the REST endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceRequest {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
}

impl ServiceRequest {
    pub const ALL: [ServiceRequest; 5] = [
        ServiceRequest::Start,
        ServiceRequest::Stop,
        ServiceRequest::Restart,
        ServiceRequest::Enable,
        ServiceRequest::Disable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceRequest::Start => "start",
            ServiceRequest::Stop => "stop",
            ServiceRequest::Restart => "restart",
            ServiceRequest::Enable => "enable",
            ServiceRequest::Disable => "disable",
        }
    }
}

impl fmt::Display for ServiceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        ServiceRequest::ALL
            .into_iter()
            .find(|r| r.as_str() == lower)
            .ok_or_else(|| Error::UnsupportedRequest(s.to_string()))
    }
}

/// Decoded value of [`SERVICE_LABEL`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ServiceLabel {
    #[default]
    Absent,
    Request(ServiceRequest),
    /// Present but not a supported verb
    Ignored(String),
}

impl ServiceLabel {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => ServiceLabel::Absent,
            Some(v) => match v.parse::<ServiceRequest>() {
                Ok(req) => ServiceLabel::Request(req),
                Err(_) => ServiceLabel::Ignored(v.to_ascii_lowercase()),
            },
        }
    }
}

/// The labels of a node this daemon acts upon
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeLabelState {
    pub enablement: Enablement,
    pub service: ServiceLabel,
}

impl NodeLabelState {
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self {
            enablement: Enablement::parse(labels.get(ENABLEMENT_LABEL).map(String::as_str)),
            service: ServiceLabel::parse(labels.get(SERVICE_LABEL).map(String::as_str)),
        }
    }

    pub fn from_node(node: &Node) -> Self {
        Self::from_labels(node.labels())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_absent_enablement_means_enabled() {
        let state = NodeLabelState::from_labels(&BTreeMap::new());
        assert_eq!(state.enablement, Enablement::Enabled);
        assert_eq!(state.service, ServiceLabel::Absent);
    }

    #[test]
    fn test_enablement_values() {
        assert_eq!(Enablement::parse(Some("false")), Enablement::SoftDisabled);
        assert_eq!(Enablement::parse(Some("FALSE")), Enablement::SoftDisabled);
        for v in ["uninstall", "remove", "rm", "Remove"] {
            assert_eq!(Enablement::parse(Some(v)), Enablement::UninstallRequested);
        }
        assert_eq!(Enablement::parse(Some("true")), Enablement::Enabled);
        assert_eq!(Enablement::parse(Some("whatever")), Enablement::Enabled);
        assert!(Enablement::SoftDisabled.is_disabled());
        assert!(!Enablement::Enabled.is_disabled());
    }

    #[test]
    fn test_service_label_decoding() {
        let state = NodeLabelState::from_labels(&labels(&[(SERVICE_LABEL, "Restart")]));
        assert_eq!(state.service, ServiceLabel::Request(ServiceRequest::Restart));

        let state = NodeLabelState::from_labels(&labels(&[(SERVICE_LABEL, "reboot")]));
        assert_eq!(state.service, ServiceLabel::Ignored("reboot".into()));

        let state = NodeLabelState::from_labels(&labels(&[(SERVICE_LABEL, "")]));
        assert_eq!(state.service, ServiceLabel::Absent);
    }

    #[test]
    fn test_service_request_round_trip_names() {
        for req in ServiceRequest::ALL {
            assert_eq!(req.as_str().parse::<ServiceRequest>().unwrap(), req);
        }
        assert!(matches!(
            "install".parse::<ServiceRequest>(),
            Err(Error::UnsupportedRequest(_))
        ));
    }
}
