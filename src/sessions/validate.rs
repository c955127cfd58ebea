//! Input validation for session targets and ports.

use crate::error::SessionError;

/// Kubernetes object names: DNS-1123 subdomain (lowercase alphanumerics,
/// `-` and `.`, alphanumeric at both ends of each label), 1-253 chars.
pub fn is_valid_pod_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 253 && name.split('.').all(is_dns_label)
}

/// Namespaces: a single DNS-1123 label, 1-63 chars.
pub fn is_valid_namespace(name: &str) -> bool {
    name.len() <= 63 && is_dns_label(name)
}

fn is_dns_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

/// Reject a `(namespace, pod)` pair that cannot name a pod.
pub fn validate_target(namespace: &str, pod: &str) -> Result<(), SessionError> {
    if namespace.is_empty() || pod.is_empty() {
        return Err(SessionError::InvalidParameter(
            "pod and namespace are required".to_string(),
        ));
    }
    if !is_valid_namespace(namespace) {
        return Err(SessionError::InvalidParameter(format!(
            "invalid namespace {namespace:?}: must be a lowercase DNS label"
        )));
    }
    if !is_valid_pod_name(pod) {
        return Err(SessionError::InvalidParameter(format!(
            "invalid pod name {pod:?}: must be a lowercase DNS subdomain"
        )));
    }
    Ok(())
}

/// Range-check a TCP port given as a raw integer.
pub fn check_port(field: &str, value: i64) -> Result<u16, SessionError> {
    match u16::try_from(value) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(SessionError::InvalidParameter(format!(
            "{field} must be between 1 and 65535 (got {value})"
        ))),
    }
}
