//! Reconciliation keys (`namespace/name`).

use crate::error::ControllerError;
use kube::Resource;

/// Key of an object: `namespace/name`, or just `name` for cluster-scoped objects.
pub fn object_key<K: Resource>(obj: &K) -> String {
    let meta = obj.meta();
    let name = meta.name.as_deref().unwrap_or_default();
    match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

/// Splits a key into `(namespace, name)`.
///
/// A key without a slash is a cluster-scoped name with an empty namespace.
/// More than one slash, or an empty name, is rejected.
pub fn split_key(key: &str) -> Result<(&str, &str), ControllerError> {
    let (namespace, name) = match key.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => ("", key),
    };
    if name.is_empty() || name.contains('/') {
        return Err(ControllerError::MalformedKey(key.to_string()));
    }
    Ok((namespace, name))
}
