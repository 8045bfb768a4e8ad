//! Store ids and cache keys.
//!
//! Every component is percent-encoded before joining, so separators inside
//! an org, service or version name cannot make two identities collide.

use urlencoding::encode;

/// Fixed id of the data-version marker record
pub const DATA_VERSION_ID: &str = "instance";

fn join(parts: &[&str], separator: &str) -> String {
    parts
        .iter()
        .map(|part| encode(part).into_owned())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Store id of a service record
pub fn service_id(organization_id: &str, service_id: &str, version: &str) -> String {
    join(&[organization_id, service_id, version], ":")
}

/// Store id of an application record
pub fn application_id(organization_id: &str, application_id: &str, version: &str) -> String {
    join(&[organization_id, application_id, version], ":")
}

pub fn service_cache_key(organization_id: &str, service_id: &str, version: &str) -> String {
    format!("SVC::{}", join(&[organization_id, service_id, version], "|"))
}

pub fn application_cache_key(organization_id: &str, application_id: &str, version: &str) -> String {
    format!("APP::{}", join(&[organization_id, application_id, version], "|"))
}

pub fn contract_cache_key(api_key: &str) -> String {
    format!("CONTRACT::{}", encode(api_key))
}
