// Tenant seed file for the dev node's in-memory tenant store.
use anyhow::{Context, Result};
use ember_common::Tenant;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct TenantsFile {
    #[serde(default)]
    tenants: Vec<Tenant>,
}

/// Reads tenants from a YAML file of the form `tenants: [{tenant_id: ..}]`.
pub fn load_tenants(path: &Path) -> Result<Vec<Tenant>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read tenants file: {}", path.display()))?;
    parse_tenants(&contents).with_context(|| format!("parse tenants file: {}", path.display()))
}

pub fn parse_tenants(contents: &str) -> Result<Vec<Tenant>> {
    let file: TenantsFile = serde_yaml::from_str(contents)?;
    let mut seen = HashSet::new();
    for tenant in &file.tenants {
        anyhow::ensure!(!tenant.tenant_id.trim().is_empty(), "tenant_id must not be blank");
        anyhow::ensure!(
            seen.insert(tenant.tenant_id.as_str()),
            "duplicate tenant_id {}",
            tenant.tenant_id
        );
    }
    Ok(file.tenants)
}
