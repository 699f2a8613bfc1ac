//! Role lookup from a static inventory.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use crate::collab::{CollabError, RoleResolver};

/// Maps role names to node addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
  roles: BTreeMap<String, String>,
}

impl StaticInventory {
  pub fn new(roles: BTreeMap<String, String>) -> Self {
    Self { roles }
  }
}

#[async_trait]
impl RoleResolver for StaticInventory {
  async fn resolve_role(&self, role: &str) -> Result<String, CollabError> {
    let address = self
      .roles
      .get(role)
      .cloned()
      .ok_or_else(|| CollabError::RoleNotFound(role.to_string()))?;
    debug!(role, %address, "resolved role");
    Ok(address)
  }
}
