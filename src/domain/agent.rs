//! Support agents eligible for conversation assignment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{validate_tenant, AgentId, TenantId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub email: String,
    /// `None` means the agent serves every tenant.
    pub tenant_id: Option<TenantId>,
    pub available: bool,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: &str, email: &str, tenant_id: Option<TenantId>) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::validation("agent name is required"));
        }
        if !email.contains('@') {
            return Err(Error::validation(format!("invalid agent email '{}'", email)));
        }
        if let Some(tenant_id) = tenant_id {
            validate_tenant(tenant_id)?;
        }
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.trim().to_string(),
            email: email.trim().to_lowercase(),
            tenant_id,
            available: true,
            created_at: Utc::now(),
        })
    }

    pub fn serves(&self, tenant_id: TenantId) -> bool {
        self.tenant_id.map_or(true, |t| t == tenant_id)
    }
}
