//! Per-bot credentials.
//!
//! A `CredentialPlan` describes what each bot presents to the channel when it
//! connects. `CredentialSource` binds a plan to a fleet size, rejecting tables
//! that are too short, and then hands out one credential per bot index.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::error::FleetError;

/// Identity policy the service resolves on its side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPolicy {
    /// Ask the service for a fresh identity.
    CreateNew,
    /// Ask the service for the next unused identity.
    NextAvailable,
}

impl AuthPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthPolicy::CreateNew => "createNew",
            AuthPolicy::NextAvailable => "nextAvailable",
        }
    }
}

/// What a single bot presents when it connects.
#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    None,
    Policy(AuthPolicy),
    Login { id: String, password: String },
    /// A table record that is not an id/password pair; passed through as-is.
    Opaque(Value),
}

impl Credential {
    pub fn is_none(&self) -> bool {
        matches!(self, Credential::None)
    }

    /// Short description for log lines. Never includes secrets.
    pub fn summary(&self) -> String {
        match self {
            Credential::None => "no auth".to_string(),
            Credential::Policy(policy) => format!("auth: {}", policy.as_str()),
            Credential::Login { id, .. } => format!("auth: id={}", id),
            Credential::Opaque(_) => "auth: opaque record".to_string(),
        }
    }

    /// JSON form handed to the bot process, `None` when there is nothing to send.
    pub fn to_env_value(&self) -> Option<String> {
        let value = match self {
            Credential::None => return None,
            Credential::Policy(policy) => Value::String(policy.as_str().to_string()),
            Credential::Login { id, password } => json!({ "id": id, "pwd": password }),
            Credential::Opaque(value) => value.clone(),
        };
        Some(value.to_string())
    }

    fn from_record(record: Value) -> Self {
        if let Value::Object(map) = &record {
            let id = map.get("id").and_then(Value::as_str);
            let password = map
                .get("password")
                .or_else(|| map.get("pwd"))
                .and_then(Value::as_str);
            if let (Some(id), Some(password)) = (id, password) {
                return Credential::Login {
                    id: id.to_string(),
                    password: password.to_string(),
                };
            }
        }
        Credential::Opaque(record)
    }
}

/// Parses an `--auth` value: `new`, `next`, or `id:password`.
pub fn parse_auth(value: &str) -> Result<Credential, FleetError> {
    let trimmed = value.trim();
    match trimmed {
        "new" | "createNew" => return Ok(Credential::Policy(AuthPolicy::CreateNew)),
        "next" | "nextAvailable" => return Ok(Credential::Policy(AuthPolicy::NextAvailable)),
        _ => {}
    }
    match trimmed.split_once(':') {
        Some((id, password)) if !id.is_empty() => Ok(Credential::Login {
            id: id.to_string(),
            password: password.to_string(),
        }),
        _ => Err(FleetError::InvalidAuth(value.to_string())),
    }
}

/// Loads a credential table: a JSON array of records.
pub fn load_credential_table(path: &Path) -> Result<Vec<Credential>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read credential table {}", path.display()))?;
    let records: Vec<Value> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse credential table {}", path.display()))?;
    if records.is_empty() {
        return Err(FleetError::EmptyCredentialTable {
            path: path.to_path_buf(),
        }
        .into());
    }
    Ok(records.into_iter().map(Credential::from_record).collect())
}

/// How credentials are assigned across the fleet.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialPlan {
    /// Every bot gets the same credential (possibly `Credential::None`).
    Uniform(Credential),
    /// Bot `i` gets entry `i`.
    Table(Vec<Credential>),
}

impl Default for CredentialPlan {
    fn default() -> Self {
        CredentialPlan::Uniform(Credential::None)
    }
}

impl CredentialPlan {
    /// Builds a plan from the configured sources.
    ///
    /// A table wins over an `--auth` value; both being set is logged.
    pub fn from_sources(auth: Option<&str>, table: Option<Vec<Credential>>) -> Result<Self, FleetError> {
        if let Some(table) = table {
            if let Some(auth) = auth {
                tracing::warn!(auth, "credential table given, ignoring auth value");
            }
            return Ok(CredentialPlan::Table(table));
        }
        match auth {
            Some(value) => Ok(CredentialPlan::Uniform(parse_auth(value)?)),
            None => Ok(CredentialPlan::default()),
        }
    }

    /// Whether any bot would present a credential.
    pub fn requests_auth(&self) -> bool {
        match self {
            CredentialPlan::Uniform(credential) => !credential.is_none(),
            CredentialPlan::Table(records) => records.iter().any(|c| !c.is_none()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CredentialPlan::Uniform(credential) => credential.summary(),
            CredentialPlan::Table(records) => format!("auth: table of {} records", records.len()),
        }
    }
}

/// A plan checked against a fleet size.
#[derive(Debug, Clone)]
pub struct CredentialSource {
    plan: CredentialPlan,
    size: usize,
}

impl CredentialSource {
    pub fn new(plan: CredentialPlan, size: usize) -> Result<Self, FleetError> {
        if let CredentialPlan::Table(records) = &plan {
            if records.len() < size {
                return Err(FleetError::CredentialTableTooShort {
                    records: records.len(),
                    required: size,
                });
            }
        }
        Ok(Self { plan, size })
    }

    /// Credential for bot `index`; `None` only outside `0..size`.
    pub fn resolve(&self, index: usize) -> Option<Credential> {
        if index >= self.size {
            return None;
        }
        match &self.plan {
            CredentialPlan::Uniform(credential) => Some(credential.clone()),
            CredentialPlan::Table(records) => records.get(index).cloned(),
        }
    }
}
