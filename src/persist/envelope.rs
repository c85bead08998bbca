//! Versioned on-disk wrapper `{ "version": N, "payload": ... }` and forward
//! migration of stored payloads.

use crate::core::{PersistError, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Version reported for payloads written before envelopes existed.
pub const LEGACY_VERSION: u32 = 0;

/// Migrates a payload from `stored` to `current`.
pub type PayloadMigrator = Arc<dyn Fn(Value, u32, u32) -> Result<Value> + Send + Sync>;

/// Transforms a payload across one migration step.
pub type StepTransform = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEnvelope {
    pub version: u32,
    pub payload: Value,
}

/// Result of opening an envelope against the runtime version.
#[derive(Debug, Clone, PartialEq)]
pub struct UnwrappedPayload {
    pub payload: Value,
    pub stored_version: u32,
    /// Version the payload now conforms to. Equals `stored_version` when an
    /// older payload was passed through without a migrator.
    pub resolved_version: u32,
    pub migrated: bool,
}

impl VersionedEnvelope {
    pub fn wrap(payload: Value, version: u32) -> Self {
        Self { version, payload }
    }

    pub fn into_value(self) -> Value {
        serde_json::json!({ "version": self.version, "payload": self.payload })
    }

    /// Splits raw JSON into `(version, payload)`.
    ///
    /// Anything that is not an object with exactly a numeric `version` and a
    /// `payload` key is legacy data at version 0.
    pub fn detect(raw: Value) -> (u32, Value) {
        match raw {
            Value::Object(mut map) if map.len() == 2 && map.contains_key("payload") => {
                let version = map
                    .get("version")
                    .and_then(Value::as_u64)
                    .and_then(|v| u32::try_from(v).ok());
                match version {
                    Some(version) => {
                        let payload = map.remove("payload").unwrap_or(Value::Null);
                        (version, payload)
                    }
                    None => (LEGACY_VERSION, Value::Object(map)),
                }
            }
            other => (LEGACY_VERSION, other),
        }
    }

    /// Opens `raw` for a runtime at `current_version`.
    ///
    /// * equal version: payload unchanged, `migrated = false`
    /// * older version with a migrator: migrator runs once, `migrated = true`
    /// * older version without a migrator: payload passed through with a warning
    /// * newer version: `UnsupportedVersion`, no migration attempted
    pub fn unwrap(
        raw: Value,
        current_version: u32,
        migrator: Option<&PayloadMigrator>,
    ) -> Result<UnwrappedPayload> {
        let (stored_version, payload) = Self::detect(raw);

        if stored_version > current_version {
            return Err(PersistError::UnsupportedVersion {
                stored: stored_version,
                current: current_version,
            });
        }

        if stored_version == current_version {
            return Ok(UnwrappedPayload {
                payload,
                stored_version,
                resolved_version: current_version,
                migrated: false,
            });
        }

        match migrator {
            Some(migrate) => {
                let payload = migrate(payload, stored_version, current_version)?;
                Ok(UnwrappedPayload {
                    payload,
                    stored_version,
                    resolved_version: current_version,
                    migrated: true,
                })
            }
            None => {
                warn!(
                    "Payload at version {} loaded by runtime version {} without a migrator; using it as-is",
                    stored_version, current_version
                );
                Ok(UnwrappedPayload {
                    payload,
                    stored_version,
                    resolved_version: stored_version,
                    migrated: false,
                })
            }
        }
    }
}

/// One forward migration edge.
#[derive(Clone)]
pub struct MigrationStep {
    pub from_version: u32,
    pub to_version: u32,
    transform: StepTransform,
}

impl MigrationStep {
    pub fn new<F>(from_version: u32, to_version: u32, transform: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            from_version,
            to_version,
            transform: Arc::new(transform),
        }
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .finish()
    }
}

/// Ordered set of migration steps leading up to `current_version`.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    current_version: u32,
    steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn new(current_version: u32) -> Self {
        Self {
            current_version,
            steps: Vec::new(),
        }
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    /// Adds a step and validates the plan.
    pub fn add_step(&mut self, step: MigrationStep) -> Result<()> {
        self.steps.push(step);
        if let Err(err) = self.validate() {
            self.steps.pop();
            return Err(err);
        }
        Ok(())
    }

    pub fn with_step<F>(mut self, from_version: u32, to_version: u32, transform: F) -> Result<Self>
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.add_step(MigrationStep::new(from_version, to_version, transform))?;
        Ok(self)
    }

    /// Checks step direction, bounds and duplicates.
    pub fn validate(&self) -> Result<()> {
        if self.current_version == LEGACY_VERSION {
            return Err(PersistError::Migration(
                "Current schema version must be >= 1".to_string(),
            ));
        }

        let mut seen_from = HashSet::<u32>::new();
        for step in &self.steps {
            if step.to_version <= step.from_version {
                return Err(PersistError::Migration(format!(
                    "Migration step {} -> {} is invalid",
                    step.from_version, step.to_version
                )));
            }
            if step.to_version > self.current_version {
                return Err(PersistError::Migration(format!(
                    "Migration step {} -> {} exceeds current schema version {}",
                    step.from_version, step.to_version, self.current_version
                )));
            }
            if !seen_from.insert(step.from_version) {
                return Err(PersistError::Migration(format!(
                    "Duplicate migration step starting at version {}",
                    step.from_version
                )));
            }
        }
        Ok(())
    }

    fn resolve_chain(&self, from_version: u32, to_version: u32) -> Result<Vec<&MigrationStep>> {
        if from_version > to_version {
            return Err(PersistError::UnsupportedVersion {
                stored: from_version,
                current: to_version,
            });
        }

        let by_from: HashMap<u32, &MigrationStep> = self
            .steps
            .iter()
            .map(|step| (step.from_version, step))
            .collect();

        let mut cursor = from_version;
        let mut chain = Vec::new();
        while cursor < to_version {
            let step = by_from.get(&cursor).copied().ok_or_else(|| {
                PersistError::Migration(format!(
                    "Missing migration step starting at version {} for target {}",
                    cursor, to_version
                ))
            })?;
            if step.to_version > to_version {
                return Err(PersistError::Migration(format!(
                    "Migration step {} -> {} overshoots target {}",
                    step.from_version, step.to_version, to_version
                )));
            }
            chain.push(step);
            cursor = step.to_version;
        }
        Ok(chain)
    }

    /// Applies the chain of steps from `from_version` to `to_version`.
    pub fn migrate(&self, payload: Value, from_version: u32, to_version: u32) -> Result<Value> {
        self.resolve_chain(from_version, to_version)?
            .into_iter()
            .try_fold(payload, |payload, step| (step.transform)(payload))
    }

    pub fn into_migrator(self) -> PayloadMigrator {
        Arc::new(move |payload: Value, stored: u32, current: u32| {
            self.migrate(payload, stored, current)
        })
    }
}
