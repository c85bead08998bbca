//! Payload encoders: plain JSON, versioned JSON envelopes and MessagePack.

use crate::core::{PersistError, Result};
use crate::persist::envelope::{MigrationPlan, PayloadMigrator, VersionedEnvelope};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

/// Decoded payload plus whether it was migrated from an older schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<P> {
    pub payload: P,
    pub migrated: bool,
}

impl<P> Decoded<P> {
    pub fn current(payload: P) -> Self {
        Self {
            payload,
            migrated: false,
        }
    }
}

/// Turns a dataset payload into bytes and back.
///
/// `decode` reports unreadable input as `PersistError::Serialization`; the
/// dataset treats that as a corrupt file.
pub trait PayloadCodec: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;

    /// Payload used when there is no file or after a critical reset.
    fn empty(&self) -> Self::Payload;

    fn encode(&self, payload: &Self::Payload) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Decoded<Self::Payload>>;

    /// Short format label for logs and tooling.
    fn format_name(&self) -> &'static str {
        "custom"
    }
}

fn parse_json_document(bytes: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(bytes)?;
    if value.is_null() {
        return Err(PersistError::Serialization(
            "document decodes to null".to_string(),
        ));
    }
    Ok(value)
}

// ============================================================================
// JSON
// ============================================================================

/// Unversioned JSON document.
#[derive(Debug, Clone)]
pub struct JsonCodec<T> {
    pretty: bool,
    _payload: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            pretty: true,
            _payload: PhantomData,
        }
    }

    pub fn compact() -> Self {
        Self {
            pretty: false,
            _payload: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PayloadCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    type Payload = T;

    fn empty(&self) -> T {
        T::default()
    }

    fn encode(&self, payload: &T) -> Result<Vec<u8>> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(payload)?
        } else {
            serde_json::to_vec(payload)?
        };
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Decoded<T>> {
        let value = parse_json_document(bytes)?;
        Ok(Decoded::current(serde_json::from_value(value)?))
    }

    fn format_name(&self) -> &'static str {
        "json"
    }
}

// ============================================================================
// Versioned JSON
// ============================================================================

/// JSON payload wrapped in a `{ "version", "payload" }` envelope.
#[derive(Clone)]
pub struct VersionedJsonCodec<T> {
    current_version: u32,
    migrator: Option<PayloadMigrator>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> VersionedJsonCodec<T> {
    pub fn new(current_version: u32) -> Self {
        Self {
            current_version,
            migrator: None,
            _payload: PhantomData,
        }
    }

    pub fn with_migrator<F>(mut self, migrator: F) -> Self
    where
        F: Fn(Value, u32, u32) -> Result<Value> + Send + Sync + 'static,
    {
        self.migrator = Some(Arc::new(migrator));
        self
    }

    /// Uses a validated step plan as the migrator. The plan's current version
    /// becomes the codec's version.
    pub fn with_plan(plan: MigrationPlan) -> Result<Self> {
        plan.validate()?;
        Ok(Self {
            current_version: plan.current_version(),
            migrator: Some(plan.into_migrator()),
            _payload: PhantomData,
        })
    }

    pub fn current_version(&self) -> u32 {
        self.current_version
    }
}

impl<T> PayloadCodec for VersionedJsonCodec<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    type Payload = T;

    fn empty(&self) -> T {
        T::default()
    }

    fn encode(&self, payload: &T) -> Result<Vec<u8>> {
        let envelope = VersionedEnvelope::wrap(serde_json::to_value(payload)?, self.current_version);
        Ok(serde_json::to_vec_pretty(&envelope)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Decoded<T>> {
        let raw = parse_json_document(bytes)?;
        let unwrapped =
            VersionedEnvelope::unwrap(raw, self.current_version, self.migrator.as_ref())?;
        if unwrapped.payload.is_null() {
            return Err(PersistError::Serialization(
                "envelope payload is null".to_string(),
            ));
        }
        Ok(Decoded {
            payload: serde_json::from_value(unwrapped.payload)?,
            migrated: unwrapped.migrated,
        })
    }

    fn format_name(&self) -> &'static str {
        "versioned-json"
    }
}

// ============================================================================
// MessagePack
// ============================================================================

/// Compact binary encoding with named fields.
#[derive(Debug, Clone)]
pub struct MsgPackCodec<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T> MsgPackCodec<T> {
    pub fn new() -> Self {
        Self {
            _payload: PhantomData,
        }
    }
}

impl<T> Default for MsgPackCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PayloadCodec for MsgPackCodec<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
{
    type Payload = T;

    fn empty(&self) -> T {
        T::default()
    }

    fn encode(&self, payload: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(payload)
            .map_err(|err| PersistError::Serialization(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Decoded<T>> {
        let payload = rmp_serde::from_slice(bytes)
            .map_err(|err| PersistError::Serialization(err.to_string()))?;
        Ok(Decoded::current(payload))
    }

    fn format_name(&self) -> &'static str {
        "msgpack"
    }
}
