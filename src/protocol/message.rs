//! Typed message contract and the catalog that maps type names to schemas.

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::channel::{ChannelAddress, WILDCARD};
use crate::error::{Error, Result};

/// Payload key carrying the message type name on the wire.
pub const TYPE_TAG: &str = "__type__";

/// Longest payload excerpt quoted in deserialization errors.
const PAYLOAD_PREVIEW_LEN: usize = 100;

/// A named, versionless message schema.
///
/// The name is the message's identity inside a process and the first token of
/// every channel it travels on.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct PaymentRequestMessage { amount: f64, user_id: String }
///
/// impl MessageType for PaymentRequestMessage {
///     const NAME: &'static str = "PaymentRequestMessage";
/// }
/// ```
pub trait MessageType: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    /// Channel this type is published on for a given leg and session.
    fn channel_of(direction: &str, session_id: &str) -> Result<ChannelAddress> {
        ChannelAddress::new(Self::NAME, direction, session_id)
    }
}

type ChannelFn = fn(&str, &str) -> Result<ChannelAddress>;

/// Immutable, schema-validated message instance.
#[derive(Clone)]
pub struct Message {
    type_name: &'static str,
    fields: Map<String, Value>,
    value: Arc<dyn Any + Send + Sync>,
    channel_fn: ChannelFn,
}

impl Message {
    /// Wrap a typed value for sending. Values that would not decode again on
    /// the receiving side, such as a non-finite float, are rejected here.
    pub fn new<T: MessageType>(value: T) -> Result<Self> {
        let fields = match serde_json::to_value(&value) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                return Err(Error::SchemaValidation {
                    class_name: T::NAME.to_string(),
                    reason: format!("expected a struct with named fields, got {}", other),
                })
            }
            Err(e) => {
                return Err(Error::SchemaValidation {
                    class_name: T::NAME.to_string(),
                    reason: e.to_string(),
                })
            }
        };
        // JSON has no NaN or infinity; serde_json writes them as null.
        if let Err(e) = serde_json::from_value::<T>(Value::Object(fields.clone())) {
            return Err(Error::SchemaValidation {
                class_name: T::NAME.to_string(),
                reason: format!("value does not survive JSON encoding: {}", e),
            });
        }
        Ok(Self::assemble(value, fields))
    }

    /// Build from raw field values, rejecting unknown and missing fields.
    pub fn from_fields<T: MessageType>(fields: Map<String, Value>) -> Result<Self> {
        let schema_error = |reason: String| Error::SchemaValidation {
            class_name: T::NAME.to_string(),
            reason,
        };
        let (value, canonical) = parse_fields::<T>(fields).map_err(schema_error)?;
        Ok(Self::assemble(value, canonical))
    }

    /// Build from wire bytes. Any mismatch with the expected structure is a
    /// deserialization error, kept apart from schema errors.
    pub fn from_bytes<T: MessageType>(bytes: &[u8]) -> Result<Self> {
        let deser_error = |reason: String| Error::Deserialization {
            class_name: T::NAME.to_string(),
            reason: format!("{}. Payload was: {}", reason, preview(bytes)),
        };

        let mut fields = match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => return Err(deser_error("payload is not a JSON object".to_string())),
            Err(e) => return Err(deser_error(e.to_string())),
        };

        match fields.remove(TYPE_TAG) {
            None => {}
            Some(Value::String(tag)) if tag == T::NAME => {}
            Some(tag) => {
                return Err(deser_error(format!(
                    "type tag {} does not match {}",
                    tag,
                    T::NAME
                )))
            }
        }

        let (value, canonical) = parse_fields::<T>(fields).map_err(deser_error)?;
        Ok(Self::assemble(value, canonical))
    }

    fn assemble<T: MessageType>(value: T, fields: Map<String, Value>) -> Self {
        Self {
            type_name: T::NAME,
            fields,
            value: Arc::new(value),
            channel_fn: T::channel_of,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn is<T: MessageType>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Typed view of the message.
    pub fn downcast_ref<T: MessageType>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Channel derived through the message type's own channel function.
    pub fn channel_of(&self, direction: &str, session_id: &str) -> Result<ChannelAddress> {
        (self.channel_fn)(direction, session_id)
    }

    /// Wire form: the fields as a JSON object plus the type tag.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut wire = self.fields.clone();
        wire.insert(TYPE_TAG.to_string(), Value::String(self.type_name.to_string()));
        Ok(serde_json::to_vec(&Value::Object(wire))?)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type_name", &self.type_name)
            .field("fields", &self.fields)
            .finish()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.fields == other.fields
    }
}

/// Deserialize `fields` into `T` and check nothing was silently dropped.
fn parse_fields<T: MessageType>(
    fields: Map<String, Value>,
) -> std::result::Result<(T, Map<String, Value>), String> {
    let value: T =
        serde_json::from_value(Value::Object(fields.clone())).map_err(|e| e.to_string())?;

    let canonical = match serde_json::to_value(&value) {
        Ok(Value::Object(canonical)) => canonical,
        Ok(_) => return Err("expected a struct with named fields".to_string()),
        Err(e) => return Err(e.to_string()),
    };

    let unknown: Vec<&str> = fields
        .keys()
        .filter(|k| !canonical.contains_key(*k))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(format!("unknown field(s): {}", unknown.join(", ")));
    }

    Ok((value, canonical))
}

fn preview(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut out: String = text.chars().take(PAYLOAD_PREVIEW_LEN).collect();
    if text.chars().count() > PAYLOAD_PREVIEW_LEN {
        out.push_str("...");
    }
    out
}

struct Schema {
    type_id: TypeId,
    decode: fn(&[u8]) -> Result<Message>,
    build: fn(Map<String, Value>) -> Result<Message>,
}

/// Registry of every message type in use, keyed by name.
///
/// Populated at startup; the dispatcher looks types up here by the first
/// channel token.
#[derive(Default)]
pub struct MessageCatalog {
    schemas: RwLock<BTreeMap<&'static str, Schema>>,
}

impl MessageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`. Registering the same type twice is a no-op; reusing a
    /// name for a different type is an error. The type's channel function must
    /// put the type name in the first channel position.
    pub fn register<T: MessageType>(&self) -> Result<()> {
        if T::NAME == WILDCARD {
            return Err(Error::Config(format!(
                "message type name '{}' is reserved for wildcard patterns",
                WILDCARD
            )));
        }
        let sample = T::channel_of(WILDCARD, WILDCARD)?;
        if sample.type_name != T::NAME {
            return Err(Error::Config(format!(
                "message type '{}' derives channels named '{}'; the first channel token must be the type name",
                T::NAME, sample.type_name
            )));
        }

        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = schemas.get(T::NAME) {
            if existing.type_id == TypeId::of::<T>() {
                return Ok(());
            }
            return Err(Error::Config(format!(
                "message type name '{}' is already registered for a different type",
                T::NAME
            )));
        }
        schemas.insert(
            T::NAME,
            Schema {
                type_id: TypeId::of::<T>(),
                decode: Message::from_bytes::<T>,
                build: Message::from_fields::<T>,
            },
        );
        tracing::debug!(message_type = T::NAME, "Registered message type");
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|k| k.to_string())
            .collect()
    }

    /// Decode wire bytes for the named type.
    pub fn decode(&self, name: &str, bytes: &[u8]) -> Result<Message> {
        let decode = self.lookup(name, |s| s.decode)?;
        decode(bytes)
    }

    /// Build a message of the named type from raw fields.
    pub fn build(&self, name: &str, fields: Map<String, Value>) -> Result<Message> {
        let build = self.lookup(name, |s| s.build)?;
        build(fields)
    }

    fn lookup<F: Copy>(&self, name: &str, pick: impl Fn(&Schema) -> F) -> Result<F> {
        let schemas = self.schemas.read().unwrap_or_else(PoisonError::into_inner);
        match schemas.get(name) {
            Some(schema) => Ok(pick(schema)),
            None => Err(Error::MessageClassNotRegistered {
                class_name: name.to_string(),
                available: schemas.keys().map(|k| k.to_string()).collect(),
            }),
        }
    }
}

/// Set of message type names an agent receives or sends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSet {
    names: BTreeSet<&'static str>,
}

impl MessageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: MessageType>(mut self) -> Self {
        self.names.insert(T::NAME);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.names.iter().copied()
    }
}
