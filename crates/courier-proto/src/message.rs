//! JSON messages and their reserved envelope.
//!
//! A message is a JSON object. Routing metadata lives in one reserved key,
//! [`ENVELOPE_KEY`]; everything else in the object is the schema-less body.
//! Bodies are accessed through dotted paths (`"monitor.os.valid"`), which
//! round-trip through nested objects.
//!
//! Messages are mutable until sent and must be treated as immutable
//! afterwards; routing clones them where fan-out requires it.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::{address::Address, error::ProtocolError};

/// Reserved key holding the envelope object.
pub const ENVELOPE_KEY: &str = "-={([env])}=-";

/// Envelope key holding the base64 ciphertext of selectively encrypted
/// fields.
pub const SECURE_FIELD: &str = ".secure";

/// Envelope key the central post office stamps on messages addressed to
/// `central.po`, naming the connection they arrived on.
pub const CONNECTION_FIELD: &str = "-={([connectionName])}=-";

const FROM: &str = "from";
const TO: &str = "to";
const TYPE: &str = "type";
const ID: &str = "id";
const REPLY: &str = "reply";
const EXPECT: &str = "expect";

/// Message type strings used by the management plane.
pub mod message_types {
    /// First handshake after a post office process starts.
    pub const CONNECT: &str = "manage.connect";
    /// Handshake on any subsequent socket of the same process.
    pub const RECONNECT: &str = "manage.reconnect";
    /// Central-to-client liveness probe.
    pub const PING: &str = "manage.ping";
    /// Client answer to a liveness probe.
    pub const PONG: &str = "manage.pong";
    /// Subscription request, snooped by the central post office.
    pub const SUBSCRIBE: &str = "manage.subscribe";
    /// Subscription removal, snooped by the central post office.
    pub const UNSUBSCRIBE: &str = "manage.unsubscribe";
    /// Broker and per-client statistics (manager only).
    pub const STATUS: &str = "manage.status";
    /// Persist the broker's client table (manager only).
    pub const WRITE: &str = "manage.write";
    /// Add a client (manager only).
    pub const ADD: &str = "manage.add";
    /// Delete a client (manager only).
    pub const DELETE: &str = "manage.delete";
    /// Host and process telemetry.
    pub const MONITOR: &str = "manage.monitor";
    /// Names of the currently connected post offices.
    pub const CONNECTED: &str = "manage.connected";
}

/// Dotted-path operations over a JSON object.
///
/// Paths split on `.`; intermediate objects are created by [`put`] and
/// required by the other operations. These are the primitive accessors the
/// selective-encryption layer builds on.
pub mod dotted {
    use serde_json::{Map, Value};

    use crate::error::ProtocolError;

    fn segments(path: &str) -> Result<Vec<&str>, ProtocolError> {
        if path.is_empty() {
            return Err(ProtocolError::InvalidPath {
                path: path.to_string(),
                reason: "path is empty",
            });
        }
        let parts: Vec<&str> = path.split('.').collect();
        if parts.iter().any(|s| s.is_empty()) {
            return Err(ProtocolError::InvalidPath {
                path: path.to_string(),
                reason: "path has an empty segment",
            });
        }
        Ok(parts)
    }

    /// Read the value at `path`, or `None` if any segment is absent or a
    /// non-terminal segment is not an object.
    pub fn get<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
        let parts = segments(path).ok()?;
        let (last, parents) = parts.split_last()?;
        let mut current = root;
        for part in parents {
            current = current.get(*part)?.as_object()?;
        }
        current.get(*last)
    }

    /// Whether a value exists at `path`.
    pub fn has(root: &Map<String, Value>, path: &str) -> bool {
        get(root, path).is_some()
    }

    /// Write `value` at `path`, creating intermediate objects as needed.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidPath` if the path is empty, has an empty
    /// segment, or a non-terminal segment already holds a non-object.
    pub fn put(
        root: &mut Map<String, Value>,
        path: &str,
        value: Value,
    ) -> Result<(), ProtocolError> {
        let parts = segments(path)?;
        let Some((last, parents)) = parts.split_last() else {
            return Err(ProtocolError::InvalidPath {
                path: path.to_string(),
                reason: "path is empty",
            });
        };
        let mut current = root;
        for part in parents {
            let slot = current
                .entry((*part).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            match slot {
                Value::Object(map) => current = map,
                _ => {
                    return Err(ProtocolError::InvalidPath {
                        path: path.to_string(),
                        reason: "intermediate segment is not an object",
                    });
                }
            }
        }
        current.insert((*last).to_string(), value);
        Ok(())
    }

    /// Remove and return the value at `path`, or `None` if absent.
    ///
    /// Intermediate objects emptied by the removal are left in place; the
    /// encryption layer re-merges into the same shape.
    pub fn remove(root: &mut Map<String, Value>, path: &str) -> Option<Value> {
        let parts = segments(path).ok()?;
        let (last, parents) = parts.split_last()?;
        let mut current = root;
        for part in parents {
            current = current.get_mut(*part)?.as_object_mut()?;
        }
        current.remove(*last)
    }
}

/// One protocol message: envelope plus schema-less JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    root: Map<String, Value>,
}

impl Message {
    /// Build a direct (point-to-point) message.
    pub fn direct(
        from: &Address,
        to: &Address,
        msg_type: &str,
        id: &str,
        expect_reply: bool,
    ) -> Self {
        let mut msg = Self::blank(from, msg_type, id);
        msg.env_put(TO, Value::String(to.to_string()));
        if expect_reply {
            msg.env_put(EXPECT, Value::Bool(true));
        }
        msg
    }

    /// Build a publish (broadcast) message; `to` is absent by construction.
    pub fn publish(from: &Address, msg_type: &str, id: &str) -> Self {
        Self::blank(from, msg_type, id)
    }

    /// Build a reply to `original`: recipient is the original sender and
    /// `reply` carries the original id.
    ///
    /// # Errors
    ///
    /// `ProtocolError::InvalidAddress` if the original's `from` does not
    /// parse (cannot happen for messages that passed envelope validation).
    pub fn reply(original: &Self, from: &Address, msg_type: &str, id: &str) -> Result<Self, ProtocolError> {
        let to: Address = original.from_addr().parse()?;
        let mut msg = Self::direct(from, &to, msg_type, id, false);
        msg.env_put(REPLY, Value::String(original.id().to_string()));
        Ok(msg)
    }

    fn blank(from: &Address, msg_type: &str, id: &str) -> Self {
        let mut env = Map::new();
        env.insert(FROM.to_string(), Value::String(from.to_string()));
        env.insert(TYPE.to_string(), Value::String(msg_type.to_string()));
        env.insert(ID.to_string(), Value::String(id.to_string()));
        let mut root = Map::new();
        root.insert(ENVELOPE_KEY.to_string(), Value::Object(env));
        Self { root }
    }

    /// Parse a message from its wire JSON, validating the envelope.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(root) = value else {
            return Err(ProtocolError::InvalidEnvelope(
                "message is not a JSON object".to_string(),
            ));
        };
        let msg = Self { root };
        msg.validate()?;
        Ok(msg)
    }

    /// Serialize to wire JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(&self.root).map_err(ProtocolError::Json)
    }

    /// Envelope well-formedness: `from` and `id` present and non-empty,
    /// `from` and `to` (when present) parse as addresses.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let Some(env) = self.envelope() else {
            return Err(ProtocolError::InvalidEnvelope("envelope is missing".to_string()));
        };
        let from = env.get(FROM).and_then(Value::as_str).unwrap_or("");
        if from.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("'from' is missing or empty".to_string()));
        }
        from.parse::<Address>()?;
        let id = env.get(ID).and_then(Value::as_str).unwrap_or("");
        if id.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("'id' is missing or empty".to_string()));
        }
        if let Some(to) = env.get(TO) {
            let Some(to) = to.as_str() else {
                return Err(ProtocolError::InvalidEnvelope("'to' is not a string".to_string()));
            };
            to.parse::<Address>()?;
        }
        Ok(())
    }

    fn envelope(&self) -> Option<&Map<String, Value>> {
        self.root.get(ENVELOPE_KEY).and_then(Value::as_object)
    }

    fn envelope_mut(&mut self) -> &mut Map<String, Value> {
        let slot = self
            .root
            .entry(ENVELOPE_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        match slot {
            Value::Object(map) => map,
            _ => unreachable!("slot was just set to an object"),
        }
    }

    fn env_str(&self, key: &str) -> Option<&str> {
        self.envelope()?.get(key)?.as_str()
    }

    fn env_put(&mut self, key: &str, value: Value) {
        self.envelope_mut().insert(key.to_string(), value);
    }

    /// Sender address as text.
    pub fn from_addr(&self) -> &str {
        self.env_str(FROM).unwrap_or_default()
    }

    /// Sender's post office: the prefix of `from` before its first dot.
    pub fn from_po(&self) -> &str {
        let from = self.from_addr();
        from.split_once('.').map_or(from, |(po, _)| po)
    }

    /// Recipient address, present iff this is a direct message.
    pub fn to_addr(&self) -> Option<&str> {
        self.env_str(TO)
    }

    /// Message type (may be empty).
    pub fn type_name(&self) -> &str {
        self.env_str(TYPE).unwrap_or_default()
    }

    /// Major component of the type: everything before the last dot.
    pub fn major_type(&self) -> &str {
        let t = self.type_name();
        t.rsplit_once('.').map_or(t, |(major, _)| major)
    }

    /// Message id, unique within the sending post office.
    pub fn id(&self) -> &str {
        self.env_str(ID).unwrap_or_default()
    }

    /// Id of the message this one replies to, if any.
    pub fn in_reply_to(&self) -> Option<&str> {
        self.env_str(REPLY)
    }

    /// Whether the sender expects a reply.
    pub fn expects_reply(&self) -> bool {
        self.envelope()
            .and_then(|e| e.get(EXPECT))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether this is a direct message (`to` present and non-empty).
    pub fn is_direct(&self) -> bool {
        self.to_addr().is_some_and(|to| !to.is_empty())
    }

    /// Whether this is a publish message (`to` absent).
    pub fn is_publish(&self) -> bool {
        !self.is_direct()
    }

    /// Whether any fields have been selectively encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.secure_payload().is_some()
    }

    /// Change the recipient.
    pub fn set_to(&mut self, to: &Address) {
        self.env_put(TO, Value::String(to.to_string()));
    }

    /// Set or clear the reply-expected flag.
    pub fn set_expect(&mut self, expect: bool) {
        if expect {
            self.env_put(EXPECT, Value::Bool(true));
        } else {
            self.envelope_mut().remove(EXPECT);
        }
    }

    /// The base64 ciphertext of encrypted fields, if any.
    pub fn secure_payload(&self) -> Option<&str> {
        self.env_str(SECURE_FIELD)
    }

    /// Store the ciphertext of encrypted fields.
    pub fn set_secure_payload(&mut self, ciphertext: String) {
        self.env_put(SECURE_FIELD, Value::String(ciphertext));
    }

    /// Remove and return the ciphertext of encrypted fields.
    pub fn take_secure_payload(&mut self) -> Option<String> {
        match self.envelope_mut().remove(SECURE_FIELD) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Connection name stamped by the central post office, if any.
    pub fn connection_name(&self) -> Option<&str> {
        self.env_str(CONNECTION_FIELD)
    }

    /// Stamp the connection a message arrived on.
    pub fn set_connection_name(&mut self, name: &str) {
        self.env_put(CONNECTION_FIELD, Value::String(name.to_string()));
    }

    /// Read a body value by dotted path.
    pub fn get_dotted(&self, path: &str) -> Option<&Value> {
        dotted::get(&self.root, path)
    }

    /// Whether a body value exists at the dotted path.
    pub fn has_dotted(&self, path: &str) -> bool {
        dotted::has(&self.root, path)
    }

    /// Write a body value by dotted path, creating intermediate objects.
    pub fn put_dotted(
        &mut self,
        path: &str,
        value: impl Into<Value>,
    ) -> Result<(), ProtocolError> {
        dotted::put(&mut self.root, path, value.into())
    }

    /// Remove and return a body value by dotted path.
    pub fn remove_dotted(&mut self, path: &str) -> Option<Value> {
        dotted::remove(&mut self.root, path)
    }

    /// String body value by dotted path, if present and a string.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get_dotted(path)?.as_str()
    }

    /// Deep-merge a JSON object into the message.
    ///
    /// Object values merge recursively; everything else (including keys
    /// that happen to contain dots) is inserted verbatim, so a shape
    /// extracted field-by-field merges back exactly.
    pub fn merge_object(&mut self, object: Map<String, Value>) {
        merge_into(&mut self.root, object);
    }
}

fn merge_into(dst: &mut Map<String, Value>, src: Map<String, Value>) {
    for (key, value) in src {
        match dst.entry(key) {
            serde_json::map::Entry::Vacant(slot) => {
                slot.insert(value);
            }
            serde_json::map::Entry::Occupied(mut slot) => match (slot.get_mut(), value) {
                (Value::Object(existing), Value::Object(incoming)) => {
                    merge_into(existing, incoming);
                }
                (replaced, value) => *replaced = value,
            },
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.root.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(text: &str) -> Address {
        text.parse().unwrap()
    }

    #[test]
    fn direct_message_envelope() {
        let m = Message::direct(&addr("alpha.io"), &addr("beta.io"), "ping", "1.alpha", true);
        assert_eq!(m.from_addr(), "alpha.io");
        assert_eq!(m.from_po(), "alpha");
        assert_eq!(m.to_addr(), Some("beta.io"));
        assert_eq!(m.type_name(), "ping");
        assert_eq!(m.id(), "1.alpha");
        assert!(m.expects_reply());
        assert!(m.is_direct());
        assert!(!m.is_publish());
        m.validate().unwrap();
    }

    #[test]
    fn publish_message_has_no_recipient() {
        let m = Message::publish(&addr("alpha.io"), "sensor.temperature", "2.alpha");
        assert_eq!(m.to_addr(), None);
        assert!(m.is_publish());
        assert_eq!(m.major_type(), "sensor");
    }

    #[test]
    fn major_type_without_minor_is_whole_type() {
        let m = Message::publish(&addr("alpha.io"), "sensor", "3.alpha");
        assert_eq!(m.major_type(), "sensor");
    }

    #[test]
    fn reply_swaps_endpoints_and_links_ids() {
        let original =
            Message::direct(&addr("alpha.io"), &addr("beta.io"), "ping", "4.alpha", true);
        let r = Message::reply(&original, &addr("beta.io"), "ping", "1.beta").unwrap();
        assert_eq!(r.to_addr(), Some("alpha.io"));
        assert_eq!(r.from_addr(), "beta.io");
        assert_eq!(r.in_reply_to(), Some("4.alpha"));
        assert!(!r.expects_reply());
    }

    #[test]
    fn wire_round_trip_preserves_body() {
        let mut m = Message::publish(&addr("alpha.io"), "sensor.temperature", "5.alpha");
        m.put_dotted("temp", 21.5).unwrap();
        m.put_dotted("site.rack", "r12").unwrap();

        let bytes = m.to_bytes().unwrap();
        let parsed = Message::from_slice(&bytes).unwrap();
        assert_eq!(parsed, m);
        assert_eq!(parsed.get_dotted("temp"), Some(&Value::from(21.5)));
        assert_eq!(parsed.get_str("site.rack"), Some("r12"));
    }

    #[test]
    fn parse_rejects_missing_envelope() {
        assert!(Message::from_slice(br#"{"x":1}"#).is_err());
    }

    #[test]
    fn parse_rejects_empty_from_or_id() {
        let no_from = format!(r#"{{"{ENVELOPE_KEY}":{{"id":"1.a"}}}}"#);
        assert!(Message::from_slice(no_from.as_bytes()).is_err());

        let no_id = format!(r#"{{"{ENVELOPE_KEY}":{{"from":"a.b"}}}}"#);
        assert!(Message::from_slice(no_id.as_bytes()).is_err());
    }

    #[test]
    fn parse_rejects_non_object() {
        assert!(Message::from_slice(b"[1,2,3]").is_err());
        assert!(Message::from_slice(b"not json").is_err());
    }

    #[test]
    fn dotted_paths_round_trip_nested_objects() {
        let mut m = Message::publish(&addr("a.b"), "t", "1.a");
        m.put_dotted("one.two.three", 3).unwrap();
        assert!(m.has_dotted("one.two.three"));
        assert!(m.has_dotted("one.two"));
        assert!(!m.has_dotted("one.three"));

        let taken = m.remove_dotted("one.two.three").unwrap();
        assert_eq!(taken, Value::from(3));
        assert!(!m.has_dotted("one.two.three"));
    }

    #[test]
    fn dotted_put_rejects_non_object_intermediate() {
        let mut m = Message::publish(&addr("a.b"), "t", "1.a");
        m.put_dotted("leaf", 1).unwrap();
        assert!(m.put_dotted("leaf.sub", 2).is_err());
    }

    #[test]
    fn dotted_rejects_degenerate_paths() {
        let mut m = Message::publish(&addr("a.b"), "t", "1.a");
        assert!(m.put_dotted("", 1).is_err());
        assert!(m.put_dotted("a..b", 1).is_err());
        assert!(!m.has_dotted(""));
    }

    #[test]
    fn secure_payload_accessors() {
        let mut m = Message::publish(&addr("a.b"), "t", "1.a");
        assert!(!m.is_encrypted());
        m.set_secure_payload("Y2lwaGVy".to_string());
        assert!(m.is_encrypted());
        assert_eq!(m.secure_payload(), Some("Y2lwaGVy"));
        assert_eq!(m.take_secure_payload().as_deref(), Some("Y2lwaGVy"));
        assert!(!m.is_encrypted());
    }

    #[test]
    fn connection_name_stamp() {
        let mut m = Message::direct(&addr("alpha.po"), &addr("central.po"), "manage.pong", "6.alpha", false);
        assert_eq!(m.connection_name(), None);
        m.set_connection_name("127.0.0.1:51000");
        assert_eq!(m.connection_name(), Some("127.0.0.1:51000"));
    }
}
