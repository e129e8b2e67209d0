//! The broker's routing core.
//!
//! The router is pure logic: it consumes [`RouterEvent`]s and returns
//! [`RouterAction`]s for the runtime to execute, and owns all mutable
//! broker state (clients, connections, subscriptions). One task drives it,
//! so no internal locking is needed and message handling is serialized per
//! broker, which is what keeps authentication and routing races out.
//!
//! Per inbound message: authenticate if it is a handshake, snoop
//! subscription traffic to maintain the routing table, dispatch management
//! operations addressed to `central.po`, and otherwise forward to the
//! destination post office, re-encrypting selectively-encrypted payloads
//! from the sender's secret to the recipient's.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use bytes::Bytes;
use courier_crypto::{authenticator, encrypt_fields, re_encrypt};
use courier_proto::{
    Address, CENTRAL_NAME, Message, SubscriptionIndex, encode_frame, message_types, radix64,
};
use rand::RngCore;
use serde_json::{Map, Value};

use crate::{
    client::PoClient,
    config::{CentralConfig, ClientEntry, ConfigStore},
    connection::PoConnection,
    error::CentralError,
};

/// Everything the runtime reports into the router.
#[derive(Debug)]
pub(crate) enum RouterEvent {
    /// A TCP connection was accepted.
    Accepted {
        /// Remote address string; names the connection.
        conn_id: String,
    },
    /// Raw bytes arrived on a connection.
    Data {
        /// The connection they arrived on
        conn_id: String,
        /// The bytes, as read
        bytes: Vec<u8>,
    },
    /// A connection reached end-of-stream or failed.
    Closed {
        /// The connection that ended
        conn_id: String,
    },
    /// Time to ping every connected client.
    PingTick,
    /// Time to reap connections that stopped answering pings.
    WatchdogTick,
}

/// Everything the router asks the runtime to do.
#[derive(Debug)]
pub(crate) enum RouterAction {
    /// Bind an authenticated connection to its client's outbound queue.
    Associate {
        /// The connection
        conn_id: String,
        /// The client it authenticated as
        client: String,
    },
    /// Enqueue a serialized frame for a client.
    Enqueue {
        /// Destination client
        client: String,
        /// Complete wire frame
        frame: Bytes,
    },
    /// Close a connection and stop its tasks.
    Close {
        /// The connection to close
        conn_id: String,
    },
    /// Collect telemetry off-thread and deliver the filled reply.
    Monitor {
        /// Client awaiting the reply
        client: String,
        /// Reply envelope to fill with telemetry
        reply: Message,
    },
    /// A client was deleted; discard its outbound queue.
    DropClient {
        /// The deleted client
        client: String,
    },
}

pub(crate) struct Router {
    config: CentralConfig,
    store: Arc<dyn ConfigStore>,
    clients: HashMap<String, PoClient>,
    connections: HashMap<String, PoConnection>,
    subscriptions: SubscriptionIndex,
    next_id: u64,
    started_at: Instant,
}

impl Router {
    pub(crate) fn new(
        config: CentralConfig,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self, CentralError> {
        let mut clients = HashMap::new();
        for entry in &config.clients {
            let secret = entry.secret_bytes()?;
            clients.insert(
                entry.name.clone(),
                PoClient::new(entry.name.clone(), secret, entry.manager),
            );
        }
        Ok(Self {
            config,
            store,
            clients,
            connections: HashMap::new(),
            subscriptions: SubscriptionIndex::new(),
            next_id: 0,
            started_at: Instant::now(),
        })
    }

    /// Process one event; returns the actions for the runtime to execute
    /// in order.
    pub(crate) fn handle(&mut self, event: RouterEvent) -> Vec<RouterAction> {
        let mut actions = Vec::new();
        match event {
            RouterEvent::Accepted { conn_id } => {
                tracing::debug!(conn = %conn_id, "connection accepted");
                self.connections.insert(
                    conn_id.clone(),
                    PoConnection::new(conn_id, self.config.max_message_size),
                );
            }
            RouterEvent::Data { conn_id, bytes } => {
                self.on_data(&conn_id, &bytes, &mut actions);
            }
            RouterEvent::Closed { conn_id } => {
                if self.connections.contains_key(&conn_id) {
                    tracing::info!(conn = %conn_id, "connection closed");
                    self.close_connection(&conn_id, &mut actions);
                }
            }
            RouterEvent::PingTick => self.ping_clients(&mut actions),
            RouterEvent::WatchdogTick => self.reap_silent_connections(&mut actions),
        }
        actions
    }

    fn next_wire_id(&mut self) -> String {
        self.next_id += 1;
        format!("{}.{}", radix64::encode(self.next_id), CENTRAL_NAME)
    }

    /// Remove a connection from the tables and tell the runtime to close
    /// it. The client, if any, survives and awaits a reconnect.
    fn close_connection(&mut self, conn_id: &str, actions: &mut Vec<RouterAction>) {
        if let Some(conn) = self.connections.remove(conn_id) {
            if let Some(client_name) = conn.client {
                if let Some(client) = self.clients.get_mut(&client_name) {
                    if client.connection.as_deref() == Some(conn_id) {
                        client.connection = None;
                    }
                }
            }
        }
        actions.push(RouterAction::Close { conn_id: conn_id.to_string() });
    }

    fn on_data(&mut self, conn_id: &str, bytes: &[u8], actions: &mut Vec<RouterAction>) {
        let client_name = self.connections.get(conn_id).and_then(|c| c.client.clone());
        if let Some(name) = &client_name {
            if let Some(client) = self.clients.get_mut(name) {
                client.rx_bytes += bytes.len() as u64;
            }
        }

        let frames = {
            let Some(conn) = self.connections.get_mut(conn_id) else {
                return;
            };
            conn.deframer.push(bytes);
            let rejected_before = conn.deframer.rejected_frames();
            let mut frames = Vec::new();
            while let Some(frame) = conn.deframer.next_frame() {
                frames.push(frame);
            }
            let rejected = conn.deframer.rejected_frames() - rejected_before;
            if rejected > 0 {
                tracing::warn!(conn = conn_id, rejected, "dropped malformed frames");
            }
            frames
        };

        for payload in frames {
            match Message::from_slice(&payload) {
                Ok(message) => self.on_message(conn_id, message, actions),
                Err(e) => {
                    tracing::warn!(conn = conn_id, error = %e, "dropping malformed message");
                }
            }
        }
    }

    fn on_message(&mut self, conn_id: &str, mut message: Message, actions: &mut Vec<RouterAction>) {
        let client_name = self.connections.get(conn_id).and_then(|c| c.client.clone());
        let to_central = message
            .to_addr()
            .and_then(|to| to.parse::<Address>().ok())
            .is_some_and(|to| to.is_central_management());
        let is_handshake = to_central
            && matches!(
                message.type_name(),
                message_types::CONNECT | message_types::RECONNECT
            );

        if client_name.is_none() && !is_handshake {
            tracing::warn!(
                conn = conn_id,
                msg_type = message.type_name(),
                "dropping message from unauthenticated connection"
            );
            return;
        }
        if let Some(name) = &client_name {
            if let Some(client) = self.clients.get_mut(name) {
                client.rx_messages += 1;
            }
        }

        if to_central {
            message.set_connection_name(conn_id);
        }

        // Snoop subscription traffic: that is how the broker learns where
        // publishes must go. The request itself is still forwarded.
        if message.in_reply_to().is_none()
            && matches!(
                message.type_name(),
                message_types::SUBSCRIBE | message_types::UNSUBSCRIBE
            )
        {
            let to_management = message
                .to_addr()
                .and_then(|to| to.parse::<Address>().ok())
                .is_some_and(|to| to.is_management());
            if to_management {
                self.snoop_subscription(&message);
            }
        }

        if message.is_publish() {
            self.forward_publish(&message, actions);
        } else if to_central {
            self.handle_central(conn_id, &message, actions);
        } else {
            self.forward_direct(&message, actions);
        }
    }

    fn snoop_subscription(&mut self, message: &Message) {
        let add = message.type_name() == message_types::SUBSCRIBE;
        let (Some(source), Some(msg_type), Some(requestor)) = (
            message.get_str("source"),
            message.get_str("type"),
            message.get_str("requestor"),
        ) else {
            tracing::warn!("subscription request with missing fields; not snooped");
            return;
        };
        let (Ok(source), Ok(requestor)) =
            (source.parse::<Address>(), requestor.parse::<Address>())
        else {
            tracing::warn!("subscription request with invalid addresses; not snooped");
            return;
        };
        let key = SubscriptionIndex::key(&source, msg_type);
        if add {
            self.subscriptions.subscribe(&key, requestor);
        } else {
            self.subscriptions.unsubscribe(&key, &requestor);
        }
        tracing::debug!(key = %key, add, "subscription snooped");
    }

    /// Forward a direct message to the post office named by its recipient.
    fn forward_direct(&mut self, message: &Message, actions: &mut Vec<RouterAction>) {
        let Some(to) = message.to_addr() else {
            return;
        };
        let dest_po = to.split_once('.').map_or(to, |(po, _)| po).to_string();
        self.deliver_to_po(&dest_po, message, actions);
    }

    /// Fan a publish out to each subscribed post office exactly once.
    fn forward_publish(&mut self, message: &Message, actions: &mut Vec<RouterAction>) {
        let subscribers = self
            .subscriptions
            .subscribers_for_publish(message.from_addr(), message.type_name());
        if subscribers.is_empty() {
            tracing::warn!(
                from = message.from_addr(),
                msg_type = message.type_name(),
                "publish with no subscribed post offices; dropping"
            );
            return;
        }
        let destinations: HashSet<String> =
            subscribers.iter().map(|a| a.po().to_string()).collect();
        for dest_po in destinations {
            self.deliver_to_po(&dest_po, message, actions);
        }
    }

    /// Serialize (re-encrypting if needed) and enqueue for one post
    /// office.
    fn deliver_to_po(&mut self, dest_po: &str, message: &Message, actions: &mut Vec<RouterAction>) {
        if !self.clients.contains_key(dest_po) {
            tracing::warn!(dest = dest_po, "dropping message for unknown post office");
            return;
        }
        let mut out = message.clone();
        if out.is_encrypted() {
            let sender_po = out.from_po().to_string();
            let Some(sender) = self.clients.get(&sender_po) else {
                tracing::warn!(
                    sender = sender_po,
                    "dropping encrypted message from unknown post office"
                );
                return;
            };
            let sender_secret = sender.secret.clone();
            let dest_secret = match self.clients.get(dest_po) {
                Some(dest) => dest.secret.clone(),
                None => return,
            };
            if let Err(e) = re_encrypt(&mut out, &sender_secret, &dest_secret) {
                tracing::warn!(id = out.id(), error = %e, "re-encryption failed; dropping");
                return;
            }
        }
        self.enqueue_message(dest_po, &out, actions);
    }

    fn enqueue_message(
        &mut self,
        client_name: &str,
        message: &Message,
        actions: &mut Vec<RouterAction>,
    ) {
        let frame = match message.to_bytes().and_then(|bytes| encode_frame(&bytes)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(id = message.id(), error = %e, "dropping unencodable message");
                return;
            }
        };
        if let Some(client) = self.clients.get_mut(client_name) {
            client.tx_bytes += frame.len() as u64;
            client.tx_messages += 1;
        }
        actions.push(RouterAction::Enqueue {
            client: client_name.to_string(),
            frame: Bytes::from(frame),
        });
    }

    /// Dispatch a message addressed to `central.po`.
    fn handle_central(&mut self, conn_id: &str, message: &Message, actions: &mut Vec<RouterAction>) {
        match message.type_name() {
            message_types::CONNECT | message_types::RECONNECT => {
                self.handle_handshake(conn_id, message, actions);
            }
            message_types::PONG => {
                if let Some(conn) = self.connections.get_mut(conn_id) {
                    conn.last_pong = Instant::now();
                }
            }
            message_types::STATUS => self.handle_status(conn_id, message, actions),
            message_types::WRITE => self.handle_write(conn_id, message, actions),
            message_types::ADD => self.handle_add(conn_id, message, actions),
            message_types::DELETE => self.handle_delete(conn_id, message, actions),
            message_types::MONITOR => self.handle_monitor(conn_id, message, actions),
            message_types::CONNECTED => self.handle_connected(conn_id, message, actions),
            other => {
                tracing::warn!(msg_type = other, "unknown management operation; dropping");
            }
        }
    }

    /// Authenticate a connect/reconnect handshake.
    ///
    /// The authenticator is recomputed from the configured secret; any
    /// mismatch closes the connection, without a reply. On success the
    /// connection displaces the client's previous one, the reply announces
    /// the frame limit and ping interval, and a fresh process (one that
    /// sent `manage.connect`) gets its source-side subscriptions replayed.
    fn handle_handshake(&mut self, conn_id: &str, message: &Message, actions: &mut Vec<RouterAction>) {
        let po_name = message.from_po().to_string();
        let presented = message.get_str("authenticator").unwrap_or_default();

        let Some(client) = self.clients.get(&po_name) else {
            tracing::warn!(conn = conn_id, po = %po_name, "handshake from unknown post office");
            self.close_connection(conn_id, actions);
            return;
        };
        let expected = authenticator(&client.secret, &po_name, message.id());
        if expected != presented {
            tracing::warn!(conn = conn_id, po = %po_name, "authenticator mismatch; closing");
            self.close_connection(conn_id, actions);
            return;
        }

        let displaced = client.connection.clone().filter(|old| old != conn_id);
        if let Some(old) = displaced {
            tracing::info!(po = %po_name, old_conn = %old, "displacing previous connection");
            self.close_connection(&old, actions);
        }

        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.client = Some(po_name.clone());
            conn.last_pong = Instant::now();
        }
        let Some(client) = self.clients.get_mut(&po_name) else {
            return;
        };
        client.connected(conn_id.to_string());
        // The reply type follows this broker's view: the very first
        // connection of a client answers `manage.connect`, every later
        // one `manage.reconnect`, regardless of what the client sent.
        let reply_type = if client.connect_count == 1 {
            message_types::CONNECT
        } else {
            message_types::RECONNECT
        };

        actions.push(RouterAction::Associate {
            conn_id: conn_id.to_string(),
            client: po_name.clone(),
        });

        let id = self.next_wire_id();
        match Message::reply(message, &Address::central_management(), reply_type, &id) {
            Ok(mut reply) => {
                reply.put_dotted("maxMessageSize", self.config.max_message_size as u64).ok();
                reply.put_dotted("pingIntervalMS", self.config.ping_interval_ms).ok();
                self.enqueue_message(&po_name, &reply, actions);
            }
            Err(e) => tracing::warn!(error = %e, "cannot build handshake reply"),
        }
        tracing::info!(po = %po_name, conn = conn_id, "post office authenticated");

        // A client that sent `manage.connect` is a fresh process with
        // empty tables; replay the subscriptions it is the source of.
        if message.type_name() == message_types::CONNECT {
            self.refresh_subscriptions(&po_name, actions);
        }
    }

    /// Replay `manage.subscribe` for every subscription whose source lives
    /// on `po_name`, so a restarted source post office rebuilds its local
    /// routing. Informational: no reply is requested.
    fn refresh_subscriptions(&mut self, po_name: &str, actions: &mut Vec<RouterAction>) {
        let prefix = format!("{po_name}.");
        let replay: Vec<(Address, String, Vec<Address>)> = self
            .subscriptions
            .entries_with_prefix(&prefix)
            .filter_map(|(key, subscribers)| {
                SubscriptionIndex::split_key(key)
                    .map(|(source, msg_type)| {
                        (source, msg_type, subscribers.iter().cloned().collect())
                    })
            })
            .collect();

        for (source, msg_type, requestors) in replay {
            let Ok(to) = Address::management(source.po()) else {
                continue;
            };
            for requestor in requestors {
                let Ok(from) = Address::management(requestor.po()) else {
                    continue;
                };
                let id = self.next_wire_id();
                let mut replayed =
                    Message::direct(&from, &to, message_types::SUBSCRIBE, &id, false);
                replayed.put_dotted("source", source.to_string()).ok();
                replayed.put_dotted("type", msg_type.clone()).ok();
                replayed.put_dotted("requestor", requestor.to_string()).ok();
                tracing::debug!(
                    po = po_name,
                    source = %source,
                    requestor = %requestor,
                    "replaying subscription"
                );
                self.enqueue_message(po_name, &replayed, actions);
            }
        }
    }

    fn authenticated_client(&self, conn_id: &str) -> Option<&PoClient> {
        let name = self.connections.get(conn_id)?.client.as_ref()?;
        self.clients.get(name)
    }

    /// Name of the conn's client when it has manager privilege.
    fn require_manager(&self, conn_id: &str, operation: &str) -> Option<String> {
        match self.authenticated_client(conn_id) {
            Some(client) if client.manager => Some(client.name.clone()),
            Some(client) => {
                tracing::warn!(
                    client = client.name,
                    operation,
                    "management operation requires manager privilege; dropping"
                );
                None
            }
            None => {
                tracing::warn!(
                    conn = conn_id,
                    operation,
                    "management operation from unauthenticated connection; dropping"
                );
                None
            }
        }
    }

    fn handle_status(&mut self, conn_id: &str, message: &Message, actions: &mut Vec<RouterAction>) {
        let Some(manager) = self.require_manager(conn_id, "status") else {
            return;
        };

        let mut clients_obj = Map::new();
        for (name, client) in &self.clients {
            let mut entry = Map::new();
            entry.insert("manager".to_string(), Value::Bool(client.manager));
            entry.insert("connected".to_string(), Value::Bool(client.connection.is_some()));
            entry.insert("rxBytes".to_string(), Value::from(client.rx_bytes));
            entry.insert("txBytes".to_string(), Value::from(client.tx_bytes));
            entry.insert("rxMessages".to_string(), Value::from(client.rx_messages));
            entry.insert("txMessages".to_string(), Value::from(client.tx_messages));
            entry.insert("connectCount".to_string(), Value::from(client.connect_count));
            entry.insert(
                "lastConnectTime".to_string(),
                client.last_connect_ms.map_or(Value::Null, Value::from),
            );
            clients_obj.insert(name.clone(), Value::Object(entry));
        }

        let id = self.next_wire_id();
        let Ok(mut reply) =
            Message::reply(message, &Address::central_management(), message_types::STATUS, &id)
        else {
            return;
        };
        reply.put_dotted("name", self.config.name.clone()).ok();
        reply.put_dotted("uptimeMS", self.started_at.elapsed().as_millis() as u64).ok();
        reply.put_dotted("pingIntervalMS", self.config.ping_interval_ms).ok();
        reply.put_dotted("maxMessageSize", self.config.max_message_size as u64).ok();
        reply.put_dotted("connections", self.connections.len() as u64).ok();
        reply.put_dotted("clients", Value::Object(clients_obj)).ok();

        let Some(secret) = self.clients.get(&manager).map(|c| c.secret.clone()) else {
            return;
        };
        if let Err(e) = encrypt_fields(&mut reply, &secret, &["clients"]) {
            tracing::error!(error = %e, "cannot encrypt status reply");
            return;
        }
        self.enqueue_message(&manager, &reply, actions);
    }

    fn handle_write(&mut self, conn_id: &str, message: &Message, actions: &mut Vec<RouterAction>) {
        let Some(manager) = self.require_manager(conn_id, "write") else {
            return;
        };

        let mut snapshot = self.config.clone();
        snapshot.clients = self
            .clients
            .values()
            .map(|c| ClientEntry {
                name: c.name.clone(),
                secret: STANDARD.encode(&c.secret),
                manager: c.manager,
            })
            .collect();
        snapshot.clients.sort_by(|a, b| a.name.cmp(&b.name));

        match self.store.save(&snapshot) {
            Ok(()) => {
                tracing::info!(clients = snapshot.clients.len(), "configuration persisted");
                let id = self.next_wire_id();
                if let Ok(ack) = Message::reply(
                    message,
                    &Address::central_management(),
                    message_types::WRITE,
                    &id,
                ) {
                    self.enqueue_message(&manager, &ack, actions);
                }
            }
            Err(e) => tracing::error!(error = %e, "cannot persist configuration"),
        }
    }

    /// Decrypt a manager request's payload with the manager's secret.
    fn decrypt_manager_request(
        &self,
        manager: &str,
        message: &Message,
        operation: &str,
    ) -> Option<Message> {
        let secret = self.clients.get(manager).map(|c| c.secret.clone())?;
        if !message.is_encrypted() {
            tracing::warn!(operation, "request payload must be encrypted; dropping");
            return None;
        }
        let mut request = message.clone();
        match courier_crypto::decrypt_fields(&mut request, &secret) {
            Ok(()) => Some(request),
            Err(e) => {
                tracing::warn!(operation, error = %e, "cannot decrypt request payload");
                None
            }
        }
    }

    fn handle_add(&mut self, conn_id: &str, message: &Message, actions: &mut Vec<RouterAction>) {
        let Some(manager) = self.require_manager(conn_id, "add") else {
            return;
        };
        let Some(request) = self.decrypt_manager_request(&manager, message, "add") else {
            return;
        };

        let Some(name) = request.get_str("name").map(str::to_string) else {
            tracing::warn!("add request without a client name; dropping");
            return;
        };
        if name.is_empty() || name.contains('.') || name == CENTRAL_NAME {
            tracing::warn!(name = %name, "add request with invalid client name; dropping");
            return;
        }
        if self.clients.contains_key(&name) {
            tracing::warn!(name = %name, "add request for existing client; dropping");
            return;
        }

        let secret_b64 = request.get_str("secret").map_or_else(
            || {
                let mut bytes = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut bytes);
                STANDARD.encode(bytes)
            },
            str::to_string,
        );
        let Ok(secret) = STANDARD.decode(&secret_b64) else {
            tracing::warn!(name = %name, "add request with undecodable secret; dropping");
            return;
        };
        if secret.is_empty() {
            tracing::warn!(name = %name, "add request with empty secret; dropping");
            return;
        }

        self.clients
            .insert(name.clone(), PoClient::new(name.clone(), secret, false));
        tracing::info!(name = %name, "client added");

        let id = self.next_wire_id();
        let Ok(mut ack) =
            Message::reply(message, &Address::central_management(), message_types::ADD, &id)
        else {
            return;
        };
        ack.put_dotted("name", name).ok();
        ack.put_dotted("secret", secret_b64).ok();
        let Some(manager_secret) = self.clients.get(&manager).map(|c| c.secret.clone()) else {
            return;
        };
        if let Err(e) = encrypt_fields(&mut ack, &manager_secret, &["name", "secret"]) {
            tracing::error!(error = %e, "cannot encrypt add acknowledgement");
            return;
        }
        self.enqueue_message(&manager, &ack, actions);
    }

    fn handle_delete(&mut self, conn_id: &str, message: &Message, actions: &mut Vec<RouterAction>) {
        let Some(manager) = self.require_manager(conn_id, "delete") else {
            return;
        };
        let Some(request) = self.decrypt_manager_request(&manager, message, "delete") else {
            return;
        };
        let Some(name) = request.get_str("name").map(str::to_string) else {
            tracing::warn!("delete request without a client name; dropping");
            return;
        };

        let Some(removed) = self.clients.remove(&name) else {
            tracing::warn!(name = %name, "delete request for unknown client; dropping");
            return;
        };
        if let Some(conn_id) = removed.connection {
            self.close_connection(&conn_id, actions);
        }
        actions.push(RouterAction::DropClient { client: name.clone() });
        tracing::info!(name = %name, "client deleted");

        let id = self.next_wire_id();
        if let Ok(ack) =
            Message::reply(message, &Address::central_management(), message_types::DELETE, &id)
        {
            self.enqueue_message(&manager, &ack, actions);
        }
    }

    fn handle_monitor(&mut self, conn_id: &str, message: &Message, actions: &mut Vec<RouterAction>) {
        let Some(client_name) = self.connections.get(conn_id).and_then(|c| c.client.clone())
        else {
            return;
        };
        let id = self.next_wire_id();
        match Message::reply(message, &Address::central_management(), message_types::MONITOR, &id)
        {
            // Telemetry collection blocks; the runtime runs it on a
            // throwaway task so the router never waits for it.
            Ok(reply) => actions.push(RouterAction::Monitor { client: client_name, reply }),
            Err(e) => tracing::warn!(error = %e, "cannot build monitor reply"),
        }
    }

    fn handle_connected(&mut self, conn_id: &str, message: &Message, actions: &mut Vec<RouterAction>) {
        let Some(client_name) = self.connections.get(conn_id).and_then(|c| c.client.clone())
        else {
            return;
        };
        let mut names: Vec<&str> = self
            .clients
            .values()
            .filter(|c| c.connection.is_some())
            .map(|c| c.name.as_str())
            .collect();
        names.sort_unstable();
        let list = names.join(",");

        let id = self.next_wire_id();
        let Ok(mut reply) = Message::reply(
            message,
            &Address::central_management(),
            message_types::CONNECTED,
            &id,
        ) else {
            return;
        };
        reply.put_dotted("postOffices", list).ok();
        self.enqueue_message(&client_name, &reply, actions);
    }

    /// Send `manage.ping` to every connected client.
    fn ping_clients(&mut self, actions: &mut Vec<RouterAction>) {
        let connected: Vec<String> = self
            .clients
            .values()
            .filter(|c| c.connection.is_some())
            .map(|c| c.name.clone())
            .collect();
        for name in connected {
            let Ok(to) = Address::management(&name) else {
                continue;
            };
            let id = self.next_wire_id();
            let ping = Message::direct(
                &Address::central_management(),
                &to,
                message_types::PING,
                &id,
                false,
            );
            self.enqueue_message(&name, &ping, actions);
        }
    }

    /// Close connections whose pong silence exceeds 1.5 times the ping
    /// interval. Unauthenticated connections are covered too, which bounds
    /// how long a peer may stall before authenticating.
    fn reap_silent_connections(&mut self, actions: &mut Vec<RouterAction>) {
        let deadline_ms = self.config.ping_interval_ms.saturating_mul(3) / 2;
        let stale: Vec<String> = self
            .connections
            .values()
            .filter(|c| c.last_pong.elapsed().as_millis() as u64 > deadline_ms)
            .map(|c| c.id.clone())
            .collect();
        for conn_id in stale {
            tracing::warn!(conn = %conn_id, "no pong within deadline; closing connection");
            self.close_connection(&conn_id, actions);
        }
    }
}
