//! End-to-end scenarios: real post offices talking through a real broker
//! over localhost TCP.

use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use courier_central::{
    Central, CentralConfig, ClientEntry, NullStore, OverflowPolicy, SystemProbe,
};
use courier_crypto::{decrypt_fields, encrypt_fields};
use courier_office::{OfficeConfig, PostOffice};
use courier_proto::{Address, Deframer, Message, encode_frame};
use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
    time::timeout,
};

const ALPHA_SECRET: &[u8] = b"alpha secret bytes";
const BETA_SECRET: &[u8] = b"beta secret bytes";

fn central_config(max_message_size: usize) -> CentralConfig {
    CentralConfig {
        name: "central".to_string(),
        local_address: "127.0.0.1".to_string(),
        // Ephemeral port so parallel tests never collide.
        port: 0,
        ping_interval_ms: 500,
        max_message_size,
        overflow: OverflowPolicy::DropNewest,
        clients: vec![
            ClientEntry {
                name: "alpha".to_string(),
                secret: STANDARD.encode(ALPHA_SECRET),
                manager: true,
            },
            ClientEntry {
                name: "beta".to_string(),
                secret: STANDARD.encode(BETA_SECRET),
                manager: false,
            },
        ],
    }
}

async fn start_central(max_message_size: usize) -> (JoinHandle<()>, u16) {
    let central = Central::bind(
        central_config(max_message_size),
        Arc::new(NullStore),
        Arc::new(SystemProbe),
    )
    .await
    .expect("broker binds");
    let port = central.local_addr().expect("bound address").port();
    let handle = tokio::spawn(async move {
        let _ = central.run().await;
    });
    (handle, port)
}

fn office_config(name: &str, secret: &[u8], port: u16) -> OfficeConfig {
    OfficeConfig {
        name: name.to_string(),
        secret: STANDARD.encode(secret),
        queue_size: 32,
        cpo_host: "127.0.0.1".to_string(),
        cpo_port: port,
        max_message_size: 65536,
    }
}

async fn await_connected(office: &PostOffice) {
    for _ in 0..200 {
        if office.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("post office '{}' never connected", office.name());
}

/// Publish repeatedly until the subscriber sees one delivery; the
/// subscription handshake is asynchronous on three machines.
async fn publish_until_received(
    source: &courier_office::Mailbox,
    sink: &courier_office::Mailbox,
    msg_type: &str,
) -> Message {
    for _ in 0..50 {
        let mut m = source.create_publish(msg_type);
        m.put_dotted("temp", 21.5).expect("valid path");
        source.send(m);
        if let Some(got) = sink.poll(Duration::from_millis(200)).await {
            return got;
        }
    }
    panic!("publish never reached the subscriber");
}

#[tokio::test]
async fn publish_crosses_the_broker() {
    let (central, port) = start_central(65536).await;
    let alpha = PostOffice::start(office_config("alpha", ALPHA_SECRET, port)).expect("alpha");
    let beta = PostOffice::start(office_config("beta", BETA_SECRET, port)).expect("beta");
    let alpha_io = alpha.create_mailbox("io").expect("mailbox");
    let beta_io = beta.create_mailbox("io").expect("mailbox");
    await_connected(&alpha).await;
    await_connected(&beta).await;

    beta_io.subscribe(&"alpha.io".parse().expect("valid"), "sensor");

    let got = publish_until_received(&alpha_io, &beta_io, "sensor.temperature").await;
    assert_eq!(got.from_addr(), "alpha.io");
    assert_eq!(got.type_name(), "sensor.temperature");
    assert_eq!(got.to_addr(), None, "publishes carry no recipient");
    assert_eq!(got.get_dotted("temp"), Some(&Value::from(21.5)));

    alpha.shutdown().await;
    beta.shutdown().await;
    central.abort();
}

#[tokio::test]
async fn direct_request_and_reply() {
    let (central, port) = start_central(65536).await;
    let alpha = PostOffice::start(office_config("alpha", ALPHA_SECRET, port)).expect("alpha");
    let beta = PostOffice::start(office_config("beta", BETA_SECRET, port)).expect("beta");
    let alpha_io = alpha.create_mailbox("io").expect("mailbox");
    let beta_io = beta.create_mailbox("io").expect("mailbox");
    await_connected(&alpha).await;
    await_connected(&beta).await;

    let responder = {
        let beta_io = beta_io.clone();
        tokio::spawn(async move {
            let request = beta_io.take().await.expect("request arrives");
            assert!(request.expects_reply());
            let reply = beta_io.create_reply(&request, "ping").expect("reply builds");
            beta_io.send(reply);
        })
    };

    let request = alpha_io.create_direct(&"beta.io".parse().expect("valid"), "ping", true);
    let request_id = request.id().to_string();
    let reply = alpha_io
        .send_and_wait(request, Duration::from_secs(5))
        .await
        .expect("reply within the deadline");
    assert_eq!(reply.in_reply_to(), Some(request_id.as_str()));
    assert_eq!(reply.from_addr(), "beta.io");

    responder.await.expect("responder finishes");
    alpha.shutdown().await;
    beta.shutdown().await;
    central.abort();
}

#[tokio::test]
async fn encrypted_field_crosses_hops_without_plaintext() {
    let (central, port) = start_central(65536).await;
    let alpha = PostOffice::start(office_config("alpha", ALPHA_SECRET, port)).expect("alpha");
    let beta = PostOffice::start(office_config("beta", BETA_SECRET, port)).expect("beta");
    let alpha_io = alpha.create_mailbox("io").expect("mailbox");
    let beta_io = beta.create_mailbox("io").expect("mailbox");
    await_connected(&alpha).await;
    await_connected(&beta).await;

    let mut m = alpha_io.create_direct(&"beta.io".parse().expect("valid"), "login", false);
    m.put_dotted("cred", "xyz").expect("valid path");
    encrypt_fields(&mut m, ALPHA_SECRET, &["cred"]).expect("encrypts");
    assert!(!m.has_dotted("cred"));
    alpha_io.send(m);

    let mut got = beta_io.poll(Duration::from_secs(5)).await.expect("delivered");
    // On the wire to beta it is ciphertext under beta's secret.
    assert!(got.is_encrypted());
    assert!(!got.has_dotted("cred"));
    decrypt_fields(&mut got, BETA_SECRET).expect("recipient decrypts");
    assert_eq!(got.get_str("cred"), Some("xyz"));

    alpha.shutdown().await;
    beta.shutdown().await;
    central.abort();
}

/// Hand-rolled client for wire-level tests: connects, authenticates, and
/// reads frames.
struct RawClient {
    stream: TcpStream,
    deframer: Deframer,
}

impl RawClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connects");
        Self { stream, deframer: Deframer::new(1 << 20) }
    }

    fn handshake_frame(po: &str, secret: &[u8], id: &str) -> Vec<u8> {
        let mut m = Message::direct(
            &Address::management(po).expect("valid"),
            &Address::central_management(),
            "manage.connect",
            id,
            true,
        );
        m.put_dotted("authenticator", courier_crypto::authenticator(secret, po, id))
            .expect("valid path");
        encode_frame(&m.to_bytes().expect("serializes")).expect("encodes")
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write succeeds");
    }

    async fn read_message(&mut self) -> Message {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(payload) = self.deframer.next_frame() {
                return Message::from_slice(&payload).expect("valid message");
            }
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("read within deadline")
                .expect("read succeeds");
            assert!(n > 0, "broker closed the connection");
            self.deframer.push(&buf[..n]);
        }
    }

    /// Read until a message of the wanted type arrives; the shared
    /// outbound queue may hold earlier pings.
    async fn read_until(&mut self, msg_type: &str) -> Message {
        loop {
            let m = self.read_message().await;
            if m.type_name() == msg_type {
                return m;
            }
        }
    }
}

#[tokio::test]
async fn oversize_frame_is_dropped_but_connection_survives() {
    let (central, port) = start_central(256).await;
    let mut raw = RawClient::connect(port).await;

    // A correctly framed payload one byte over the limit, then a valid
    // handshake in the same stream.
    let oversize = encode_frame(&vec![b'x'; 257]).expect("encodes");
    raw.send(&oversize).await;
    raw.send(&RawClient::handshake_frame("alpha", ALPHA_SECRET, "1.alpha")).await;

    let reply = raw.read_until("manage.connect").await;
    assert_eq!(reply.in_reply_to(), Some("1.alpha"));
    assert_eq!(reply.get_dotted("maxMessageSize"), Some(&Value::from(256u64)));

    central.abort();
}

#[tokio::test]
async fn displaced_link_reconnects_and_delivers() {
    let (central, port) = start_central(65536).await;
    let alpha = PostOffice::start(office_config("alpha", ALPHA_SECRET, port)).expect("alpha");
    let beta = PostOffice::start(office_config("beta", BETA_SECRET, port)).expect("beta");
    let alpha_io = alpha.create_mailbox("io").expect("mailbox");
    let beta_io = beta.create_mailbox("io").expect("mailbox");
    await_connected(&alpha).await;
    await_connected(&beta).await;

    // An impostor authenticates as alpha; the broker displaces the
    // office's socket, which must reconnect on its own and win the link
    // back.
    let mut raw = RawClient::connect(port).await;
    raw.send(&RawClient::handshake_frame("alpha", ALPHA_SECRET, "Z.alpha")).await;
    let reply = raw.read_until("manage.reconnect").await;
    assert_eq!(reply.in_reply_to(), Some("Z.alpha"), "broker has seen alpha before");

    // Traffic sent through the reconnect window is delivered once the
    // link is back, envelope intact.
    let mut delivered = None;
    for _ in 0..50 {
        let m = alpha_io.create_direct(&"beta.io".parse().expect("valid"), "after-kill", false);
        alpha_io.send(m);
        if let Some(got) = beta_io.poll(Duration::from_millis(300)).await {
            delivered = Some(got);
            break;
        }
    }
    let got = delivered.expect("message delivered after reconnect");
    assert_eq!(got.from_addr(), "alpha.io");
    assert_eq!(got.type_name(), "after-kill");

    alpha.shutdown().await;
    beta.shutdown().await;
    central.abort();
}

#[tokio::test]
async fn subscription_survives_source_restart() {
    let (central, port) = start_central(65536).await;
    let alpha = PostOffice::start(office_config("alpha", ALPHA_SECRET, port)).expect("alpha");
    let beta = PostOffice::start(office_config("beta", BETA_SECRET, port)).expect("beta");
    let beta_io = beta.create_mailbox("io").expect("mailbox");
    await_connected(&alpha).await;
    await_connected(&beta).await;

    beta_io.subscribe(&"alpha.io".parse().expect("valid"), "periodic.1000ms");
    // Let the subscription reach both the broker and alpha.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // alpha's process restarts: all of its in-memory tables are gone.
    alpha.shutdown().await;
    let alpha = PostOffice::start(office_config("alpha", ALPHA_SECRET, port)).expect("alpha");
    let alpha_io = alpha.create_mailbox("io").expect("mailbox");
    await_connected(&alpha).await;

    // Without beta doing anything, the broker replayed the subscription
    // to the fresh alpha, so its publishes reach beta again.
    let got = publish_until_received(&alpha_io, &beta_io, "periodic.1000ms").await;
    assert_eq!(got.from_addr(), "alpha.io");
    assert_eq!(got.type_name(), "periodic.1000ms");

    alpha.shutdown().await;
    beta.shutdown().await;
    central.abort();
}

#[tokio::test]
async fn management_surface_answers_over_the_wire() {
    let (central, port) = start_central(65536).await;
    let alpha = PostOffice::start(office_config("alpha", ALPHA_SECRET, port)).expect("alpha");
    let beta = PostOffice::start(office_config("beta", BETA_SECRET, port)).expect("beta");
    let alpha_io = alpha.create_mailbox("io").expect("mailbox");
    await_connected(&alpha).await;
    await_connected(&beta).await;

    // manage.connected
    let request = alpha_io.create_direct(&Address::central_management(), "manage.connected", true);
    let reply = alpha_io
        .send_and_wait(request, Duration::from_secs(5))
        .await
        .expect("connected reply");
    assert_eq!(reply.get_str("postOffices"), Some("alpha,beta"));

    // manage.status: manager-only; the clients subtree travels encrypted.
    let request = alpha_io.create_direct(&Address::central_management(), "manage.status", true);
    let mut reply = alpha_io
        .send_and_wait(request, Duration::from_secs(5))
        .await
        .expect("status reply");
    assert!(reply.is_encrypted());
    assert!(!reply.has_dotted("clients"));
    decrypt_fields(&mut reply, ALPHA_SECRET).expect("manager decrypts");
    assert_eq!(reply.get_dotted("clients.beta.connected"), Some(&Value::Bool(true)));

    // manage.monitor: collection runs off the router; the reply carries
    // both subtrees.
    let request = alpha_io.create_direct(&Address::central_management(), "manage.monitor", true);
    let reply = alpha_io
        .send_and_wait(request, Duration::from_secs(5))
        .await
        .expect("monitor reply");
    assert!(reply.has_dotted("monitor.os.valid"));
    assert!(reply.has_dotted("monitor.process.cpus"));

    alpha.shutdown().await;
    beta.shutdown().await;
    central.abort();
}
