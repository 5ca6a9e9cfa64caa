//! In-process fake miIO device for tests.
//! Answers hello packets and encrypted requests on a loopback UDP socket.

use crate::crypto::TokenCipher;
use crate::protocol::{
    HEADER_LEN, MAGIC, MiioMessage, UNKNOWN_HELLO, pack_message, parse_header, unpack_message,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

pub(crate) const TOKEN_HEX: &str = "00112233445566778899aabbccddeeff";
pub(crate) const DEVICE_ID: u32 = 0x0412_3456;
const START_STAMP: u32 = 1000;

/// How the fake device answers one request.
pub(crate) enum Reply {
    /// `{"id": .., "result": value}`
    Result(Value),
    /// `{"id": .., "error": {"code": .., "message": ..}}`
    Error(i64, String),
    /// No answer at all
    Silent,
    /// A reply for some other request id, then the real one
    StaleFirst(Value),
    /// A result packed with a different token
    WrongToken(Value),
}

#[derive(Default)]
struct Journal {
    hellos: usize,
    requests: Vec<(String, Value)>,
}

pub(crate) struct FakeDevice {
    port: u16,
    journal: Arc<Mutex<Journal>>,
    handle: JoinHandle<()>,
}

impl FakeDevice {
    pub(crate) async fn spawn<F>(mut responder: F) -> Self
    where
        F: FnMut(&str, &Value) -> Reply + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let journal = Arc::new(Mutex::new(Journal::default()));
        let task_journal = journal.clone();

        let handle = tokio::spawn(async move {
            let cipher = TokenCipher::new(&hex::decode(TOKEN_HEX).unwrap()).unwrap();
            let mut stamp = START_STAMP;
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let data = &buf[..len];
                let Ok(header) = parse_header(data) else {
                    continue;
                };
                stamp += 1;

                if header.unknown == UNKNOWN_HELLO {
                    task_journal.lock().unwrap().hellos += 1;
                    let _ = socket.send_to(&hello_reply(stamp), peer).await;
                    continue;
                }

                let Ok(msg) = unpack_message(data, Some(&cipher)) else {
                    continue;
                };
                let request: Value = serde_json::from_slice(&msg.payload).unwrap();
                let id = request["id"].as_u64().unwrap();
                let method = request["method"].as_str().unwrap_or_default().to_string();
                let params = request["params"].clone();
                task_journal
                    .lock()
                    .unwrap()
                    .requests
                    .push((method.clone(), params.clone()));

                let packets = match responder(&method, &params) {
                    Reply::Result(v) => vec![encode(&cipher, stamp, json!({"id": id, "result": v}))],
                    Reply::Error(code, message) => vec![encode(
                        &cipher,
                        stamp,
                        json!({"id": id, "error": {"code": code, "message": message}}),
                    )],
                    Reply::Silent => Vec::new(),
                    Reply::StaleFirst(v) => vec![
                        encode(&cipher, stamp, json!({"id": id + 1000, "result": ["stale"]})),
                        encode(&cipher, stamp, json!({"id": id, "result": v})),
                    ],
                    Reply::WrongToken(v) => {
                        let other = TokenCipher::new(&[0x5a; 16]).unwrap();
                        vec![encode(&other, stamp, json!({"id": id, "result": v}))]
                    }
                };
                for packet in packets {
                    let _ = socket.send_to(&packet, peer).await;
                }
            }
        });

        Self {
            port,
            journal,
            handle,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn hellos(&self) -> usize {
        self.journal.lock().unwrap().hellos
    }

    /// Method and params of every decrypted request, in arrival order.
    pub(crate) fn requests(&self) -> Vec<(String, Value)> {
        self.journal.lock().unwrap().requests.clone()
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn hello_reply(stamp: u32) -> Vec<u8> {
    let mut data = vec![0u8; HEADER_LEN];
    data[..2].copy_from_slice(&MAGIC.to_be_bytes());
    data[2..4].copy_from_slice(&(HEADER_LEN as u16).to_be_bytes());
    data[8..12].copy_from_slice(&DEVICE_ID.to_be_bytes());
    data[12..16].copy_from_slice(&stamp.to_be_bytes());
    data[16..].fill(0xFF);
    data
}

fn encode(cipher: &TokenCipher, stamp: u32, reply: Value) -> Vec<u8> {
    let msg = MiioMessage {
        device_id: DEVICE_ID,
        stamp,
        payload: serde_json::to_vec(&reply).unwrap(),
    };
    pack_message(&msg, cipher).unwrap()
}

/// A loopback port with nothing listening on it.
pub(crate) async fn unused_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}
