//! Individual miIO device communication.
//! Handles the UDP session, hello handshake, and request/response correlation.

use crate::crypto::TokenCipher;
use crate::error::{MiioError, Result};
use crate::model::Model;
use crate::protocol::{
    DEFAULT_PORT, HEADER_LEN, MiioMessage, hello_packet, pack_message, parse_header,
    unpack_message,
};
use log::{debug, info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant, timeout_at};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_BUFFER: usize = 4096;

const METHOD_GET_PROP: &str = "get_prop";
const METHOD_INFO: &str = "miIO.info";

const KEY_ID: &str = "id";
const KEY_METHOD: &str = "method";
const KEY_PARAMS: &str = "params";
const KEY_RESULT: &str = "result";
const KEY_ERROR: &str = "error";

/// Validated connection parameters of a single appliance.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    host: String,
    token: [u8; 16],
    model: Option<Model>,
    port: u16,
    timeout: Duration,
}

impl DeviceIdentity {
    /// Validates host and token. The token must be 32 hex characters.
    pub fn new<H: Into<String>>(host: H, token: &str) -> Result<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(MiioError::Config("host must not be empty".into()));
        }
        Ok(Self {
            host,
            token: parse_token(token)?,
            model: None,
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn model(&self) -> Option<Model> {
        self.model
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// First five hex characters of the token, safe for logs.
    pub fn token_hint(&self) -> String {
        hex::encode(&self.token[..3])[..5].to_string()
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("host", &self.host)
            .field("token", &format_args!("{}...", self.token_hint()))
            .field("model", &self.model)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn parse_token(token: &str) -> Result<[u8; 16]> {
    if token.len() != 32 {
        return Err(MiioError::Config(format!(
            "token must be 32 hex characters, got {}",
            token.len()
        )));
    }
    let bytes =
        hex::decode(token).map_err(|e| MiioError::Config(format!("token is not hex: {}", e)))?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Builder for [`DeviceClient`].
pub struct DeviceBuilder {
    host: String,
    token: String,
    model: Option<String>,
    port: u16,
    timeout: Duration,
}

impl DeviceBuilder {
    pub fn new<H: Into<String>, T: Into<String>>(host: H, token: T) -> Self {
        Self {
            host: host.into(),
            token: token.into(),
            model: None,
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Model identifier; must be one of the known models.
    pub fn model<M: Into<String>>(mut self, model: M) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Deadline applied to every network call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn identity(self) -> Result<DeviceIdentity> {
        let mut identity = DeviceIdentity::new(self.host, &self.token)?;
        identity.model = self.model.as_deref().map(Model::from_str).transpose()?;
        identity.port = self.port;
        identity.timeout = self.timeout;
        Ok(identity)
    }

    pub fn build(self) -> Result<DeviceClient> {
        DeviceClient::new(self.identity()?)
    }
}

/// Result of the `miIO.info` query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub model: Option<String>,
    pub mac: Option<String>,
    pub fw_ver: Option<String>,
    pub hw_ver: Option<String>,
}

/// Device id and clock learned from the hello handshake.
#[derive(Debug, Clone, Copy)]
struct Session {
    device_id: u32,
    stamp: u32,
    observed_at: Instant,
}

impl Session {
    fn next_stamp(&self) -> u32 {
        let elapsed = self.observed_at.elapsed().as_secs() as u32;
        self.stamp.wrapping_add(elapsed).wrapping_add(1)
    }
}

/// miIO client for a single device.
///
/// Every call is a single request/response exchange bounded by the identity's
/// timeout; nothing is retried. Calls take `&mut self`, so one client never
/// has two exchanges in flight.
pub struct DeviceClient {
    identity: DeviceIdentity,
    cipher: TokenCipher,
    socket: Option<UdpSocket>,
    session: Option<Session>,
    next_id: u32,
}

impl DeviceClient {
    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    pub fn new(identity: DeviceIdentity) -> Result<Self> {
        let cipher = TokenCipher::new(&identity.token)?;
        let next_id = rand::rng().next_u32() % 10_000 + 1;
        Ok(Self {
            identity,
            cipher,
            socket: None,
            session: None,
            next_id,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Whether a handshake has been completed and not invalidated since.
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Reads properties, at most `max_batch` per request (0 means all at once).
    ///
    /// Values come back in the order of `names`.
    pub async fn get_properties<S: AsRef<str>>(
        &mut self,
        names: &[S],
        max_batch: usize,
    ) -> Result<Vec<Value>> {
        let batch = if max_batch == 0 {
            names.len().max(1)
        } else {
            max_batch
        };

        let mut values = Vec::with_capacity(names.len());
        for chunk in names.chunks(batch) {
            let params: Vec<Value> = chunk
                .iter()
                .map(|n| Value::String(n.as_ref().to_string()))
                .collect();
            match self.send_command(METHOD_GET_PROP, Value::Array(params)).await? {
                Value::Array(items) => values.extend(items),
                other => {
                    return Err(MiioError::Protocol(format!(
                        "{} returned a non-list result: {}",
                        METHOD_GET_PROP, other
                    )));
                }
            }
        }

        if values.len() != names.len() {
            return Err(MiioError::Protocol(format!(
                "requested {} properties, received {} values",
                names.len(),
                values.len()
            )));
        }
        Ok(values)
    }

    /// Sends one command and returns the decoded reply.
    ///
    /// `params` is forwarded verbatim; `null` is sent as an empty list. The
    /// reply's `result` member is returned, or the whole reply when it has
    /// none. A reply carrying an `error` member becomes [`MiioError::Device`].
    pub async fn send_command(&mut self, command: &str, params: Value) -> Result<Value> {
        let params = if params.is_null() { json!([]) } else { params };

        let result = self.exchange(command, params).await;
        if let Err(e) = &result
            && e.invalidates_session()
        {
            debug!(
                "Dropping session with {} after error: {}",
                self.identity.host, e
            );
            self.session = None;
        }
        result
    }

    /// Queries model, MAC address and firmware details.
    pub async fn info(&mut self) -> Result<DeviceInfo> {
        let reply = self.send_command(METHOD_INFO, json!([])).await?;
        serde_json::from_value(reply).map_err(MiioError::from)
    }

    /// Drops the socket and session; the next call starts over with a handshake.
    pub fn close(&mut self) {
        info!("Closing session to device {}", self.identity.host);
        self.session = None;
        self.socket = None;
    }
}

// -------------------------------------------------------------------------
// Internal Communication Helpers
// -------------------------------------------------------------------------
impl DeviceClient {
    async fn exchange(&mut self, command: &str, params: Value) -> Result<Value> {
        self.ensure_socket().await?;
        let session = match self.session {
            Some(s) => s,
            None => self.handshake().await?,
        };

        let id = self.take_request_id();
        let request = json!({ KEY_ID: id, KEY_METHOD: command, KEY_PARAMS: params });
        debug!("request: {}", request);

        let msg = MiioMessage {
            device_id: session.device_id,
            stamp: session.next_stamp(),
            payload: serde_json::to_vec(&request)?,
        };
        let packet = pack_message(&msg, &self.cipher)?;

        let socket = self.socket.as_ref().ok_or_else(not_connected)?;
        let cipher = &self.cipher;
        let (stamp, reply) = send_and_receive(socket, self.identity.timeout, &packet, |data| {
            let msg = unpack_message(data, Some(cipher))?;
            if msg.payload.is_empty() {
                debug!("Ignoring empty packet while waiting for reply {}", id);
                return Ok(None);
            }
            let reply: Value = serde_json::from_slice(&msg.payload).inspect_err(|e| {
                debug!("Undecodable reply {:?}: {}", msg.payload_as_string(), e)
            })?;
            if reply.get(KEY_ID).and_then(Value::as_u64) != Some(id as u64) {
                debug!("Discarding reply {:?}, expected id {}", reply.get(KEY_ID), id);
                return Ok(None);
            }
            Ok(Some((msg.stamp, reply)))
        })
        .await?;
        debug!("reply: {}", reply);

        self.session = Some(Session {
            device_id: session.device_id,
            stamp,
            observed_at: Instant::now(),
        });

        interpret_reply(reply)
    }

    async fn handshake(&mut self) -> Result<Session> {
        info!(
            "Handshaking with device {}:{}",
            self.identity.host, self.identity.port
        );
        let socket = self.socket.as_ref().ok_or_else(not_connected)?;
        let session = send_and_receive(socket, self.identity.timeout, &hello_packet(), |data| {
            // Anything but a bare header is a late reply to an earlier request.
            Ok(parse_header(data)
                .ok()
                .filter(|h| h.length as usize == HEADER_LEN)
                .map(|h| Session {
                    device_id: h.device_id,
                    stamp: h.stamp,
                    observed_at: Instant::now(),
                }))
        })
        .await
        .inspect_err(|e| warn!("Handshake with {} failed: {}", self.identity.host, e))?;

        debug!(
            "Session established: device_id={:08X}, stamp={}",
            session.device_id, session.stamp
        );
        self.session = Some(session);
        Ok(session)
    }

    async fn ensure_socket(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let target = tokio::net::lookup_host((self.identity.host.as_str(), self.identity.port))
            .await?
            .next()
            .ok_or_else(|| {
                MiioError::Unreachable(format!("could not resolve {}", self.identity.host))
            })?;
        let bind_addr = if target.is_ipv6() {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;
        debug!("Bound {} for device {}", socket.local_addr()?, target);
        self.socket = Some(socket);
        Ok(())
    }

    fn take_request_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }
}

fn not_connected() -> MiioError {
    MiioError::Unreachable("socket not connected".into())
}

/// Sends `packet` and reads datagrams until `accept` yields a value or the
/// deadline passes. `accept` returns `Ok(None)` to skip a datagram.
async fn send_and_receive<T>(
    socket: &UdpSocket,
    wait: Duration,
    packet: &[u8],
    mut accept: impl FnMut(&[u8]) -> Result<Option<T>>,
) -> Result<T> {
    let deadline = Instant::now() + wait;
    socket.send(packet).await?;

    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        let len = timeout_at(deadline, socket.recv(&mut buf))
            .await
            .map_err(|_| {
                MiioError::Unreachable(format!("no reply within {} ms", wait.as_millis()))
            })??;
        if let Some(v) = accept(&buf[..len])? {
            return Ok(v);
        }
    }
}

fn interpret_reply(mut reply: Value) -> Result<Value> {
    if let Some(err) = reply.get(KEY_ERROR) {
        return Err(MiioError::Device {
            code: err.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match reply.get_mut(KEY_RESULT) {
        Some(result) => Ok(result.take()),
        None => Ok(reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, Reply, TOKEN_HEX, unused_port};

    fn client_for(device: &FakeDevice) -> DeviceClient {
        DeviceBuilder::new("127.0.0.1", TOKEN_HEX)
            .port(device.port())
            .timeout(Duration::from_millis(300))
            .build()
            .unwrap()
    }

    #[test]
    fn validates_token() {
        assert!(DeviceIdentity::new("10.0.0.2", TOKEN_HEX).is_ok());
        for bad in ["", "abc", &TOKEN_HEX[..31], "zz112233445566778899aabbccddeeff"] {
            assert!(
                matches!(DeviceIdentity::new("10.0.0.2", bad), Err(MiioError::Config(_))),
                "{:?} should be rejected",
                bad
            );
        }
        assert!(matches!(
            DeviceIdentity::new(" ", TOKEN_HEX),
            Err(MiioError::Config(_))
        ));
    }

    #[test]
    fn builder_rejects_unknown_model() {
        let err = DeviceBuilder::new("10.0.0.2", TOKEN_HEX)
            .model("xjx.toilet.zero")
            .identity()
            .unwrap_err();
        assert!(matches!(err, MiioError::Config(_)));

        let identity = DeviceBuilder::new("10.0.0.2", TOKEN_HEX)
            .model("xjx.toilet.pure")
            .port(1234)
            .identity()
            .unwrap();
        assert_eq!(identity.model(), Some(Model::XjxToiletPure));
        assert_eq!(identity.port(), 1234);
    }

    #[test]
    fn debug_hides_token() {
        let identity = DeviceIdentity::new("10.0.0.2", TOKEN_HEX).unwrap();
        let printed = format!("{:?}", identity);
        assert!(!printed.contains(TOKEN_HEX));
        assert!(printed.contains(&TOKEN_HEX[..5]));
    }

    #[test]
    fn interprets_replies() {
        assert_eq!(
            interpret_reply(json!({"id": 1, "result": ["ok"]})).unwrap(),
            json!(["ok"])
        );
        assert_eq!(
            interpret_reply(json!({"id": 1, "other": 5})).unwrap(),
            json!({"id": 1, "other": 5})
        );
        assert_eq!(
            interpret_reply(json!({"id": 1, "error": {"code": -5001, "message": "busy"}}))
                .unwrap_err(),
            MiioError::Device {
                code: -5001,
                message: "busy".into()
            }
        );
    }

    #[tokio::test]
    async fn reads_one_property_per_request() {
        let device = FakeDevice::spawn(|method, params| match (method, params) {
            ("get_prop", p) if p == &json!(["seating"]) => Reply::Result(json!([1])),
            ("get_prop", p) if p == &json!(["status_led"]) => Reply::Result(json!(["0"])),
            _ => Reply::Result(json!([])),
        })
        .await;
        let mut client = client_for(&device);

        let values = client
            .get_properties(&["seating", "status_led"], 1)
            .await
            .unwrap();
        assert_eq!(values, vec![json!(1), json!("0")]);

        let requests = device.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], ("get_prop".to_string(), json!(["seating"])));
        assert_eq!(requests[1], ("get_prop".to_string(), json!(["status_led"])));
        assert_eq!(device.hellos(), 1);
    }

    #[tokio::test]
    async fn batches_properties() {
        let device = FakeDevice::spawn(|_, params| {
            let n = params.as_array().map(Vec::len).unwrap_or_default();
            Reply::Result(Value::Array(vec![json!(0); n]))
        })
        .await;
        let mut client = client_for(&device);

        let names = ["a", "b", "c"];
        assert_eq!(client.get_properties(&names, 2).await.unwrap().len(), 3);
        assert_eq!(client.get_properties(&names, 0).await.unwrap().len(), 3);
        let sizes: Vec<usize> = device
            .requests()
            .iter()
            .map(|(_, p)| p.as_array().map(Vec::len).unwrap_or_default())
            .collect();
        assert_eq!(sizes, vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn value_count_mismatch_is_protocol_error() {
        let device = FakeDevice::spawn(|_, _| Reply::Result(json!([0, 2, 3]))).await;
        let mut client = client_for(&device);
        assert!(matches!(
            client.get_properties(&["status_tunwash"], 1).await,
            Err(MiioError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn null_params_are_sent_as_empty_list() {
        let device = FakeDevice::spawn(|_, _| Reply::Result(json!(["ok"]))).await;
        let mut client = client_for(&device);
        let reply = client.send_command("self_clean_on", Value::Null).await.unwrap();
        assert_eq!(reply, json!(["ok"]));
        assert_eq!(device.requests()[0].1, json!([]));

        client
            .send_command("set_mode", json!({"mode": 2}))
            .await
            .unwrap();
        assert_eq!(device.requests()[1].1, json!({"mode": 2}));
    }

    #[tokio::test]
    async fn skips_replies_for_other_requests() {
        let device = FakeDevice::spawn(|_, _| Reply::StaleFirst(json!(["ok"]))).await;
        let mut client = client_for(&device);
        assert_eq!(
            client.send_command("night_led_on", json!([])).await.unwrap(),
            json!(["ok"])
        );
    }

    #[tokio::test]
    async fn device_error_surfaces() {
        let device = FakeDevice::spawn(|_, _| Reply::Error(-9999, "user ack timeout".into())).await;
        let mut client = client_for(&device);
        let err = client.send_command("func_off", json!(["x"])).await.unwrap_err();
        assert!(matches!(err, MiioError::Device { code: -9999, .. }));
        assert!(client.has_session());
    }

    #[tokio::test]
    async fn wrong_token_is_auth_error_and_drops_session() {
        let device = FakeDevice::spawn(|_, _| Reply::WrongToken(json!(["ok"]))).await;
        let mut client = client_for(&device);
        let err = client.send_command("self_clean_on", json!([])).await.unwrap_err();
        assert!(matches!(err, MiioError::Auth(_)));
        assert!(!client.has_session());
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let device = FakeDevice::spawn(|_, _| Reply::Silent).await;
        let mut client = client_for(&device);
        let err = client.send_command("get_prop", json!(["seating"])).await.unwrap_err();
        assert!(matches!(err, MiioError::Unreachable(_)));
        assert!(!client.has_session());
        // The handshake succeeded before the request timed out.
        assert_eq!(device.hellos(), 1);
    }

    #[tokio::test]
    async fn missing_device_is_unreachable() {
        let mut client = DeviceBuilder::new("127.0.0.1", TOKEN_HEX)
            .port(unused_port().await)
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        assert!(matches!(
            client.get_properties(&["seating"], 1).await,
            Err(MiioError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn fetches_info() {
        let device = FakeDevice::spawn(|method, _| match method {
            "miIO.info" => Reply::Result(json!({
                "model": "xjx.toilet.pro",
                "mac": "AA:BB:CC:DD:EE:FF",
                "fw_ver": "1.0.21",
                "ap": {"rssi": -50}
            })),
            _ => Reply::Silent,
        })
        .await;
        let mut client = client_for(&device);
        let info = client.info().await.unwrap();
        assert_eq!(info.model.as_deref(), Some("xjx.toilet.pro"));
        assert_eq!(info.mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(info.hw_ver, None);
    }

    #[tokio::test]
    async fn rehandshakes_after_close() {
        let device = FakeDevice::spawn(|_, _| Reply::Result(json!(["ok"]))).await;
        let mut client = client_for(&device);
        client.send_command("a", json!([])).await.unwrap();
        client.send_command("b", json!([])).await.unwrap();
        assert_eq!(device.hellos(), 1);
        client.close();
        client.send_command("c", json!([])).await.unwrap();
        assert_eq!(device.hellos(), 2);
    }
}
