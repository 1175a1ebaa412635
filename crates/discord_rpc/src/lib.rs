use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use playcord_engine::{ClientFactory, ConnectionEvent, PresenceClient, PresencePayload};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub const RPC_PORTS: [u16; 10] = [6463, 6464, 6465, 6466, 6467, 6468, 6469, 6470, 6471, 6472];
const IPC_SLOTS: [u8; 10] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9];

const OPCODE_HANDSHAKE: i32 = 0;
const OPCODE_FRAME: i32 = 1;
const OPCODE_CLOSE: i32 = 2;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Transport {
    Ipc(IpcTransport),
    Ws(Box<Ws>),
}

#[cfg(unix)]
enum IpcTransport {
    Unix(tokio::net::UnixStream),
}

#[cfg(windows)]
enum IpcTransport {
    Pipe(tokio::net::windows::named_pipe::NamedPipeClient),
}

impl IpcTransport {
    async fn send(&mut self, opcode: i32, payload: &[u8]) -> Result<()> {
        match self {
            #[cfg(unix)]
            IpcTransport::Unix(stream) => write_frame(stream, opcode, payload).await,
            #[cfg(windows)]
            IpcTransport::Pipe(pipe) => write_frame(pipe, opcode, payload).await,
        }
    }

    async fn recv(&mut self) -> Result<(i32, Vec<u8>)> {
        match self {
            #[cfg(unix)]
            IpcTransport::Unix(stream) => read_frame(stream).await,
            #[cfg(windows)]
            IpcTransport::Pipe(pipe) => read_frame(pipe).await,
        }
    }
}

/// Discord local RPC: IPC socket or named pipe first, local websocket second.
///
/// Readiness and transport failures are also reported through the
/// [`ConnectionEvent`] sender handed over at construction.
pub struct DiscordRpcClient {
    client_id: String,
    transport: Option<Transport>,
    events: UnboundedSender<ConnectionEvent>,
    user: Option<String>,
}

impl DiscordRpcClient {
    pub fn new(client_id: impl Into<String>, events: UnboundedSender<ConnectionEvent>) -> Self {
        Self {
            client_id: client_id.into(),
            transport: None,
            events,
            user: None,
        }
    }

    /// Factory for the presence publisher, one client per connection attempt.
    pub fn factory(client_id: String) -> ClientFactory {
        Box::new(move |events| Box::new(DiscordRpcClient::new(client_id.clone(), events)))
    }

    /// Discord user the READY handshake was answered for.
    pub fn user_name(&self) -> Option<&str> {
        self.user.as_deref()
    }

    async fn send_command(&mut self, payload: Value) -> Result<()> {
        let result = match self.transport.as_mut() {
            Some(Transport::Ipc(ipc)) => send_over_ipc(ipc, &payload).await,
            Some(Transport::Ws(ws)) => send_over_ws(ws, &payload).await,
            None => return Err(anyhow!("discord transport not connected")),
        };
        if let Err(err) = &result {
            self.transport = None;
            let _ = self.events.send(ConnectionEvent::Failed(err.to_string()));
        }
        result
    }
}

#[async_trait]
impl PresenceClient for DiscordRpcClient {
    async fn connect(&mut self) -> Result<()> {
        self.transport = None;
        self.user = None;

        let connected = match try_connect_ipc(&self.client_id).await {
            Some((ipc, user)) => Some((Transport::Ipc(ipc), user)),
            None => try_connect_ws(&self.client_id)
                .await
                .map(|(ws, user)| (Transport::Ws(Box::new(ws)), user)),
        };
        let Some((transport, user)) = connected else {
            return Err(anyhow!("unable to connect to local Discord RPC"));
        };

        info!(user = user.as_deref().unwrap_or("unknown"), "discord rpc ready");
        self.transport = Some(transport);
        self.user = user;
        let _ = self.events.send(ConnectionEvent::Ready);
        Ok(())
    }

    async fn set_activity(&mut self, payload: &PresencePayload) -> Result<()> {
        self.send_command(set_activity_command(Some(payload))).await
    }

    async fn clear_activity(&mut self) -> Result<()> {
        self.send_command(set_activity_command(None)).await
    }

    async fn close(&mut self) {
        match self.transport.take() {
            Some(Transport::Ipc(mut ipc)) => {
                let bye = json!({ "v": 1, "client_id": self.client_id }).to_string();
                if let Err(err) = ipc.send(OPCODE_CLOSE, bye.as_bytes()).await {
                    debug!(error = %err, "discord ipc close frame not sent");
                }
            }
            Some(Transport::Ws(mut ws)) => {
                let _ = (*ws).close(None).await;
            }
            None => {}
        }
    }

    fn is_ready(&self) -> bool {
        self.transport.is_some()
    }
}

async fn send_over_ipc(ipc: &mut IpcTransport, payload: &Value) -> Result<()> {
    ipc.send(OPCODE_FRAME, payload.to_string().as_bytes())
        .await?;
    let (opcode, raw) = ipc.recv().await?;
    if opcode == OPCODE_CLOSE {
        return Err(anyhow!("discord closed the ipc connection"));
    }
    validate_rpc_response(&raw)
}

async fn send_over_ws(ws: &mut Ws, payload: &Value) -> Result<()> {
    ws.send(Message::Text(payload.to_string()))
        .await
        .context("failed sending discord ws message")?;
    match ws.next().await {
        Some(Ok(Message::Text(text))) => validate_rpc_response(text.as_bytes()),
        Some(Ok(Message::Binary(bin))) => validate_rpc_response(&bin),
        Some(Ok(Message::Close(_))) | None => Err(anyhow!("discord ws closed")),
        Some(Err(err)) => Err(anyhow!("discord ws receive failed: {err}")),
        Some(Ok(_)) => Ok(()),
    }
}

async fn try_connect_ws(client_id: &str) -> Option<(Ws, Option<String>)> {
    for port in RPC_PORTS {
        let url = Url::parse(&format!("ws://127.0.0.1:{port}/?v=1&client_id={client_id}")).ok()?;
        match connect_async(url.as_str()).await {
            Ok((mut ws, _)) => {
                let handshake = json!({ "v": 1, "client_id": client_id });
                if ws.send(Message::Text(handshake.to_string())).await.is_err() {
                    continue;
                }
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => match parse_ready(text.as_bytes()) {
                        Ok(user) => {
                            debug!(port, "connected to discord rpc websocket");
                            return Some((ws, user));
                        }
                        Err(err) => debug!(port, error = %err, "discord ws handshake rejected"),
                    },
                    other => debug!(port, reply = ?other.map(|m| m.is_ok()), "discord ws handshake failed"),
                }
            }
            Err(err) => {
                debug!(port, error = %err, "discord ws connect failed");
            }
        }
    }
    None
}

async fn try_connect_ipc(client_id: &str) -> Option<(IpcTransport, Option<String>)> {
    for slot in IPC_SLOTS {
        match connect_ipc_slot(slot).await {
            Ok(mut ipc) => {
                let hs = json!({ "v": 1, "client_id": client_id }).to_string();
                if ipc.send(OPCODE_HANDSHAKE, hs.as_bytes()).await.is_err() {
                    continue;
                }
                match ipc.recv().await {
                    Ok((OPCODE_CLOSE, raw)) => {
                        warn!(slot, reply = %String::from_utf8_lossy(&raw), "discord refused the handshake");
                    }
                    Ok((_, raw)) => match parse_ready(&raw) {
                        Ok(user) => {
                            debug!(slot, "connected to discord ipc");
                            return Some((ipc, user));
                        }
                        Err(err) => debug!(slot, error = %err, "discord ipc handshake rejected"),
                    },
                    Err(err) => debug!(slot, error = %err, "discord ipc handshake failed"),
                }
            }
            Err(err) => {
                debug!(slot, error = %err, "discord ipc slot unavailable");
            }
        }
    }
    None
}

/// Socket paths Discord may listen on for `slot`, most specific first.
#[cfg(unix)]
pub fn ipc_candidates(slot: u8) -> Vec<PathBuf> {
    let name = format!("discord-ipc-{slot}");
    let mut paths = Vec::new();
    for var in ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"] {
        if let Ok(dir) = std::env::var(var) {
            paths.push(PathBuf::from(&dir).join(&name));
            paths.push(PathBuf::from(&dir).join("app/com.discordapp.Discord").join(&name));
            paths.push(PathBuf::from(dir).join("snap.discord").join(&name));
        }
    }
    paths.push(PathBuf::from("/tmp").join(&name));
    paths.push(PathBuf::from("/private/tmp").join(name));
    paths
}

#[cfg(windows)]
pub fn ipc_candidates(slot: u8) -> Vec<PathBuf> {
    vec![PathBuf::from(format!(r"\\?\pipe\discord-ipc-{slot}"))]
}

#[cfg(unix)]
async fn connect_ipc_slot(slot: u8) -> Result<IpcTransport> {
    for p in ipc_candidates(slot) {
        if let Ok(stream) = tokio::net::UnixStream::connect(&p).await {
            return Ok(IpcTransport::Unix(stream));
        }
    }
    Err(anyhow!("no unix discord ipc socket found"))
}

#[cfg(windows)]
async fn connect_ipc_slot(slot: u8) -> Result<IpcTransport> {
    use tokio::net::windows::named_pipe::ClientOptions;
    let path = format!(r"\\?\pipe\discord-ipc-{slot}");
    let pipe = ClientOptions::new().open(&path)?;
    Ok(IpcTransport::Pipe(pipe))
}

async fn write_frame<W>(w: &mut W, opcode: i32, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = i32::try_from(payload.len()).context("discord ipc payload too large")?;
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&opcode.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R>(r: &mut R) -> Result<(i32, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; 8];
    r.read_exact(&mut hdr).await?;

    let opcode = i32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
    let len = i32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
    if len < 0 {
        return Err(anyhow!("invalid discord ipc frame length"));
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    if !matches!(opcode, OPCODE_HANDSHAKE | OPCODE_FRAME | OPCODE_CLOSE) {
        warn!(opcode, "discord ipc unexpected opcode");
    }
    Ok((opcode, payload))
}

fn nonce() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{n:x}")
}

fn activity_json(payload: &PresencePayload) -> Value {
    let mut assets = serde_json::Map::new();
    assets.insert("large_image".to_string(), json!(payload.large_image_key));
    if let Some(text) = &payload.large_image_text {
        assets.insert("large_text".to_string(), json!(text));
    }
    assets.insert("small_image".to_string(), json!(payload.small_image_key));
    assets.insert("small_text".to_string(), json!(payload.small_image_text));

    json!({
        "type": 2,
        "details": payload.details,
        "state": payload.state,
        "timestamps": {
            "start": payload.start_timestamp,
            "end": payload.end_timestamp,
        },
        "assets": Value::Object(assets),
    })
}

/// `SET_ACTIVITY` with a null activity clears the status.
fn set_activity_command(payload: Option<&PresencePayload>) -> Value {
    json!({
        "cmd": "SET_ACTIVITY",
        "args": {
            "pid": std::process::id(),
            "activity": payload.map(activity_json).unwrap_or(Value::Null),
        },
        "nonce": nonce(),
    })
}

/// Accepts the handshake reply only if it is a `READY` dispatch.
fn parse_ready(raw: &[u8]) -> Result<Option<String>> {
    let value: Value = serde_json::from_slice(raw).context("handshake reply is not json")?;
    validate_rpc_response(raw)?;
    let evt = value.get("evt").and_then(Value::as_str).unwrap_or_default();
    if !evt.eq_ignore_ascii_case("READY") {
        return Err(anyhow!("unexpected handshake event {evt:?}"));
    }
    Ok(value
        .pointer("/data/user/username")
        .and_then(Value::as_str)
        .map(str::to_string))
}

fn validate_rpc_response(raw: &[u8]) -> Result<()> {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(_) => return Ok(()),
    };

    if value
        .get("evt")
        .and_then(|v| v.as_str())
        .map(|evt| evt.eq_ignore_ascii_case("ERROR"))
        .unwrap_or(false)
    {
        let data = value.get("data");
        let code = data
            .and_then(|d| d.get("code"))
            .and_then(|c| c.as_i64())
            .unwrap_or_default();
        let msg = data
            .and_then(|d| d.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("unknown discord rpc error");
        return Err(anyhow!("discord rpc error {code}: {msg}"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> PresencePayload {
        PresencePayload {
            details: "Song A".to_string(),
            state: "by Artist X".to_string(),
            large_image_key: "itunes_logo".to_string(),
            large_image_text: None,
            small_image_key: "play_icon".to_string(),
            small_image_text: "Via iTunes".to_string(),
            start_timestamp: 1_000,
            end_timestamp: 181_000,
        }
    }

    #[tokio::test]
    async fn frames_survive_the_wire() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_frame(&mut a, OPCODE_FRAME, br#"{"cmd":"SET_ACTIVITY"}"#)
            .await
            .expect("write");
        let (opcode, body) = read_frame(&mut b).await.expect("read");
        assert_eq!(opcode, OPCODE_FRAME);
        assert_eq!(body, br#"{"cmd":"SET_ACTIVITY"}"#);
    }

    #[tokio::test]
    async fn negative_frame_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut raw = OPCODE_FRAME.to_le_bytes().to_vec();
        raw.extend_from_slice(&(-4i32).to_le_bytes());
        a.write_all(&raw).await.expect("write");
        assert!(read_frame(&mut b).await.is_err());
    }

    #[test]
    fn activity_carries_both_timestamps_and_assets() {
        let cmd = set_activity_command(Some(&payload()));
        let activity = &cmd["args"]["activity"];
        assert_eq!(activity["details"], "Song A");
        assert_eq!(activity["state"], "by Artist X");
        assert_eq!(activity["timestamps"]["start"], 1_000);
        assert_eq!(activity["timestamps"]["end"], 181_000);
        assert_eq!(activity["assets"]["small_text"], "Via iTunes");
        assert!(activity["assets"].get("large_text").is_none());
    }

    #[test]
    fn clearing_sends_a_null_activity() {
        let cmd = set_activity_command(None);
        assert_eq!(cmd["cmd"], "SET_ACTIVITY");
        assert!(cmd["args"]["activity"].is_null());
    }

    #[test]
    fn handshake_needs_a_ready_dispatch() {
        let ready = br#"{"cmd":"DISPATCH","evt":"READY","data":{"v":1,"user":{"username":"listener"}}}"#;
        assert_eq!(parse_ready(ready).expect("ready").as_deref(), Some("listener"));

        let error = br#"{"cmd":"DISPATCH","evt":"ERROR","data":{"code":4000,"message":"Invalid Client ID"}}"#;
        let err = parse_ready(error).expect_err("rejected");
        assert!(err.to_string().contains("Invalid Client ID"));

        assert!(parse_ready(b"not json").is_err());
    }

    #[tokio::test]
    async fn disconnected_client_is_not_ready() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut client = DiscordRpcClient::new("123", tx);
        assert!(!client.is_ready());
        assert!(client.set_activity(&payload()).await.is_err());
        assert!(client.user_name().is_none());
        client.close().await;
    }

    #[tokio::test]
    async fn closing_a_websocket_transport_sends_a_close_frame() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
            ws.next().await
        });

        let (ws, _) = connect_async(format!("ws://{addr}")).await.expect("connect");
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut client = DiscordRpcClient::new("123", tx);
        client.transport = Some(Transport::Ws(Box::new(ws)));
        assert!(client.is_ready());

        client.close().await;
        assert!(!client.is_ready());
        let received = server.await.expect("join");
        assert!(matches!(received, Some(Ok(Message::Close(_)))));
    }
}
