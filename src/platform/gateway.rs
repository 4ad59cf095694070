use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, Stream, StreamExt,
};
use log::{debug, info, warn};
use serde_json::{json, Value as JsonValue};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, error::TrySendError},
        Mutex,
    },
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::{Activity, Session, ShardInfo};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OP_DISPATCH: u64 = 0;
const OP_HEARTBEAT: u64 = 1;
const OP_IDENTIFY: u64 = 2;
const OP_PRESENCE_UPDATE: u64 = 3;
const OP_RESUME: u64 = 6;
const OP_RECONNECT: u64 = 7;
const OP_INVALID_SESSION: u64 = 9;
const OP_HELLO: u64 = 10;
const OP_HEARTBEAT_ACK: u64 = 11;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF_MIN: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);
// Closing with 1000 would invalidate the session, so reconnects use 4000.
const RECONNECT_CLOSE_CODE: u16 = 4000;

/// Close codes after which the gateway will never accept this bot again.
fn is_fatal_close(code: u16) -> bool {
    code == 4004 || (4010..=4014).contains(&code)
}

/// Close codes that invalidate the session, so the next login must identify.
fn forgets_session(code: u16) -> bool {
    code == 4007 || code == 4009
}

fn gateway_url(base: &str) -> String {
    format!("{}/?v=10&encoding=json", base.trim_end_matches('/'))
}

pub fn identify_payload(token: &str, shard: Option<ShardInfo>) -> JsonValue {
    let mut data = json!({
        "token": token,
        "intents": 0,
        "properties": {
            "os": std::env::consts::OS,
            "browser": "presence-ticker",
            "device": "presence-ticker"
        }
    });
    if let Some(shard) = shard {
        data["shard"] = json!([shard.id, shard.count]);
    }
    json!({ "op": OP_IDENTIFY, "d": data })
}

pub fn resume_payload(token: &str, session_id: &str, seq: &JsonValue) -> JsonValue {
    json!({
        "op": OP_RESUME,
        "d": { "token": token, "session_id": session_id, "seq": seq }
    })
}

pub fn presence_payload(activity: &Activity) -> JsonValue {
    json!({
        "op": OP_PRESENCE_UPDATE,
        "d": {
            "since": null,
            "activities": [{ "name": activity.name, "type": activity.kind.code() }],
            "status": "online",
            "afk": false
        }
    })
}

fn heartbeat_payload(seq: &JsonValue) -> Message {
    Message::Text(json!({ "op": OP_HEARTBEAT, "d": seq }).to_string())
}

async fn next_payload<S>(read: &mut S) -> Result<JsonValue>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(Message::Close(frame))) => bail!("gateway closed: {:?}", frame),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => bail!("gateway stream ended"),
        }
    }
}

struct Connection {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    heartbeat: Duration,
}

/// How a live connection ended.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Shutdown,
    Reconnect,
    Fatal,
}

/// Login state of one gateway session, kept across reconnects.
struct Link {
    url: String,
    token: String,
    shard: Option<ShardInfo>,
    label: String,
    seq: JsonValue,
    session_id: Option<String>,
    resume_url: Option<String>,
}

impl Link {
    fn track(&mut self, payload: &JsonValue) {
        if !payload["s"].is_null() {
            self.seq = payload["s"].clone();
        }
    }

    fn forget_session(&mut self) {
        self.session_id = None;
        self.resume_url = None;
        self.seq = JsonValue::Null;
    }

    /// Connects and logs in, resuming the previous session when there is one.
    async fn establish(&mut self) -> Result<Connection> {
        if let (Some(session_id), Some(resume_url)) = (self.session_id.clone(), self.resume_url.clone()) {
            match self.resume(&session_id, &resume_url).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!("Gateway {}: resume failed, identifying: {:#}", self.label, e);
                    self.forget_session();
                }
            }
        }
        self.identify().await
    }

    async fn hello(url: &str) -> Result<Connection> {
        let (ws, _) = connect_async(url).await.context("connecting to gateway")?;
        let (write, mut read) = ws.split();
        let hello = next_payload(&mut read).await?;
        if hello["op"].as_u64() != Some(OP_HELLO) {
            bail!("expected gateway hello, got {}", hello["op"]);
        }
        let heartbeat = hello["d"]["heartbeat_interval"]
            .as_u64()
            .ok_or(anyhow!("Failed to parse gateway hello"))?;
        Ok(Connection {
            write,
            read,
            heartbeat: Duration::from_millis(heartbeat),
        })
    }

    async fn identify(&mut self) -> Result<Connection> {
        let mut conn = Link::hello(&gateway_url(&self.url)).await?;
        conn.write
            .send(Message::Text(identify_payload(&self.token, self.shard).to_string()))
            .await?;
        loop {
            let payload = next_payload(&mut conn.read).await?;
            self.track(&payload);
            match payload["op"].as_u64() {
                Some(OP_DISPATCH) if payload["t"].as_str() == Some("READY") => {
                    self.session_id = payload["d"]["session_id"].as_str().map(str::to_owned);
                    self.resume_url = payload["d"]["resume_gateway_url"].as_str().map(str::to_owned);
                    return Ok(conn);
                }
                Some(OP_INVALID_SESSION) => bail!("gateway rejected identify"),
                _ => {}
            }
        }
    }

    async fn resume(&mut self, session_id: &str, resume_url: &str) -> Result<Connection> {
        let mut conn = Link::hello(&gateway_url(resume_url)).await?;
        conn.write
            .send(Message::Text(
                resume_payload(&self.token, session_id, &self.seq).to_string(),
            ))
            .await?;
        loop {
            let payload = next_payload(&mut conn.read).await?;
            self.track(&payload);
            match payload["op"].as_u64() {
                Some(OP_DISPATCH) if payload["t"].as_str() == Some("RESUMED") => return Ok(conn),
                Some(OP_INVALID_SESSION) => bail!("gateway rejected resume"),
                _ => {}
            }
        }
    }

    /// Serves one connection until it drops, the gateway asks for a new one,
    /// or the session is shut down.
    async fn serve(
        &mut self,
        conn: Connection,
        commands: &mut mpsc::Receiver<Message>,
        shutdown: &CancellationToken,
    ) -> Outcome {
        let Connection {
            mut write,
            mut read,
            heartbeat,
        } = conn;
        let mut heartbeats =
            tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        let mut acked = true;
        let outcome = loop {
            let res = tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Outcome::Shutdown;
                }
                _ = heartbeats.tick() => {
                    if !acked {
                        warn!("Gateway {}: heartbeat not acknowledged, reconnecting", self.label);
                        break Outcome::Reconnect;
                    }
                    acked = false;
                    write.send(heartbeat_payload(&self.seq)).await
                }
                Some(msg) = commands.recv() => write.send(msg).await,
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let payload: JsonValue = match serde_json::from_str(&text) {
                            Ok(payload) => payload,
                            Err(e) => {
                                debug!("Gateway {}: unparsable frame: {}", self.label, e);
                                continue;
                            }
                        };
                        self.track(&payload);
                        match payload["op"].as_u64() {
                            Some(OP_HEARTBEAT) => write.send(heartbeat_payload(&self.seq)).await,
                            Some(OP_HEARTBEAT_ACK) => {
                                acked = true;
                                Ok(())
                            }
                            Some(OP_RECONNECT) => {
                                info!("Gateway {} asked to reconnect", self.label);
                                break Outcome::Reconnect;
                            }
                            Some(OP_INVALID_SESSION) => {
                                if payload["d"].as_bool() != Some(true) {
                                    self.forget_session();
                                }
                                warn!("Gateway {}: session invalidated", self.label);
                                break Outcome::Reconnect;
                            }
                            _ => Ok(()),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        warn!("Gateway {} closed: {:?}", self.label, frame);
                        let code = frame.map(|frame| u16::from(frame.code));
                        match code {
                            Some(code) if is_fatal_close(code) => return Outcome::Fatal,
                            Some(code) if forgets_session(code) => self.forget_session(),
                            _ => {}
                        }
                        break Outcome::Reconnect;
                    }
                    Some(Ok(_)) => Ok(()),
                    Some(Err(e)) => Err(e),
                    None => {
                        warn!("Gateway {}: stream ended", self.label);
                        break Outcome::Reconnect;
                    }
                },
            };
            if let Err(e) = res {
                warn!("Gateway {}: {}", self.label, e);
                break Outcome::Reconnect;
            }
        };
        let _ = write
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(RECONNECT_CLOSE_CODE),
                reason: "reconnecting".into(),
            })))
            .await;
        outcome
    }

    /// Logs in again after a dropped connection. Returns `None` on shutdown.
    async fn reconnect(&mut self, shutdown: &CancellationToken) -> Option<Connection> {
        let mut backoff = RECONNECT_BACKOFF_MIN;
        loop {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => return None,
                res = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.establish()) => res,
            };
            match attempt {
                Ok(Ok(conn)) => {
                    info!("Gateway reconnected: {}", self.label);
                    return Some(conn);
                }
                Ok(Err(e)) => warn!(
                    "Gateway {}: reconnect failed, retrying in {:?}: {:#}",
                    self.label, backoff, e
                ),
                Err(_) => warn!(
                    "Gateway {}: reconnect timed out, retrying in {:?}",
                    self.label, backoff
                ),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }
    }
}

async fn drive(
    mut link: Link,
    mut conn: Connection,
    mut commands: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
) {
    loop {
        match link.serve(conn, &mut commands, &shutdown).await {
            Outcome::Reconnect => {}
            Outcome::Shutdown => break,
            Outcome::Fatal => {
                warn!("Gateway {}: closed for good", link.label);
                break;
            }
        }
        conn = match link.reconnect(&shutdown).await {
            Some(conn) => conn,
            None => break,
        };
    }
    debug!("Gateway {} driver stopped", link.label);
}

/// One gateway session. A background task keeps it alive with heartbeats,
/// reconnects it when the gateway drops it, and forwards presence updates.
pub struct GatewaySession {
    label: String,
    commands: mpsc::Sender<Message>,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl GatewaySession {
    /// Connects to the gateway at `url`, a base address without query string.
    pub async fn connect(
        url: &str,
        token: &str,
        shard: Option<ShardInfo>,
        label: &str,
    ) -> Result<GatewaySession> {
        let label = match shard {
            Some(shard) => format!("{} shard {}/{}", label, shard.id, shard.count),
            None => label.to_owned(),
        };
        let mut link = Link {
            url: url.to_owned(),
            token: token.to_owned(),
            shard,
            label: label.clone(),
            seq: JsonValue::Null,
            session_id: None,
            resume_url: None,
        };
        let conn = tokio::time::timeout(HANDSHAKE_TIMEOUT, link.establish())
            .await
            .map_err(|_| anyhow!("gateway handshake timed out"))??;
        info!("Gateway ready: {}", label);

        let (commands, commands_rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let driver = tokio::spawn(drive(link, conn, commands_rx, shutdown.clone()));
        Ok(GatewaySession {
            label,
            commands,
            shutdown,
            driver: Mutex::new(Some(driver)),
        })
    }
}

#[async_trait]
impl Session for GatewaySession {
    async fn set_activity(&self, activity: &Activity) -> Result<()> {
        let msg = Message::Text(presence_payload(activity).to_string());
        self.commands.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => anyhow!("gateway session {} is reconnecting", self.label),
            TrySendError::Closed(_) => anyhow!("gateway session {} is closed", self.label),
        })
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(driver) = self.driver.lock().await.take() {
            driver.await?;
        }
        Ok(())
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    type ServerWs = WebSocketStream<TcpStream>;

    #[test]
    fn identify_carries_shard_when_sharded() {
        let payload = identify_payload("secret", Some(ShardInfo { id: 1, count: 4 }));
        assert_eq!(payload["op"], 2);
        assert_eq!(payload["d"]["token"], "secret");
        assert_eq!(payload["d"]["shard"], json!([1, 4]));

        let payload = identify_payload("secret", None);
        assert!(payload["d"]["shard"].is_null());
    }

    #[test]
    fn presence_update_uses_activity_type() {
        let payload = presence_payload(&Activity::watching("+0.82 % | TSLA"));
        assert_eq!(payload["op"], 3);
        assert_eq!(payload["d"]["activities"][0]["name"], "+0.82 % | TSLA");
        assert_eq!(payload["d"]["activities"][0]["type"], 3);
        assert_eq!(payload["d"]["status"], "online");

        let payload = presence_payload(&Activity::playing("5.00 ⬈ +1.00%"));
        assert_eq!(payload["d"]["activities"][0]["type"], 0);
    }

    #[test]
    fn gateway_url_appends_version_query() {
        assert_eq!(
            gateway_url("wss://gateway.discord.gg"),
            "wss://gateway.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(
            gateway_url("wss://gateway-us-east1-b.discord.gg/"),
            "wss://gateway-us-east1-b.discord.gg/?v=10&encoding=json"
        );
    }

    #[test]
    fn close_codes() {
        assert!(is_fatal_close(4004));
        assert!(is_fatal_close(4014));
        assert!(!is_fatal_close(4000));
        assert!(forgets_session(4009));
        assert!(!forgets_session(4001));
    }

    async fn accept(listener: &TcpListener) -> ServerWs {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn send(ws: &mut ServerWs, payload: JsonValue) {
        ws.send(Message::Text(payload.to_string())).await.unwrap();
    }

    async fn recv(ws: &mut ServerWs) -> JsonValue {
        next_payload(ws).await.unwrap()
    }

    async fn hello(ws: &mut ServerWs) {
        send(ws, json!({ "op": 10, "d": { "heartbeat_interval": 45000 } })).await;
    }

    fn ready(resume_url: &str) -> JsonValue {
        json!({
            "op": 0,
            "t": "READY",
            "s": 1,
            "d": { "session_id": "abc", "resume_gateway_url": resume_url }
        })
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn resumes_after_reconnect_request() {
        let (listener, url) = listen().await;
        let (reconnected_tx, reconnected_rx) = tokio::sync::oneshot::channel();
        let resume_url = url.clone();
        let server = tokio::spawn(async move {
            let mut first = accept(&listener).await;
            hello(&mut first).await;
            assert_eq!(recv(&mut first).await["op"], 2);
            send(&mut first, ready(&resume_url)).await;
            send(&mut first, json!({ "op": 7, "d": null })).await;

            let mut second = accept(&listener).await;
            reconnected_tx.send(()).unwrap();
            hello(&mut second).await;
            let resume = recv(&mut second).await;
            send(&mut second, json!({ "op": 0, "t": "RESUMED", "s": 2, "d": null })).await;
            let presence = recv(&mut second).await;
            (resume, presence)
        });

        let session = GatewaySession::connect(&url, "secret", None, "TSLA").await.unwrap();
        reconnected_rx.await.unwrap();
        session
            .set_activity(&Activity::watching("+1.00 % | TSLA"))
            .await
            .unwrap();

        let (resume, presence) = server.await.unwrap();
        assert_eq!(resume["op"], 6);
        assert_eq!(resume["d"]["session_id"], "abc");
        assert_eq!(resume["d"]["seq"], 1);
        assert_eq!(presence["op"], 3);
        assert_eq!(presence["d"]["activities"][0]["name"], "+1.00 % | TSLA");
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn identifies_again_after_invalid_session() {
        let (listener, url) = listen().await;
        let resume_url = url.clone();
        let server = tokio::spawn(async move {
            let mut first = accept(&listener).await;
            hello(&mut first).await;
            recv(&mut first).await;
            send(&mut first, ready(&resume_url)).await;
            send(&mut first, json!({ "op": 9, "d": false })).await;

            let mut second = accept(&listener).await;
            hello(&mut second).await;
            let login = recv(&mut second).await;
            send(&mut second, ready(&resume_url)).await;
            login
        });

        let session = GatewaySession::connect(&url, "secret", Some(ShardInfo { id: 0, count: 2 }), "BTC")
            .await
            .unwrap();
        let login = server.await.unwrap();
        assert_eq!(login["op"], 2);
        assert_eq!(login["d"]["shard"], json!([0, 2]));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn authentication_failure_ends_the_session() {
        let (listener, url) = listen().await;
        let resume_url = url.clone();
        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            hello(&mut ws).await;
            recv(&mut ws).await;
            send(&mut ws, ready(&resume_url)).await;
            ws.close(Some(CloseFrame {
                code: CloseCode::from(4004),
                reason: "Authentication failed".into(),
            }))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });

        let session = GatewaySession::connect(&url, "secret", None, "TSLA").await.unwrap();
        server.await.unwrap();
        for _ in 0..100 {
            if session.commands.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let err = session.set_activity(&Activity::watching("x")).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
        session.close().await.unwrap();
    }
}
