// src/transport/bridge.rs
//
// Transport backed by an external protocol bridge process speaking newline-delimited
// JSON over stdio.
//
//   gateway -> bridge   {"id": 7, "method": "send_text", "params": {"jid": "...", "text": "..."}}
//   bridge  -> gateway  {"id": 7, "result": {...}}  |  {"id": 7, "error": {"message": "..."}}
//   bridge  -> gateway  {"event": "connection.update", "payload": {"connection": "open", "qr": null, "statusCode": null}}
//                       {"event": "messages.upsert",   "payload": {"type": "notify", "messages": [...]}}
//                       {"event": "contacts.upsert",   "payload": [{"id": "...@s.whatsapp.net", "lid": "...@lid"}]}
//
// Methods: connect {authDir}, send_text {jid, text}, profile_picture_url {jid, type},
// download_media {message} -> {data: base64}, logout, shutdown.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{ConnectionState, Contact, Transport, TransportError, TransportEvent};
use crate::envelope::WaMessage;

type Pending = DashMap<u64, oneshot::Sender<Result<Value, String>>>;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub command: String,
    pub script: PathBuf,
    pub auth_dir: PathBuf,
    pub request_timeout: Duration,
}

struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    reader: JoinHandle<()>,
}

pub struct BridgeTransport {
    config: BridgeConfig,
    process: Mutex<Option<BridgeProcess>>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct ConnectionPayload {
    connection: Option<ConnectionState>,
    qr: Option<String>,
    #[serde(rename = "statusCode")]
    status_code: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct UpsertPayload {
    #[serde(default)]
    messages: Vec<WaMessage>,
}

impl BridgeTransport {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            process: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let line = json!({ "id": id, "method": method, "params": params }).to_string();
        {
            let mut guard = self.process.lock().await;
            let Some(process) = guard.as_mut() else {
                self.pending.remove(&id);
                return Err(TransportError::NotConnected);
            };
            let written = async {
                process.stdin.write_all(line.as_bytes()).await?;
                process.stdin.write_all(b"\n").await?;
                process.stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                self.pending.remove(&id);
                return Err(e.into());
            }
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(TransportError::Request(message)),
            Ok(Err(_)) => Err(TransportError::Request("bridge exited".into())),
            Err(_) => {
                self.pending.remove(&id);
                Err(TransportError::Timeout(method.to_string()))
            }
        }
    }

    fn fail_pending(pending: &Pending, reason: &str) {
        let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = pending.remove(&id) {
                let _ = tx.send(Err(reason.to_string()));
            }
        }
    }

    async fn read_loop(
        stdout: ChildStdout,
        pending: Arc<Pending>,
        events: mpsc::Sender<TransportEvent>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "bridge stdout read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let payload: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(error = %e, "bridge emitted non-JSON line");
                    continue;
                }
            };

            if let Some(id) = payload.get("id").and_then(Value::as_u64) {
                if let Some((_, tx)) = pending.remove(&id) {
                    let outcome = match payload.get("error") {
                        Some(err) => Err(err
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("bridge request failed")
                            .to_string()),
                        None => Ok(payload.get("result").cloned().unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(outcome);
                }
                continue;
            }

            match parse_event(&payload) {
                Ok(Some(event)) => {
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "dropping malformed bridge event"),
            }
        }

        Self::fail_pending(&pending, "bridge exited");
        let _ = events
            .send(TransportEvent::Connection {
                state: Some(ConnectionState::Close),
                qr: None,
                status_code: None,
            })
            .await;
    }
}

fn parse_event(payload: &Value) -> Result<Option<TransportEvent>, TransportError> {
    let Some(event) = payload.get("event").and_then(Value::as_str) else {
        return Ok(None);
    };
    let body = payload.get("payload").cloned().unwrap_or(Value::Null);
    let decode_err = |e: serde_json::Error| TransportError::Protocol(format!("{event}: {e}"));

    let parsed = match event {
        "connection.update" => {
            let p: ConnectionPayload = serde_json::from_value(body).map_err(decode_err)?;
            TransportEvent::Connection {
                state: p.connection,
                qr: p.qr,
                status_code: p.status_code,
            }
        }
        "messages.upsert" => {
            let p: UpsertPayload = serde_json::from_value(body).map_err(decode_err)?;
            TransportEvent::Messages(p.messages)
        }
        "contacts.upsert" | "contacts.update" => {
            let contacts: Vec<Contact> = serde_json::from_value(body).map_err(decode_err)?;
            TransportEvent::Contacts(contacts)
        }
        _ => return Ok(None),
    };
    Ok(Some(parsed))
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        self.end().await;

        let mut child = Command::new(&self.config.command)
            .arg(&self.config.script)
            .env("AUTH_DIR", &self.config.auth_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Protocol("bridge stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("bridge stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "bridge", "{line}");
                }
            });
        }

        let reader = tokio::spawn(Self::read_loop(stdout, Arc::clone(&self.pending), events));
        *self.process.lock().await = Some(BridgeProcess {
            child,
            stdin,
            reader,
        });

        tracing::info!(
            command = %self.config.command,
            script = %self.config.script.display(),
            "bridge process started"
        );

        self.request(
            "connect",
            json!({ "authDir": self.config.auth_dir.display().to_string() }),
        )
        .await?;
        Ok(())
    }

    async fn send_text(&self, jid: &str, text: &str) -> Result<(), TransportError> {
        self.request("send_text", json!({ "jid": jid, "text": text }))
            .await
            .map(|_| ())
    }

    async fn profile_picture_url(&self, jid: &str) -> Result<Option<String>, TransportError> {
        let result = self
            .request("profile_picture_url", json!({ "jid": jid, "type": "image" }))
            .await?;
        Ok(result
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
            .map(str::to_string))
    }

    async fn download_media(&self, envelope: &Value) -> Result<Vec<u8>, TransportError> {
        let result = self.request("download_media", envelope.clone()).await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Protocol("download_media: missing data".into()))?;
        STANDARD
            .decode(data)
            .map_err(|e| TransportError::Protocol(format!("download_media: {e}")))
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.request("logout", json!({})).await.map(|_| ())
    }

    async fn end(&self) {
        let taken = self.process.lock().await.take();
        if let Some(mut process) = taken {
            process.reader.abort();
            if let Err(e) = process.child.kill().await {
                tracing::debug!(error = %e, "bridge process already gone");
            }
            Self::fail_pending(&self.pending, "bridge ended");
        }
    }
}
