//! Owns the transport lifecycle: pairing, QR issuance, reconnects and forced resets.
//!
//! A single actor task is the only writer of [`SessionState`]; REST handlers and the
//! realtime broadcaster read it through a `watch` receiver. Every connection attempt
//! gets an epoch number and events from superseded attempts are dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::identity::ContactBook;
use crate::ingest::{IngestOutcome, MessageIngester};
use crate::realtime::RealtimeBroadcaster;
use crate::transport::{ConnectionState, Transport, TransportError, TransportEvent};

/// Close codes after which the stored credentials are useless: logged out,
/// bad session, connection replaced, unavailable.
pub const FATAL_CLOSE_CODES: [u16; 4] = [401, 411, 440, 500];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    #[serde(rename = "qr_ready")]
    Identifying,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub status: ConnectionStatus,
    pub qr: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            qr: None,
        }
    }
}

pub fn session_channel() -> (watch::Sender<SessionState>, watch::Receiver<SessionState>) {
    watch::channel(SessionState::default())
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("connection supervisor is not running")]
    Stopped,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub auth_dir: PathBuf,
    pub reconnect_delay: Duration,
    pub logout_restart_delay: Duration,
}

enum Command {
    Init(oneshot::Sender<Result<(), SupervisorError>>),
    Logout(oneshot::Sender<Result<(), SupervisorError>>),
    Restart { epoch: u64 },
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    session: watch::Receiver<SessionState>,
}

impl SupervisorHandle {
    /// Begins pairing. No-op while connected or while an attempt is in flight.
    pub async fn init(&self) -> Result<(), SupervisorError> {
        self.call(Command::Init).await
    }

    pub async fn logout(&self) -> Result<(), SupervisorError> {
        self.call(Command::Logout).await
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn session(&self) -> SessionState {
        self.session.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session.borrow().status == ConnectionStatus::Connected
    }

    async fn call(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), SupervisorError>>) -> Command,
    ) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SupervisorError::Stopped)?;
        rx.await.map_err(|_| SupervisorError::Stopped)?
    }
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    ingester: MessageIngester,
    contacts: Arc<ContactBook>,
    realtime: RealtimeBroadcaster,
    session: watch::Sender<SessionState>,
    config: SupervisorConfig,
    commands: mpsc::Sender<Command>,
    events: mpsc::Sender<(u64, TransportEvent)>,
    epoch: u64,
    in_flight: bool,
    retries: u32,
}

impl ConnectionSupervisor {
    pub fn spawn(
        transport: Arc<dyn Transport>,
        ingester: MessageIngester,
        contacts: Arc<ContactBook>,
        realtime: RealtimeBroadcaster,
        session: watch::Sender<SessionState>,
        config: SupervisorConfig,
    ) -> SupervisorHandle {
        let (commands, command_rx) = mpsc::channel(16);
        let (events, event_rx) = mpsc::channel(256);
        let handle = SupervisorHandle {
            commands: commands.clone(),
            session: session.subscribe(),
        };

        let actor = ConnectionSupervisor {
            transport,
            ingester,
            contacts,
            realtime,
            session,
            config,
            commands,
            events,
            epoch: 0,
            in_flight: false,
            retries: 0,
        };
        tokio::spawn(actor.run(command_rx, event_rx));
        handle
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<(u64, TransportEvent)>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown(done)) => {
                        self.transport.end().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some((epoch, event)) = events.recv() => {
                    if epoch == self.epoch {
                        self.handle_event(event).await;
                    } else {
                        tracing::debug!(epoch, current = self.epoch, "dropping event from stale connection");
                    }
                }
            }
        }
        tracing::info!("connection supervisor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Init(reply) => {
                let status = self.session.borrow().status;
                let res = if status == ConnectionStatus::Connected || self.in_flight {
                    tracing::debug!(?status, "init ignored, session already active");
                    Ok(())
                } else {
                    self.start().await
                };
                let _ = reply.send(res);
            }
            Command::Logout(reply) => {
                let _ = reply.send(self.logout().await);
            }
            Command::Restart { epoch } => {
                if epoch != self.epoch || self.in_flight {
                    return;
                }
                if let Err(e) = self.start().await {
                    tracing::error!(error = %e, "scheduled reconnect failed");
                }
            }
            Command::Shutdown(_) => {}
        }
    }

    async fn start(&mut self) -> Result<(), SupervisorError> {
        self.epoch += 1;
        let epoch = self.epoch;

        let (tx, mut rx) = mpsc::channel::<TransportEvent>(64);
        let forward = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if forward.send((epoch, event)).await.is_err() {
                    break;
                }
            }
        });

        self.in_flight = true;
        match self.transport.connect(tx).await {
            Ok(()) => {
                tracing::info!(epoch, retries = self.retries, "connection attempt started");
                Ok(())
            }
            Err(e) => {
                tracing::error!(epoch, error = %e, "could not start connection");
                // trailing events of the dead attempt must not schedule a reconnect
                self.epoch += 1;
                self.in_flight = false;
                self.set_status(ConnectionStatus::Disconnected);
                Err(e.into())
            }
        }
    }

    async fn logout(&mut self) -> Result<(), SupervisorError> {
        // invalidate the current attempt and any pending restart
        self.epoch += 1;
        self.in_flight = false;

        let result = match self.transport.logout().await {
            Ok(()) | Err(TransportError::NotConnected) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "server-side logout failed");
                Err(e.into())
            }
        };
        self.transport.end().await;
        self.purge_credentials().await;

        self.session.send_modify(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.qr = None;
        });
        self.realtime.status(ConnectionStatus::Disconnected);
        self.realtime.qr(None);
        tracing::info!("logged out, re-pairing shortly");

        self.schedule_restart(self.config.logout_restart_delay);
        result
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connection {
                state,
                qr,
                status_code,
            } => {
                if let Some(qr) = qr {
                    self.session.send_modify(|s| {
                        s.status = ConnectionStatus::Identifying;
                        s.qr = Some(qr.clone());
                    });
                    tracing::info!("pairing QR issued");
                    self.realtime.qr(Some(qr));
                    self.realtime.status(ConnectionStatus::Identifying);
                }
                match state {
                    Some(ConnectionState::Open) => self.on_open(),
                    Some(ConnectionState::Close) => self.on_close(status_code).await,
                    Some(ConnectionState::Connecting) | None => {}
                }
            }
            TransportEvent::Messages(batch) => {
                tracing::debug!(count = batch.len(), "message batch received");
                for msg in batch {
                    let ingester = self.ingester.clone();
                    tokio::spawn(async move {
                        let id = msg.id().to_string();
                        match ingester.ingest(msg).await {
                            Ok(IngestOutcome::Skipped(reason)) => {
                                tracing::debug!(message_id = %id, ?reason, "message skipped");
                            }
                            Ok(IngestOutcome::Stored(_)) => {}
                            Err(e) => {
                                tracing::error!(message_id = %id, error = %e, "message dropped");
                            }
                        }
                    });
                }
            }
            TransportEvent::Contacts(list) => {
                self.contacts.remember(&list);
                tracing::debug!(received = list.len(), cached = self.contacts.len(), "contacts synced");
            }
        }
    }

    fn on_open(&mut self) {
        self.in_flight = false;
        self.retries = 0;
        self.session.send_modify(|s| {
            s.status = ConnectionStatus::Connected;
            s.qr = None;
        });
        self.realtime.status(ConnectionStatus::Connected);
        tracing::info!("whatsapp connected");
    }

    async fn on_close(&mut self, status_code: Option<u16>) {
        self.in_flight = false;

        if status_code.is_some_and(|c| FATAL_CLOSE_CODES.contains(&c)) {
            tracing::warn!(?status_code, "session invalidated, purging credentials");
            self.session.send_modify(|s| {
                s.status = ConnectionStatus::Disconnected;
                s.qr = None;
            });
            self.realtime.status(ConnectionStatus::Disconnected);
            self.transport.end().await;
            self.purge_credentials().await;
            if let Err(e) = self.start().await {
                tracing::error!(error = %e, "re-pairing failed");
            }
            return;
        }

        self.retries += 1;
        tracing::warn!(?status_code, retries = self.retries, "connection lost, reconnecting");
        self.set_status(ConnectionStatus::Reconnecting);
        self.schedule_restart(self.config.reconnect_delay);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.session.send_modify(|s| s.status = status);
        self.realtime.status(status);
    }

    fn schedule_restart(&self, delay: Duration) {
        let commands = self.commands.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::Restart { epoch }).await;
        });
    }

    async fn purge_credentials(&self) {
        match purge_dir_contents(&self.config.auth_dir).await {
            Ok(n) => tracing::info!(removed = n, dir = %self.config.auth_dir.display(), "credentials purged"),
            Err(e) => tracing::error!(error = %e, dir = %self.config.auth_dir.display(), "credential purge failed"),
        }
    }
}

/// Removes everything inside `dir` but keeps the directory itself.
async fn purge_dir_contents(dir: &Path) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        removed += 1;
    }
    Ok(removed)
}
