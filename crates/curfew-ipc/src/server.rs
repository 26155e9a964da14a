//! IPC server implementation
//!
//! One reader and one writer task per connection. Requests are forwarded to
//! the daemon as [`ServerMessage`]s; responses and events share the writer so
//! lines never interleave.

use curfew_api::{
    ClientInfo, ClientRole, Command, ErrorCode, ErrorInfo, Event, Request, Response,
};
use curfew_util::ClientId;
use serde::Serialize;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::{IpcError, IpcResult};

const EVENT_BUFFER: usize = 100;

/// Message from a connection to the daemon
pub enum ServerMessage {
    Request {
        client_id: ClientId,
        request: Request,
    },
    ClientConnected {
        client_id: ClientId,
        info: ClientInfo,
    },
    ClientDisconnected {
        client_id: ClientId,
    },
}

type ClientTable = Arc<RwLock<HashMap<ClientId, ClientSlot>>>;

struct ClientSlot {
    info: ClientInfo,
    outbox: mpsc::UnboundedSender<String>,
    subscribed: bool,
}

/// Unix socket server speaking newline-delimited JSON
pub struct IpcServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    clients: ClientTable,
    events: broadcast::Sender<Event>,
    inbox: mpsc::UnboundedSender<ServerMessage>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerMessage>>>,
}

impl IpcServer {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (inbox, inbox_rx) = mpsc::unbounded_channel();

        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            listener: None,
            clients: Arc::new(RwLock::new(HashMap::new())),
            events,
            inbox,
            inbox_rx: Mutex::new(Some(inbox_rx)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale one from a previous run
    pub async fn start(&mut self) -> IpcResult<()> {
        self.listener = Some(bind_socket(&self.socket_path)?);
        info!(path = %self.socket_path.display(), "IPC server listening");
        Ok(())
    }

    /// Receiver for connection and request messages. Can be taken once.
    pub async fn take_message_receiver(&self) -> Option<mpsc::UnboundedReceiver<ServerMessage>> {
        self.inbox_rx.lock().await.take()
    }

    /// Accept connections until the task is dropped
    pub async fn run(&self) -> IpcResult<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or(IpcError::NotStarted)?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => self.accept(stream).await,
                Err(e) => error!(error = %e, "Failed to accept connection"),
            }
        }
    }

    async fn accept(&self, stream: UnixStream) {
        let uid = get_peer_uid(&stream);
        let role = role_for_uid(uid, nix::unistd::getuid().as_raw());
        let mut info = ClientInfo::new(role);
        info.uid = uid;
        let client_id = info.client_id.clone();

        info!(client_id = %client_id, uid = ?uid, role = ?role, "Client connected");

        let (read_half, write_half) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();

        self.clients.write().await.insert(
            client_id.clone(),
            ClientSlot {
                info: info.clone(),
                outbox: outbox.clone(),
                subscribed: false,
            },
        );
        let _ = self.inbox.send(ServerMessage::ClientConnected {
            client_id: client_id.clone(),
            info,
        });

        tokio::spawn(read_requests(
            read_half,
            client_id.clone(),
            self.clients.clone(),
            self.inbox.clone(),
            outbox,
        ));
        tokio::spawn(write_outgoing(
            write_half,
            client_id,
            self.clients.clone(),
            outbox_rx,
            self.events.subscribe(),
        ));
    }

    /// Queue a response for one client
    pub async fn send_response(&self, client_id: &ClientId, response: Response) -> IpcResult<()> {
        let line = serde_json::to_string(&response)?;

        if let Some(slot) = self.clients.read().await.get(client_id) {
            slot.outbox
                .send(line)
                .map_err(|_| IpcError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Send an event to every subscribed client
    pub fn broadcast_event(&self, event: Event) {
        let _ = self.events.send(event);
    }

    pub async fn get_client_info(&self, client_id: &ClientId) -> Option<ClientInfo> {
        self.clients
            .read()
            .await
            .get(client_id)
            .map(|slot| slot.info.clone())
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Remove the socket file
    pub fn shutdown(&self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind_socket(path: &Path) -> IpcResult<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;
    // Owner and group only
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660))?;
    Ok(listener)
}

/// Subscribe and unsubscribe toggle event delivery before the daemon sees them
fn subscription_change(command: &Command) -> Option<bool> {
    match command {
        Command::SubscribeEvents => Some(true),
        Command::UnsubscribeEvents => Some(false),
        _ => None,
    }
}

async fn read_requests(
    read_half: OwnedReadHalf,
    client_id: ClientId,
    clients: ClientTable,
    inbox: mpsc::UnboundedSender<ServerMessage>,
    outbox: mpsc::UnboundedSender<String>,
) {
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(client_id = %client_id, "Client disconnected (EOF)");
                break;
            }
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "Read error");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<Request>(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "Invalid request");
                let rejection = Response::error(
                    0,
                    ErrorInfo::new(ErrorCode::InvalidRequest, format!("Malformed request: {e}")),
                );
                if let Ok(json) = serde_json::to_string(&rejection) {
                    let _ = outbox.send(json);
                }
                continue;
            }
        };

        if let Some(subscribed) = subscription_change(&request.command)
            && let Some(slot) = clients.write().await.get_mut(&client_id)
        {
            slot.subscribed = subscribed;
        }

        let _ = inbox.send(ServerMessage::Request {
            client_id: client_id.clone(),
            request,
        });
    }

    // Dropping the slot drops the last outbox sender, which stops the writer
    clients.write().await.remove(&client_id);
    let _ = inbox.send(ServerMessage::ClientDisconnected { client_id });
}

async fn write_outgoing(
    mut write_half: OwnedWriteHalf,
    client_id: ClientId,
    clients: ClientTable,
    mut outbox: mpsc::UnboundedReceiver<String>,
    mut events: broadcast::Receiver<Event>,
) {
    loop {
        let line = tokio::select! {
            // Responses go out ahead of queued events
            biased;

            response = outbox.recv() => match response {
                Some(line) => line,
                None => break,
            },

            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(client_id = %client_id, missed, "Client lagging behind events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let subscribed = clients
                    .read()
                    .await
                    .get(&client_id)
                    .is_some_and(|slot| slot.subscribed);
                match (subscribed, encode(&event)) {
                    (true, Some(line)) => line,
                    _ => continue,
                }
            }
        };

        if let Err(e) = write_line(&mut write_half, line).await {
            debug!(client_id = %client_id, error = %e, "Write error");
            break;
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value).ok()
}

async fn write_line(writer: &mut OwnedWriteHalf, mut line: String) -> std::io::Result<()> {
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

/// Root and the daemon's own user may modify state; everyone else observes
fn role_for_uid(uid: Option<u32>, daemon_uid: u32) -> ClientRole {
    match uid {
        Some(0) => ClientRole::Admin,
        Some(u) if u == daemon_uid => ClientRole::Admin,
        _ => ClientRole::Observer,
    }
}

fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
    use std::os::unix::io::AsFd;

    nix::sys::socket::getsockopt(&stream.as_fd(), nix::sys::socket::sockopt::PeerCredentials)
        .ok()
        .map(|cred| cred.uid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IpcClient;
    use curfew_api::{EventPayload, LoopState, ResponsePayload, ResponseResult};
    use std::time::Duration;
    use tempfile::tempdir;

    async fn started(socket_path: &Path) -> Arc<IpcServer> {
        let mut server = IpcServer::new(socket_path);
        server.start().await.unwrap();
        let server = Arc::new(server);

        let accept = server.clone();
        tokio::spawn(async move {
            let _ = accept.run().await;
        });
        server
    }

    #[tokio::test]
    async fn test_server_start() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("test.sock");

        let mut server = IpcServer::new(&socket_path);
        server.start().await.unwrap();

        assert!(socket_path.exists());
        drop(server);
        assert!(!socket_path.exists());
    }

    #[test]
    fn test_roles_from_uid() {
        assert_eq!(role_for_uid(Some(0), 1000), ClientRole::Admin);
        assert_eq!(role_for_uid(Some(1000), 1000), ClientRole::Admin);
        assert_eq!(role_for_uid(Some(1001), 1000), ClientRole::Observer);
        assert_eq!(role_for_uid(None, 1000), ClientRole::Observer);
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("curfewd.sock");
        let server = started(&socket_path).await;
        let mut messages = server.take_message_receiver().await.unwrap();

        let client = tokio::spawn({
            let socket_path = socket_path.clone();
            async move {
                let mut client = IpcClient::connect(&socket_path).await.unwrap();
                client.send(Command::Ping).await.unwrap()
            }
        });

        loop {
            match messages.recv().await.unwrap() {
                ServerMessage::ClientConnected { client_id, info } => {
                    assert_eq!(info.client_id, client_id);
                    assert_eq!(info.role, ClientRole::Admin);
                }
                ServerMessage::Request { client_id, request } => {
                    assert!(matches!(request.command, Command::Ping));
                    server
                        .send_response(
                            &client_id,
                            Response::success(request.request_id, ResponsePayload::Pong),
                        )
                        .await
                        .unwrap();
                    break;
                }
                ServerMessage::ClientDisconnected { .. } => panic!("client went away"),
            }
        }

        let response = client.await.unwrap();
        assert_eq!(response.request_id, 1);
        assert!(matches!(response.result, ResponseResult::Ok(ResponsePayload::Pong)));
    }

    #[tokio::test]
    async fn test_disconnect_releases_client() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("curfewd.sock");
        let server = started(&socket_path).await;
        let mut messages = server.take_message_receiver().await.unwrap();

        let client = IpcClient::connect(&socket_path).await.unwrap();
        let connected = match messages.recv().await.unwrap() {
            ServerMessage::ClientConnected { client_id, .. } => client_id,
            _ => panic!("expected a connection first"),
        };
        assert_eq!(server.client_count().await, 1);

        drop(client);

        let gone = tokio::time::timeout(Duration::from_secs(5), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            gone,
            ServerMessage::ClientDisconnected { ref client_id } if *client_id == connected
        ));
        assert_eq!(server.client_count().await, 0);
        assert!(server.get_client_info(&connected).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_line_gets_error_response() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("curfewd.sock");
        let _server = started(&socket_path).await;

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"{not json}\n").await.unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();

        let response: Response = serde_json::from_str(line.trim()).unwrap();
        assert!(matches!(
            response.result,
            ResponseResult::Err(ref e) if e.code == ErrorCode::InvalidRequest
        ));
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("curfewd.sock");
        let server = started(&socket_path).await;
        let mut messages = server.take_message_receiver().await.unwrap();

        let responder = {
            let server = server.clone();
            tokio::spawn(async move {
                while let Some(msg) = messages.recv().await {
                    if let ServerMessage::Request { client_id, request } = msg {
                        let payload = ResponsePayload::Subscribed {
                            client_id: client_id.clone(),
                        };
                        server
                            .send_response(&client_id, Response::success(request.request_id, payload))
                            .await
                            .unwrap();
                        server.broadcast_event(Event::new(EventPayload::LoopStateChanged {
                            state: LoopState::Running,
                        }));
                    }
                }
            })
        };

        let client = IpcClient::connect(&socket_path).await.unwrap();
        let mut events = client.subscribe().await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            event.payload,
            EventPayload::LoopStateChanged { state: LoopState::Running }
        ));
        responder.abort();
    }
}
