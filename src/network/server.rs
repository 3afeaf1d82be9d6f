//! WebSocket Game Server
//!
//! Async WebSocket host for authoritative matches.
//! Routes client messages to match sessions and pushes their updates back.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock, broadcast};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::core::clock::{Clock, SystemClock};
use crate::game::command::BatchedCommand;
use crate::game::domain::DomainCore;
use crate::game::state::PlayerId;
use crate::network::protocol::{ClientMessage, ServerMessage, ErrorCode, MatchId};
use crate::network::session::{dispatch_all, MessageOf, SessionConfig, SessionError, SessionManager};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections silent for this long are dropped.
    pub idle_timeout: Duration,
    /// Batch window suggested to clients (ms).
    pub batch_window_ms: u64,
    /// Run the in-process demo instead of serving.
    pub demo: bool,
    /// Match session settings.
    pub session: SessionConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            batch_window_ms: 0,
            demo: false,
            session: SessionConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from `TURNSYNC_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("TURNSYNC_BIND_ADDR") {
            match addr.parse() {
                Ok(addr) => config.bind_addr = addr,
                Err(e) => warn!("Ignoring TURNSYNC_BIND_ADDR={}: {}", addr, e),
            }
        }
        if let Some(max) = lookup("TURNSYNC_MAX_CONNECTIONS") {
            match max.parse() {
                Ok(max) => config.max_connections = max,
                Err(e) => warn!("Ignoring TURNSYNC_MAX_CONNECTIONS={}: {}", max, e),
            }
        }
        if let Some(window) = lookup("TURNSYNC_BATCH_WINDOW_MS") {
            match window.parse() {
                Ok(window) => config.batch_window_ms = window,
                Err(e) => warn!("Ignoring TURNSYNC_BATCH_WINDOW_MS={}: {}", window, e),
            }
        }
        config.demo = lookup("TURNSYNC_DEMO")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        config
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Connected client state.
struct ConnectedClient<D: DomainCore> {
    /// Seat held by this connection.
    player_id: Option<PlayerId>,
    /// Match joined.
    match_id: Option<MatchId>,
    /// Outgoing channel of this connection.
    sender: mpsc::Sender<MessageOf<D>>,
    /// Last activity.
    last_activity: Instant,
}

impl<D: DomainCore> ConnectedClient<D> {
    fn seat(&self) -> Option<(MatchId, PlayerId)> {
        Some((self.match_id?, self.player_id?))
    }
}

type Clients<D> = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient<D>>>>;

/// The game server.
pub struct GameServer<D: DomainCore> {
    /// Server configuration.
    config: ServerConfig,
    /// Session manager.
    sessions: Arc<SessionManager<D>>,
    /// Connected clients.
    clients: Clients<D>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl<D> GameServer<D>
where
    D: DomainCore + Clone + Send + Sync + 'static,
    D::State: Send + Sync + 'static,
    D::Event: Send + Sync + 'static,
{
    /// Create a new game server hosting `domain`.
    pub fn new(domain: D, config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            sessions: Arc::new(SessionManager::new(domain, config.session.clone())),
            config,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server v{} listening on {}", self.config.version, listener.local_addr()?);

        let cleanup_clients = self.clients.clone();
        let cleanup_sessions = self.sessions.clone();
        let idle_timeout = self.config.idle_timeout;

        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_clients, cleanup_sessions, idle_timeout).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let sessions = self.sessions.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<MessageOf<D>>(64);

            {
                let mut clients = clients.write().await;
                clients.insert(addr, ConnectedClient {
                    player_id: None,
                    match_id: None,
                    sender: msg_tx.clone(),
                    last_activity: Instant::now(),
                });
            }

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::error(
                                            ErrorCode::InvalidMessage,
                                            e.to_string(),
                                        )).await;
                                        continue;
                                    }
                                };

                                {
                                    let mut clients = clients.write().await;
                                    if let Some(client) = clients.get_mut(&addr) {
                                        client.last_activity = Instant::now();
                                    }
                                }

                                Self::handle_client_message(addr, client_msg, &clients, &sessions, &msg_tx).await;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let _ = msg_tx.send(ServerMessage::error(
                                    ErrorCode::InvalidMessage,
                                    "binary frames are not supported",
                                )).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::MatchClosed {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            let removed = clients.write().await.remove(&addr);
            if let Some((match_id, player_id)) = removed.as_ref().and_then(ConnectedClient::seat) {
                Self::detach(match_id, player_id, &msg_tx, &sessions).await;
            }

            // The seat and the client entry held the other senders; flush what is queued.
            drop(removed);
            drop(msg_tx);
            if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
                debug!("Dropped pending messages for {}", addr);
            }

            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle a client message.
    async fn handle_client_message(
        addr: SocketAddr,
        msg: ClientMessage,
        clients: &Clients<D>,
        sessions: &Arc<SessionManager<D>>,
        sender: &mpsc::Sender<MessageOf<D>>,
    ) {
        let reply = match msg {
            ClientMessage::CreateMatch { player_ids } => {
                match sessions.create_match(player_ids).await {
                    Ok(match_id) => Some(ServerMessage::MatchCreated { match_id }),
                    Err(e) => Some(ServerMessage::error(ErrorCode::InvalidMessage, e.to_string())),
                }
            }
            ClientMessage::Join { match_id, player_id } => {
                Self::handle_join(addr, match_id, player_id, clients, sessions, sender).await
            }
            ClientMessage::Batch { commands } => {
                Self::handle_batch(addr, &commands, clients, sessions).await
            }
            ClientMessage::Undo => {
                Self::handle_undo(addr, clients, sessions).await
            }
            ClientMessage::SyncRequest => {
                Self::handle_sync(addr, clients, sessions).await
            }
            ClientMessage::Ping { timestamp } => {
                Some(ServerMessage::Pong { timestamp, server_time: SystemClock.now_ms() })
            }
            ClientMessage::Leave => {
                let leaving = {
                    let mut clients = clients.write().await;
                    clients.get_mut(&addr).and_then(|client| {
                        let seat = client.seat();
                        client.player_id = None;
                        client.match_id = None;
                        seat
                    })
                };
                if let Some((match_id, player_id)) = leaving {
                    Self::detach(match_id, player_id, sender, sessions).await;
                }
                None
            }
        };

        if let Some(reply) = reply {
            let _ = sender.send(reply).await;
        }
    }

    /// Attach the connection to a seat and send it the current state.
    async fn handle_join(
        addr: SocketAddr,
        match_id: MatchId,
        player_id: PlayerId,
        clients: &Clients<D>,
        sessions: &Arc<SessionManager<D>>,
        sender: &mpsc::Sender<MessageOf<D>>,
    ) -> Option<MessageOf<D>> {
        if Self::seat_of(addr, clients).await.is_some() {
            return Some(ServerMessage::error(ErrorCode::AlreadyInMatch, "Leave the current match first"));
        }
        let Some(session) = sessions.get(&match_id).await else {
            return Some(ServerMessage::error(ErrorCode::MatchNotFound, "No such match"));
        };

        let (seat, snapshot) = {
            let mut session = session.write().await;
            let seat = match session.subscribe(player_id, sender.clone()) {
                Ok(seat) => seat,
                Err(e) => return Some(Self::session_error(&e)),
            };
            (seat, session.sync_for(player_id))
        };

        if let Some(client) = clients.write().await.get_mut(&addr) {
            client.player_id = Some(player_id);
            client.match_id = Some(match_id);
        }
        info!("{} joined match {} as seat {}", addr, match_id, seat);

        let _ = sender.send(ServerMessage::Joined { match_id, player_id, seat }).await;
        match snapshot {
            Ok(update) => Some(ServerMessage::Update(update)),
            Err(e) => Some(Self::session_error(&e)),
        }
    }

    /// Apply a batch and fan the results out.
    async fn handle_batch(
        addr: SocketAddr,
        commands: &[BatchedCommand],
        clients: &Clients<D>,
        sessions: &Arc<SessionManager<D>>,
    ) -> Option<MessageOf<D>> {
        let Some((match_id, player_id)) = Self::seat_of(addr, clients).await else {
            return Some(ServerMessage::error(ErrorCode::NotInMatch, "Join a match first"));
        };
        let Some(session) = sessions.get(&match_id).await else {
            return Some(ServerMessage::error(ErrorCode::MatchNotFound, "Match is gone"));
        };

        let outgoing = {
            let mut session = session.write().await;
            match session.apply_batch(player_id, commands) {
                Ok(deliveries) => {
                    debug!("Match {}: {} commands from {} -> {} updates", match_id, commands.len(), player_id, deliveries.len());
                    session.outbox(deliveries)
                }
                Err(e) => return Some(Self::session_error(&e)),
            }
        };
        dispatch_all(outgoing);
        None
    }

    /// Undo on behalf of the connection's seat.
    async fn handle_undo(
        addr: SocketAddr,
        clients: &Clients<D>,
        sessions: &Arc<SessionManager<D>>,
    ) -> Option<MessageOf<D>> {
        let Some((match_id, player_id)) = Self::seat_of(addr, clients).await else {
            return Some(ServerMessage::error(ErrorCode::NotInMatch, "Join a match first"));
        };
        let Some(session) = sessions.get(&match_id).await else {
            return Some(ServerMessage::error(ErrorCode::MatchNotFound, "Match is gone"));
        };

        let outgoing = {
            let mut session = session.write().await;
            match session.undo(player_id) {
                Ok(deliveries) => session.outbox(deliveries),
                Err(e) => return Some(Self::session_error(&e)),
            }
        };
        dispatch_all(outgoing);
        None
    }

    /// Current state for a reconnecting client.
    async fn handle_sync(
        addr: SocketAddr,
        clients: &Clients<D>,
        sessions: &Arc<SessionManager<D>>,
    ) -> Option<MessageOf<D>> {
        let Some((match_id, player_id)) = Self::seat_of(addr, clients).await else {
            return Some(ServerMessage::error(ErrorCode::NotInMatch, "Join a match first"));
        };
        let Some(session) = sessions.get(&match_id).await else {
            return Some(ServerMessage::error(ErrorCode::MatchNotFound, "Match is gone"));
        };

        let session = session.read().await;
        match session.sync_for(player_id) {
            Ok(update) => Some(ServerMessage::Update(update)),
            Err(e) => Some(Self::session_error(&e)),
        }
    }

    async fn seat_of(addr: SocketAddr, clients: &Clients<D>) -> Option<(MatchId, PlayerId)> {
        clients.read().await.get(&addr)?.seat()
    }

    /// Drop this connection's subscription to the seat, if it still holds it.
    async fn detach(
        match_id: MatchId,
        player_id: PlayerId,
        connection: &mpsc::Sender<MessageOf<D>>,
        sessions: &Arc<SessionManager<D>>,
    ) {
        let Some(session) = sessions.get(&match_id).await else {
            return;
        };
        if session.write().await.unsubscribe(player_id, connection) {
            debug!("{} left match {}", player_id, match_id);
        }
    }

    fn session_error(e: &SessionError) -> MessageOf<D> {
        let code = match e {
            SessionError::NotSeated(_) => ErrorCode::NotSeated,
            SessionError::MatchNotFound | SessionError::Closed => ErrorCode::MatchNotFound,
            SessionError::NothingToUndo => ErrorCode::UndoUnavailable,
            SessionError::Encode(_) => ErrorCode::InternalError,
            SessionError::NoPlayers | SessionError::TooManyPlayers(_) | SessionError::DuplicatePlayer(_) => {
                ErrorCode::InvalidMessage
            }
        };
        ServerMessage::error(code, e.to_string())
    }

    /// Run cleanup loop.
    async fn run_cleanup_loop(clients: Clients<D>, sessions: Arc<SessionManager<D>>, idle_timeout: Duration) {
        let mut interval = interval(Duration::from_secs(60));

        loop {
            interval.tick().await;

            let now = Instant::now();
            let idle: Vec<_> = {
                let mut clients = clients.write().await;
                let addrs: Vec<_> = clients
                    .iter()
                    .filter(|(_, c)| now.duration_since(c.last_activity) > idle_timeout)
                    .map(|(addr, _)| *addr)
                    .collect();
                addrs.into_iter().filter_map(|addr| clients.remove(&addr).map(|c| (addr, c))).collect()
            };

            for (addr, client) in idle {
                if let Some((match_id, player_id)) = client.seat() {
                    Self::detach(match_id, player_id, &client.sender, &sessions).await;
                }
                info!("Removed idle client {}", addr);
            }

            sessions.cleanup().await;
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.session_count().await
    }

    /// Session manager.
    pub fn sessions(&self) -> &Arc<SessionManager<D>> {
        &self.sessions
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::test_domain::{Counter, CounterCommand, CounterEvent, CounterState, ALICE, BOB};
    use tokio_tungstenite::connect_async;

    type CounterMessage = ServerMessage<CounterState, CounterEvent>;
    type WsClient = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.batch_window_ms, 0);
        assert!(!config.demo);
    }

    #[test]
    fn test_server_config_from_lookup() {
        let config = ServerConfig::from_lookup(|key| match key {
            "TURNSYNC_BIND_ADDR" => Some("127.0.0.1:9000".to_string()),
            "TURNSYNC_MAX_CONNECTIONS" => Some("12".to_string()),
            "TURNSYNC_BATCH_WINDOW_MS" => Some("not a number".to_string()),
            "TURNSYNC_DEMO" => Some("1".to_string()),
            _ => None,
        });

        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.batch_window_ms, 0);
        assert!(config.demo);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = GameServer::new(Counter, ServerConfig::default());

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = Arc::new(GameServer::new(Counter, ServerConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = server.clone();
        let handle = tokio::spawn(async move { running.serve(listener).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap();
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stalled_reader_does_not_freeze_match() {
        let server = GameServer::new(Counter, ServerConfig::default());
        let match_id = server.sessions().create_match(vec![ALICE, BOB]).await.unwrap();
        let session = server.sessions().get(&match_id).await.unwrap();

        // Bob's connection never reads its queue.
        let (bob_tx, _bob_rx) = mpsc::channel(1);
        session.write().await.subscribe(BOB, bob_tx).unwrap();

        let addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let (alice_tx, mut alice_rx) = mpsc::channel(16);
        session.write().await.subscribe(ALICE, alice_tx.clone()).unwrap();
        server.clients.write().await.insert(addr, ConnectedClient {
            player_id: Some(ALICE),
            match_id: Some(match_id),
            sender: alice_tx.clone(),
            last_activity: Instant::now(),
        });

        for amount in 1..=3 {
            let commands = vec![BatchedCommand::encode(&CounterCommand::Add { amount }).unwrap()];
            let handled = GameServer::handle_client_message(
                addr,
                ClientMessage::Batch { commands },
                &server.clients,
                &server.sessions,
                &alice_tx,
            );
            tokio::time::timeout(Duration::from_secs(1), handled).await.unwrap();
        }
        assert_eq!(session.read().await.state().core.value, 6);
        for _ in 0..3 {
            assert!(matches!(alice_rx.try_recv(), Ok(ServerMessage::Update(_))));
        }

        let leave = GameServer::handle_client_message(addr, ClientMessage::Leave, &server.clients, &server.sessions, &alice_tx);
        tokio::time::timeout(Duration::from_secs(1), leave).await.unwrap();
        assert_eq!(session.read().await.connected_count(), 1);
        assert!(server.clients.read().await[&addr].seat().is_none());
    }

    #[tokio::test]
    async fn test_websocket_match_flow() {
        let server = Arc::new(GameServer::new(Counter, ServerConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();

        async fn send(ws: &mut WsClient, msg: ClientMessage) {
            ws.send(Message::Text(msg.to_json().unwrap())).await.unwrap();
        }
        async fn recv(ws: &mut WsClient) -> CounterMessage {
            loop {
                let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                if let Message::Text(text) = frame {
                    return CounterMessage::from_json(&text).unwrap();
                }
            }
        }

        send(&mut ws, ClientMessage::CreateMatch { player_ids: vec![ALICE, BOB] }).await;
        let match_id = match recv(&mut ws).await {
            ServerMessage::MatchCreated { match_id } => match_id,
            other => panic!("expected match_created, got {other:?}"),
        };

        send(&mut ws, ClientMessage::Batch { commands: vec![] }).await;
        assert!(matches!(recv(&mut ws).await, ServerMessage::Error(e) if e.code == ErrorCode::NotInMatch));

        send(&mut ws, ClientMessage::Join { match_id, player_id: ALICE }).await;
        assert!(matches!(recv(&mut ws).await, ServerMessage::Joined { seat: 0, .. }));
        match recv(&mut ws).await {
            ServerMessage::Update(update) => assert_eq!(update.state.sys.version, 0),
            other => panic!("expected update, got {other:?}"),
        }

        let add = BatchedCommand::encode(&CounterCommand::Add { amount: 5 }).unwrap();
        send(&mut ws, ClientMessage::Batch { commands: vec![add] }).await;
        match recv(&mut ws).await {
            ServerMessage::Update(update) => {
                assert_eq!(update.acked, 1);
                assert_eq!(update.state.core.value, 5);
                assert!(update.verify_hash());
            }
            other => panic!("expected update, got {other:?}"),
        }

        send(&mut ws, ClientMessage::Ping { timestamp: 42 }).await;
        assert!(matches!(recv(&mut ws).await, ServerMessage::Pong { timestamp: 42, .. }));

        server.shutdown();
    }
}
