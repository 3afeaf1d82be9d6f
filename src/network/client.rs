//! Client transport
//!
//! Glue between an [`OptimisticEngine`] and an async connection. The engine
//! itself is synchronous; [`ClientDriver`] owns it inside one tokio task and
//! feeds it the three things that may change it: local input, batch-window
//! timers and server messages.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::core::clock::Clock;
use crate::game::command::BatchedCommand;
use crate::game::domain::DomainCore;
use crate::game::state::PlayerId;
use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::sync::batcher::{BatchSink, SendFailure};
use crate::sync::engine::{EngineConfig, OptimisticEngine, SubmitOutcome};
use crate::sync::observer::EffectObserver;

/// Capacity of the channels between driver and socket.
pub const CHANNEL_CAPACITY: usize = 64;

/// Delay between resends of batches the outbound channel refused.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Batch sink writing `batch` messages into a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ClientMessage>,
}

impl ChannelSink {
    /// Wrap an outbound channel.
    pub fn new(tx: mpsc::Sender<ClientMessage>) -> Self {
        Self { tx }
    }
}

impl BatchSink for ChannelSink {
    fn send_batch(&mut self, batch: Vec<BatchedCommand>) -> Result<(), SendFailure> {
        self.tx
            .try_send(ClientMessage::Batch { commands: batch })
            .map_err(|e| {
                let reason = match &e {
                    TrySendError::Full(_) => "outbound channel full",
                    TrySendError::Closed(_) => "connection closed",
                };
                match e.into_inner() {
                    ClientMessage::Batch { commands } => SendFailure::new(commands, reason),
                    _ => SendFailure::new(Vec::new(), reason),
                }
            })
    }
}

/// Client transport errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Both ends of an open connection.
pub struct Connection<G, E> {
    /// Messages to the server.
    pub outbound: mpsc::Sender<ClientMessage>,
    /// Messages from the server.
    pub inbound: mpsc::Receiver<ServerMessage<G, E>>,
}

/// Open a WebSocket connection and pump JSON frames through channels.
pub async fn connect<G, E>(url: &str) -> Result<Connection<G, E>, ClientError>
where
    G: serde::de::DeserializeOwned + Send + 'static,
    E: serde::de::DeserializeOwned + Send + 'static,
{
    let (ws_stream, _) = connect_async(url).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    info!("Connected to {}", url);

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
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
        let _ = ws_sender.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => match ServerMessage::from_json(&text) {
                    Ok(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Unreadable server message: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
            }
        }
        debug!("Server stream ended");
    });

    Ok(Connection { outbound: out_tx, inbound: in_rx })
}

// =============================================================================
// DRIVER
// =============================================================================

/// Local input for the driver.
#[derive(Debug, Clone)]
pub enum DriverInput<C> {
    /// Submit a command.
    Submit {
        /// Acting player
        player: PlayerId,
        /// Command
        kind: C,
    },
    /// Send queued commands now.
    Flush,
    /// Stop immediately.
    Shutdown,
}

/// Why the driver stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverExit {
    /// Input closed and every sent command was acknowledged.
    Drained,
    /// `DriverInput::Shutdown` was received.
    Shutdown,
    /// The server closed the match.
    MatchClosed(String),
    /// The server stream ended.
    Disconnected,
}

/// Runs one engine against one connection.
pub struct ClientDriver<D: DomainCore, O> {
    engine: OptimisticEngine<D, ChannelSink>,
    observer: O,
    clock: Arc<dyn Clock>,
    issued: u64,
}

impl<D, O> ClientDriver<D, O>
where
    D: DomainCore,
    O: EffectObserver<D::Event>,
{
    /// Create a driver whose batches go to `outbound`.
    pub fn new(
        domain: D,
        config: EngineConfig<D>,
        outbound: mpsc::Sender<ClientMessage>,
        observer: O,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let engine = OptimisticEngine::new(domain, config, ChannelSink::new(outbound), clock.clone());
        Self { engine, observer, clock, issued: 0 }
    }

    /// Engine being driven.
    pub fn engine(&self) -> &OptimisticEngine<D, ChannelSink> {
        &self.engine
    }

    /// Observer being fed.
    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Run until shutdown, disconnect, or drained input.
    ///
    /// The engine is torn down on exit; its last states stay readable.
    pub async fn run(
        &mut self,
        mut inbound: mpsc::Receiver<ServerMessage<D::State, D::Event>>,
        mut input: mpsc::Receiver<DriverInput<D::Command>>,
    ) -> DriverExit {
        let mut input_open = true;

        let exit = loop {
            if !input_open && self.engine.acked() >= self.issued {
                break DriverExit::Drained;
            }

            let wait = self
                .engine
                .next_deadline()
                .map(|deadline| Duration::from_millis(deadline.saturating_sub(self.clock.now_ms())));
            let backlog = self.engine.batcher().undelivered_len() > 0;

            tokio::select! {
                msg = inbound.recv() => {
                    match msg {
                        Some(ServerMessage::Update(update)) => {
                            match self.engine.on_authoritative_update(update) {
                                Ok(report) => debug!("Reconciled: {:?}", report.outcome),
                                Err(e) => error!("Update refused: {}", e),
                            }
                        }
                        Some(ServerMessage::MatchClosed { reason }) => break DriverExit::MatchClosed(reason),
                        Some(ServerMessage::Error(e)) => warn!("Server error {:?}: {}", e.code, e.message),
                        Some(other) => debug!("Ignoring {:?}", other),
                        None => break DriverExit::Disconnected,
                    }
                }
                cmd = input.recv(), if input_open => {
                    match cmd {
                        Some(DriverInput::Submit { player, kind }) => self.submit(player, kind),
                        Some(DriverInput::Flush) => self.engine.flush(),
                        Some(DriverInput::Shutdown) => break DriverExit::Shutdown,
                        None => {
                            input_open = false;
                            self.engine.flush();
                        }
                    }
                }
                _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {
                    self.engine.poll_timers();
                }
                _ = tokio::time::sleep(RETRY_INTERVAL), if backlog => {}
            }

            if self.engine.batcher().undelivered_len() > 0 {
                let resent = self.engine.retry_undelivered();
                if resent > 0 {
                    debug!("Resent {} refused batches", resent);
                }
            }
            self.engine.render_to(&mut self.observer);
        };

        info!("Client driver stopped: {:?}", exit);
        self.engine.teardown();
        exit
    }

    fn submit(&mut self, player: PlayerId, kind: D::Command) {
        match self.engine.submit(player, kind) {
            Ok(SubmitOutcome::Predicted { .. }) | Ok(SubmitOutcome::Sent { .. }) => self.issued += 1,
            Ok(SubmitOutcome::Rejected { reason }) => debug!("Command rejected locally: {}", reason),
            Err(e) => error!("Submit failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{ManualClock, SystemClock};
    use crate::game::test_domain::{Counter, CounterCommand, CounterEvent, CounterState, ALICE, BOB};
    use crate::network::session::{MatchSession, SessionConfig};
    use crate::sync::batcher::BatcherConfig;
    use crate::sync::observer::RecordingObserver;

    /// Serve `session` for ALICE over channels, delivering her updates.
    fn spawn_authority(
        mut session: MatchSession<Counter>,
        mut from_client: mpsc::Receiver<ClientMessage>,
        to_client: mpsc::Sender<ServerMessage<CounterState, CounterEvent>>,
    ) -> tokio::task::JoinHandle<MatchSession<Counter>> {
        tokio::spawn(async move {
            if let Ok(update) = session.sync_for(ALICE) {
                let _ = to_client.send(ServerMessage::Update(update)).await;
            }
            while let Some(msg) = from_client.recv().await {
                if let ClientMessage::Batch { commands } = msg {
                    let deliveries = session.apply_batch(ALICE, &commands).unwrap();
                    for delivery in deliveries.into_iter().filter(|d| d.player_id == ALICE) {
                        if to_client.send(ServerMessage::Update(delivery.update)).await.is_err() {
                            return session;
                        }
                    }
                }
            }
            session
        })
    }

    #[test]
    fn test_channel_sink_returns_batch_when_closed() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sink = ChannelSink::new(tx);

        let batch = vec![BatchedCommand::new("ADD", serde_json::json!({ "amount": 1 }))];
        let failure = sink.send_batch(batch.clone()).unwrap_err();
        assert_eq!(failure.batch, batch);
        assert_eq!(failure.reason, "connection closed");
    }

    #[test]
    fn test_channel_sink_full() {
        let (tx, _rx) = mpsc::channel(1);
        let mut sink = ChannelSink::new(tx);

        assert!(sink.send_batch(vec![]).is_ok());
        let failure = sink.send_batch(vec![]).unwrap_err();
        assert_eq!(failure.reason, "outbound channel full");
    }

    #[tokio::test]
    async fn test_driver_drains_against_session() {
        let session = MatchSession::new(uuid::Uuid::nil(), Counter, vec![ALICE, BOB], &SessionConfig::default()).unwrap();

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let authority = spawn_authority(session, out_rx, in_tx);

        let mut driver = ClientDriver::new(
            Counter,
            EngineConfig::default(),
            out_tx,
            RecordingObserver::default(),
            Arc::new(ManualClock::new(0)),
        );

        for amount in [1, 2, 3] {
            input_tx
                .send(DriverInput::Submit { player: ALICE, kind: CounterCommand::Add { amount } })
                .await
                .unwrap();
        }
        drop(input_tx);

        let exit = tokio::time::timeout(Duration::from_secs(5), driver.run(in_rx, input_rx))
            .await
            .unwrap();
        assert_eq!(exit, DriverExit::Drained);

        assert_eq!(driver.engine().acked(), 3);
        assert_eq!(driver.engine().confirmed_state().unwrap().core.value, 6);
        assert_eq!(driver.observer().seen.len(), 3);

        drop(driver);
        let session = authority.await.unwrap();
        assert_eq!(session.state().core.value, 6);
    }

    #[tokio::test]
    async fn test_driver_flushes_on_window_timer() {
        let session = MatchSession::new(uuid::Uuid::nil(), Counter, vec![ALICE], &SessionConfig::default()).unwrap();

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let authority = spawn_authority(session, out_rx, in_tx);

        let config = EngineConfig {
            batching: BatcherConfig::with_window(20, 16),
            ..EngineConfig::default()
        };
        let mut driver = ClientDriver::new(Counter, config, out_tx, RecordingObserver::default(), Arc::new(SystemClock));

        let feeder = tokio::spawn(async move {
            for _ in 0..3 {
                let _ = input_tx
                    .send(DriverInput::Submit { player: ALICE, kind: CounterCommand::Add { amount: 5 } })
                    .await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = input_tx.send(DriverInput::Shutdown).await;
        });

        let exit = tokio::time::timeout(Duration::from_secs(5), driver.run(in_rx, input_rx))
            .await
            .unwrap();
        feeder.await.unwrap();

        assert_eq!(exit, DriverExit::Shutdown);
        assert_eq!(driver.engine().acked(), 3);
        assert_eq!(driver.engine().confirmed_state().unwrap().core.value, 15);
        drop(driver);
        assert_eq!(authority.await.unwrap().state().core.value, 15);
    }

    #[tokio::test]
    async fn test_driver_resends_refused_batches_without_server_traffic() {
        // Room for one batch; the socket writer is slow to start.
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let (_in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut sent = Vec::new();
            while sent.len() < 3 {
                match out_rx.recv().await {
                    Some(ClientMessage::Batch { commands }) => {
                        sent.extend(commands.iter().map(|c| c.decode::<CounterCommand>().unwrap()));
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            sent
        });

        let feeder = tokio::spawn(async move {
            for amount in [1, 2, 3] {
                let _ = input_tx
                    .send(DriverInput::Submit { player: ALICE, kind: CounterCommand::Add { amount } })
                    .await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = input_tx.send(DriverInput::Shutdown).await;
        });

        let mut driver = ClientDriver::new(
            Counter,
            EngineConfig::default(),
            out_tx,
            RecordingObserver::default(),
            Arc::new(ManualClock::new(0)),
        );
        let exit = tokio::time::timeout(Duration::from_secs(5), driver.run(in_rx, input_rx))
            .await
            .unwrap();
        feeder.await.unwrap();
        assert_eq!(exit, DriverExit::Shutdown);

        drop(driver);
        let sent = tokio::time::timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
        assert_eq!(
            sent,
            vec![
                CounterCommand::Add { amount: 1 },
                CounterCommand::Add { amount: 2 },
                CounterCommand::Add { amount: 3 },
            ]
        );
    }

    #[tokio::test]
    async fn test_driver_stops_when_match_closes() {
        let (out_tx, _out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (_input_tx, input_rx) = mpsc::channel::<DriverInput<CounterCommand>>(CHANNEL_CAPACITY);

        in_tx.send(ServerMessage::MatchClosed { reason: "bye".into() }).await.unwrap();

        let mut driver = ClientDriver::new(
            Counter,
            EngineConfig::default(),
            out_tx,
            RecordingObserver::default(),
            Arc::new(ManualClock::new(0)),
        );
        let exit = driver.run(in_rx, input_rx).await;

        assert_eq!(exit, DriverExit::MatchClosed("bye".into()));
        assert!(driver.engine().is_torn_down());
    }
}
