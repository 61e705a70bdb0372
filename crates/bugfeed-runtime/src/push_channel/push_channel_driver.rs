use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message as WsMessage, Utf8Bytes,
    },
};

use super::{ChannelAction, ChannelEvent, ConnectionState, PushChannelMachine};
use crate::change_reconciler::{AppliedChange, ChangeReconciler, ReconcileError, ReconcileOutcome};
use crate::push_protocol::NORMAL_CLOSE_CODE;

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(30_000);
const DEFAULT_EVENT_BUFFER: usize = 256;

#[async_trait]
/// Trait contract for resolving one `update` notification.
pub trait UpdateReconciler: Send + Sync {
    async fn reconcile_update(
        &self,
        bug_id: u64,
        when: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError>;
}

#[async_trait]
impl UpdateReconciler for ChangeReconciler {
    async fn reconcile_update(
        &self,
        bug_id: u64,
        when: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile(bug_id, when).await
    }
}

#[derive(Debug, Clone)]
pub struct PushChannelConfig {
    pub endpoint: Option<String>,
    pub reconnect_interval: Duration,
    pub event_buffer: usize,
}

impl Default for PushChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Debug)]
enum WorkerMessage {
    Event(ChannelEvent),
    /// Reported by the connection task spawned for `generation`.
    Transport {
        generation: u64,
        event: ChannelEvent,
    },
    Shutdown,
}

#[derive(Debug)]
enum TransportCommand {
    Send(String),
    Close,
}

/// Caller side of a running push channel.
pub struct PushChannelHandle {
    events: mpsc::Sender<WorkerMessage>,
    state: watch::Receiver<ConnectionState>,
    worker: Option<JoinHandle<()>>,
}

impl PushChannelHandle {
    pub async fn connect(&self) -> Result<()> {
        self.send(ChannelEvent::Connect).await
    }

    pub async fn subscribe(&self, bug_ids: impl IntoIterator<Item = u64>) -> Result<()> {
        self.send(ChannelEvent::Subscribe(bug_ids.into_iter().collect()))
            .await
    }

    pub async fn unsubscribe(&self, bug_ids: impl IntoIterator<Item = u64>) -> Result<()> {
        self.send(ChannelEvent::Unsubscribe(bug_ids.into_iter().collect()))
            .await
    }

    pub async fn set_online(&self, online: bool) -> Result<()> {
        self.send(ChannelEvent::SetOnline(online)).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.send(ChannelEvent::Disconnect).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| anyhow!("push channel worker stopped"))
    }

    /// Closes the transport intentionally and stops the worker.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.events.send(WorkerMessage::Shutdown).await;
        if let Some(worker) = self.worker.take() {
            worker
                .await
                .map_err(|error| anyhow!("push channel worker failed: {error}"))?;
        }
        Ok(())
    }

    async fn send(&self, event: ChannelEvent) -> Result<()> {
        self.events
            .send(WorkerMessage::Event(event))
            .await
            .map_err(|_| anyhow!("push channel worker stopped"))
    }
}

impl Drop for PushChannelHandle {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Spawns the channel worker. Applied changes are delivered on `updates`.
pub fn spawn_push_channel(
    config: PushChannelConfig,
    reconciler: Arc<dyn UpdateReconciler>,
    updates: mpsc::Sender<AppliedChange>,
) -> PushChannelHandle {
    let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let worker = PushChannelWorker {
        machine: PushChannelMachine::new(config.endpoint),
        events: events_tx.clone(),
        generation: 0,
        outbound: None,
        reconnect_timer: None,
        reconnect_interval: config.reconnect_interval.max(Duration::from_millis(1)),
        reconciler,
        updates,
        state: state_tx,
    };
    PushChannelHandle {
        events: events_tx,
        state: state_rx,
        worker: Some(tokio::spawn(worker.run(events_rx))),
    }
}

struct PushChannelWorker {
    machine: PushChannelMachine,
    events: mpsc::Sender<WorkerMessage>,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<TransportCommand>>,
    reconnect_timer: Option<JoinHandle<()>>,
    reconnect_interval: Duration,
    reconciler: Arc<dyn UpdateReconciler>,
    updates: mpsc::Sender<AppliedChange>,
    state: watch::Sender<ConnectionState>,
}

impl PushChannelWorker {
    async fn run(mut self, mut inbox: mpsc::Receiver<WorkerMessage>) {
        while let Some(message) = inbox.recv().await {
            let event = match message {
                WorkerMessage::Event(event) => event,
                WorkerMessage::Transport { generation, event } => {
                    if generation != self.generation {
                        tracing::debug!(generation, "dropping event from superseded connection");
                        continue;
                    }
                    if matches!(event, ChannelEvent::Closed { .. }) {
                        self.outbound = None;
                    }
                    event
                }
                WorkerMessage::Shutdown => {
                    let actions = self.machine.handle(ChannelEvent::Disconnect);
                    self.apply(actions);
                    self.cancel_reconnect_timer();
                    self.publish_state();
                    break;
                }
            };
            let actions = self.machine.handle(event);
            self.apply(actions);
            self.publish_state();
        }
    }

    fn publish_state(&self) {
        let state = self.machine.state();
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            tracing::info!(state = state.as_str(), "push channel state changed");
        }
    }

    fn apply(&mut self, actions: Vec<ChannelAction>) {
        for action in actions {
            match action {
                ChannelAction::OpenTransport { endpoint } => self.open_transport(endpoint),
                ChannelAction::Send(command) => {
                    if let Some(outbound) = &self.outbound {
                        let _ = outbound.send(TransportCommand::Send(command.to_json()));
                    }
                }
                ChannelAction::CloseTransport => {
                    if let Some(outbound) = &self.outbound {
                        let _ = outbound.send(TransportCommand::Close);
                    }
                }
                ChannelAction::StartReconnectTimer => self.start_reconnect_timer(),
                ChannelAction::CancelReconnectTimer => self.cancel_reconnect_timer(),
                ChannelAction::Reconcile { bug_id, when } => {
                    self.dispatch_reconcile(bug_id, when)
                }
            }
        }
    }

    fn open_transport(&mut self, endpoint: String) {
        self.generation = self.generation.wrapping_add(1);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound = Some(outbound_tx);
        tracing::info!(endpoint = %endpoint, "connecting push channel");
        tokio::spawn(run_connection(
            endpoint,
            self.generation,
            self.events.clone(),
            outbound_rx,
        ));
    }

    fn start_reconnect_timer(&mut self) {
        self.cancel_reconnect_timer();
        let events = self.events.clone();
        let period = self.reconnect_interval;
        tracing::info!(
            interval_ms = period.as_millis() as u64,
            "push channel closed unexpectedly; reconnect scheduled"
        );
        self.reconnect_timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if events
                    .send(WorkerMessage::Event(ChannelEvent::ReconnectTick))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }));
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn dispatch_reconcile(&self, bug_id: u64, when: DateTime<Utc>) {
        let reconciler = self.reconciler.clone();
        let updates = self.updates.clone();
        tokio::spawn(async move {
            match reconciler.reconcile_update(bug_id, when).await {
                Ok(ReconcileOutcome::Applied(changes)) => {
                    for change in changes {
                        if updates.send(change).await.is_err() {
                            tracing::debug!(bug_id, "update receiver dropped");
                            return;
                        }
                    }
                }
                Ok(outcome) => {
                    tracing::debug!(
                        bug_id,
                        %when,
                        outcome = outcome.as_str(),
                        "notification produced no changes"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        bug_id,
                        %when,
                        error = %error,
                        "failed to reconcile bug notification"
                    );
                }
            }
        });
    }
}

async fn run_connection(
    endpoint: String,
    generation: u64,
    events: mpsc::Sender<WorkerMessage>,
    mut outbound: mpsc::UnboundedReceiver<TransportCommand>,
) {
    let report = |event: ChannelEvent| WorkerMessage::Transport { generation, event };
    let stream = match connect_async(endpoint.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(error) => {
            tracing::warn!(endpoint = %endpoint, error = %error, "failed to open push channel");
            let _ = events.send(report(ChannelEvent::Closed { code: None })).await;
            return;
        }
    };
    if events.send(report(ChannelEvent::Opened)).await.is_err() {
        return;
    }

    let (mut sink, mut source) = stream.split();
    let close_code = loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(TransportCommand::Send(text)) => {
                    if let Err(error) = sink.send(WsMessage::Text(text.into())).await {
                        tracing::warn!(error = %error, "failed to send push command");
                        break None;
                    }
                }
                Some(TransportCommand::Close) | None => {
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: Utf8Bytes::from_static("client disconnect"),
                    };
                    let _ = sink.send(WsMessage::Close(Some(frame))).await;
                    break Some(NORMAL_CLOSE_CODE);
                }
            },
            message = source.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    let event = ChannelEvent::Message(text.as_str().to_string());
                    if events.send(report(event)).await.is_err() {
                        break Some(NORMAL_CLOSE_CODE);
                    }
                }
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        if events.send(report(ChannelEvent::Message(text))).await.is_err() {
                            break Some(NORMAL_CLOSE_CODE);
                        }
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "ignoring non utf-8 push frame");
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    break frame.map(|frame| u16::from(frame.code));
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                Some(Err(error)) => {
                    tracing::warn!(error = %error, "push channel transport error");
                    break None;
                }
                None => break None,
            }
        }
    };
    tracing::info!(close_code = ?close_code, "push channel closed");
    let _ = events
        .send(report(ChannelEvent::Closed { code: close_code }))
        .await;
}
