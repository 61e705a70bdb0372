//! Push channel: an explicit connection state machine plus the websocket
//! driver that feeds it from a single event queue.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::push_protocol::{
    parse_inbound_message, InboundMessage, OutboundCommand, NORMAL_CLOSE_CODE,
};
use crate::subscription_registry::SubscriptionRegistry;

mod push_channel_driver;

pub use push_channel_driver::{
    spawn_push_channel, PushChannelConfig, PushChannelHandle, UpdateReconciler,
    DEFAULT_RECONNECT_INTERVAL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Everything the channel reacts to, in arrival order.
pub enum ChannelEvent {
    Connect,
    Opened,
    /// `code` is `None` when the transport failed without a close frame.
    Closed { code: Option<u16> },
    Message(String),
    ReconnectTick,
    Subscribe(Vec<u64>),
    Unsubscribe(Vec<u64>),
    SetOnline(bool),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Side effects requested by the state machine; the driver performs them.
pub enum ChannelAction {
    OpenTransport { endpoint: String },
    Send(OutboundCommand),
    CloseTransport,
    StartReconnectTimer,
    CancelReconnectTimer,
    Reconcile { bug_id: u64, when: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct PushChannelMachine {
    endpoint: Option<String>,
    online: bool,
    state: ConnectionState,
    registry: SubscriptionRegistry,
    reconnect_pending: bool,
}

impl PushChannelMachine {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint: endpoint
                .map(|endpoint| endpoint.trim().to_string())
                .filter(|endpoint| !endpoint.is_empty()),
            online: true,
            state: ConnectionState::Disconnected,
            registry: SubscriptionRegistry::new(),
            reconnect_pending: false,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn handle(&mut self, event: ChannelEvent) -> Vec<ChannelAction> {
        match event {
            ChannelEvent::Connect => self.connect(),
            ChannelEvent::Opened => self.opened(),
            ChannelEvent::Closed { code } => self.closed(code),
            ChannelEvent::Message(raw) => self.message(&raw),
            ChannelEvent::ReconnectTick => {
                if self.reconnect_pending {
                    self.connect()
                } else {
                    Vec::new()
                }
            }
            ChannelEvent::Subscribe(bug_ids) => {
                let bug_ids = dedup_ids(bug_ids);
                self.registry.add(bug_ids.iter().copied());
                self.send(OutboundCommand::Subscribe(bug_ids))
            }
            ChannelEvent::Unsubscribe(bug_ids) => {
                let bug_ids = dedup_ids(bug_ids);
                self.registry.remove(bug_ids.iter().copied());
                self.send(OutboundCommand::Unsubscribe(bug_ids))
            }
            ChannelEvent::SetOnline(online) => {
                self.online = online;
                Vec::new()
            }
            ChannelEvent::Disconnect => self.disconnect(),
        }
    }

    fn connect(&mut self) -> Vec<ChannelAction> {
        let Some(endpoint) = self.endpoint.clone() else {
            tracing::debug!("push channel has no endpoint; staying disconnected");
            return Vec::new();
        };
        if !self.online {
            tracing::debug!("push channel is offline; skipping connect");
            return Vec::new();
        }
        if self.state != ConnectionState::Disconnected {
            return Vec::new();
        }
        self.state = ConnectionState::Connecting;
        vec![ChannelAction::OpenTransport { endpoint }]
    }

    fn opened(&mut self) -> Vec<ChannelAction> {
        if self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(ChannelAction::CancelReconnectTimer);
        }
        self.state = ConnectionState::Open;
        if !self.registry.is_empty() {
            actions.push(ChannelAction::Send(OutboundCommand::Subscribe(
                self.registry.snapshot(),
            )));
        }
        actions
    }

    fn closed(&mut self, code: Option<u16>) -> Vec<ChannelAction> {
        let intentional =
            self.state == ConnectionState::Closing || code == Some(NORMAL_CLOSE_CODE);
        self.state = ConnectionState::Disconnected;
        if intentional {
            if self.reconnect_pending {
                self.reconnect_pending = false;
                return vec![ChannelAction::CancelReconnectTimer];
            }
            return Vec::new();
        }
        if self.reconnect_pending {
            // The recurring timer is still armed and will retry.
            return Vec::new();
        }
        self.reconnect_pending = true;
        vec![ChannelAction::StartReconnectTimer]
    }

    fn message(&mut self, raw: &str) -> Vec<ChannelAction> {
        if self.state != ConnectionState::Open {
            return Vec::new();
        }
        match parse_inbound_message(raw) {
            Ok(Some(InboundMessage::Update { bug_id, when })) => {
                vec![ChannelAction::Reconcile { bug_id, when }]
            }
            Ok(None) => {
                tracing::debug!("ignoring unsupported push command");
                Vec::new()
            }
            Err(error) => {
                tracing::warn!(error = %error, "ignoring malformed push message");
                Vec::new()
            }
        }
    }

    fn send(&self, command: OutboundCommand) -> Vec<ChannelAction> {
        if self.state != ConnectionState::Open || command.bug_ids().is_empty() {
            return Vec::new();
        }
        vec![ChannelAction::Send(command)]
    }

    fn disconnect(&mut self) -> Vec<ChannelAction> {
        let mut actions = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            actions.push(ChannelAction::CancelReconnectTimer);
        }
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            self.state = ConnectionState::Closing;
            actions.push(ChannelAction::CloseTransport);
        }
        actions
    }
}

fn dedup_ids(mut bug_ids: Vec<u64>) -> Vec<u64> {
    bug_ids.sort_unstable();
    bug_ids.dedup();
    bug_ids
}
