//! In-memory rendezvous service for tests and simulations
//!
//! Behaves like the relay the polyfill expects:
//!
//! - `["setId", address]` on a signaling connection registers it under `address`
//! - `["create", sender, config]` on a connection routed to `target` is
//!   forwarded to the signaling connection registered as `target`, and the
//!   sending connection is queued for `sender`
//! - the ready token sent first on a connection routed to `sender` pairs it
//!   with the oldest queued connection for `sender` (FIFO) and is forwarded
//! - paired connections relay every frame to each other; closing one closes both
//!
//! Every text frame seen before pairing is recorded with its route.

use crate::protocol::{is_ready_token, ControlMessage};
use crate::transport::{Connector, DuplexConnection, DuplexSink, Frame, Route, TransportEvent};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// Control frame observed at the rendezvous boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFrame {
    /// Connection id assigned by the rendezvous
    pub connection: u64,
    /// Route the sending connection was opened with
    pub route: Route,
    /// Frame text
    pub text: String,
}

struct MockConnection {
    route: Route,
    tx: mpsc::UnboundedSender<TransportEvent>,
    peer: Option<u64>,
    open: bool,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    connections: HashMap<u64, MockConnection>,
    registrations: HashMap<String, u64>,
    pending: HashMap<String, VecDeque<u64>>,
    frames: Vec<RecordedFrame>,
    refuse: bool,
    connects: usize,
}

impl MockState {
    fn emit(&self, id: u64, event: TransportEvent) {
        if let Some(connection) = self.connections.get(&id) {
            if connection.open {
                let _ = connection.tx.send(event);
            }
        }
    }

    fn shut(&mut self, id: u64) {
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        if !connection.open {
            return;
        }
        connection.open = false;
        let _ = connection.tx.send(TransportEvent::Closed);
        let peer = connection.peer;

        self.registrations.retain(|_, registered| *registered != id);
        for queue in self.pending.values_mut() {
            queue.retain(|queued| *queued != id);
        }

        if let Some(peer) = peer {
            self.shut(peer);
        }
    }
}

/// In-memory rendezvous service
pub struct MockRendezvous {
    this: Weak<MockRendezvous>,
    state: Mutex<MockState>,
}

impl MockRendezvous {
    /// Create a new rendezvous
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: Mutex::new(MockState::default()),
        })
    }

    /// Make subsequent connects fail (or succeed again)
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Number of connections opened so far
    pub fn connection_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Number of connections still open
    pub fn open_connection_count(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|c| c.open)
            .count()
    }

    /// Whether a signaling connection is registered under `address`
    pub fn is_registered(&self, address: &str) -> bool {
        self.state.lock().registrations.contains_key(address)
    }

    /// Control frames recorded so far, in arrival order
    pub fn frames(&self) -> Vec<RecordedFrame> {
        self.state.lock().frames.clone()
    }

    /// Raise a transport error on every open connection with `route`
    pub fn inject_error(&self, route: &Route, message: &str) {
        let state = self.state.lock();
        for (id, connection) in &state.connections {
            if connection.open && connection.route == *route {
                state.emit(*id, TransportEvent::Error(message.to_string()));
            }
        }
    }

    /// Close every open connection with `route` from the server side
    pub fn drop_connections(&self, route: &Route) {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.open && c.route == *route)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            state.shut(id);
        }
    }

    fn receive(&self, id: u64, frame: Frame) -> Result<()> {
        let mut state = self.state.lock();
        let (route, peer) = match state.connections.get(&id) {
            Some(connection) if connection.open => (connection.route.clone(), connection.peer),
            _ => return Err(Error::Transport(format!("connection {} is closed", id))),
        };

        if let Some(peer) = peer {
            state.emit(peer, TransportEvent::Message(frame));
            return Ok(());
        }

        let Frame::Text(text) = frame else {
            debug!("Rendezvous dropped binary frame from unpaired connection {}", id);
            return Ok(());
        };

        state.frames.push(RecordedFrame {
            connection: id,
            route: route.clone(),
            text: text.clone(),
        });

        if is_ready_token(&text) {
            if let Route::Peer(address) = &route {
                let initiator = state.pending.get_mut(address).and_then(VecDeque::pop_front);
                if let Some(initiator) = initiator {
                    if let Some(c) = state.connections.get_mut(&id) {
                        c.peer = Some(initiator);
                    }
                    if let Some(c) = state.connections.get_mut(&initiator) {
                        c.peer = Some(id);
                    }
                    state.emit(initiator, TransportEvent::Message(Frame::Text(text)));
                }
            }
            return Ok(());
        }

        match ControlMessage::from_text(&text) {
            Ok(ControlMessage::SetId { address }) => {
                state.registrations.insert(address, id);
            }
            Ok(ControlMessage::Create { address, .. }) => {
                if let Route::Peer(target) = &route {
                    state.pending.entry(address).or_default().push_back(id);
                    if let Some(subscriber) = state.registrations.get(target).copied() {
                        state.emit(subscriber, TransportEvent::Message(Frame::Text(text)));
                    } else {
                        debug!("Rendezvous has no subscriber for {}", target);
                    }
                }
            }
            _ => debug!("Rendezvous ignored control frame from {}", id),
        }

        Ok(())
    }

    fn close_connection(&self, id: u64) {
        self.state.lock().shut(id);
    }
}

#[async_trait]
impl Connector for MockRendezvous {
    async fn connect(&self, route: Route) -> Result<DuplexConnection> {
        let mut state = self.state.lock();
        if state.refuse {
            return Err(Error::Transport("connection refused".to_string()));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.connects += 1;

        let (tx, events) = mpsc::unbounded_channel();
        state.connections.insert(
            id,
            MockConnection {
                route,
                tx,
                peer: None,
                open: true,
            },
        );

        Ok(DuplexConnection {
            sink: Arc::new(MockSink {
                id,
                rendezvous: self.this.clone(),
            }),
            events,
        })
    }
}

struct MockSink {
    id: u64,
    rendezvous: Weak<MockRendezvous>,
}

#[async_trait]
impl DuplexSink for MockSink {
    async fn send(&self, frame: Frame) -> Result<()> {
        match self.rendezvous.upgrade() {
            Some(rendezvous) => rendezvous.receive(self.id, frame),
            None => Err(Error::Transport("rendezvous is gone".to_string())),
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(rendezvous) = self.rendezvous.upgrade() {
            rendezvous.close_connection(self.id);
        }
        Ok(())
    }
}
