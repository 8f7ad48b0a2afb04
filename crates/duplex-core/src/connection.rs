use std::sync::Arc;
use tokio::sync::Mutex;

use crate::engine::{EngineFactory, RtcEngine, SharedEngine};
use crate::errors::CallError;
use crate::events::{CallEvent, ConnectionState, EventEmitter};

/// Room credentials supplied by the caller. Token acquisition happens
/// outside the core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCredentials {
    pub room_id: String,
    pub user_id: String,
    pub user_name: String,
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub room_id: String,
    pub local_user_id: String,
    pub local_user_name: String,
    pub auth_token: String,
    pub connection_status: ConnectionState,
    pub peer_online: bool,
    pub last_error: Option<CallError>,
}

/// Proof that a session was opened: its epoch and the engine serving it.
pub struct SessionTicket {
    pub epoch: u64,
    pub engine: Arc<SharedEngine>,
}

struct SessionSlot {
    session: Session,
    epoch: u64,
    engine: Option<Arc<SharedEngine>>,
}

/// Owns the room login lifecycle and the room-level connection status.
///
/// Every session is tagged with an epoch. Inbound engine notifications carry
/// the epoch of the session they were received for and are dropped once that
/// session has been superseded.
pub struct ConnectionManager {
    factory: Arc<EngineFactory>,
    emitter: EventEmitter,
    slot: Arc<Mutex<SessionSlot>>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<EngineFactory>, emitter: EventEmitter) -> Self {
        Self {
            factory,
            emitter,
            slot: Arc::new(Mutex::new(SessionSlot {
                session: Session::default(),
                epoch: 0,
                engine: None,
            })),
        }
    }

    /// Start a new session for `credentials` and subscribe to its engine.
    ///
    /// Returns `None` without touching the engine when `room_id` is empty.
    /// An already open session is logged out first.
    pub async fn open_session(&self, credentials: SessionCredentials) -> Option<SessionTicket> {
        if credentials.room_id.is_empty() {
            tracing::warn!("no room id, skipping login");
            return None;
        }

        if self.slot.lock().await.engine.is_some() {
            self.logout().await;
        }

        let engine = self.factory.acquire();
        engine.drain_pending().await;

        let mut slot = self.slot.lock().await;
        slot.epoch += 1;
        slot.session = Session {
            room_id: credentials.room_id,
            local_user_id: credentials.user_id,
            local_user_name: credentials.user_name,
            auth_token: credentials.token,
            ..Session::default()
        };
        slot.engine = Some(engine.clone());
        tracing::info!("session {} opened for room {}", slot.epoch, slot.session.room_id);

        Some(SessionTicket {
            epoch: slot.epoch,
            engine,
        })
    }

    /// Join the room of the session identified by `ticket`.
    ///
    /// Never fails to the caller: an engine error is recorded as
    /// `LoginFailed` on the session and the session's engine is released.
    /// The connection status itself only follows engine notifications.
    pub async fn login(&self, ticket: &SessionTicket) -> bool {
        let session = {
            let slot = self.slot.lock().await;
            if slot.epoch != ticket.epoch {
                tracing::debug!("login for superseded session {} skipped", ticket.epoch);
                return false;
            }
            slot.session.clone()
        };

        let result = ticket
            .engine
            .engine()
            .login(
                &session.room_id,
                &session.local_user_id,
                &session.local_user_name,
                &session.auth_token,
            )
            .await;

        match result {
            Ok(()) => {
                tracing::info!("login accepted for room {}", session.room_id);
                true
            }
            Err(e) => {
                tracing::warn!("login failed for room {}: {e}", session.room_id);
                let released = {
                    let mut slot = self.slot.lock().await;
                    if slot.epoch != ticket.epoch {
                        return false;
                    }
                    slot.epoch += 1;
                    slot.session.last_error = Some(CallError::LoginFailed(e.to_string()));
                    slot.engine.take()
                };
                drop(released);
                self.emitter.emit(CallEvent::LoginFailed(e.to_string()));
                false
            }
        }
    }

    /// Leave the room. The exit request runs in the background; events that
    /// arrive for this session afterwards are ignored.
    pub async fn logout(&self) {
        let (engine, was_disconnected) = {
            let mut slot = self.slot.lock().await;
            slot.epoch += 1;
            let was_disconnected = slot.session.connection_status == ConnectionState::Disconnected;
            slot.session = Session::default();
            (slot.engine.take(), was_disconnected)
        };

        if !was_disconnected {
            self.emitter
                .emit(CallEvent::ConnectionStateChanged(ConnectionState::Disconnected));
        }

        if let Some(shared) = engine {
            tokio::spawn(async move {
                if let Err(e) = shared.engine().logout().await {
                    tracing::warn!("error leaving room: {e}");
                }
                drop(shared);
            });
        }
    }

    pub async fn is_current(&self, epoch: u64) -> bool {
        self.slot.lock().await.epoch == epoch
    }

    /// Apply an engine connection notification. Returns the previous status
    /// when the transition was taken.
    pub async fn apply_connection_state(
        &self,
        epoch: u64,
        state: ConnectionState,
    ) -> Option<ConnectionState> {
        let previous = {
            let mut slot = self.slot.lock().await;
            if slot.epoch != epoch {
                tracing::debug!("connection state {state:?} for superseded session ignored");
                return None;
            }
            let previous = slot.session.connection_status;
            if previous == state {
                return None;
            }
            if !previous.can_transition_to(state) {
                tracing::warn!("ignoring connection transition {previous:?} -> {state:?}");
                return None;
            }
            slot.session.connection_status = state;
            previous
        };

        tracing::info!("connection {previous:?} -> {state:?}");
        self.emitter.emit(CallEvent::ConnectionStateChanged(state));
        Some(previous)
    }

    pub async fn apply_peer_presence(&self, epoch: u64, present: bool) {
        {
            let mut slot = self.slot.lock().await;
            if slot.epoch != epoch {
                return;
            }
            if slot.session.peer_online == present {
                return;
            }
            slot.session.peer_online = present;
        }
        tracing::info!("peer online: {present}");
        self.emitter.emit(CallEvent::PeerPresenceChanged(present));
    }

    pub async fn session(&self) -> Session {
        self.slot.lock().await.session.clone()
    }

    pub async fn connection_status(&self) -> ConnectionState {
        self.slot.lock().await.session.connection_status
    }

    /// The engine of the current session, if any.
    pub async fn engine(&self) -> Option<Arc<dyn RtcEngine>> {
        self.slot.lock().await.engine.as_ref().map(|e| e.engine())
    }
}
