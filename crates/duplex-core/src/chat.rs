use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::connection::ConnectionManager;
use crate::errors::CallError;
use crate::events::{CallEvent, ChatMessage, EventEmitter};

/// Append-only message log with an index of the ids it holds.
#[derive(Debug, Default)]
struct MessageLog {
    messages: Vec<ChatMessage>,
    ids: HashSet<String>,
}

impl MessageLog {
    /// Returns `false` when a message with the same id is already logged.
    fn append(&mut self, msg: ChatMessage) -> bool {
        if !self.ids.insert(msg.id.clone()) {
            return false;
        }
        self.messages.push(msg);
        true
    }
}

/// Session-scoped room chat.
pub struct MessageChannel {
    connection: Arc<ConnectionManager>,
    emitter: EventEmitter,
    log: Mutex<MessageLog>,
}

impl MessageChannel {
    pub fn new(connection: Arc<ConnectionManager>, emitter: EventEmitter) -> Self {
        Self {
            connection,
            emitter,
            log: Mutex::new(MessageLog::default()),
        }
    }

    /// Send `body` to the room.
    ///
    /// The message is logged before the engine is called and stays logged
    /// even if the send fails.
    pub async fn send(&self, body: &str) -> Result<ChatMessage, CallError> {
        let session = self.connection.session().await;
        if session.room_id.is_empty() {
            return Err(CallError::NotConnected);
        }
        let engine = self.connection.engine().await.ok_or(CallError::NotConnected)?;

        let sent_at_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let msg = ChatMessage {
            id: local_message_id(sent_at_ms),
            sender_id: session.local_user_id.clone(),
            sender_name: session.local_user_name.clone(),
            body: body.to_string(),
            sent_at_ms,
        };

        self.log.lock().await.append(msg.clone());
        self.emitter.emit(CallEvent::ChatMessageReceived(msg.clone()));

        if let Err(e) = engine.send_message(&session.room_id, body).await {
            let failure = CallError::SendFailed(e.to_string());
            tracing::warn!("message {} not delivered: {failure}", msg.id);
            self.emitter.emit(CallEvent::ChatMessageSendFailed {
                message_id: msg.id.clone(),
                reason: e.to_string(),
            });
        } else {
            tracing::debug!("message {} sent", msg.id);
        }

        Ok(msg)
    }

    /// Append a batch delivered by the engine, dropping redelivered ids.
    pub async fn on_receive(&self, batch: Vec<ChatMessage>) -> usize {
        let mut appended = Vec::new();
        {
            let mut log = self.log.lock().await;
            for msg in batch {
                if log.append(msg.clone()) {
                    appended.push(msg);
                } else {
                    tracing::debug!("duplicate message {} dropped", msg.id);
                }
            }
        }

        let count = appended.len();
        for msg in appended {
            self.emitter.emit(CallEvent::ChatMessageReceived(msg));
        }
        count
    }

    /// All messages of the current session, in receipt order.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.log.lock().await.messages.clone()
    }

    /// Forget the log when the session ends.
    pub async fn clear(&self) {
        let mut log = self.log.lock().await;
        log.messages.clear();
        log.ids.clear();
    }
}

/// Millisecond timestamp prefix plus a random suffix, so two sends in the
/// same millisecond still get distinct ids.
fn local_message_id(sent_at_ms: u64) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{sent_at_ms}-{}", &suffix[..12])
}
