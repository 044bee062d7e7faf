//! Services mounted by the binary: `/echo` and `/chat`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use portico_core::{CloseFrame, Opcode};
use portico_server::{Behavior, IncomingMessage, Session, WebSocketServer};
use tracing::{debug, warn};

/// Sends every message back to its sender with the same opcode.
pub(crate) struct Echo;

#[async_trait]
impl Behavior for Echo {
    async fn on_message(&mut self, session: &Arc<Session>, message: IncomingMessage) {
        let payload = Bytes::copy_from_slice(message.as_bytes());
        if let Err(err) = session.send(message.opcode(), payload).await {
            debug!(session_id = %session.id(), error = %err, "echo failed");
        }
    }
}

/// Relays text messages to everyone connected to the same path.
#[derive(Default)]
pub(crate) struct Chat {
    relayed: u64,
}

#[async_trait]
impl Behavior for Chat {
    async fn on_open(&mut self, session: &Arc<Session>) {
        let online = session.sessions().map_or(1, |registry| registry.count());
        let _ = session.send_text(format!("welcome, {online} online")).await;
    }

    async fn on_message(&mut self, session: &Arc<Session>, message: IncomingMessage) {
        let Some(text) = message.as_text() else {
            return;
        };
        let Some(registry) = session.sessions() else {
            return;
        };
        match registry
            .broadcast(Opcode::Text, Bytes::from(text.to_string()))
            .await
        {
            Ok(summary) => {
                self.relayed += 1;
                if summary.failed > 0 {
                    debug!(
                        session_id = %session.id(),
                        failed = summary.failed,
                        "chat relay partially failed"
                    );
                }
            }
            Err(err) => warn!(session_id = %session.id(), error = %err, "chat relay rejected"),
        }
    }

    async fn on_close(&mut self, session: &Arc<Session>, frame: &CloseFrame) {
        debug!(
            session_id = %session.id(),
            code = %frame.code(),
            relayed = self.relayed,
            "left chat"
        );
    }
}

/// Register the bundled services on `server`.
pub(crate) fn mount(server: &WebSocketServer) -> portico_server::Result<()> {
    server.add_websocket_service("/echo", || Echo)?;
    server.add_websocket_service("/chat", Chat::default)?;
    Ok(())
}
