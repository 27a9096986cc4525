use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::transport::{SessionHandle, Transport};
use crate::errors::CoreEngineError;
use crate::model::{FlowId, OutboundMessage, SessionId};

/// Relación de un flow con una contraparte. No se persiste por separado:
/// viaja dentro del checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSession {
    pub session_id: SessionId,
    pub counterparty: String,
    pub send_seq: u64,
    pub recv_seq: u64,
}

impl FlowSession {
    pub fn handle(&self) -> SessionHandle {
        SessionHandle { session: self.session_id,
                        counterparty: self.counterparty.clone() }
    }
}

/// Sobre en el cable: payload JSON + número de secuencia por sesión.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub flow_id: FlowId,
    pub session: SessionId,
    pub seq: u64,
    pub payload: Value,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreEngineError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreEngineError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Lo que el driver entregó al reanudar tras un `Receive`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Message { session: SessionId, payload: Value },
    TimedOut { session: SessionId },
}

/// Sesiones de un flow más el mensaje entrante del intervalo actual.
#[derive(Debug, Default)]
pub struct SessionMessenger {
    sessions: IndexMap<SessionId, FlowSession>,
    inbound: Option<Inbound>,
}

impl SessionMessenger {
    pub fn from_snapshot(sessions: Vec<FlowSession>) -> Self {
        Self { sessions: sessions.into_iter().map(|s| (s.session_id, s)).collect(),
               inbound: None }
    }

    pub fn snapshot(&self) -> Vec<FlowSession> {
        self.sessions.values().cloned().collect()
    }

    pub fn get(&self, session: SessionId) -> Option<&FlowSession> {
        self.sessions.get(&session)
    }

    pub fn initiate(&mut self, transport: &dyn Transport, counterparty: &str) -> Result<SessionId, CoreEngineError> {
        let handle = transport.open_session(counterparty)?;
        let session = FlowSession { session_id: handle.session,
                                    counterparty: handle.counterparty,
                                    send_seq: 0,
                                    recv_seq: 0 };
        let id = session.session_id;
        self.sessions.insert(id, session);
        Ok(id)
    }

    /// Asigna secuencia a un envío y lo convierte en entrada del outbox.
    pub fn prepare_send(&mut self, session: SessionId, payload: Value) -> Result<OutboundMessage, CoreEngineError> {
        let s = self.sessions
                    .get_mut(&session)
                    .ok_or_else(|| CoreEngineError::UnknownSession(session.to_string()))?;
        s.send_seq += 1;
        Ok(OutboundMessage { session,
                             counterparty: s.counterparty.clone(),
                             seq: s.send_seq,
                             payload })
    }

    pub fn ensure_known(&self, session: SessionId) -> Result<(), CoreEngineError> {
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(CoreEngineError::UnknownSession(session.to_string()))
        }
    }

    pub(crate) fn accept(&mut self, inbound: Inbound) -> Result<(), CoreEngineError> {
        if let Inbound::Message { session, .. } = &inbound {
            let s = self.sessions
                        .get_mut(session)
                        .ok_or_else(|| CoreEngineError::UnknownSession(session.to_string()))?;
            s.recv_seq += 1;
        }
        self.inbound = Some(inbound);
        Ok(())
    }

    /// Consume el mensaje entregado para `session`.
    pub fn take_received(&mut self, session: SessionId) -> Result<Value, CoreEngineError> {
        match self.inbound.take() {
            Some(Inbound::Message { session: s, payload }) if s == session => Ok(payload),
            Some(Inbound::TimedOut { session: s }) if s == session => {
                Err(CoreEngineError::ReceiveTimeout(session.to_string()))
            }
            other => {
                self.inbound = other;
                Err(CoreEngineError::NothingReceived(session.to_string()))
            }
        }
    }

    /// Descarta un mensaje entrante no consumido al final del intervalo.
    pub(crate) fn clear_inbound(&mut self) {
        self.inbound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::InMemoryTransport;
    use serde_json::json;

    #[test]
    fn send_sequence_is_per_session() {
        let transport = InMemoryTransport::new();
        let mut m = SessionMessenger::default();
        let a = m.initiate(&transport, "notary").unwrap();
        let b = m.initiate(&transport, "bank").unwrap();
        assert_eq!(m.prepare_send(a, json!(1)).unwrap().seq, 1);
        assert_eq!(m.prepare_send(a, json!(2)).unwrap().seq, 2);
        assert_eq!(m.prepare_send(b, json!(3)).unwrap().seq, 1);
    }

    #[test]
    fn received_is_consumed_once() {
        let transport = InMemoryTransport::new();
        let mut m = SessionMessenger::default();
        let s = m.initiate(&transport, "bank").unwrap();
        m.accept(Inbound::Message { session: s,
                                    payload: json!("ack") })
         .unwrap();
        assert_eq!(m.take_received(s).unwrap(), json!("ack"));
        assert!(matches!(m.take_received(s), Err(CoreEngineError::NothingReceived(_))));
        assert_eq!(m.get(s).unwrap().recv_seq, 1);
    }

    #[test]
    fn timeout_surfaces_as_error() {
        let transport = InMemoryTransport::new();
        let mut m = SessionMessenger::default();
        let s = m.initiate(&transport, "bank").unwrap();
        m.accept(Inbound::TimedOut { session: s }).unwrap();
        assert!(matches!(m.take_received(s), Err(CoreEngineError::ReceiveTimeout(_))));
    }

    #[test]
    fn snapshot_preserves_order() {
        let transport = InMemoryTransport::new();
        let mut m = SessionMessenger::default();
        let a = m.initiate(&transport, "a").unwrap();
        let b = m.initiate(&transport, "b").unwrap();
        let restored = SessionMessenger::from_snapshot(m.snapshot());
        let ids: Vec<SessionId> = restored.snapshot().iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec![a, b]);
    }
}
