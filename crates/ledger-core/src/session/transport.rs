//! Transporte de red colaborador: primitiva opaca de envío de bytes por
//! sesión. La recepción es push: el transporte entrega los mensajes
//! entrantes al scheduler (`FlowScheduler::deliver`).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::errors::CoreEngineError;
use crate::model::SessionId;

/// Handle opaco devuelto por el transporte al abrir una sesión.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session: SessionId,
    pub counterparty: String,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn open_session(&self, counterparty: &str) -> Result<SessionHandle, CoreEngineError>;

    async fn send(&self, handle: &SessionHandle, bytes: Vec<u8>) -> Result<(), CoreEngineError>;
}

/// Mensaje registrado por `InMemoryTransport`.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub handle: SessionHandle,
    pub bytes: Vec<u8>,
}

/// Transporte en memoria para tests y demo: guarda lo enviado y lo publica
/// a los suscriptores (contrapartes simuladas).
pub struct InMemoryTransport {
    sent: Mutex<Vec<SentMessage>>,
    failing_sends: AtomicU32,
    events: broadcast::Sender<SentMessage>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self { sent: Mutex::new(Vec::new()),
               failing_sends: AtomicU32::new(0),
               events }
    }

    /// Copia de todos los mensajes enviados, en orden.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SentMessage> {
        self.events.subscribe()
    }

    /// Hace fallar los próximos `n` envíos con un error de transporte.
    pub fn fail_next_sends(&self, n: u32) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn open_session(&self, counterparty: &str) -> Result<SessionHandle, CoreEngineError> {
        Ok(SessionHandle { session: SessionId::new(),
                           counterparty: counterparty.to_string() })
    }

    async fn send(&self, handle: &SessionHandle, bytes: Vec<u8>) -> Result<(), CoreEngineError> {
        let injected = self.failing_sends
                           .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                           .is_ok();
        if injected {
            return Err(CoreEngineError::Transport(format!("injected send failure to {}", handle.counterparty)));
        }
        let msg = SentMessage { handle: handle.clone(),
                                bytes };
        self.sent
            .lock()
            .map_err(|_| CoreEngineError::Internal("transport log poisoned".into()))?
            .push(msg.clone());
        let _ = self.events.send(msg);
        Ok(())
    }
}
