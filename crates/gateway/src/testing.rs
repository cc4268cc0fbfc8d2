//! Fakes shared by the gateway's unit tests.

use std::sync::Mutex;

use {
    async_trait::async_trait,
    parley_common::{DeliveryReceipt, Error, Outbound, Result, now_ms},
    parley_session::{ChatTransport, TransportEvent},
    tokio::sync::mpsc,
};

/// A transport that can never connect.
pub struct Offline;

#[async_trait]
impl ChatTransport for Offline {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        Err(Error::transport("offline"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, _: &str, _: &str) -> Result<DeliveryReceipt> {
        Err(Error::transport("offline"))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn refresh_credential(&self) -> Result<()> {
        Ok(())
    }
}

/// Records every outbound text.
#[derive(Default)]
pub struct Recorder {
    sent: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }
}

#[async_trait]
impl Outbound for Recorder {
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<DeliveryReceipt> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((conversation_id.into(), text.into()));
        Ok(DeliveryReceipt {
            message_id: format!("out-{}", now_ms()),
            conversation_id: conversation_id.into(),
            sent_at_ms: now_ms(),
        })
    }
}
