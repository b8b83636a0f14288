//! The single in-memory warehouse connection shared by all requests.
//!
//! The slot holds one `Arc<Connection>`; credentials and client are swapped in
//! and out together, so a reader never sees one without the other. Connect and
//! disconnect are serialized by `writer`; readers only take a short snapshot.

use crate::backend::{Connector, ServiceAccountCredentials, Warehouse};
use crate::error::BridgeError;
use crate::masking;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// A verified warehouse client and the identity it was built from.
#[derive(Debug)]
pub struct Connection<W> {
    pub project_id: String,
    pub client_email: String,
    pub warehouse: W,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub connected: bool,
    pub project_id: Option<String>,
}

type Slot<W> = RwLock<Option<Arc<Connection<W>>>>;

pub struct Session<C: Connector> {
    connector: C,
    slot: Slot<C::Warehouse>,
    writer: Mutex<()>,
    show_secrets: bool,
}

impl<C: Connector> Session<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            slot: RwLock::new(None),
            writer: Mutex::new(()),
            show_secrets: false,
        }
    }

    /// Log private keys in clear text instead of masking them.
    pub fn with_show_secrets(mut self, show_secrets: bool) -> Self {
        self.show_secrets = show_secrets;
        self
    }

    /// Build and verify a client, then make it the current connection.
    ///
    /// Any failure leaves the session disconnected, including when a previous
    /// connection existed.
    pub async fn connect(
        &self,
        credentials: ServiceAccountCredentials,
    ) -> Result<Arc<Connection<C::Warehouse>>, BridgeError> {
        let _writer = self.writer.lock().await;

        let project_id = credentials.project_id.clone();
        let client_email = credentials.client_email.clone();
        tracing::info!(
            project_id = %project_id,
            client_email = %client_email,
            private_key = %masking::format_secret(&credentials.private_key, self.show_secrets),
            "connecting to BigQuery"
        );

        let verified = match self.connector.connect(credentials).await {
            Ok(warehouse) => warehouse.verify().await.map(|_| warehouse),
            Err(e) => Err(e),
        };

        match verified {
            Ok(warehouse) => {
                let connection = Arc::new(Connection {
                    project_id,
                    client_email,
                    warehouse,
                });
                self.store(Some(Arc::clone(&connection)));
                tracing::info!(project_id = %connection.project_id, "connected to BigQuery");
                Ok(connection)
            }
            Err(e) => {
                self.store(None);
                tracing::warn!(project_id = %project_id, error = %e, "BigQuery connection failed");
                Err(BridgeError::Auth {
                    message: format!("Failed to connect to BigQuery: {}", e.detail()),
                })
            }
        }
    }

    pub async fn disconnect(&self) {
        let _writer = self.writer.lock().await;
        if let Some(previous) = self.store(None) {
            tracing::info!(project_id = %previous.project_id, "disconnected from BigQuery");
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self.snapshot() {
            Some(connection) => SessionStatus {
                connected: true,
                project_id: Some(connection.project_id.clone()),
            },
            None => SessionStatus {
                connected: false,
                project_id: None,
            },
        }
    }

    /// The live connection, or `NotConnected`.
    pub fn current(&self) -> Result<Arc<Connection<C::Warehouse>>, BridgeError> {
        self.snapshot().ok_or(BridgeError::NotConnected)
    }

    fn snapshot(&self) -> Option<Arc<Connection<C::Warehouse>>> {
        self.slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the slot contents, returning what was there.
    fn store(
        &self,
        next: Option<Arc<Connection<C::Warehouse>>>,
    ) -> Option<Arc<Connection<C::Warehouse>>> {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, next)
    }
}
