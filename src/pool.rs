//! Round-robin pool of worker clients.
//!
//! Each member owns its own worker process, so independent calls scale with
//! the number of workers. Dispatch is a shared cursor: call `n` goes to
//! `clients[n % len]`.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client::{CallOptions, ClientBuilder, OffloadResponse, WorkerClient};
use crate::error::{OffloadError, Result};

/// A fixed set of [`WorkerClient`]s used in rotation.
#[derive(Debug)]
pub struct ClientPool {
    clients: Vec<WorkerClient>,
    cursor: AtomicUsize,
}

impl ClientPool {
    /// Build `size` clients from the same builder.
    ///
    /// Workers start lazily, on each member's first call.
    ///
    /// # Errors
    ///
    /// `Config` if `size` is zero, or any error from [`ClientBuilder::build`].
    pub fn new(size: usize, builder: ClientBuilder) -> Result<Self> {
        if size == 0 {
            return Err(OffloadError::Config(
                "pool size must be at least 1".to_string(),
            ));
        }
        let clients = (0..size)
            .map(|_| builder.clone().build())
            .collect::<Result<Vec<_>>>()?;
        Self::from_clients(clients)
    }

    /// Pool over existing clients.
    pub fn from_clients(clients: Vec<WorkerClient>) -> Result<Self> {
        if clients.is_empty() {
            return Err(OffloadError::Config(
                "pool needs at least one client".to_string(),
            ));
        }
        Ok(Self {
            clients,
            cursor: AtomicUsize::new(0),
        })
    }

    /// The client the next call goes to; advances the cursor.
    pub fn next_client(&self) -> &WorkerClient {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[idx]
    }

    /// [`WorkerClient::call`] on the next client.
    pub async fn call<T, R>(&self, entry: &str, payload: &T, options: &CallOptions) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.next_client().call(entry, payload, options).await
    }

    /// [`WorkerClient::call_bytes`] on the next client.
    pub async fn call_bytes(
        &self,
        entry: &str,
        payload: Bytes,
        options: &CallOptions,
    ) -> Result<OffloadResponse> {
        self.next_client().call_bytes(entry, payload, options).await
    }

    /// Close every member.
    pub async fn close(&self) {
        for client in &self.clients {
            client.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clients(&self) -> &[WorkerClient] {
        &self.clients
    }
}
