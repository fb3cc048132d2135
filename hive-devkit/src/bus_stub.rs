/*!
Stub de serveur de bus pour les tests

Écoute sur un port éphémère, lit chaque connexion entrante comme un message
complet et enregistre l'enveloppe analysée pour les assertions de tests.
*/

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::debug;

use hive_core::Envelope;

/// In-memory bus server recording every message it receives.
#[derive(Clone)]
pub struct BusStub {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Envelope>>>,
}

impl BusStub {
    /// Bind an ephemeral port and start recording in the background.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = received.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };

                let sink = sink.clone();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    if sock.read_to_end(&mut buffer).await.is_ok() {
                        let raw = String::from_utf8_lossy(&buffer);
                        match Envelope::parse(&raw) {
                            Ok(msg) => {
                                debug!("bus stub received: {raw}");
                                sink.lock().push(msg);
                            }
                            Err(e) => debug!("bus stub ignored malformed message: {e}"),
                        }
                    }
                });
            }
        });

        Ok(Self { addr, received })
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Snapshot of every envelope recorded so far.
    pub fn received(&self) -> Vec<Envelope> {
        self.received.lock().clone()
    }

    pub fn clear(&self) {
        self.received.lock().clear();
    }

    /// Wait until at least `count` messages arrived, or the timeout hits.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Envelope> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let messages = self.received();
            if messages.len() >= count || tokio::time::Instant::now() >= deadline {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// First recorded message carrying the given tag, if any.
    pub fn find_by_tag(&self, tag: &str) -> Option<Envelope> {
        self.received().into_iter().find(|m| m.has_tag(tag))
    }
}
