/**
 * BUS - Émission et réception de messages plateforme
 *
 * RÔLE : Côté émission, ouvre une connexion TCP vers le serveur central et
 * écrit l'enveloppe texte. Côté réception, lit un message complet d'une
 * connexion entrante (le message se termine à la fermeture du flux).
 */
use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use hive_core::Envelope;

/// Handle on the central bus server, used to dispatch messages.
#[derive(Debug, Clone)]
pub struct Bus {
    server_host: String,
    server_port: u16,
}

impl Bus {
    pub fn new(server_host: String, server_port: u16) -> Self {
        Self {
            server_host,
            server_port,
        }
    }

    pub async fn send(&self, msg: &Envelope) -> Result<()> {
        self.send_raw(&msg.to_wire()).await
    }

    /// Deliver a raw message to the bus server over a fresh connection.
    pub async fn send_raw(&self, raw: &str) -> Result<()> {
        let addr = format!("{}:{}", self.server_host, self.server_port);
        debug!("sending to {addr}: {raw}");

        let mut stream = TcpStream::connect(addr.as_str())
            .await
            .with_context(|| format!("cannot reach bus server at {addr}"))?;
        stream.write_all(raw.as_bytes()).await?;
        stream.shutdown().await?;

        Ok(())
    }
}

/// Read one complete message from an accepted connection.
pub async fn read_message(stream: &mut TcpStream) -> Result<String> {
    let mut buffer = Vec::new();
    stream.read_to_end(&mut buffer).await?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
