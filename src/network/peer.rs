// Peer connection management

use crate::error::{LedgerError, Result};
use crate::network::message::{Message, HEADER_LENGTH};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// One connection to a peer. Each connection carries exactly one message.
pub struct Peer {
    addr: String,
    stream: TcpStream,
}

impl Peer {
    /// Wrap an accepted connection
    pub fn new(stream: TcpStream, addr: String) -> Self {
        Self { addr, stream }
    }

    /// Connect to a peer
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| LedgerError::Protocol(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| LedgerError::Protocol(format!("Failed to connect to {}: {}", addr, e)))?;

        Ok(Self::new(stream, addr.to_string()))
    }

    /// Send a message to the peer
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        let data = message.serialize();

        self.stream
            .write_all(&data)
            .await
            .map_err(|e| LedgerError::Protocol(format!("Failed to send to {}: {}", self.addr, e)))?;

        self.stream
            .shutdown()
            .await
            .map_err(|e| LedgerError::Protocol(format!("Failed to close connection to {}: {}", self.addr, e)))?;

        Ok(())
    }

    /// Receive a message from the peer, giving up after `read_timeout`
    pub async fn receive_message(&mut self, read_timeout: Duration) -> Result<Message> {
        timeout(read_timeout, self.read_frame())
            .await
            .map_err(|_| LedgerError::Protocol(format!("Timed out reading from {}", self.addr)))?
    }

    async fn read_frame(&mut self) -> Result<Message> {
        let mut header = [0u8; HEADER_LENGTH];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|e| LedgerError::Protocol(format!("Failed to read header: {}", e)))?;

        let (message_type, payload_len) = Message::parse_header(&header)?;

        let mut payload = vec![0u8; payload_len];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| LedgerError::Protocol(format!("Failed to read {} payload: {}", message_type.as_str(), e)))?;

        Message::from_payload(message_type, &payload)
    }

    /// Get peer address
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// Open a connection to `addr`, deliver one message and close it
pub async fn send_message(addr: &str, message: &Message, connect_timeout: Duration) -> Result<()> {
    let mut peer = Peer::connect(addr, connect_timeout).await?;
    peer.send_message(message).await?;

    log::debug!("Sent {} to {}", message.message_type().as_str(), addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Hash256;
    use crate::network::InvType;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_send_and_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let message = Message::Inv {
            addr_from: "localhost:3001".to_string(),
            kind: InvType::Block,
            items: vec![Hash256::new([4; 32])],
        };

        let expected = message.clone();
        let receiver = tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            let mut peer = Peer::new(stream, remote.to_string());
            peer.receive_message(TIMEOUT).await.unwrap()
        });

        send_message(&addr, &message, TIMEOUT).await.unwrap();
        assert_eq!(receiver.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let message = Message::GetBlocks {
            addr_from: "localhost:3001".to_string(),
        };
        assert!(send_message(&addr, &message, TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn test_stalled_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let _client = TcpStream::connect(&addr).await.unwrap();
        let (stream, remote) = listener.accept().await.unwrap();
        let mut peer = Peer::new(stream, remote.to_string());

        let result = peer.receive_message(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(LedgerError::Protocol(_))));
    }
}
