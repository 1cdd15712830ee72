//! UDP transport: each datagram is already a complete unit (UDP itself does
//! the framing), so this is a thin encrypt-on-send / decrypt-on-receive
//! wrapper around `tokio::net::UdpSocket`, not a `Stream`/`Sink` codec.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::crypt::{CryptError, CryptState};

#[derive(Debug, Error)]
pub enum UdpTransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("crypto error: {0}")]
    Crypt(#[from] CryptError),
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn connect(remote: SocketAddr) -> Result<Self, std::io::Error> {
        let bind_addr: SocketAddr = if remote.is_ipv4() { "0.0.0.0:0".parse().unwrap() } else { "[::]:0".parse().unwrap() };

        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(remote).await?;
        Ok(UdpTransport { socket })
    }

    pub async fn send(&self, crypt: &mut CryptState, plaintext: &[u8]) -> Result<(), UdpTransportError> {
        let datagram = crypt.encrypt(plaintext);
        self.socket.send(&datagram).await?;
        Ok(())
    }

    /// Receives and decrypts one datagram. A crypto failure is returned to
    /// the caller rather than silently dropped, so `good`/`late`/`lost`
    /// bookkeeping and resync decisions stay at the call site.
    pub async fn recv(&self, crypt: &mut CryptState, buf: &mut [u8]) -> Result<Vec<u8>, UdpTransportError> {
        let n = self.socket.recv(buf).await?;
        Ok(crypt.decrypt(&buf[..n])?)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_datagram_between_two_sockets() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpTransport::connect(server_addr).await.unwrap();
        server.connect(client.local_addr().unwrap()).await.unwrap();

        let mut client_crypt = CryptState::generate();
        let mut server_crypt =
            CryptState::from_parts(*client_crypt.raw_key(), *client_crypt.encrypt_iv(), *client_crypt.encrypt_iv());

        client.send(&mut client_crypt, b"hello").await.unwrap();

        let mut buf = [0u8; 2048];
        let n = server.recv(&mut buf).await.unwrap();
        let plain = server_crypt.decrypt(&buf[..n]).unwrap();

        assert_eq!(plain, b"hello");
    }
}
