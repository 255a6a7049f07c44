use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::util::traits::DatagramTransport;

/// Largest datagram accepted as a reply.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Sends each exchange over a freshly bound, ephemeral UDP socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpTransport;

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", what))
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn exchange(
        &self,
        host: &str,
        port: u16,
        payload: &[u8],
        expect_reply: bool,
        given_timeout: Duration,
    ) -> io::Result<Option<Vec<u8>>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;

        timeout(given_timeout, socket.send_to(payload, (host, port)))
            .await
            .map_err(|_| timed_out("send"))??;

        if !expect_reply {
            return Ok(None);
        }

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        let (number_of_bytes, _src_addr) = timeout(given_timeout, socket.recv_from(&mut buffer))
            .await
            .map_err(|_| timed_out("receive"))??;
        buffer.truncate(number_of_bytes);
        Ok(Some(buffer))
    }
}
