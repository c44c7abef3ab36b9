//! Reliable-close UDP endpoint for OHM traffic.
//!
//! One socket serves a whole session: it is (re)opened in unicast or
//! multicast mode, read by a single reader task, and written from wherever a
//! frame needs to go out (the reader itself, the repair sweep, the leave
//! path). Sends are non-blocking and best-effort - UDP gives no delivery
//! guarantee, so there is nothing useful to wait for.
//!
//! `interrupt(true)` ejects a blocked reader with [`SocketError::Interrupted`]
//! and keeps subsequent reads failing until the interrupt is cleared. It is
//! idempotent and safe from any thread.

use crate::error::SocketError;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

pub struct OhmSocket {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    interrupted: AtomicBool,
    interrupt_notify: Notify,
}

impl OhmSocket {
    pub fn new() -> OhmSocket {
        OhmSocket {
            socket: Mutex::new(None),
            interrupted: AtomicBool::new(false),
            interrupt_notify: Notify::new(),
        }
    }

    /// Open for unicast reception: bind an ephemeral port on the given
    /// interface. Replaces any previously open socket.
    pub async fn open_unicast(&self, interface: Ipv4Addr, ttl: u8) -> Result<(), SocketError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(interface, 0)).await?;
        socket.set_ttl(ttl as u32)?;
        debug!("opened unicast socket on {:?}", socket.local_addr()?);
        *self.socket.lock().unwrap() = Some(Arc::new(socket));
        Ok(())
    }

    /// Open for multicast reception: bind the group port and join the group
    /// on the given interface. Replaces any previously open socket.
    pub async fn open_multicast(
        &self,
        interface: Ipv4Addr,
        group: SocketAddrV4,
        ttl: u8,
    ) -> Result<(), SocketError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port())).await?;
        socket.join_multicast_v4(*group.ip(), interface)?;
        socket.set_multicast_ttl_v4(ttl as u32)?;
        debug!("opened multicast socket for {:?} on {:?}", group, interface);
        *self.socket.lock().unwrap() = Some(Arc::new(socket));
        Ok(())
    }

    pub fn close(&self) {
        if self.socket.lock().unwrap().take().is_some() {
            debug!("closed socket");
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.current()?.local_addr()?)
    }

    /// Non-blocking best-effort send.
    pub fn try_send(&self, datagram: &[u8], to: SocketAddr) -> Result<(), SocketError> {
        let socket = self.current()?;
        match socket.try_send_to(datagram, to) {
            Ok(sent) if sent == datagram.len() => Ok(()),
            Ok(sent) => {
                warn!("short send to {:?}: {} of {} bytes", to, sent, datagram.len());
                Ok(())
            }
            Err(e) => Err(SocketError::Network(e)),
        }
    }

    /// Receive one datagram. Blocks until bytes arrive or the socket is
    /// interrupted; there is no timeout.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        let socket = self.current()?;

        // register for the interrupt before checking the flag, so an
        // interrupt arriving in between cannot be missed
        let notified = self.interrupt_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.interrupted.load(Ordering::Acquire) {
            return Err(SocketError::Interrupted);
        }

        tokio::select! {
            _ = notified => Err(SocketError::Interrupted),
            result = socket.recv_from(buf) => {
                let (len, from) = result?;
                trace!("received {} bytes from {:?}", len, from);
                Ok((len, from))
            }
        }
    }

    /// Set or clear the interrupt. Idempotent.
    pub fn interrupt(&self, interrupt: bool) {
        trace!("interrupt({})", interrupt);
        self.interrupted.store(interrupt, Ordering::Release);
        if interrupt {
            self.interrupt_notify.notify_waiters();
        }
    }

    fn current(&self) -> Result<Arc<UdpSocket>, SocketError> {
        self.socket
            .lock()
            .unwrap()
            .clone()
            .ok_or(SocketError::NotOpen)
    }
}

impl Default for OhmSocket {
    fn default() -> Self {
        OhmSocket::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn open_pair() -> (OhmSocket, UdpSocket, SocketAddr) {
        let socket = OhmSocket::new();
        socket.open_unicast(Ipv4Addr::LOCALHOST, 1).await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        (socket, peer, local)
    }

    #[tokio::test]
    async fn test_recv_delivers_datagram() {
        let (socket, peer, local) = open_pair().await;
        peer.send_to(b"hello", local).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, peer.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (socket, peer, _local) = open_pair().await;
        socket.try_send(b"out", peer.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"out");
    }

    #[tokio::test]
    async fn test_interrupt_ejects_blocked_reader() {
        let (socket, _peer, _local) = open_pair().await;
        let socket = Arc::new(socket);

        let reader = socket.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            reader.recv(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        socket.interrupt(true);

        let result = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(SocketError::Interrupted)));

        // repeated interrupts change nothing; reads keep failing until cleared
        socket.interrupt(true);
        let mut buf = [0u8; 64];
        assert!(matches!(socket.recv(&mut buf).await, Err(SocketError::Interrupted)));
    }

    #[tokio::test]
    async fn test_clearing_interrupt_restores_reception() {
        let (socket, peer, local) = open_pair().await;
        socket.interrupt(true);
        let mut buf = [0u8; 64];
        assert!(matches!(socket.recv(&mut buf).await, Err(SocketError::Interrupted)));

        socket.interrupt(false);
        peer.send_to(b"back", local).await.unwrap();
        let (len, _) = timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"back");
    }

    #[tokio::test]
    async fn test_recv_without_open_fails() {
        let socket = OhmSocket::new();
        let mut buf = [0u8; 64];
        assert!(matches!(socket.recv(&mut buf).await, Err(SocketError::NotOpen)));
    }
}
