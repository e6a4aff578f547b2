use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    sync::mpsc::{self, Receiver, TryRecvError},
    thread,
};

use anyhow::Context;
use boiler_common::{
    connectivity::NetError,
    timesync::{NtpTransport, NTP_PACKET_SIZE, NTP_PORT},
};
use tracing::{debug, warn};

type Lookup = Result<SocketAddr, String>;

/// Non-blocking SNTP datagrams over a std UDP socket.
///
/// Name resolution runs on a short-lived thread; `send` fails until the
/// address is known and the result is cached until a send fails.
pub struct UdpNtp {
    socket: UdpSocket,
    server: String,
    port: u16,
    target: Option<SocketAddr>,
    lookup: Option<Receiver<Lookup>>,
}

impl UdpNtp {
    pub fn new(server: String) -> anyhow::Result<Self> {
        Self::with_port(server, NTP_PORT)
    }

    fn with_port(server: String, port: u16) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("ntp socket bind")?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            server,
            port,
            target: None,
            lookup: None,
        })
    }

    fn resolve(&mut self) -> Result<SocketAddr, NetError> {
        if let Some(target) = self.target {
            return Ok(target);
        }

        let Some(pending) = &self.lookup else {
            let (tx, rx) = mpsc::channel();
            let host = (self.server.clone(), self.port);
            thread::Builder::new()
                .name("ntp-dns".into())
                .spawn(move || {
                    let _ = tx.send(lookup(host));
                })
                .map_err(|err| NetError::Driver(format!("resolver spawn: {err}")))?;
            self.lookup = Some(rx);
            return Err(NetError::Driver(format!("resolving {}", self.server)));
        };

        let result = pending.try_recv();
        match result {
            Ok(Ok(target)) => {
                debug!("ntp server {} at {target}", self.server);
                self.lookup = None;
                self.target = Some(target);
                Ok(target)
            }
            Ok(Err(err)) => {
                self.lookup = None;
                Err(NetError::Driver(err))
            }
            Err(TryRecvError::Empty) => {
                Err(NetError::Driver(format!("resolving {}", self.server)))
            }
            Err(TryRecvError::Disconnected) => {
                self.lookup = None;
                Err(NetError::Driver(format!("resolver for {} exited", self.server)))
            }
        }
    }
}

fn lookup((host, port): (String, u16)) -> Lookup {
    (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|err| format!("resolve {host}: {err}"))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| format!("{host} has no ipv4 address"))
}

impl NtpTransport for UdpNtp {
    fn send(&mut self, request: &[u8; NTP_PACKET_SIZE]) -> Result<(), NetError> {
        let target = self.resolve()?;
        self.socket.send_to(request, target).map(|_| ()).map_err(|err| {
            self.target = None;
            NetError::Driver(err.to_string())
        })
    }

    fn try_recv(&mut self, buf: &mut [u8; NTP_PACKET_SIZE]) -> Option<usize> {
        match self.socket.recv_from(buf) {
            Ok((len, _)) => Some(len),
            Err(err) if err.kind() == ErrorKind::WouldBlock => None,
            Err(err) => {
                warn!("ntp receive failed: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn send_when_resolved(ntp: &mut UdpNtp, request: &[u8; NTP_PACKET_SIZE]) {
        for _ in 0..200 {
            if ntp.send(request).is_ok() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("server never resolved");
    }

    #[test]
    fn first_send_returns_while_lookup_is_pending() {
        let mut ntp = UdpNtp::with_port("127.0.0.1".into(), 9).unwrap();
        assert!(ntp.send(&[0; NTP_PACKET_SIZE]).is_err());
        assert!(ntp.lookup.is_some());
        assert_eq!(ntp.target, None);
    }

    #[test]
    fn resolved_address_is_cached_and_exchanges_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = server.local_addr().unwrap().port();

        let mut ntp = UdpNtp::with_port("127.0.0.1".into(), port).unwrap();
        let request = [0x23; NTP_PACKET_SIZE];
        send_when_resolved(&mut ntp, &request);
        assert_eq!(ntp.target, Some(server.local_addr().unwrap()));
        assert!(ntp.lookup.is_none());

        let mut received = [0; NTP_PACKET_SIZE];
        let (len, client) = server.recv_from(&mut received).unwrap();
        assert_eq!(len, NTP_PACKET_SIZE);
        assert_eq!(received, request);

        // Cached: the second send goes out without another lookup.
        ntp.send(&request).unwrap();
        assert!(ntp.lookup.is_none());
        server.recv_from(&mut received).unwrap();

        server.send_to(&[0x24; NTP_PACKET_SIZE], client).unwrap();
        let mut reply = [0; NTP_PACKET_SIZE];
        let mut got = None;
        for _ in 0..200 {
            got = ntp.try_recv(&mut reply);
            if got.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(got, Some(NTP_PACKET_SIZE));
        assert_eq!(reply, [0x24; NTP_PACKET_SIZE]);
    }
}
