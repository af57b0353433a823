//! Blocking TCP and HTTP reachability checks.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::blocking::Client;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::trace;

const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// One attempt per call, plain success or failure.
pub trait Prober: Send + Sync {
    fn tcp(&self, host: &str, port: u16, timeout: Duration, src_ip: Option<IpAddr>) -> bool;

    fn http(&self, url: &str, timeout: Duration, src_ip: Option<IpAddr>) -> bool;
}

/// Probes over the real network stack.
#[derive(Default)]
pub struct NetProber {
    http_clients: Mutex<HashMap<Option<IpAddr>, Client>>,
}

impl NetProber {
    pub fn new() -> Self {
        Self::default()
    }

    fn http_client(&self, src_ip: Option<IpAddr>) -> reqwest::Result<Client> {
        let mut clients = self.http_clients.lock();
        if let Some(client) = clients.get(&src_ip) {
            return Ok(client.clone());
        }
        let client = Client::builder().local_address(src_ip).build()?;
        clients.insert(src_ip, client.clone());
        Ok(client)
    }
}

impl Prober for NetProber {
    fn tcp(&self, host: &str, port: u16, timeout: Duration, src_ip: Option<IpAddr>) -> bool {
        match tcp_connect(host, port, timeout.max(MIN_TIMEOUT), src_ip) {
            Ok(()) => true,
            Err(err) => {
                trace!(host, port, error = %err, "tcp probe failed");
                false
            }
        }
    }

    fn http(&self, url: &str, timeout: Duration, src_ip: Option<IpAddr>) -> bool {
        let client = match self.http_client(src_ip) {
            Ok(client) => client,
            Err(err) => {
                trace!(url, error = %err, "http client setup failed");
                return false;
            }
        };
        match client.get(url).timeout(timeout.max(MIN_TIMEOUT)).send() {
            Ok(response) => {
                trace!(url, status = %response.status(), "http probe answered");
                true
            }
            Err(err) => {
                trace!(url, error = %err, "http probe failed");
                false
            }
        }
    }
}

/// Connects to the first reachable resolved address of `host:port`, then
/// closes the connection.
fn tcp_connect(host: &str, port: u16, timeout: Duration, src_ip: Option<IpAddr>) -> io::Result<()> {
    let mut last_err = io::Error::new(
        io::ErrorKind::NotFound,
        format!("no usable address for {host}:{port}"),
    );

    for addr in (host, port).to_socket_addrs()? {
        if let Some(src) = src_ip {
            if src.is_ipv4() != addr.is_ipv4() {
                continue;
            }
        }

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if let Some(src) = src_ip {
            socket.bind(&SockAddr::from(SocketAddr::new(src, 0)))?;
        }
        match socket.connect_timeout(&SockAddr::from(addr), timeout) {
            Ok(()) => {
                let _ = socket.shutdown(Shutdown::Both);
                return Ok(());
            }
            Err(err) => last_err = err,
        }
    }

    Err(last_err)
}
