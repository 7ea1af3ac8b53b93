//! Registry of backend servers and backend selection.

use crate::config::{BackendConfig, SelectionStrategy};
use rand::Rng;
use std::{
    io,
    net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("no backend servers available")]
    NoBackends,
}

/// A backend game server. Liveness is probed on demand, never cached.
///
/// The socket address is known up front for IP literals; host names are
/// looked up once, by [`BackendServer::resolve`], when the server is
/// registered from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendServer {
    name: String,
    address: String,
    port: u16,
    priority: i32,
    resolved: Option<SocketAddr>,
}

impl BackendServer {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16, priority: i32) -> Self {
        let address = address.into();
        let resolved = address.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, port));
        Self {
            name: name.into(),
            address,
            port,
            priority,
            resolved,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Lower values are preferred.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// The cached socket address. Never blocks.
    pub fn resolved_addr(&self) -> Option<SocketAddr> {
        self.resolved
    }

    /// Looks the host name up and caches the first address. Blocks on
    /// DNS, so it must not run on the tick thread.
    pub fn resolve(&mut self) -> io::Result<SocketAddr> {
        let address = self.lookup()?;
        self.resolved = Some(address);
        Ok(address)
    }

    /// The cached address, or a fresh lookup when there is none.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        match self.resolved {
            Some(address) => Ok(address),
            None => self.lookup(),
        }
    }

    fn lookup(&self) -> io::Result<SocketAddr> {
        (self.address.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))
    }

    /// Best-effort TCP connect probe. Runs off the tick thread.
    pub fn is_online(&self, timeout: Duration) -> bool {
        match self.socket_addr() {
            Ok(addr) => TcpStream::connect_timeout(&addr, timeout).is_ok(),
            Err(_) => false,
        }
    }
}

impl From<&BackendConfig> for BackendServer {
    fn from(config: &BackendConfig) -> Self {
        Self::new(&config.name, &config.address, config.port, config.priority)
    }
}

#[derive(Debug)]
pub struct ServerManager {
    servers: Vec<Arc<BackendServer>>,
    strategy: SelectionStrategy,
    round_robin: AtomicUsize,
    probe_timeout: Duration,
}

impl ServerManager {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            servers: Vec::new(),
            strategy,
            round_robin: AtomicUsize::new(0),
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn from_config<'a>(
        strategy: SelectionStrategy,
        backends: impl IntoIterator<Item = &'a BackendConfig>,
    ) -> Self {
        let mut manager = Self::new(strategy);
        for backend in backends {
            let mut server = BackendServer::from(backend);
            if server.resolved_addr().is_none() {
                if let Err(e) = server.resolve() {
                    tracing::warn!(server = %server.name, "Cannot resolve {}: {e}", server.address);
                }
            }
            manager.register(server);
        }
        manager
    }

    /// Adds a server, replacing any previous server of the same name in
    /// place.
    pub fn register(&mut self, server: BackendServer) {
        let server = Arc::new(server);
        match self.servers.iter_mut().find(|s| s.name == server.name) {
            Some(existing) => *existing = server,
            None => self.servers.push(server),
        }
    }

    pub fn set_probe_timeout(&mut self, timeout: Duration) {
        self.probe_timeout = timeout;
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// All servers, in registration order.
    pub fn all(&self) -> &[Arc<BackendServer>] {
        &self.servers
    }

    pub fn get(&self, name: &str) -> Option<Arc<BackendServer>> {
        self.servers.iter().find(|s| s.name == name).cloned()
    }

    pub fn by_address(&self, address: &str, port: u16) -> Option<Arc<BackendServer>> {
        self.servers
            .iter()
            .find(|s| s.address == address && s.port == port)
            .cloned()
    }

    pub fn is_online(&self, server: &BackendServer) -> bool {
        server.is_online(self.probe_timeout)
    }

    /// Picks a backend according to the configured strategy.
    ///
    /// Priority picks the lowest priority value, the first registered
    /// server winning ties. Round-robin cycles through the servers in
    /// registration order, advancing on every call.
    pub fn select(&self) -> Result<Arc<BackendServer>, ServerError> {
        if self.servers.is_empty() {
            return Err(ServerError::NoBackends);
        }
        let index = match self.strategy {
            SelectionStrategy::Priority => self
                .servers
                .iter()
                .enumerate()
                .min_by_key(|(index, s)| (s.priority, *index))
                .map(|(index, _)| index)
                .unwrap_or_default(),
            SelectionStrategy::RoundRobin => {
                self.round_robin.fetch_add(1, Ordering::Relaxed) % self.servers.len()
            }
            SelectionStrategy::Random => rand::thread_rng().gen_range(0..self.servers.len()),
        };
        Ok(Arc::clone(&self.servers[index]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn manager(strategy: SelectionStrategy) -> ServerManager {
        let mut manager = ServerManager::new(strategy);
        manager.register(BackendServer::new("survival", "127.0.0.1", 19134, 5));
        manager.register(BackendServer::new("lobby", "127.0.0.1", 19133, 0));
        manager.register(BackendServer::new("lobby-2", "127.0.0.1", 19135, 0));
        manager
    }

    #[test]
    fn priority_picks_lowest_value_then_registration_order() {
        let manager = manager(SelectionStrategy::Priority);
        for _ in 0..5 {
            assert_eq!(manager.select().unwrap().name(), "lobby");
        }
    }

    #[test]
    fn round_robin_visits_each_server_once_per_cycle() {
        let manager = manager(SelectionStrategy::RoundRobin);
        let names: Vec<_> = (0..6)
            .map(|_| manager.select().unwrap().name().to_owned())
            .collect();
        assert_eq!(
            names,
            ["survival", "lobby", "lobby-2", "survival", "lobby", "lobby-2"]
        );
    }

    #[test]
    fn random_stays_in_registry() {
        let manager = manager(SelectionStrategy::Random);
        for _ in 0..20 {
            assert!(manager.get(manager.select().unwrap().name()).is_some());
        }
    }

    #[test]
    fn empty_registry_has_no_backends() {
        for strategy in [
            SelectionStrategy::Priority,
            SelectionStrategy::RoundRobin,
            SelectionStrategy::Random,
        ] {
            let manager = ServerManager::new(strategy);
            assert!(matches!(manager.select(), Err(ServerError::NoBackends)));
        }
    }

    #[test]
    fn lookup_by_name_and_address() {
        let manager = manager(SelectionStrategy::Priority);
        assert_eq!(manager.get("survival").unwrap().port(), 19134);
        assert_eq!(manager.by_address("127.0.0.1", 19135).unwrap().name(), "lobby-2");
        assert!(manager.by_address("127.0.0.1", 1).is_none());
        assert!(manager.get("hub").is_none());
    }

    #[test]
    fn ip_literals_need_no_lookup() {
        let server = BackendServer::new("lobby", "127.0.0.1", 19132, 0);
        assert_eq!(server.resolved_addr(), Some(([127, 0, 0, 1], 19132).into()));
        let v6 = BackendServer::new("lobby", "::1", 19132, 0);
        assert_eq!(v6.resolved_addr(), Some(SocketAddr::new(IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1]), 19132)));

        let named = BackendServer::new("hub", "localhost", 19132, 0);
        assert_eq!(named.resolved_addr(), None);
    }

    #[test]
    fn configured_host_names_are_resolved_once() {
        let backends = [BackendConfig {
            name: "hub".to_owned(),
            address: "localhost".to_owned(),
            port: 19132,
            priority: 0,
        }];
        let manager = ServerManager::from_config(SelectionStrategy::Priority, &backends);
        let hub = manager.get("hub").unwrap();
        let address = hub.resolved_addr().unwrap();
        assert!(address.ip().is_loopback());
        assert_eq!(address.port(), 19132);
    }

    #[test]
    fn liveness_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let online = BackendServer::new("up", "127.0.0.1", port, 0);
        assert!(online.is_online(Duration::from_secs(1)));

        drop(listener);
        let offline = BackendServer::new("down", "127.0.0.1", port, 0);
        assert!(!offline.is_online(Duration::from_secs(1)));
    }
}
