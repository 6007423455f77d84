use std::cell::OnceCell;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

/// A single forwarding rule: connections accepted on `local_port` are relayed
/// to `remote_host:remote_port`.
///
/// Fields stay optional until configuration is complete; only mappings for
/// which [`Mapping::is_configured`] holds are served.
#[derive(Debug, Clone)]
pub struct Mapping {
    name: String,
    local_port: Option<u16>,
    remote_host: Option<String>,
    remote_port: Option<u16>,
    resolved: OnceCell<SocketAddr>,
}

impl Mapping {
    /// Starts an empty mapping; fields are filled in with the setters.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local_port: None,
            remote_host: None,
            remote_port: None,
            resolved: OnceCell::new(),
        }
    }

    pub fn new(
        name: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        let mut mapping = Self::named(name);
        mapping.set_local_port(Some(local_port));
        mapping.set_remote_host(remote_host);
        mapping.set_remote_port(Some(remote_port));
        mapping
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref()
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.remote_port
    }

    /// Port 0 is treated as "not set".
    pub fn set_local_port(&mut self, port: Option<u16>) {
        self.local_port = port.filter(|p| *p != 0);
    }

    pub fn set_remote_port(&mut self, port: Option<u16>) {
        let port = port.filter(|p| *p != 0);
        if port != self.remote_port {
            self.remote_port = port;
            self.resolved = OnceCell::new();
        }
    }

    pub fn set_remote_host(&mut self, host: impl Into<String>) {
        let host = host.into();
        if host.is_empty() || self.remote_host.as_deref() == Some(host.as_str()) {
            return;
        }
        self.remote_host = Some(host);
        self.resolved = OnceCell::new();
    }

    pub fn is_configured(&self) -> bool {
        self.local_port.is_some() && self.remote_port.is_some() && self.remote_host.is_some()
    }

    /// Wildcard address the listener for this mapping binds to.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.local_port
            .map(|port| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
    }

    /// Resolves the remote endpoint, caching the first address found until
    /// the host or port changes.
    pub fn remote_addr(&self) -> io::Result<SocketAddr> {
        if let Some(addr) = self.resolved.get() {
            return Ok(*addr);
        }
        let (Some(host), Some(port)) = (self.remote_host.as_deref(), self.remote_port) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mapping '{}' has no remote address", self.name),
            ));
        };
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host}:{port} did not resolve to any address"),
            )
        })?;
        let _ = self.resolved.set(addr);
        Ok(addr)
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = |p: Option<u16>| p.map_or_else(|| "?".to_string(), |p| p.to_string());
        write!(
            f,
            "{} (:{} -> {}:{})",
            self.name,
            port(self.local_port),
            self.remote_host.as_deref().unwrap_or("?"),
            port(self.remote_port)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_only_when_complete() {
        let mut mapping = Mapping::named("web");
        assert!(!mapping.is_configured());
        mapping.set_local_port(Some(8080));
        mapping.set_remote_host("127.0.0.1");
        assert!(!mapping.is_configured());
        mapping.set_remote_port(Some(80));
        assert!(mapping.is_configured());
    }

    #[test]
    fn zero_ports_and_empty_host_stay_unset() {
        let mut mapping = Mapping::named("web");
        mapping.set_local_port(Some(0));
        mapping.set_remote_port(Some(0));
        mapping.set_remote_host("");
        assert_eq!(mapping.local_port(), None);
        assert_eq!(mapping.remote_port(), None);
        assert_eq!(mapping.remote_host(), None);
    }

    #[test]
    fn resolution_is_invalidated_by_changes() {
        let mut mapping = Mapping::new("db", 15432, "127.0.0.1", 5432);
        assert_eq!(
            mapping.remote_addr().unwrap(),
            "127.0.0.1:5432".parse::<SocketAddr>().unwrap()
        );

        mapping.set_remote_port(Some(5433));
        assert_eq!(mapping.remote_addr().unwrap().port(), 5433);

        mapping.set_remote_host("127.0.0.2");
        assert_eq!(
            mapping.remote_addr().unwrap(),
            "127.0.0.2:5433".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn unconfigured_mapping_does_not_resolve() {
        let mapping = Mapping::named("empty");
        let err = mapping.remote_addr().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn display_names_both_sides() {
        let mapping = Mapping::new("ssh", 2222, "10.0.0.5", 22);
        assert_eq!(mapping.to_string(), "ssh (:2222 -> 10.0.0.5:22)");
        assert_eq!(Mapping::named("x").to_string(), "x (:? -> ?:?)");
    }
}
