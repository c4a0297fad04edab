//! Values the dev server injects into the client at serve time.

use crate::error::{ClientError, Result};
use hotwire_proto::ClientEnv;
use std::time::Duration;
use url::Url;

/// Default heartbeat interval, matching the server's socket timeout.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Interval between liveness probes while the server is down.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Where and how the client reaches the HMR socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// `ws` or `wss`.
    pub protocol: String,
    /// `host:port` followed by the socket path, e.g. `localhost:5173/`.
    pub host_and_path: String,
    /// Socket address of the server itself, used when the primary address
    /// never opens.
    pub direct_target: String,
    /// The socket port was configured explicitly; never fall back.
    pub explicit_port: bool,
    /// Public base path, always ending in `/`.
    pub base: String,
    /// Render server errors in an overlay instead of only logging them.
    pub overlay: bool,
    pub heartbeat_interval: Duration,
    pub ping_interval: Duration,
}

impl ClientConfig {
    /// Derive the socket address from the URL of the page being served.
    ///
    /// # Errors
    /// Returns an error if the page URL has no host.
    pub fn from_page_url(page: &Url) -> Result<Self> {
        let host = page
            .host_str()
            .ok_or_else(|| ClientError::transport(format!("page URL has no host: {page}")))?;
        let authority = match page.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let protocol = if page.scheme() == "https" { "wss" } else { "ws" };

        Ok(Self {
            protocol: protocol.to_string(),
            host_and_path: format!("{authority}/"),
            direct_target: format!("{authority}/"),
            explicit_port: false,
            base: "/".to_string(),
            overlay: true,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            ping_interval: DEFAULT_PING_INTERVAL,
        })
    }

    /// Apply the settings a server published, falling back to the page URL
    /// for whatever it left unset.
    ///
    /// # Errors
    /// Returns an error if the page URL has no host.
    pub fn from_env(env: &ClientEnv, page: &Url) -> Result<Self> {
        let mut config = Self::from_page_url(page)?.with_base(&env.base);
        if let Some(protocol) = &env.protocol {
            config.protocol.clone_from(protocol);
        }
        let page_host = page.host_str().unwrap_or("localhost");
        let host = env.hostname.as_deref().unwrap_or(page_host);
        let (authority, _) = split_authority(&config.host_and_path);
        let port = env.port.map_or_else(
            || authority.rsplit_once(':').map_or("", |(_, port)| port).to_string(),
            |port| port.to_string(),
        );
        config.host_and_path = if port.is_empty() {
            format!("{host}{}", env.path)
        } else {
            format!("{host}:{port}{}", env.path)
        };
        config.direct_target.clone_from(&env.direct_target);
        config.explicit_port = env.port.is_some();
        config.overlay = env.overlay;
        config.heartbeat_interval = Duration::from_millis(env.timeout_ms);
        Ok(config)
    }

    /// Use a different public base path.
    #[must_use]
    pub fn with_base(mut self, base: &str) -> Self {
        let trimmed = base.trim_matches('/');
        self.base = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        };
        self
    }

    /// Dial a dedicated socket port. Disables the direct-target fallback.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        let (authority, path) = split_authority(&self.host_and_path);
        let host = authority.rsplit_once(':').map_or(authority, |(host, _)| host);
        self.host_and_path = format!("{host}:{port}{path}");
        self.explicit_port = true;
        self
    }

    /// Primary socket URL.
    ///
    /// # Errors
    /// Returns an error if the configured host does not form a valid URL.
    pub fn socket_url(&self) -> Result<Url> {
        Ok(Url::parse(&format!("{}://{}", self.protocol, self.host_and_path))?)
    }

    /// Fallback socket URL pointing straight at the server.
    ///
    /// # Errors
    /// Returns an error if the direct target does not form a valid URL.
    pub fn direct_socket_url(&self) -> Result<Url> {
        Ok(Url::parse(&format!("{}://{}", self.protocol, self.direct_target))?)
    }

    /// HTTP address probed while waiting for the server to come back.
    #[must_use]
    pub fn ping_url(&self) -> String {
        let scheme = if self.protocol == "wss" { "https" } else { "http" };
        format!("{scheme}://{}", self.host_and_path)
    }

    /// URL a module path is re-imported from, relative to `base`.
    #[must_use]
    pub fn module_url(&self, path: &str) -> String {
        format!("{}{}", self.base, path.trim_start_matches('/'))
    }
}

fn split_authority(host_and_path: &str) -> (&str, &str) {
    match host_and_path.find('/') {
        Some(idx) => host_and_path.split_at(idx),
        None => (host_and_path, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(url: &str) -> ClientConfig {
        ClientConfig::from_page_url(&Url::parse(url).unwrap()).unwrap()
    }

    #[test]
    fn test_from_page_url() {
        let config = page("http://localhost:5173/about");
        assert_eq!(config.protocol, "ws");
        assert_eq!(config.host_and_path, "localhost:5173/");
        assert_eq!(config.socket_url().unwrap().as_str(), "ws://localhost:5173/");
        assert_eq!(config.ping_url(), "http://localhost:5173/");
        assert!(!config.explicit_port);
    }

    #[test]
    fn test_secure_page_uses_wss() {
        let config = page("https://example.test/");
        assert_eq!(config.protocol, "wss");
        assert_eq!(config.host_and_path, "example.test:443/");
        assert_eq!(config.ping_url(), "https://example.test:443/");
    }

    #[test]
    fn test_with_port_keeps_path() {
        let config = page("http://localhost:5173/").with_port(24678);
        assert_eq!(config.host_and_path, "localhost:24678/");
        assert_eq!(config.direct_target, "localhost:5173/");
        assert!(config.explicit_port);
    }

    #[test]
    fn test_from_env() {
        let env = ClientEnv {
            port: Some(24678),
            path: "/app/__hmr".to_string(),
            direct_target: "localhost:5173/app/".to_string(),
            base: "/app/".to_string(),
            overlay: false,
            timeout_ms: 5_000,
            ..Default::default()
        };
        let page = Url::parse("http://localhost:5173/app/").unwrap();
        let config = ClientConfig::from_env(&env, &page).unwrap();
        assert_eq!(config.host_and_path, "localhost:24678/app/__hmr");
        assert_eq!(config.direct_target, "localhost:5173/app/");
        assert_eq!(config.base, "/app/");
        assert!(config.explicit_port);
        assert!(!config.overlay);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(5_000));

        let env = ClientEnv {
            path: "/".to_string(),
            base: "/".to_string(),
            ..env
        };
        let config = ClientConfig::from_env(&ClientEnv { port: None, ..env }, &page).unwrap();
        assert_eq!(config.host_and_path, "localhost:5173/");
        assert!(!config.explicit_port);
    }

    #[test]
    fn test_module_url_under_base() {
        let config = page("http://localhost:5173/").with_base("app");
        assert_eq!(config.base, "/app/");
        assert_eq!(config.module_url("/src/main.js"), "/app/src/main.js");
        assert_eq!(page("http://localhost/").module_url("/a.js"), "/a.js");
    }
}
