use std::time::Duration;

use crate::transport::TransportType;

/// Configuration attached to every session of a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The path this server answers on, e.g.: `/engine.io/`
    pub req_path: String,

    /// The interval at which the server sends a ping packet to the client.
    pub ping_interval: Duration,

    /// After a ping, the time the client has to answer with a pong before
    /// the session is considered to have timed out.
    pub ping_timeout: Duration,

    /// The time a transport upgrade may stay incomplete before it is
    /// cancelled.
    pub upgrade_timeout: Duration,

    /// The maximum number of payload bytes accepted on a single polling
    /// request, and the byte budget of a single polling response.
    pub max_payload: usize,

    /// The size of the buffer between a session and its websocket writer.
    ///
    /// If the buffer is full any subsequent send fails.
    pub max_buffer_size: usize,

    /// The transports this server accepts.
    pub transports: Vec<TransportType>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            req_path: "/engine.io/".to_string(),
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(20_000),
            upgrade_timeout: Duration::from_secs(15),
            max_payload: 1_000_000,
            max_buffer_size: 128,
            transports: vec![TransportType::Polling, TransportType::Websocket],
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    pub fn req_path(mut self, req_path: impl Into<String>) -> Self {
        self.config.req_path = req_path.into();
        self
    }

    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.config.ping_interval = ping_interval;
        self
    }

    pub fn ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.config.ping_timeout = ping_timeout;
        self
    }

    pub fn upgrade_timeout(mut self, upgrade_timeout: Duration) -> Self {
        self.config.upgrade_timeout = upgrade_timeout;
        self
    }

    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.config.max_payload = max_payload;
        self
    }

    pub fn max_buffer_size(mut self, max_buffer_size: usize) -> Self {
        self.config.max_buffer_size = max_buffer_size;
        self
    }

    /// Restricts the server to the given transports. A session can only be
    /// opened or upgraded on a transport listed here.
    pub fn transports(mut self, transports: impl Into<Vec<TransportType>>) -> Self {
        self.config.transports = transports.into();
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.req_path, "/engine.io/");
        assert_eq!(config.ping_interval, Duration::from_millis(25_000));
        assert_eq!(config.ping_timeout, Duration::from_millis(20_000));
        assert_eq!(config.max_payload, 1_000_000);
        assert_eq!(
            config.transports,
            vec![TransportType::Polling, TransportType::Websocket]
        );
    }

    #[test]
    fn builder_overrides_fields() {
        let config = ServerConfig::builder()
            .req_path("/eio/")
            .ping_interval(Duration::from_millis(300))
            .ping_timeout(Duration::from_millis(200))
            .max_payload(64)
            .transports([TransportType::Polling])
            .build();
        assert_eq!(config.req_path, "/eio/");
        assert_eq!(config.max_payload, 64);
        assert_eq!(config.transports, vec![TransportType::Polling]);
    }
}
