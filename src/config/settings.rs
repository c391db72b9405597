use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub engine: EngineSettings,
    pub poller: PollerSettings,
    pub feeds: FeedSettings,
    pub log: LogSettings,
}

/// Address the WebSocket server binds to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Credentials and token signing.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub username: String,
    pub password: String,
    pub token_ttl_secs: u64,
}

/// Engine limits.
///
/// `outbound_buffer` is the per-connection queue depth; frames beyond it are
/// dropped for that connection instead of stalling the fan-out.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    pub outbound_buffer: usize,
    pub max_connections: usize,
}

/// The bars polling loop: how often it ticks and which topics it refreshes.
#[derive(Debug, Deserialize, Clone)]
pub struct PollerSettings {
    pub interval_ms: u64,
    pub symbols: Vec<String>,
    pub resolutions: Vec<String>,
}

/// The simulated market and brokerage behind the routes.
///
/// An `activity_interval_ms` of 0 turns the simulated order flow off.
#[derive(Debug, Deserialize, Clone)]
pub struct FeedSettings {
    pub seed: u64,
    pub history_bars: usize,
    pub quote_interval_ms: u64,
    pub book_interval_ms: u64,
    pub status_interval_ms: u64,
    pub activity_interval_ms: u64,
    pub accounts: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub auth: Option<PartialAuthSettings>,
    pub engine: Option<PartialEngineSettings>,
    pub poller: Option<PartialPollerSettings>,
    pub feeds: Option<PartialFeedSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialAuthSettings {
    pub jwt_secret: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialEngineSettings {
    pub outbound_buffer: Option<usize>,
    pub max_connections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPollerSettings {
    pub interval_ms: Option<u64>,
    pub symbols: Option<Vec<String>>,
    pub resolutions: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialFeedSettings {
    pub seed: Option<u64>,
    pub history_bars: Option<usize>,
    pub quote_interval_ms: Option<u64>,
    pub book_interval_ms: Option<u64>,
    pub status_interval_ms: Option<u64>,
    pub activity_interval_ms: Option<u64>,
    pub accounts: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            auth: AuthSettings {
                jwt_secret: "change_me".to_string(),
                username: "admin".to_string(),
                password: "password".to_string(),
                token_ttl_secs: 24 * 3600,
            },
            engine: EngineSettings {
                outbound_buffer: 256,
                max_connections: 1000,
            },
            poller: PollerSettings {
                interval_ms: 1000,
                symbols: vec!["AAPL".to_string(), "MSFT".to_string(), "TSLA".to_string()],
                resolutions: vec!["1".to_string(), "5".to_string()],
            },
            feeds: FeedSettings {
                seed: 42,
                history_bars: 100,
                quote_interval_ms: 500,
                book_interval_ms: 1000,
                status_interval_ms: 5000,
                activity_interval_ms: 2000,
                accounts: vec!["demo".to_string()],
            },
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Fill every value missing from `partial` with the default.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Self::default();
        let server = partial.server.unwrap_or_default();
        let auth = partial.auth.unwrap_or_default();
        let engine = partial.engine.unwrap_or_default();
        let poller = partial.poller.unwrap_or_default();
        let feeds = partial.feeds.unwrap_or_default();
        let log = partial.log.unwrap_or_default();

        Self {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            auth: AuthSettings {
                jwt_secret: auth.jwt_secret.unwrap_or(default.auth.jwt_secret),
                username: auth.username.unwrap_or(default.auth.username),
                password: auth.password.unwrap_or(default.auth.password),
                token_ttl_secs: auth.token_ttl_secs.unwrap_or(default.auth.token_ttl_secs),
            },
            engine: EngineSettings {
                outbound_buffer: engine
                    .outbound_buffer
                    .unwrap_or(default.engine.outbound_buffer),
                max_connections: engine
                    .max_connections
                    .unwrap_or(default.engine.max_connections),
            },
            poller: PollerSettings {
                interval_ms: poller.interval_ms.unwrap_or(default.poller.interval_ms),
                symbols: poller.symbols.unwrap_or(default.poller.symbols),
                resolutions: poller.resolutions.unwrap_or(default.poller.resolutions),
            },
            feeds: FeedSettings {
                seed: feeds.seed.unwrap_or(default.feeds.seed),
                history_bars: feeds.history_bars.unwrap_or(default.feeds.history_bars),
                quote_interval_ms: feeds
                    .quote_interval_ms
                    .unwrap_or(default.feeds.quote_interval_ms),
                book_interval_ms: feeds
                    .book_interval_ms
                    .unwrap_or(default.feeds.book_interval_ms),
                status_interval_ms: feeds
                    .status_interval_ms
                    .unwrap_or(default.feeds.status_interval_ms),
                activity_interval_ms: feeds
                    .activity_interval_ms
                    .unwrap_or(default.feeds.activity_interval_ms),
                accounts: feeds.accounts.unwrap_or(default.feeds.accounts),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
