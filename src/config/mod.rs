mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    AuthSettings, EngineSettings, FeedSettings, LogSettings, PollerSettings, ServerSettings,
    Settings,
};

/// Loads the configuration from `config/default.*` and `FEEDCAST_*` environment
/// variables, then merges it with default values.
///
/// Nested keys use a double underscore (`FEEDCAST_SERVER__PORT=9000`) so that
/// field names containing underscores stay intact. List values are comma
/// separated (`FEEDCAST_POLLER__SYMBOLS=AAPL,MSFT`).
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("FEEDCAST")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("poller.symbols")
                .with_list_parse_key("poller.resolutions")
                .with_list_parse_key("feeds.accounts")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(Settings::merge(partial))
}
