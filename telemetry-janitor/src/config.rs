use envconfig::Envconfig;
use telemetry_common::config::PostgresConfig;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3303")]
    pub port: u16,

    #[envconfig(default = "text")]
    pub log_format: String,

    #[envconfig(default = "300")]
    pub cleanup_interval_secs: u64,

    // Comma separated cleaner modes, see `CleanerModeName`
    #[envconfig(default = "dead_letters,partitions")]
    pub modes: String,

    #[envconfig(default = "30")]
    pub dead_letter_retention_days: u32,

    // Rows removed per statement, repeated until a run catches up
    #[envconfig(default = "10000")]
    pub cleanup_batch_limit: u32,

    #[envconfig(default = "7")]
    pub partition_days_ahead: u32,

    #[envconfig(nested = true)]
    pub postgres: PostgresConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
