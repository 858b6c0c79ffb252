use envconfig::Envconfig;
use telemetry_common::config::{EnvMsDuration, NonEmptyString, PipelineConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(default = "text")]
    pub log_format: String,

    #[envconfig(default = "telemetry-worker")]
    pub kafka_consumer_group: NonEmptyString,

    // Independent consumers in the group, each owning its own partitions
    #[envconfig(default = "1")]
    pub worker_concurrency: usize,

    #[envconfig(default = "5000")]
    pub kafka_auto_commit_interval_ms: u32,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    // Backoff between attempts at a message whose dead letter could not be persisted
    #[envconfig(default = "1000")]
    pub error_backoff_initial_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub error_backoff_maximum_ms: EnvMsDuration,

    #[envconfig(default = "false")]
    pub run_migrations: bool,

    #[envconfig(nested = true)]
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
