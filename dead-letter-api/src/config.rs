use envconfig::Envconfig;
use telemetry_common::config::PipelineConfig;
use telemetry_common::deadletter::ReprocessPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "text")]
    pub log_format: String,

    // Guards listing, detail and reprocess. Unset or empty disables the check.
    pub operator_token: Option<String>,

    // Deletes are refused unless this is set
    pub admin_token: Option<String>,

    #[envconfig(default = "mark")]
    pub dead_letter_reprocess_policy: ReprocessPolicy,

    #[envconfig(default = "true")]
    pub refresh_schemas: bool,

    #[envconfig(nested = true)]
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
