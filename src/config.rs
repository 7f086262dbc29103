use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Process-wide immutable configuration, loaded once at boot from the
/// environment. Section prefixes: `KAFKA_`, `ZALOPAY_`, `PAYOS_`, `OUTBOX_`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub webhook_base_url: String,
    pub grpc_addr: String,
    pub http_addr: String,
    pub kafka: KafkaConfig,
    pub zalopay: ZaloPayConfig,
    pub payos: PayOsConfig,
    pub outbox: OutboxConfig,
}

#[derive(Debug, Deserialize, Clone)]
struct BaseConfig {
    database_url: String,
    webhook_base_url: String,
    #[serde(default = "default_grpc_addr")]
    grpc_addr: String,
    #[serde(default = "default_http_addr")]
    http_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ZaloPayConfig {
    pub app_id: String,
    pub key1: String,
    pub key2: String,
    #[serde(default = "default_zalopay_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_zalopay_app_user")]
    pub app_user: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PayOsConfig {
    pub client_id: String,
    pub api_key: String,
    pub checksum_key: String,
    #[serde(default = "default_payos_endpoint")]
    pub endpoint: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutboxConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

fn default_grpc_addr() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_client_id() -> String {
    "turnstile".to_string()
}

fn default_zalopay_endpoint() -> String {
    "https://sb-openapi.zalopay.vn/v2/create".to_string()
}

fn default_zalopay_app_user() -> String {
    "ticketing".to_string()
}

fn default_payos_endpoint() -> String {
    "https://api-merchant.payos.vn".to_string()
}

fn default_batch_size() -> i64 {
    100
}

fn default_max_retries() -> i32 {
    5
}

fn default_retention_days() -> i64 {
    7
}

fn default_tick_interval_secs() -> u64 {
    5
}

fn section<T: DeserializeOwned>(source: config::Environment) -> anyhow::Result<T> {
    let settings = config::Config::builder().add_source(source).build()?;
    Ok(settings.try_deserialize()?)
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let base: BaseConfig = section(config::Environment::default())?;
        let kafka = section(config::Environment::with_prefix("KAFKA").try_parsing(true))?;
        let zalopay = section(config::Environment::with_prefix("ZALOPAY"))?;
        let payos = section(config::Environment::with_prefix("PAYOS"))?;
        let outbox = section(config::Environment::with_prefix("OUTBOX").try_parsing(true))?;

        let cfg = AppConfig {
            database_url: base.database_url,
            webhook_base_url: base.webhook_base_url,
            grpc_addr: base.grpc_addr,
            http_addr: base.http_addr,
            kafka,
            zalopay,
            payos,
            outbox,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if url::Url::parse(&self.webhook_base_url).is_err() {
            anyhow::bail!("WEBHOOK_BASE_URL must be an absolute URL");
        }
        if self.kafka.username.is_some() != self.kafka.password.is_some() {
            anyhow::bail!("KAFKA_USERNAME and KAFKA_PASSWORD must be set together");
        }
        if self.zalopay.app_id.parse::<u32>().is_err() {
            anyhow::bail!("ZALOPAY_APP_ID must be numeric");
        }
        if self.outbox.batch_size <= 0 {
            anyhow::bail!("OUTBOX_BATCH_SIZE must be positive");
        }
        if self.outbox.max_retries <= 0 {
            anyhow::bail!("OUTBOX_MAX_RETRIES must be positive");
        }
        if self.outbox.retention_days <= 0 {
            anyhow::bail!("OUTBOX_RETENTION_DAYS must be positive");
        }
        Ok(())
    }

    /// Callback URL registered with a provider at link creation.
    pub fn callback_url(&self, provider: crate::domain::Provider) -> String {
        format!(
            "{}/webhook/{}",
            self.webhook_base_url.trim_end_matches('/'),
            provider.as_str().to_lowercase()
        )
    }
}
