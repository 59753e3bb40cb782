use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEnv {
    Local,
    Dev,
    Test,
    Prod,
}

impl AppEnv {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Prod => "prod",
        }
    }
}

impl std::str::FromStr for AppEnv {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "dev" | "development" => Ok(Self::Dev),
            "test" => Ok(Self::Test),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(ConfigError::InvalidEnv(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub app: AppSection,
    pub database: DatabaseSection,
    pub scheduler: SchedulerSection,
    pub rewards: RewardsSection,
    pub observability: ObservabilitySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    pub env: AppEnv,
    pub service_name: String,
    pub http_bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// In-memory stores are used when unset.
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    pub default_cycle_minutes: u32,
    /// Length of one cycle "minute" in seconds.
    pub cycle_unit_secs: u64,
    pub max_draw_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsSection {
    pub initial_balance: u64,
    pub sign_in_bonus: u64,
    pub welfare_amount: u64,
    pub welfare_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySection {
    pub log_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
}

impl<T> ResponseEnvelope<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RequestInvalid,
    NotFound,
    AlreadyExists,
    DrawsDisabled,
    NoOpenIssue,
    InsufficientFunds,
    AlreadySignedIn,
    WelfareNotEligible,
    ScheduleFailed,
    InternalError,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestInvalid => "REQUEST_INVALID",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::DrawsDisabled => "DRAWS_DISABLED",
            Self::NoOpenIssue => "NO_OPEN_ISSUE",
            Self::InsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::AlreadySignedIn => "ALREADY_SIGNED_IN",
            Self::WelfareNotEligible => "WELFARE_NOT_ELIGIBLE",
            Self::ScheduleFailed => "SCHEDULE_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid APP_ENV value: {0}")]
    InvalidEnv(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("unable to locate config directory (expected config/default.toml)")]
    ConfigDirNotFound,
    #[error("failed reading config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing config file {path}: {source}")]
    ParseToml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppConfig {
    app: Option<PartialAppSection>,
    database: Option<PartialDatabaseSection>,
    scheduler: Option<PartialSchedulerSection>,
    rewards: Option<PartialRewardsSection>,
    observability: Option<PartialObservabilitySection>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialAppSection {
    env: Option<AppEnv>,
    service_name: Option<String>,
    http_bind_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialDatabaseSection {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialSchedulerSection {
    default_cycle_minutes: Option<u32>,
    cycle_unit_secs: Option<u64>,
    max_draw_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialRewardsSection {
    initial_balance: Option<u64>,
    sign_in_bonus: Option<u64>,
    welfare_amount: Option<u64>,
    welfare_threshold: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialObservabilitySection {
    log_filter: Option<String>,
}

fn parse_env<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(None),
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let app_env = env::var("APP_ENV")
            .ok()
            .map(|value| value.parse())
            .transpose()?
            .unwrap_or(AppEnv::Local);
        let config_dir = resolve_config_dir()?;
        Self::load_from_dir_for_env(config_dir, app_env)
    }

    /// `default.toml` is required; `<env>.toml` is merged on top when present.
    pub fn load_from_dir_for_env(
        config_dir: impl AsRef<Path>,
        app_env: AppEnv,
    ) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let mut config = Self::default_for_env(app_env);
        merge_file(&mut config, &config_dir.join("default.toml"))?;
        let env_file = config_dir.join(format!("{}.toml", app_env.as_str()));
        if env_file.exists() {
            merge_file(&mut config, &env_file)?;
        }
        config.app.env = app_env;
        config.apply_env_overrides()?;
        Ok(config)
    }

    #[must_use]
    pub fn default_for_env(app_env: AppEnv) -> Self {
        Self {
            app: AppSection {
                env: app_env,
                service_name: "dice-lottery".to_string(),
                http_bind_addr: "127.0.0.1:9100".to_string(),
            },
            database: DatabaseSection {
                url: None,
                max_connections: 5,
            },
            scheduler: SchedulerSection {
                default_cycle_minutes: 1,
                cycle_unit_secs: 60,
                max_draw_retries: 3,
            },
            rewards: RewardsSection {
                initial_balance: 1000,
                sign_in_bonus: 1000,
                welfare_amount: 1000,
                welfare_threshold: 1000,
            },
            observability: ObservabilitySection {
                log_filter: "info".to_string(),
            },
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(raw_env) = env::var("APP_ENV") {
            self.app.env = raw_env.parse()?;
        }
        if let Ok(service_name) = env::var("DICE_LOTTERY__SERVICE_NAME") {
            self.app.service_name = service_name;
        }
        if let Ok(bind_addr) = env::var("DICE_LOTTERY__HTTP_BIND_ADDR") {
            self.app.http_bind_addr = bind_addr;
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            self.database.url = Some(url).filter(|u| !u.trim().is_empty());
        }
        if let Some(value) = parse_env("DATABASE__MAX_CONNECTIONS")? {
            self.database.max_connections = value;
        }
        if let Some(value) = parse_env("SCHEDULER__DEFAULT_CYCLE_MINUTES")? {
            self.scheduler.default_cycle_minutes = value;
        }
        if let Some(value) = parse_env("SCHEDULER__CYCLE_UNIT_SECS")? {
            self.scheduler.cycle_unit_secs = value;
        }
        if let Some(value) = parse_env("SCHEDULER__MAX_DRAW_RETRIES")? {
            self.scheduler.max_draw_retries = value;
        }
        if let Ok(log_filter) = env::var("OBSERVABILITY__LOG_FILTER") {
            self.observability.log_filter = log_filter;
        } else if let Ok(log_filter) = env::var("RUST_LOG") {
            self.observability.log_filter = log_filter;
        }
        Ok(())
    }

    fn merge_partial(&mut self, partial: PartialAppConfig) {
        if let Some(app) = partial.app {
            if let Some(value) = app.env {
                self.app.env = value;
            }
            if let Some(value) = app.service_name {
                self.app.service_name = value;
            }
            if let Some(value) = app.http_bind_addr {
                self.app.http_bind_addr = value;
            }
        }
        if let Some(database) = partial.database {
            if let Some(value) = database.url {
                self.database.url = Some(value).filter(|u| !u.trim().is_empty());
            }
            if let Some(value) = database.max_connections {
                self.database.max_connections = value;
            }
        }
        if let Some(scheduler) = partial.scheduler {
            if let Some(value) = scheduler.default_cycle_minutes {
                self.scheduler.default_cycle_minutes = value;
            }
            if let Some(value) = scheduler.cycle_unit_secs {
                self.scheduler.cycle_unit_secs = value;
            }
            if let Some(value) = scheduler.max_draw_retries {
                self.scheduler.max_draw_retries = value;
            }
        }
        if let Some(rewards) = partial.rewards {
            if let Some(value) = rewards.initial_balance {
                self.rewards.initial_balance = value;
            }
            if let Some(value) = rewards.sign_in_bonus {
                self.rewards.sign_in_bonus = value;
            }
            if let Some(value) = rewards.welfare_amount {
                self.rewards.welfare_amount = value;
            }
            if let Some(value) = rewards.welfare_threshold {
                self.rewards.welfare_threshold = value;
            }
        }
        if let Some(observability) = partial.observability {
            if let Some(value) = observability.log_filter {
                self.observability.log_filter = value;
            }
        }
    }
}

fn merge_file(config: &mut AppConfig, path: &Path) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    let partial =
        toml::from_str::<PartialAppConfig>(&content).map_err(|source| ConfigError::ParseToml {
            path: path.display().to_string(),
            source,
        })?;
    config.merge_partial(partial);
    Ok(())
}

fn resolve_config_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var("DICE_LOTTERY_CONFIG_DIR") {
        return Ok(PathBuf::from(path));
    }

    let mut current_dir = env::current_dir().map_err(|_| ConfigError::ConfigDirNotFound)?;
    loop {
        let candidate = current_dir.join("config");
        if candidate.join("default.toml").exists() {
            return Ok(candidate);
        }
        if !current_dir.pop() {
            break;
        }
    }

    Err(ConfigError::ConfigDirNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_config_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "platform-core-{label}-{}",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("time")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn response_envelope_serializes_error_code_as_string() {
        let response: ResponseEnvelope<()> =
            ResponseEnvelope::err(ErrorCode::InsufficientFunds, "balance 10 cannot cover 20");
        let json = serde_json::to_string(&response).expect("serialize");
        assert!(json.contains("\"INSUFFICIENT_FUNDS\""));
        assert!(json.contains("\"error\""));
    }

    #[test]
    fn error_code_as_str_matches_serde_name() {
        for code in [
            ErrorCode::NoOpenIssue,
            ErrorCode::DrawsDisabled,
            ErrorCode::WelfareNotEligible,
        ] {
            let json = serde_json::to_value(code).expect("serialize");
            assert_eq!(json, serde_json::json!(code.as_str()));
        }
    }

    #[test]
    fn config_loader_merges_default_and_env_files() {
        let base_dir = temp_config_dir("merge");
        std::fs::write(
            base_dir.join("default.toml"),
            r#"
[app]
service_name = "lottery-default"
http_bind_addr = "127.0.0.1:9100"

[scheduler]
default_cycle_minutes = 1
max_draw_retries = 3

[rewards]
initial_balance = 1000

[observability]
log_filter = "info"
"#,
        )
        .expect("write default.toml");
        std::fs::write(
            base_dir.join("dev.toml"),
            r#"
[app]
service_name = "lottery-dev"

[scheduler]
default_cycle_minutes = 5

[rewards]
sign_in_bonus = 500

[observability]
log_filter = "debug"
"#,
        )
        .expect("write dev.toml");

        let config = AppConfig::load_from_dir_for_env(&base_dir, AppEnv::Dev).expect("load config");
        let expected_log_filter = std::env::var("OBSERVABILITY__LOG_FILTER")
            .ok()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| "debug".to_string());
        assert_eq!(config.app.env, AppEnv::Dev);
        assert_eq!(config.app.service_name, "lottery-dev");
        assert_eq!(config.app.http_bind_addr, "127.0.0.1:9100");
        assert_eq!(config.rewards.initial_balance, 1000);
        assert_eq!(config.rewards.sign_in_bonus, 500);
        assert_eq!(config.observability.log_filter, expected_log_filter);
        if std::env::var("SCHEDULER__DEFAULT_CYCLE_MINUTES").is_err() {
            assert_eq!(config.scheduler.default_cycle_minutes, 5);
        }
    }

    #[test]
    fn missing_env_file_falls_back_to_default() {
        let base_dir = temp_config_dir("fallback");
        std::fs::write(
            base_dir.join("default.toml"),
            r#"
[database]
url = ""
max_connections = 8
"#,
        )
        .expect("write default.toml");

        let config =
            AppConfig::load_from_dir_for_env(&base_dir, AppEnv::Prod).expect("load config");
        assert_eq!(config.app.env, AppEnv::Prod);
        if std::env::var("DATABASE_URL").is_err() {
            assert_eq!(config.database.url, None);
        }
        if std::env::var("DATABASE__MAX_CONNECTIONS").is_err() {
            assert_eq!(config.database.max_connections, 8);
        }
    }

    #[test]
    fn missing_default_file_is_an_error() {
        let base_dir = temp_config_dir("missing");
        assert!(matches!(
            AppConfig::load_from_dir_for_env(&base_dir, AppEnv::Local),
            Err(ConfigError::ReadFile { .. })
        ));
    }
}
