use crate::strategy::system_prompt::{SystemPromptConfig, SystemPromptMode};
use crate::upstream::ProviderType;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_CONFIG_FILE: &str = "config.toml";

pub const DEFAULT_CLAUDE_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_CLAUDE_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";

/// 池存储后端。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolBackendKind {
    Memory,
    Sqlite,
}

impl PoolBackendKind {
    fn parse(v: &str) -> Self {
        match v.trim().to_lowercase().as_str() {
            "sqlite" | "db" | "database" => Self::Sqlite,
            _ => Self::Memory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub api_key: String,
    pub timeout_ms: u64,
    pub proxy: String,
    pub debug: String,
    pub data_dir: String,

    pub request_max_retries: u32,
    pub request_base_delay_ms: u64,
    pub max_error_count: u32,

    pub cron_near_minutes: u64,
    pub cron_refresh_token: bool,

    pub health_check_interval_secs: u64,
    pub health_check_timeout_ms: u64,
    pub health_check_concurrency: usize,

    pub usage_query_concurrency: usize,
    pub usage_cache_ttl_secs: u64,

    pub pool_backend: PoolBackendKind,
    pub provider_pools_file_path: PathBuf,
    pub database_path: PathBuf,
    pub default_provider: ProviderType,

    pub system_prompt_file_path: String,
    pub system_prompt_mode: String,
    pub system_prompt_capture_file: String,

    pub claude_base_url: String,
    pub claude_token_url: String,
    pub openai_base_url: String,
    pub openai_token_url: String,
    pub openai_client_id: String,

    pub shutdown_grace_secs: u64,
    pub persist_interval_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "API_KEY", alias = "REQUIRED_API_KEY")]
    api_key: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,
    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,

    #[serde(alias = "REQUEST_MAX_RETRIES")]
    request_max_retries: Option<u32>,
    #[serde(alias = "REQUEST_BASE_DELAY")]
    request_base_delay: Option<u64>,
    #[serde(alias = "MAX_ERROR_COUNT")]
    max_error_count: Option<u32>,

    #[serde(alias = "CRON_NEAR_MINUTES")]
    cron_near_minutes: Option<u64>,
    #[serde(alias = "CRON_REFRESH_TOKEN")]
    cron_refresh_token: Option<String>,

    #[serde(alias = "HEALTH_CHECK_INTERVAL")]
    health_check_interval: Option<u64>,
    #[serde(alias = "HEALTH_CHECK_TIMEOUT")]
    health_check_timeout: Option<u64>,
    #[serde(alias = "HEALTH_CHECK_CONCURRENCY")]
    health_check_concurrency: Option<usize>,

    #[serde(alias = "USAGE_QUERY_CONCURRENCY")]
    usage_query_concurrency: Option<usize>,
    #[serde(alias = "USAGE_CACHE_TTL")]
    usage_cache_ttl: Option<u64>,

    #[serde(alias = "POOL_BACKEND")]
    pool_backend: Option<String>,
    #[serde(alias = "PROVIDER_POOLS_FILE_PATH")]
    provider_pools_file_path: Option<String>,
    #[serde(alias = "DATABASE_PATH")]
    database_path: Option<String>,
    #[serde(alias = "DEFAULT_PROVIDER", alias = "MODEL_PROVIDER")]
    default_provider: Option<String>,

    #[serde(alias = "SYSTEM_PROMPT_FILE_PATH")]
    system_prompt_file_path: Option<String>,
    #[serde(alias = "SYSTEM_PROMPT_MODE")]
    system_prompt_mode: Option<String>,
    #[serde(alias = "SYSTEM_PROMPT_CAPTURE_FILE")]
    system_prompt_capture_file: Option<String>,

    #[serde(alias = "CLAUDE_BASE_URL")]
    claude_base_url: Option<String>,
    #[serde(alias = "CLAUDE_TOKEN_URL")]
    claude_token_url: Option<String>,
    #[serde(alias = "OPENAI_BASE_URL")]
    openai_base_url: Option<String>,
    #[serde(alias = "OPENAI_TOKEN_URL")]
    openai_token_url: Option<String>,
    #[serde(alias = "OPENAI_CLIENT_ID")]
    openai_client_id: Option<String>,

    #[serde(alias = "SHUTDOWN_GRACE_SECS")]
    shutdown_grace_secs: Option<u64>,
    #[serde(alias = "PERSIST_INTERVAL")]
    persist_interval: Option<u64>,
}

impl Config {
    /// 加载顺序：config.toml（可选，CONFIG_FILE 指定路径） < .env < 进程环境变量。
    pub fn load() -> Self {
        load_dotenv();

        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let raw = Figment::new()
            .merge(Toml::file(&config_file))
            .merge(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_else(|e| {
                eprintln!("配置解析失败，使用默认值：{e}");
                RawEnv::default()
            });

        let mut cfg = Self::from_raw(raw);

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    fn from_raw(raw: RawEnv) -> Self {
        let data_dir = raw.data_dir.unwrap_or_else(|| "./data".to_string());
        let provider_pools_file_path = raw
            .provider_pools_file_path
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(&data_dir).join("provider_pools.json"));
        let database_path = raw
            .database_path
            .map(PathBuf::from)
            .unwrap_or_else(|| Path::new(&data_dir).join("pool.db"));

        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            api_key: raw.api_key.unwrap_or_default(),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            data_dir,
            request_max_retries: raw.request_max_retries.unwrap_or(3),
            request_base_delay_ms: raw.request_base_delay.unwrap_or(1000),
            max_error_count: raw.max_error_count.unwrap_or(3).max(1),
            cron_near_minutes: raw.cron_near_minutes.unwrap_or(15).max(1),
            cron_refresh_token: parse_bool(raw.cron_refresh_token.as_deref()).unwrap_or(true),
            health_check_interval_secs: raw.health_check_interval.unwrap_or(600).max(1),
            health_check_timeout_ms: raw.health_check_timeout.unwrap_or(15_000),
            health_check_concurrency: raw.health_check_concurrency.unwrap_or(5).max(1),
            usage_query_concurrency: raw.usage_query_concurrency.unwrap_or(4).max(1),
            usage_cache_ttl_secs: raw.usage_cache_ttl.unwrap_or(120),
            pool_backend: PoolBackendKind::parse(raw.pool_backend.as_deref().unwrap_or("memory")),
            provider_pools_file_path,
            database_path,
            default_provider: raw
                .default_provider
                .as_deref()
                .and_then(ProviderType::parse)
                .unwrap_or(ProviderType::ClaudeOAuth),
            system_prompt_file_path: raw.system_prompt_file_path.unwrap_or_default(),
            system_prompt_mode: raw.system_prompt_mode.unwrap_or_else(|| "append".to_string()),
            system_prompt_capture_file: raw.system_prompt_capture_file.unwrap_or_default(),
            claude_base_url: raw
                .claude_base_url
                .unwrap_or_else(|| DEFAULT_CLAUDE_BASE_URL.to_string()),
            claude_token_url: raw
                .claude_token_url
                .unwrap_or_else(|| DEFAULT_CLAUDE_TOKEN_URL.to_string()),
            openai_base_url: raw
                .openai_base_url
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            openai_token_url: raw
                .openai_token_url
                .unwrap_or_else(|| DEFAULT_OPENAI_TOKEN_URL.to_string()),
            openai_client_id: raw.openai_client_id.unwrap_or_default(),
            shutdown_grace_secs: raw.shutdown_grace_secs.unwrap_or(10),
            persist_interval_secs: raw.persist_interval.unwrap_or(60).max(1),
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    pub fn request_base_delay(&self) -> Duration {
        Duration::from_millis(self.request_base_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn cron_near(&self) -> Duration {
        Duration::from_secs(self.cron_near_minutes * 60)
    }

    pub fn usage_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.usage_cache_ttl_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }

    pub fn system_prompt(&self) -> SystemPromptConfig {
        SystemPromptConfig {
            file_path: non_empty_path(&self.system_prompt_file_path),
            mode: SystemPromptMode::parse(&self.system_prompt_mode),
            capture_file: non_empty_path(&self.system_prompt_capture_file),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawEnv::default())
    }
}

fn non_empty_path(v: &str) -> Option<PathBuf> {
    let v = v.trim();
    if v.is_empty() {
        None
    } else {
        Some(PathBuf::from(v))
    }
}

fn parse_bool(v: Option<&str>) -> Option<bool> {
    match v?.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn load_dotenv() {
    let Some(path) = find_dotenv_path() else {
        return;
    };
    let Ok(content) = std::fs::read_to_string(&path) else {
        return;
    };

    for line in content.lines() {
        let Some((key, value)) = parse_dotenv_line(line) else {
            continue;
        };
        // 已存在的进程环境变量优先，.env 只补缺。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：set_var 为 unsafe；此处在启动阶段单线程调用，满足前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    for dir in cwd.ancestors() {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }
        // 不越过项目根目录。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }
    }
    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").map_or(line, str::trim_start);

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    // 行内注释：仅当 # 前是空白时才视为注释。
    let value = match raw.find(" #").or_else(|| raw.find("\t#")) {
        Some(idx) => &raw[..idx],
        None => raw,
    };
    Some((key.to_string(), value.trim().to_string()))
}
