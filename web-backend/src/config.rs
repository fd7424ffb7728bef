use std::path::PathBuf;

use scanward_core::DEFAULT_EVENT_BUFFER;

const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_DATABASE: &str = "scanward.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// 服务配置，从环境变量（以及 .env 文件）读取
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_path: PathBuf,
    pub event_buffer: usize,
    pub static_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // .env 不存在时忽略
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_address = lookup("SCANWARD_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());

        let database_path = match lookup("SCANWARD_DATABASE") {
            Some(path) => PathBuf::from(path),
            None => std::env::current_dir()
                .map(|dir| dir.join(DEFAULT_DATABASE))
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATABASE)),
        };

        let event_buffer = match lookup("SCANWARD_EVENT_BUFFER") {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "SCANWARD_EVENT_BUFFER",
                        value,
                    })
                }
            },
            None => DEFAULT_EVENT_BUFFER,
        };

        let static_dir = lookup("SCANWARD_STATIC_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            bind_address,
            database_path,
            event_buffer,
            static_dir,
        })
    }
}
