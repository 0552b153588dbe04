//! Конфигурация бота: TOML-файл с токеном, списком админов, путём к БД и доступом к панели.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const BOT_TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Не удалось прочитать конфиг {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Некорректный TOML в {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Некорректное значение {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Токен бота не задан ни в конфиге, ни в переменной окружения TELEGRAM_BOT_TOKEN")]
    MissingBotToken,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanelConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Панель выдаёт токен на час, держим его меньше.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl PanelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    bot_token: Option<String>,
    #[serde(default)]
    pub admin_ids: Vec<i64>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_users_page_size")]
    pub users_page_size: i64,
    #[serde(default = "default_throttle_secs")]
    pub throttle_secs: u64,
    pub panel: PanelConfig,
}

/// Верхняя граница страницы списка, чтобы она помещалась в одно сообщение.
pub const MAX_USERS_PAGE_SIZE: i64 = 30;

fn default_timeout_secs() -> u64 {
    15
}

fn default_token_ttl_secs() -> u64 {
    50 * 60
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/marzban-admin-bot/bot.db")
}

fn default_users_page_size() -> i64 {
    10
}

fn default_throttle_secs() -> u64 {
    2
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.panel.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "panel.base_url",
                reason: "пустой адрес панели".to_string(),
            });
        }
        if self.panel.username.trim().is_empty() || self.panel.password.is_empty() {
            return Err(ConfigError::Invalid {
                field: "panel.username/panel.password",
                reason: "не заданы учётные данные администратора панели".to_string(),
            });
        }
        if !(1..=MAX_USERS_PAGE_SIZE).contains(&self.users_page_size) {
            return Err(ConfigError::Invalid {
                field: "users_page_size",
                reason: format!(
                    "должно быть от 1 до {}, получено {}",
                    MAX_USERS_PAGE_SIZE, self.users_page_size
                ),
            });
        }
        if self.panel.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "panel.timeout_secs",
                reason: "таймаут не может быть нулевым".to_string(),
            });
        }
        Ok(())
    }

    pub fn bot_token(&self) -> Result<String, ConfigError> {
        self.bot_token
            .clone()
            .filter(|token| !token.trim().is_empty())
            .or_else(|| {
                std::env::var(BOT_TOKEN_ENV)
                    .ok()
                    .filter(|token| !token.trim().is_empty())
            })
            .ok_or(ConfigError::MissingBotToken)
    }

    pub fn is_admin(&self, tg_user_id: i64) -> bool {
        self.admin_ids.contains(&tg_user_id)
    }

    pub fn throttle_period(&self) -> Duration {
        Duration::from_secs(self.throttle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Config {
        toml::from_str(raw).expect("valid toml")
    }

    #[test]
    fn applies_defaults_for_optional_fields() {
        let config = parse(
            r#"
            bot_token = "123:abc"
            admin_ids = [42]

            [panel]
            base_url = "https://panel.example.com"
            username = "root"
            password = "pw"
            "#,
        );
        assert!(config.validate().is_ok());
        assert_eq!(config.users_page_size, 10);
        assert_eq!(config.throttle_secs, 2);
        assert_eq!(config.panel.timeout_secs, 15);
        assert_eq!(config.panel.token_ttl(), Duration::from_secs(3000));
        assert!(config.is_admin(42));
        assert!(!config.is_admin(7));
        assert_eq!(config.bot_token().unwrap(), "123:abc");
    }

    #[test]
    fn rejects_page_size_that_overflows_a_message() {
        let config = parse(
            r#"
            users_page_size = 500

            [panel]
            base_url = "https://panel.example.com"
            username = "root"
            password = "pw"
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "users_page_size",
                ..
            })
        ));
    }

    #[test]
    fn rejects_zero_page_size() {
        let config = parse(
            r#"
            users_page_size = 0

            [panel]
            base_url = "https://panel.example.com"
            username = "root"
            password = "pw"
            "#,
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "users_page_size",
                ..
            })
        ));
    }

    #[test]
    fn rejects_missing_panel_credentials() {
        let config = parse(
            r#"
            [panel]
            base_url = "https://panel.example.com"
            username = ""
            password = ""
            "#,
        );
        assert!(config.validate().is_err());
    }
}
