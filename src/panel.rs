//! HTTP-клиент API панели Marzban.
//!
//! Клиент сам держит access-токен (до истечения `token_ttl`) и карту inbound'ов
//! (на всё время жизни экземпляра). Повторов запросов нет: 409 при создании
//! пользователя отдаётся наружу как `PanelError::Conflict`, а решение принимает вызывающий.

use crate::config::PanelConfig;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

pub type Inbounds = HashMap<String, Vec<String>>;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("Ошибка авторизации в панели: {0}")]
    Authentication(String),
    #[error("Пользователь {0} не найден в панели")]
    NotFound(String),
    #[error("Пользователь {0} уже существует в панели")]
    Conflict(String),
    #[error("Ошибка API панели: {message}")]
    Api {
        status: Option<u16>,
        message: String,
    },
}

impl From<reqwest::Error> for PanelError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("таймаут запроса: {}", err)
        } else {
            err.to_string()
        };
        PanelError::Api {
            status: err.status().map(|status| status.as_u16()),
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelUserStatus {
    Active,
    Disabled,
    Limited,
    Expired,
    OnHold,
    #[serde(other)]
    Unknown,
}

impl PanelUserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PanelUserStatus::Active => "active",
            PanelUserStatus::Disabled => "disabled",
            PanelUserStatus::Limited => "limited",
            PanelUserStatus::Expired => "expired",
            PanelUserStatus::OnHold => "on_hold",
            PanelUserStatus::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(PanelUserStatus::Active),
            "disabled" => Some(PanelUserStatus::Disabled),
            "limited" => Some(PanelUserStatus::Limited),
            "expired" => Some(PanelUserStatus::Expired),
            "on_hold" => Some(PanelUserStatus::OnHold),
            _ => None,
        }
    }
}

/// Аккаунт в панели. `data_limit` и `expire` равны `None`, когда ограничения нет.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelAccount {
    pub username: String,
    pub status: PanelUserStatus,
    pub used_traffic: u64,
    pub data_limit: Option<u64>,
    pub expire: Option<DateTime<Utc>>,
    pub subscription_url: String,
    pub links: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewPanelUser {
    pub username: String,
    pub data_limit: Option<u64>,
    pub expire: Option<i64>,
    pub status: PanelUserStatus,
    /// `None`: выдать доступ ко всем inbound'ам панели.
    pub inbounds: Option<Inbounds>,
    pub note: Option<String>,
}

impl NewPanelUser {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            data_limit: None,
            expire: None,
            status: PanelUserStatus::Active,
            inbounds: None,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PanelUserPatch {
    pub status: Option<PanelUserStatus>,
    pub data_limit: Option<u64>,
    pub expire: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    username: String,
    #[serde(default)]
    status: Option<PanelUserStatus>,
    #[serde(default)]
    used_traffic: Option<u64>,
    #[serde(default)]
    data_limit: Option<u64>,
    #[serde(default)]
    expire: Option<serde_json::Value>,
    #[serde(default)]
    subscription_url: Option<String>,
    #[serde(default)]
    links: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct UsersPage {
    #[serde(default)]
    users: Vec<serde_json::Value>,
    #[serde(default)]
    total: i64,
}

#[derive(Debug, Deserialize)]
struct InboundEntry {
    tag: String,
}

#[derive(Debug, Serialize)]
struct UserPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<PanelUserStatus>,
    data_limit: u64,
    data_limit_reset_strategy: &'static str,
    expire: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    inbounds: Option<&'a Inbounds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<&'a str>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct PanelClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    token_ttl: Duration,
    token: RwLock<Option<CachedToken>>,
    inbounds: RwLock<Option<Inbounds>>,
}

fn parse_expire(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    let value = value?;
    let seconds = match value {
        serde_json::Value::Null => return None,
        serde_json::Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|seconds| seconds as i64)),
        serde_json::Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    };

    match seconds {
        Some(0) => None,
        Some(seconds) => {
            let parsed = DateTime::<Utc>::from_timestamp(seconds, 0);
            if parsed.is_none() {
                tracing::warn!(expire = %value, "Failed to parse expire date");
            }
            parsed
        }
        None => {
            tracing::warn!(expire = %value, "Failed to parse expire date");
            None
        }
    }
}

impl From<RawAccount> for PanelAccount {
    fn from(raw: RawAccount) -> Self {
        PanelAccount {
            expire: parse_expire(raw.expire.as_ref()),
            username: raw.username,
            status: raw.status.unwrap_or(PanelUserStatus::Unknown),
            used_traffic: raw.used_traffic.unwrap_or(0),
            data_limit: raw.data_limit.filter(|limit| *limit > 0),
            subscription_url: raw.subscription_url.unwrap_or_default(),
            links: raw.links.unwrap_or_default(),
        }
    }
}

async fn api_error(context: &str, response: Response) -> PanelError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    PanelError::Api {
        status: Some(status.as_u16()),
        message: format!("{}: {} - {}", context, status, body.trim()),
    }
}

impl PanelClient {
    pub fn new(config: &PanelConfig) -> Result<Self, PanelError> {
        let http = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            token_ttl: config.token_ttl(),
            token: RwLock::new(None),
            inbounds: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn user_path(username: &str) -> String {
        format!("/api/user/{}", urlencoding::encode(username))
    }

    /// Токен из кэша или новый обмен логина/пароля. Одновременные обновления
    /// допустимы: оба токена валидны, в кэше остаётся последний.
    async fn ensure_token(&self) -> Result<String, PanelError> {
        if let Some(cached) = self.token.read().await.as_ref()
            && Instant::now() < cached.expires_at
        {
            return Ok(cached.value.clone());
        }

        let response = self
            .http
            .post(self.url("/api/admin/token"))
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PanelError::Authentication(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PanelError::Authentication(format!(
                "панель ответила {}",
                response.status()
            )));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| PanelError::Authentication(format!("некорректный ответ: {}", e)))?
            .access_token;

        *self.token.write().await = Some(CachedToken {
            value: token.clone(),
            expires_at: Instant::now() + self.token_ttl,
        });
        tracing::info!("Obtained new panel API token");
        Ok(token)
    }

    async fn authorized(&self, method: Method, path: &str) -> Result<RequestBuilder, PanelError> {
        let token = self.ensure_token().await?;
        Ok(self
            .http
            .request(method, self.url(path))
            .bearer_auth(token))
    }

    pub async fn get_user(&self, username: &str) -> Result<PanelAccount, PanelError> {
        let response = self
            .authorized(Method::GET, &Self::user_path(username))
            .await?
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(PanelError::NotFound(username.to_string())),
            status if status.is_success() => {
                let raw = response.json::<RawAccount>().await?;
                Ok(raw.into())
            }
            _ => Err(api_error("Не удалось получить пользователя", response).await),
        }
    }

    /// Сырые записи пользователей и общее число по данным панели.
    pub async fn list_users(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<serde_json::Value>, i64), PanelError> {
        let response = self
            .authorized(Method::GET, "/api/users")
            .await?
            .query(&[("offset", offset), ("limit", limit)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error("Не удалось получить список пользователей", response).await);
        }
        let page = response.json::<UsersPage>().await?;
        Ok((page.users, page.total))
    }

    /// Inbound'ы панели: protocol -> теги. Запрашиваются один раз на экземпляр клиента.
    pub async fn get_inbounds(&self) -> Result<Inbounds, PanelError> {
        if let Some(cached) = self.inbounds.read().await.as_ref() {
            return Ok(cached.clone());
        }

        let response = self
            .authorized(Method::GET, "/api/inbounds")
            .await?
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error("Не удалось получить inbounds", response).await);
        }

        let raw = response.json::<HashMap<String, Vec<InboundEntry>>>().await?;
        let inbounds: Inbounds = raw
            .into_iter()
            .map(|(protocol, entries)| {
                (
                    protocol,
                    entries.into_iter().map(|entry| entry.tag).collect(),
                )
            })
            .collect();

        tracing::info!(protocols = inbounds.len(), "Cached panel inbounds");
        *self.inbounds.write().await = Some(inbounds.clone());
        Ok(inbounds)
    }

    pub async fn create_user(&self, user: &NewPanelUser) -> Result<PanelAccount, PanelError> {
        let inbounds = match user.inbounds.clone() {
            Some(inbounds) => inbounds,
            None => self.get_inbounds().await?,
        };

        let payload = UserPayload {
            username: Some(&user.username),
            status: Some(user.status),
            data_limit: user.data_limit.unwrap_or(0),
            data_limit_reset_strategy: "no_reset",
            expire: user.expire.unwrap_or(0),
            inbounds: Some(&inbounds),
            note: user.note.as_deref(),
        };
        tracing::info!(
            panel_username = %user.username,
            status = user.status.as_str(),
            data_limit = payload.data_limit,
            expire = payload.expire,
            protocols = inbounds.len(),
            "Creating panel user"
        );

        let response = self
            .authorized(Method::POST, "/api/user")
            .await?
            .json(&payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT => Err(PanelError::Conflict(user.username.clone())),
            status if status.is_success() => {
                let raw = response.json::<RawAccount>().await?;
                tracing::info!(panel_username = %user.username, "Created panel user");
                Ok(raw.into())
            }
            _ => Err(api_error("Не удалось создать пользователя", response).await),
        }
    }

    /// Read-modify-write: незаданные поля берутся из текущего состояния аккаунта.
    pub async fn modify_user(
        &self,
        username: &str,
        patch: &PanelUserPatch,
    ) -> Result<PanelAccount, PanelError> {
        let current = self.get_user(username).await?;

        let status = patch
            .status
            .or(Some(current.status))
            .filter(|status| *status != PanelUserStatus::Unknown);
        let payload = UserPayload {
            username: None,
            status,
            data_limit: patch.data_limit.or(current.data_limit).unwrap_or(0),
            data_limit_reset_strategy: "no_reset",
            expire: patch
                .expire
                .or(current.expire.map(|expire| expire.timestamp()))
                .unwrap_or(0),
            inbounds: None,
            note: None,
        };

        let response = self
            .authorized(Method::PUT, &Self::user_path(username))
            .await?
            .json(&payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(PanelError::NotFound(username.to_string())),
            status if status.is_success() => {
                let raw = response.json::<RawAccount>().await?;
                tracing::info!(
                    panel_username = %username,
                    status = ?payload.status,
                    "Modified panel user"
                );
                Ok(raw.into())
            }
            _ => Err(api_error("Не удалось изменить пользователя", response).await),
        }
    }

    /// Ищет пользователя, при отсутствии создаёт. Если создание проиграло гонку (409),
    /// один раз перечитывает аккаунт. Второй элемент: был ли аккаунт создан этим вызовом.
    pub async fn get_or_create_user(
        &self,
        user: &NewPanelUser,
    ) -> Result<(PanelAccount, bool), PanelError> {
        match self.get_user(&user.username).await {
            Ok(account) => Ok((account, false)),
            Err(PanelError::NotFound(_)) => match self.create_user(user).await {
                Ok(account) => Ok((account, true)),
                Err(PanelError::Conflict(_)) => {
                    tracing::warn!(
                        panel_username = %user.username,
                        "Panel user already exists (race), fetching"
                    );
                    let account = self.get_user(&user.username).await?;
                    Ok((account, false))
                }
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    pub async fn check_connection(&self) -> bool {
        match self.ensure_token().await {
            Ok(_) => true,
            Err(error) => {
                tracing::error!(error = %error, "Panel API connection check failed");
                false
            }
        }
    }
}
