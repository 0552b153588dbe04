use crate::bot::throttle::Throttle;
use crate::config::Config;
use crate::db::{Binding, BindingError, Db};
use crate::panel::PanelClient;
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::types::Message;
use tokio::sync::Mutex;

pub const MIN_PANEL_USERNAME_LEN: usize = 3;

#[derive(Clone)]
pub struct BotState {
    pub config: Arc<Config>,
    pub db: Arc<Db>,
    pub panel: Arc<PanelClient>,
    pub throttle: Arc<Throttle>,
    pub dialogs: Arc<Mutex<HashMap<i64, DialogState>>>,
}

/// Кто прислал апдейт: привязка (если есть) и итоговый флаг админа.
#[derive(Debug, Clone)]
pub struct Caller {
    pub telegram_id: i64,
    pub binding: Option<Binding>,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogState {
    AddAwaitTelegramId,
    AddAwaitUsername {
        telegram_id: i64,
    },
    AddConfirm {
        telegram_id: i64,
        panel_username: String,
        created_in_panel: bool,
    },
    SearchAwaitQuery,
}

/// Что делать с текстом, пришедшим в открытом диалоге.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogStep {
    Reprompt(&'static str),
    CheckTelegramId { telegram_id: i64 },
    CheckUsername {
        telegram_id: i64,
        panel_username: String,
    },
    RunSearch { query: String },
    AwaitingConfirmation,
}

impl DialogState {
    pub fn advance(&self, text: &str) -> DialogStep {
        let text = text.trim();
        match self {
            DialogState::AddAwaitTelegramId => match parse_telegram_id(text) {
                Some(telegram_id) => DialogStep::CheckTelegramId { telegram_id },
                None => DialogStep::Reprompt(
                    "❌ Telegram ID должен быть положительным числом. Попробуйте ещё раз:",
                ),
            },
            DialogState::AddAwaitUsername { telegram_id } => match validate_panel_username(text) {
                Some(panel_username) => DialogStep::CheckUsername {
                    telegram_id: *telegram_id,
                    panel_username,
                },
                None => DialogStep::Reprompt(
                    "❌ Username должен быть не короче 3 символов и без пробелов. Попробуйте ещё раз:",
                ),
            },
            DialogState::AddConfirm { .. } => DialogStep::AwaitingConfirmation,
            DialogState::SearchAwaitQuery => {
                if text.is_empty() {
                    DialogStep::Reprompt("Введите Telegram ID или часть username:")
                } else {
                    DialogStep::RunSearch {
                        query: text.to_string(),
                    }
                }
            }
        }
    }
}

pub fn parse_telegram_id(text: &str) -> Option<i64> {
    text.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

pub fn validate_panel_username(text: &str) -> Option<String> {
    let username = text.trim();
    if username.chars().count() < MIN_PANEL_USERNAME_LEN
        || username.chars().any(char::is_whitespace)
    {
        return None;
    }
    Some(username.to_string())
}

pub fn admin_panel_username(telegram_id: i64) -> String {
    format!("admin_{}", telegram_id)
}

pub fn caller_is_admin(binding: Option<&Binding>, allowlisted: bool) -> bool {
    allowlisted || binding.is_some_and(|binding| binding.is_admin)
}

pub fn sender_user_id(msg: &Message) -> Option<i64> {
    msg.from.as_ref().map(|user| user.id.0 as i64)
}

/// Админ из allowlist без привязки получает привязку `admin_<id>` при первом обращении.
pub async fn resolve_caller(state: &BotState, telegram_id: i64) -> Result<Caller, anyhow::Error> {
    let allowlisted = state.config.is_admin(telegram_id);
    let mut binding = state.db.find_by_telegram_id(telegram_id).await?;

    if binding.is_none() && allowlisted {
        let panel_username = admin_panel_username(telegram_id);
        match state
            .db
            .create_binding(telegram_id, &panel_username, true, None)
            .await
        {
            Ok(created) => {
                tracing::info!(
                    telegram_id = telegram_id,
                    panel_username = %panel_username,
                    "Auto-bound allow-listed admin"
                );
                binding = Some(created);
            }
            Err(BindingError::DuplicateTelegramBinding { .. }) => {
                binding = state.db.find_by_telegram_id(telegram_id).await?;
            }
            Err(error) => return Err(error.into()),
        }
    }

    Ok(Caller {
        telegram_id,
        is_admin: caller_is_admin(binding.as_ref(), allowlisted),
        binding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(is_admin: bool) -> Binding {
        Binding {
            id: 1,
            telegram_id: 10,
            panel_username: "alice".to_string(),
            is_admin,
            is_primary: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn add_dialog_walks_through_steps() {
        assert_eq!(
            DialogState::AddAwaitTelegramId.advance(" 12345 "),
            DialogStep::CheckTelegramId { telegram_id: 12345 }
        );
        assert_eq!(
            DialogState::AddAwaitUsername { telegram_id: 12345 }.advance("alice"),
            DialogStep::CheckUsername {
                telegram_id: 12345,
                panel_username: "alice".to_string()
            }
        );
        let confirm = DialogState::AddConfirm {
            telegram_id: 12345,
            panel_username: "alice".to_string(),
            created_in_panel: false,
        };
        assert_eq!(confirm.advance("yes"), DialogStep::AwaitingConfirmation);
    }

    #[test]
    fn add_dialog_reprompts_on_bad_input() {
        assert!(matches!(
            DialogState::AddAwaitTelegramId.advance("abc"),
            DialogStep::Reprompt(_)
        ));
        assert!(matches!(
            DialogState::AddAwaitTelegramId.advance("-5"),
            DialogStep::Reprompt(_)
        ));
        assert!(matches!(
            DialogState::AddAwaitUsername { telegram_id: 1 }.advance("ab"),
            DialogStep::Reprompt(_)
        ));
        assert!(matches!(
            DialogState::AddAwaitUsername { telegram_id: 1 }.advance("bad name"),
            DialogStep::Reprompt(_)
        ));
    }

    #[test]
    fn search_dialog_requires_non_empty_query() {
        assert!(matches!(
            DialogState::SearchAwaitQuery.advance("   "),
            DialogStep::Reprompt(_)
        ));
        assert_eq!(
            DialogState::SearchAwaitQuery.advance(" ali "),
            DialogStep::RunSearch {
                query: "ali".to_string()
            }
        );
    }

    #[test]
    fn admin_flag_comes_from_binding_or_allowlist() {
        assert!(caller_is_admin(None, true));
        assert!(caller_is_admin(Some(&binding(true)), false));
        assert!(!caller_is_admin(Some(&binding(false)), false));
        assert!(!caller_is_admin(None, false));
    }

    #[test]
    fn admin_username_uses_telegram_id() {
        assert_eq!(admin_panel_username(42), "admin_42");
    }
}
