//! Клавиатуры бота: inline и постоянные reply-кнопки.

use crate::db::{NotificationSettings, NOTIFY_EXPIRY, NOTIFY_STATUS, NOTIFY_TRAFFIC};
use crate::panel::PanelUserStatus;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup};

pub const BTN_SUBSCRIPTION: &str = "📊 Подписка";
pub const BTN_LINK: &str = "🔗 Ссылка";
pub const BTN_GUIDE: &str = "ℹ️ Инструкция";
pub const BTN_SETTINGS: &str = "⚙️ Настройки";
pub const BTN_ADMIN_PANEL: &str = "👑 Админ-панель";

pub const BTN_ADMIN_ADD: &str = "➕ Добавить";
pub const BTN_ADMIN_LIST: &str = "📋 Список";
pub const BTN_ADMIN_SEARCH: &str = "🔍 Найти";
pub const BTN_ADMIN_STATS: &str = "📈 Статистика";
pub const BTN_ADMIN_LOGS: &str = "📜 Журнал";
pub const BTN_ADMIN_BACK: &str = "👤 Мой аккаунт";

pub const BTN_CANCEL: &str = "❌ Отмена";

const CLIENT_APPS: &[(&str, &str)] = &[
    ("📱 V2Box (iOS/Android)", "https://t.me/v2box_bot"),
    (
        "💻 NekoBox (Windows/Mac/Linux)",
        "https://github.com/MatsuriDayo/nekoray/releases",
    ),
];

pub fn user_menu(is_admin: bool) -> KeyboardMarkup {
    let mut rows = vec![
        vec![
            KeyboardButton::new(BTN_SUBSCRIPTION),
            KeyboardButton::new(BTN_LINK),
        ],
        vec![
            KeyboardButton::new(BTN_GUIDE),
            KeyboardButton::new(BTN_SETTINGS),
        ],
    ];
    if is_admin {
        rows.push(vec![KeyboardButton::new(BTN_ADMIN_PANEL)]);
    }
    KeyboardMarkup::new(rows).resize_keyboard().persistent()
}

pub fn admin_menu() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![
            KeyboardButton::new(BTN_ADMIN_ADD),
            KeyboardButton::new(BTN_ADMIN_LIST),
        ],
        vec![
            KeyboardButton::new(BTN_ADMIN_SEARCH),
            KeyboardButton::new(BTN_ADMIN_STATS),
        ],
        vec![
            KeyboardButton::new(BTN_ADMIN_LOGS),
            KeyboardButton::new(BTN_ADMIN_BACK),
        ],
    ])
    .resize_keyboard()
    .persistent()
}

pub fn cancel_menu() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![vec![KeyboardButton::new(BTN_CANCEL)]]).resize_keyboard()
}

pub fn confirm_buttons(confirm_data: impl Into<String>) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default().append_row(vec![
        InlineKeyboardButton::callback("✅ Подтвердить", confirm_data.into()),
        InlineKeyboardButton::callback("❌ Отмена", "cancel"),
    ])
}

pub fn subscription_buttons() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default()
        .append_row(vec![InlineKeyboardButton::callback(
            "🔄 Обновить",
            "sub_refresh",
        )])
        .append_row(vec![InlineKeyboardButton::callback(
            "🔔 Настройки уведомлений",
            "notify_settings",
        )])
}

fn toggle_label(enabled: bool, title: &str) -> String {
    format!("{} {}", if enabled { "🔔" } else { "🔕" }, title)
}

pub fn notification_toggles(settings: &NotificationSettings) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default()
        .append_row(vec![InlineKeyboardButton::callback(
            toggle_label(settings.notify_expiry, "Истечение подписки"),
            format!("notify_toggle:{}", NOTIFY_EXPIRY),
        )])
        .append_row(vec![InlineKeyboardButton::callback(
            toggle_label(settings.notify_traffic, "Превышение трафика"),
            format!("notify_toggle:{}", NOTIFY_TRAFFIC),
        )])
        .append_row(vec![InlineKeyboardButton::callback(
            toggle_label(settings.notify_status, "Смена статуса"),
            format!("notify_toggle:{}", NOTIFY_STATUS),
        )])
}

pub fn client_apps() -> InlineKeyboardMarkup {
    CLIENT_APPS
        .iter()
        .filter_map(|(title, link)| {
            reqwest::Url::parse(link)
                .ok()
                .map(|url| InlineKeyboardButton::url(*title, url))
        })
        .fold(InlineKeyboardMarkup::default(), |markup, button| {
            markup.append_row(vec![button])
        })
}

/// Навигация по страницам (1-based). Пустая клавиатура, если страница одна.
pub fn pager(prefix: &str, page: i64, total_pages: i64) -> InlineKeyboardMarkup {
    let mut nav = Vec::with_capacity(3);
    if page > 1 {
        nav.push(InlineKeyboardButton::callback(
            "⬅️ Назад",
            format!("{}{}", prefix, page - 1),
        ));
    }
    if total_pages > 1 {
        nav.push(InlineKeyboardButton::callback(
            format!("{}/{}", page, total_pages),
            "noop",
        ));
    }
    if page < total_pages {
        nav.push(InlineKeyboardButton::callback(
            "Вперёд ➡️",
            format!("{}{}", prefix, page + 1),
        ));
    }

    if nav.len() > 1 {
        InlineKeyboardMarkup::default().append_row(nav)
    } else {
        InlineKeyboardMarkup::default()
    }
}

pub fn toggle_status_buttons(panel_usernames: &[String]) -> InlineKeyboardMarkup {
    panel_usernames
        .iter()
        .fold(InlineKeyboardMarkup::default(), |markup, username| {
            markup.append_row(vec![InlineKeyboardButton::callback(
                format!("🔄 Статус: {}", username),
                format!("toggle:{}", username),
            )])
        })
}

pub fn toggle_confirm_buttons(panel_username: &str, target: PanelUserStatus) -> InlineKeyboardMarkup {
    let label = match target {
        PanelUserStatus::Disabled => "⛔ Отключить",
        _ => "✅ Включить",
    };
    InlineKeyboardMarkup::default().append_row(vec![
        InlineKeyboardButton::callback(
            label,
            format!("toggle_ok:{}:{}", target.as_str(), panel_username),
        ),
        InlineKeyboardButton::callback("❌ Отмена", "cancel"),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callbacks(markup: &InlineKeyboardMarkup) -> Vec<String> {
        markup
            .inline_keyboard
            .iter()
            .flatten()
            .filter_map(|button| match &button.kind {
                teloxide::types::InlineKeyboardButtonKind::CallbackData(data) => {
                    Some(data.clone())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn pager_hides_navigation_for_single_page() {
        assert!(pager("bindings_page:", 1, 1).inline_keyboard.is_empty());
    }

    #[test]
    fn pager_links_neighbouring_pages() {
        assert_eq!(
            callbacks(&pager("bindings_page:", 2, 3)),
            vec!["bindings_page:1", "noop", "bindings_page:3"]
        );
        assert_eq!(callbacks(&pager("logs_page:", 1, 2)), vec!["noop", "logs_page:2"]);
    }

    #[test]
    fn toggle_confirm_encodes_target_status() {
        assert_eq!(
            callbacks(&toggle_confirm_buttons("alice", PanelUserStatus::Disabled)),
            vec!["toggle_ok:disabled:alice", "cancel"]
        );
    }

    #[test]
    fn user_menu_shows_admin_entry_only_for_admins() {
        assert_eq!(user_menu(false).keyboard.len(), 2);
        assert_eq!(user_menu(true).keyboard.len(), 3);
    }
}
