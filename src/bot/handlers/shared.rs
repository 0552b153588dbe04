use super::format::{
    action_log_line, binding_line, bindings_overview, notification_settings_text, stats_text,
    status_change_notice, status_label, subscription_text,
};
use super::state::{BotState, Caller, DialogState, resolve_caller};
use crate::bot::keyboards;
use crate::bot::throttle::wait_message;
use crate::db::{Binding, BindingError};
use crate::panel::{NewPanelUser, PanelError, PanelUserPatch, PanelUserStatus};
use anyhow::anyhow;
use chrono::{NaiveDate, Utc};
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use std::io::Cursor;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardMarkup, InputFile, MessageId, ParseMode};
use teloxide::utils::html::escape;

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub const ACTION_ADD_BINDING: &str = "add_binding";
pub const ACTION_REMOVE_BINDING: &str = "remove_binding";
pub const ACTION_TOGGLE_STATUS: &str = "toggle_status";
pub const ACTION_GRANT_ADMIN: &str = "grant_admin";
pub const ACTION_REVOKE_ADMIN: &str = "revoke_admin";

const NO_BINDING_TEXT: &str =
    "У вас нет привязанного аккаунта VPN. Обратитесь к администратору.";
const ADMIN_ONLY_TEXT: &str = "❌ Эта команда доступна только администраторам";
pub const SEARCH_RESULT_LIMIT: usize = 25;

pub fn callback_prefix_filter(prefix: &'static str) -> impl Fn(CallbackQuery) -> Option<CallbackQuery> {
    move |q: CallbackQuery| {
        if q.data.as_deref().is_some_and(|payload| payload.starts_with(prefix)) {
            Some(q)
        } else {
            None
        }
    }
}

pub fn callback_exact_filter(expected: &'static str) -> impl Fn(CallbackQuery) -> Option<CallbackQuery> {
    move |q: CallbackQuery| {
        if q.data.as_deref() == Some(expected) {
            Some(q)
        } else {
            None
        }
    }
}

pub fn callback_message_target(q: &CallbackQuery) -> Option<(ChatId, MessageId)> {
    q.message.as_ref().map(|msg| (msg.chat().id, msg.id()))
}

pub fn callback_payload<'a>(data: &'a str, prefix: &str) -> Result<&'a str, anyhow::Error> {
    data.strip_prefix(prefix)
        .filter(|payload| !payload.is_empty())
        .ok_or_else(|| anyhow!("Некорректный callback payload"))
}

pub fn parse_callback_page(data: &str, prefix: &str) -> Result<i64, anyhow::Error> {
    callback_payload(data, prefix)?
        .parse::<i64>()
        .map(|page| page.max(1))
        .map_err(|_| anyhow!("Некорректный номер страницы"))
}

/// `"<status>:<username>"` из кнопки подтверждения смены статуса.
pub fn parse_toggle_confirm(payload: &str) -> Option<(PanelUserStatus, &str)> {
    let (status, username) = payload.split_once(':')?;
    let status = PanelUserStatus::parse(status)?;
    if username.is_empty() {
        return None;
    }
    Some((status, username))
}

pub fn toggle_target(current: PanelUserStatus) -> PanelUserStatus {
    match current {
        PanelUserStatus::Active => PanelUserStatus::Disabled,
        _ => PanelUserStatus::Active,
    }
}

pub fn status_notification_key(status: PanelUserStatus, day: NaiveDate) -> String {
    format!("status_{}_{}", status.as_str(), day.format("%Y-%m-%d"))
}

pub fn total_pages(total: i64, page_size: i64) -> i64 {
    let page_size = page_size.max(1);
    ((total + page_size - 1) / page_size).max(1)
}

pub fn build_qr_png_bytes(payload: &str) -> Result<Vec<u8>, anyhow::Error> {
    let qr = QrCode::new(payload.as_bytes())?;
    let image = qr
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(512, 512)
        .build();
    let mut bytes = Vec::new();
    {
        let mut cursor = Cursor::new(&mut bytes);
        DynamicImage::ImageLuma8(image).write_to(&mut cursor, ImageFormat::Png)?;
    }
    Ok(bytes)
}

pub async fn set_dialog(state: &BotState, telegram_id: i64, dialog: DialogState) {
    state.dialogs.lock().await.insert(telegram_id, dialog);
}

pub async fn current_dialog(state: &BotState, telegram_id: i64) -> Option<DialogState> {
    state.dialogs.lock().await.get(&telegram_id).cloned()
}

pub async fn take_dialog(state: &BotState, telegram_id: i64) -> Option<DialogState> {
    state.dialogs.lock().await.remove(&telegram_id)
}

async fn send_html(bot: &Bot, chat_id: ChatId, text: String) -> Result<Message, teloxide::RequestError> {
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .await
}

async fn edit_or_send(
    bot: &Bot,
    chat_id: ChatId,
    message_id: Option<MessageId>,
    text: String,
    keyboard: InlineKeyboardMarkup,
) -> HandlerResult {
    if let Some(message_id) = message_id {
        let edited = bot
            .edit_message_text(chat_id, message_id, text)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard)
            .await;
        match edited {
            Ok(_) => {}
            Err(error) if is_message_not_modified(&error) => {
                tracing::debug!(chat_id = chat_id.0, "Message content unchanged, edit skipped");
            }
            Err(error) => return Err(error.into()),
        }
    } else {
        bot.send_message(chat_id, text)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard)
            .await?;
    }
    Ok(())
}

/// Telegram отвечает ошибкой, если новый текст и клавиатура совпадают с текущими.
pub fn is_message_not_modified(error: &teloxide::RequestError) -> bool {
    matches!(
        error,
        teloxide::RequestError::Api(teloxide::ApiError::MessageNotModified)
    )
}

pub async fn reply_admin_only(bot: &Bot, chat_id: ChatId) -> HandlerResult {
    bot.send_message(chat_id, ADMIN_ONLY_TEXT).await?;
    Ok(())
}

/// `true`, если действие разрешено; иначе пользователь получает подсказку подождать.
pub async fn allow_message_action(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    telegram_id: i64,
    action: &'static str,
) -> Result<bool, teloxide::RequestError> {
    match state.throttle.check(telegram_id, action) {
        Ok(()) => Ok(true),
        Err(wait) => {
            bot.send_message(chat_id, wait_message(wait)).await?;
            Ok(false)
        }
    }
}

pub async fn allow_callback_action(
    bot: &Bot,
    q: &CallbackQuery,
    state: &BotState,
    action: &'static str,
) -> Result<bool, teloxide::RequestError> {
    match state.throttle.check(q.from.id.0 as i64, action) {
        Ok(()) => Ok(true),
        Err(wait) => {
            bot.answer_callback_query(q.id.clone())
                .text(wait_message(wait))
                .show_alert(true)
                .await?;
            Ok(false)
        }
    }
}

pub async fn require_admin_callback(
    bot: &Bot,
    q: &CallbackQuery,
    state: &BotState,
) -> Result<Option<Caller>, anyhow::Error> {
    let caller = resolve_caller(state, q.from.id.0 as i64).await?;
    if !caller.is_admin {
        bot.answer_callback_query(q.id.clone())
            .text("Недостаточно прав")
            .show_alert(true)
            .await?;
        return Ok(None);
    }
    Ok(Some(caller))
}

pub async fn reply_panel_error(bot: &Bot, chat_id: ChatId, error: &PanelError) -> HandlerResult {
    let text = match error {
        PanelError::NotFound(username) => format!(
            "❌ Пользователь <code>{}</code> не найден в панели.",
            escape(username)
        ),
        PanelError::Conflict(username) => format!(
            "❌ Пользователь <code>{}</code> уже существует в панели.",
            escape(username)
        ),
        PanelError::Authentication(_) => {
            tracing::error!(error = %error, "Panel authentication failed");
            "⚠️ Панель недоступна: ошибка авторизации. Сообщите администратору.".to_string()
        }
        PanelError::Api { .. } => {
            tracing::error!(error = %error, "Panel request failed");
            "⚠️ Ошибка при обращении к панели. Попробуйте позже.".to_string()
        }
    };
    send_html(bot, chat_id, text).await?;
    Ok(())
}

pub async fn send_subscription(
    bot: &Bot,
    chat_id: ChatId,
    caller: &Caller,
    state: &BotState,
    message_id: Option<MessageId>,
) -> HandlerResult {
    let Some(binding) = caller.binding.as_ref() else {
        bot.send_message(chat_id, NO_BINDING_TEXT)
            .reply_markup(keyboards::user_menu(caller.is_admin))
            .await?;
        return Ok(());
    };

    let account = match state.panel.get_user(&binding.panel_username).await {
        Ok(account) => account,
        Err(error) => return reply_panel_error(bot, chat_id, &error).await,
    };
    edit_or_send(
        bot,
        chat_id,
        message_id,
        subscription_text(&account, Utc::now()),
        keyboards::subscription_buttons(),
    )
    .await
}

pub async fn send_link(bot: &Bot, chat_id: ChatId, caller: &Caller, state: &BotState) -> HandlerResult {
    let Some(binding) = caller.binding.as_ref() else {
        bot.send_message(chat_id, NO_BINDING_TEXT)
            .reply_markup(keyboards::user_menu(caller.is_admin))
            .await?;
        return Ok(());
    };

    let account = match state.panel.get_user(&binding.panel_username).await {
        Ok(account) => account,
        Err(error) => return reply_panel_error(bot, chat_id, &error).await,
    };

    let link = if account.subscription_url.is_empty() {
        account.links.first().cloned().unwrap_or_default()
    } else {
        account.subscription_url.clone()
    };
    if link.is_empty() {
        bot.send_message(chat_id, "Ссылка на подписку пока недоступна. Обратитесь к администратору.")
            .await?;
        return Ok(());
    }

    send_html(
        bot,
        chat_id,
        format!(
            "🔗 Ваша ссылка на подписку:\n\n<code>{}</code>\n\nИмпортируйте её в VPN-клиент.",
            escape(&link)
        ),
    )
    .await?;

    match build_qr_png_bytes(&link) {
        Ok(qr_png) => {
            bot.send_photo(
                chat_id,
                InputFile::memory(qr_png).file_name(format!("vpn-{}.png", account.username)),
            )
            .caption("QR-код для импорта подписки")
            .await?;
        }
        Err(error) => {
            tracing::warn!(
                panel_username = %account.username,
                error = %error,
                "Failed to render subscription QR"
            );
        }
    }
    Ok(())
}

pub async fn show_notification_settings(
    bot: &Bot,
    chat_id: ChatId,
    telegram_id: i64,
    state: &BotState,
    message_id: Option<MessageId>,
) -> HandlerResult {
    let settings = state
        .db
        .get_or_create_notification_settings(telegram_id)
        .await?;
    edit_or_send(
        bot,
        chat_id,
        message_id,
        notification_settings_text(&settings),
        keyboards::notification_toggles(&settings),
    )
    .await
}

pub async fn admin_show_bindings_page(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    requested_page: i64,
    message_id: Option<MessageId>,
) -> HandlerResult {
    let page_size = state.config.users_page_size.max(1);
    let (_, total) = state.db.list_bindings(0, 1, false).await?;
    if total <= 0 {
        return edit_or_send(
            bot,
            chat_id,
            message_id,
            "Привязок пока нет.".to_string(),
            InlineKeyboardMarkup::default(),
        )
        .await;
    }

    let total_pages = total_pages(total, page_size);
    let page = requested_page.clamp(1, total_pages);
    let (bindings, total) = state
        .db
        .list_bindings((page - 1) * page_size, page_size, false)
        .await?;

    let lines: Vec<String> = bindings.iter().map(binding_line).collect();
    let text = format!(
        "📋 Привязки\nВсего: {}\nСтраница: {}/{}\n\n{}",
        total,
        page,
        total_pages,
        lines.join("\n")
    );
    edit_or_send(
        bot,
        chat_id,
        message_id,
        text,
        keyboards::pager("bindings_page:", page, total_pages),
    )
    .await
}

pub async fn admin_show_logs_page(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    requested_page: i64,
    message_id: Option<MessageId>,
) -> HandlerResult {
    let page_size = state.config.users_page_size.max(1);
    let (_, total) = state.db.list_admin_actions(0, 1).await?;
    if total <= 0 {
        return edit_or_send(
            bot,
            chat_id,
            message_id,
            "Журнал действий пуст.".to_string(),
            InlineKeyboardMarkup::default(),
        )
        .await;
    }

    let total_pages = total_pages(total, page_size);
    let page = requested_page.clamp(1, total_pages);
    let (entries, total) = state
        .db
        .list_admin_actions((page - 1) * page_size, page_size)
        .await?;

    let lines: Vec<String> = entries.iter().map(action_log_line).collect();
    let text = format!(
        "📜 Журнал действий\nВсего: {}\nСтраница: {}/{}\n\n{}",
        total,
        page,
        total_pages,
        lines.join("\n")
    );
    edit_or_send(
        bot,
        chat_id,
        message_id,
        text,
        keyboards::pager("logs_page:", page, total_pages),
    )
    .await
}

pub async fn admin_show_stats(bot: &Bot, chat_id: ChatId, state: &BotState) -> HandlerResult {
    let stats = state.db.binding_stats().await?;
    let panel_total = match state.panel.list_users(0, 1).await {
        Ok((_, total)) => Some(total),
        Err(error) => {
            tracing::warn!(error = %error, "Failed to fetch panel user count");
            None
        }
    };
    bot.send_message(chat_id, stats_text(&stats, panel_total))
        .reply_markup(keyboards::admin_menu())
        .await?;
    Ok(())
}

pub async fn admin_run_search(bot: &Bot, chat_id: ChatId, state: &BotState, query: &str) -> HandlerResult {
    let results = state.db.search_bindings(query).await?;
    tracing::info!(query = %query, found = results.len(), "Binding search");

    if results.is_empty() {
        send_html(
            bot,
            chat_id,
            format!("❌ По запросу <code>{}</code> ничего не найдено.", escape(query)),
        )
        .await?;
        return Ok(());
    }

    let (text, usernames) = search_results_view(&results);
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboards::toggle_status_buttons(&usernames))
        .await?;
    Ok(())
}

/// Текст результатов поиска и имена для кнопок смены статуса.
/// Показывается не больше `SEARCH_RESULT_LIMIT` привязок.
pub fn search_results_view(results: &[Binding]) -> (String, Vec<String>) {
    let shown = &results[..results.len().min(SEARCH_RESULT_LIMIT)];
    let mut usernames: Vec<String> = Vec::new();
    for binding in shown {
        if !usernames.contains(&binding.panel_username) {
            usernames.push(binding.panel_username.clone());
        }
    }

    let lines: Vec<String> = shown.iter().map(binding_line).collect();
    let mut text = format!("🔍 Найдено: {}", results.len());
    if shown.len() < results.len() {
        text.push_str(&format!(
            " (показано {} из {}, уточните запрос)",
            shown.len(),
            results.len()
        ));
    }
    text.push_str(&format!(
        "\n\n{}\n\nНажмите кнопку, чтобы сменить статус в панели.",
        lines.join("\n")
    ));
    (text, usernames)
}

/// Шаг «Telegram ID» диалога добавления. `false`, если ID уже привязан и диалог закрыт.
pub async fn add_accept_telegram_id(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    admin_id: i64,
    telegram_id: i64,
) -> Result<bool, anyhow::Error> {
    if let Some(existing) = state.db.find_by_telegram_id(telegram_id).await? {
        take_dialog(state, admin_id).await;
        bot.send_message(
            chat_id,
            format!(
                "❌ Telegram ID <code>{}</code> уже привязан к <code>{}</code>.",
                telegram_id,
                escape(&existing.panel_username)
            ),
        )
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboards::admin_menu())
        .await?;
        return Ok(false);
    }
    Ok(true)
}

/// Находит или создаёт аккаунт в панели и ставит диалог на подтверждение.
pub async fn stage_new_binding(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    admin_id: i64,
    telegram_id: i64,
    panel_username: String,
) -> HandlerResult {
    if !add_accept_telegram_id(bot, chat_id, state, admin_id, telegram_id).await? {
        return Ok(());
    }

    let request = NewPanelUser::new(panel_username.as_str())
        .with_note(format!("Created via bot for TG user {}", telegram_id));
    let (account, created_in_panel) = match state.panel.get_or_create_user(&request).await {
        Ok(result) => result,
        Err(error) => {
            set_dialog(state, admin_id, DialogState::AddAwaitUsername { telegram_id }).await;
            reply_panel_error(bot, chat_id, &error).await?;
            bot.send_message(chat_id, "Введите другой username или нажмите «❌ Отмена».")
                .reply_markup(keyboards::cancel_menu())
                .await?;
            return Ok(());
        }
    };
    if created_in_panel {
        tracing::info!(
            admin_id = admin_id,
            panel_username = %panel_username,
            "Panel user created during add dialog"
        );
    }

    let role_line = match state.db.find_by_panel_username(&panel_username, true).await? {
        Some(primary) => format!(
            "Основная привязка у <code>{}</code>, новая будет дополнительной.",
            primary.telegram_id
        ),
        None => "Привязка станет основной (⭐️).".to_string(),
    };

    let text = format!(
        "✅ <b>Подтвердите добавление</b>\n\n\
         Telegram ID: <code>{}</code>\n\
         Username: <code>{}</code>\n\
         Панель: {} (статус: {})\n\
         {}",
        telegram_id,
        escape(&panel_username),
        if created_in_panel { "аккаунт создан" } else { "аккаунт найден" },
        status_label(account.status),
        role_line
    );

    set_dialog(
        state,
        admin_id,
        DialogState::AddConfirm {
            telegram_id,
            panel_username,
            created_in_panel,
        },
    )
    .await;
    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboards::confirm_buttons("add_ok"))
        .await?;
    Ok(())
}

pub async fn create_binding_with_audit(
    state: &BotState,
    admin_id: i64,
    telegram_id: i64,
    panel_username: &str,
) -> Result<Binding, BindingError> {
    let binding = state
        .db
        .create_binding(telegram_id, panel_username, false, None)
        .await?;
    state
        .db
        .record_admin_action(
            admin_id,
            ACTION_ADD_BINDING,
            Some(panel_username),
            Some(&format!(
                "telegram_id: {}, primary: {}",
                telegram_id, binding.is_primary
            )),
        )
        .await?;
    tracing::info!(
        admin_id = admin_id,
        telegram_id = telegram_id,
        panel_username = %panel_username,
        is_primary = binding.is_primary,
        "Binding added"
    );
    Ok(binding)
}

/// Завершает диалог добавления по нажатию «Подтвердить».
pub async fn finish_new_binding(
    bot: &Bot,
    chat_id: ChatId,
    message_id: Option<MessageId>,
    state: &BotState,
    admin_id: i64,
) -> HandlerResult {
    let Some(DialogState::AddConfirm {
        telegram_id,
        panel_username,
        created_in_panel,
    }) = take_dialog(state, admin_id).await
    else {
        edit_or_send(
            bot,
            chat_id,
            message_id,
            "Нет добавления, ожидающего подтверждения.".to_string(),
            InlineKeyboardMarkup::default(),
        )
        .await?;
        return Ok(());
    };

    tracing::info!(
        admin_id = admin_id,
        telegram_id = telegram_id,
        panel_username = %panel_username,
        created_in_panel = created_in_panel,
        "Add binding confirmed"
    );
    let text = match create_binding_with_audit(state, admin_id, telegram_id, &panel_username).await {
        Ok(_) => {
            let bindings = state
                .db
                .list_bindings_for_panel_username(&panel_username)
                .await?;
            format!(
                "✅ <b>Привязка добавлена</b>\n\n{}\n\nПользователь может начать работу с ботом командой /start",
                bindings_overview(&panel_username, &bindings)
            )
        }
        Err(BindingError::DuplicateTelegramBinding {
            telegram_id,
            panel_username: existing,
        }) => format!(
            "❌ Telegram ID <code>{}</code> уже привязан к <code>{}</code>.",
            telegram_id,
            escape(&existing)
        ),
        Err(error) => return Err(error.into()),
    };

    edit_or_send(
        bot,
        chat_id,
        message_id,
        text,
        InlineKeyboardMarkup::default(),
    )
    .await?;
    bot.send_message(chat_id, "Админ-панель")
        .reply_markup(keyboards::admin_menu())
        .await?;
    Ok(())
}

pub async fn remove_binding_with_audit(
    state: &BotState,
    admin_id: i64,
    telegram_id: i64,
) -> Result<Option<Binding>, anyhow::Error> {
    let Some(binding) = state.db.find_by_telegram_id(telegram_id).await? else {
        return Ok(None);
    };
    if !state.db.delete_binding(telegram_id).await? {
        return Ok(None);
    }
    state
        .db
        .record_admin_action(
            admin_id,
            ACTION_REMOVE_BINDING,
            Some(&binding.panel_username),
            Some(&format!(
                "telegram_id: {}, was_primary: {}",
                telegram_id, binding.is_primary
            )),
        )
        .await?;
    tracing::info!(
        admin_id = admin_id,
        telegram_id = telegram_id,
        panel_username = %binding.panel_username,
        "Binding removed"
    );
    Ok(Some(binding))
}

pub async fn set_admin_with_audit(
    state: &BotState,
    admin_id: i64,
    telegram_id: i64,
    is_admin: bool,
) -> Result<Option<Binding>, anyhow::Error> {
    let Some(binding) = state.db.set_admin_flag(telegram_id, is_admin).await? else {
        return Ok(None);
    };
    let action = if is_admin {
        ACTION_GRANT_ADMIN
    } else {
        ACTION_REVOKE_ADMIN
    };
    state
        .db
        .record_admin_action(
            admin_id,
            action,
            Some(&binding.panel_username),
            Some(&format!("telegram_id: {}", telegram_id)),
        )
        .await?;
    tracing::info!(
        admin_id = admin_id,
        telegram_id = telegram_id,
        is_admin = is_admin,
        "Admin flag changed"
    );
    Ok(Some(binding))
}

/// Показывает подтверждение смены статуса для аккаунта панели.
pub async fn ask_toggle_confirmation(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    panel_username: &str,
) -> HandlerResult {
    let account = match state.panel.get_user(panel_username).await {
        Ok(account) => account,
        Err(error) => return reply_panel_error(bot, chat_id, &error).await,
    };
    let target = toggle_target(account.status);
    bot.send_message(
        chat_id,
        format!(
            "Сменить статус <code>{}</code>?\n\n{} → <b>{}</b>",
            escape(panel_username),
            status_label(account.status),
            status_label(target)
        ),
    )
    .parse_mode(ParseMode::Html)
    .reply_markup(keyboards::toggle_confirm_buttons(panel_username, target))
    .await?;
    Ok(())
}

pub async fn apply_status_change(
    bot: &Bot,
    chat_id: ChatId,
    message_id: Option<MessageId>,
    state: &BotState,
    admin_id: i64,
    panel_username: &str,
    target: PanelUserStatus,
) -> HandlerResult {
    let patch = PanelUserPatch {
        status: Some(target),
        ..Default::default()
    };
    let account = match state.panel.modify_user(panel_username, &patch).await {
        Ok(account) => account,
        Err(error) => return reply_panel_error(bot, chat_id, &error).await,
    };

    state
        .db
        .record_admin_action(
            admin_id,
            ACTION_TOGGLE_STATUS,
            Some(panel_username),
            Some(&format!("status: {}", target.as_str())),
        )
        .await?;
    tracing::info!(
        admin_id = admin_id,
        panel_username = %panel_username,
        status = target.as_str(),
        "Panel user status changed"
    );

    let notified = notify_status_change(bot, state, panel_username, target).await;
    edit_or_send(
        bot,
        chat_id,
        message_id,
        format!(
            "✅ Статус <code>{}</code>: <b>{}</b>\nУведомлено пользователей: {}",
            escape(&account.username),
            status_label(account.status),
            notified
        ),
        InlineKeyboardMarkup::default(),
    )
    .await
}

/// Рассылает уведомление о смене статуса всем привязкам аккаунта, у кого оно включено.
/// Одно уведомление одного типа в сутки; ошибки доставки только логируются.
pub async fn notify_status_change(
    bot: &Bot,
    state: &BotState,
    panel_username: &str,
    status: PanelUserStatus,
) -> usize {
    let bindings = match state
        .db
        .list_bindings_for_panel_username(panel_username)
        .await
    {
        Ok(bindings) => bindings,
        Err(error) => {
            tracing::warn!(
                panel_username = %panel_username,
                error = %error,
                "Failed to load bindings for status notification"
            );
            return 0;
        }
    };

    let key = status_notification_key(status, Utc::now().date_naive());
    let text = status_change_notice(panel_username, status);
    let mut delivered = 0;

    for binding in bindings {
        match should_notify_status(state, binding.telegram_id, &key).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(error) => {
                tracing::warn!(
                    telegram_id = binding.telegram_id,
                    error = %error,
                    "Failed to check notification settings"
                );
                continue;
            }
        }

        if let Err(error) = send_html(bot, ChatId(binding.telegram_id), text.clone()).await {
            tracing::warn!(
                telegram_id = binding.telegram_id,
                error = %error,
                "Не удалось отправить уведомление о смене статуса"
            );
            continue;
        }
        delivered += 1;

        if let Err(error) = state
            .db
            .mark_notification_sent(binding.telegram_id, crate::db::NOTIFY_STATUS, &key)
            .await
        {
            tracing::warn!(
                telegram_id = binding.telegram_id,
                error = %error,
                "Failed to record sent notification"
            );
        }
    }
    delivered
}

async fn should_notify_status(
    state: &BotState,
    telegram_id: i64,
    key: &str,
) -> Result<bool, anyhow::Error> {
    let settings = state
        .db
        .get_or_create_notification_settings(telegram_id)
        .await?;
    if !settings.notify_status {
        return Ok(false);
    }
    let already_sent = state
        .db
        .has_notification_been_sent(telegram_id, crate::db::NOTIFY_STATUS, key)
        .await?;
    Ok(!already_sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_flips_active_and_reactivates_everything_else() {
        assert_eq!(toggle_target(PanelUserStatus::Active), PanelUserStatus::Disabled);
        assert_eq!(toggle_target(PanelUserStatus::Disabled), PanelUserStatus::Active);
        assert_eq!(toggle_target(PanelUserStatus::Expired), PanelUserStatus::Active);
        assert_eq!(toggle_target(PanelUserStatus::OnHold), PanelUserStatus::Active);
    }

    #[test]
    fn toggle_confirm_payload_round_trips_through_keyboard() {
        assert_eq!(
            parse_toggle_confirm("disabled:alice"),
            Some((PanelUserStatus::Disabled, "alice"))
        );
        assert_eq!(
            parse_toggle_confirm("active:user:with:colons"),
            Some((PanelUserStatus::Active, "user:with:colons"))
        );
        assert_eq!(parse_toggle_confirm("bogus:alice"), None);
        assert_eq!(parse_toggle_confirm("active:"), None);
    }

    #[test]
    fn notification_key_is_per_status_and_day() {
        let day = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        assert_eq!(
            status_notification_key(PanelUserStatus::Disabled, day),
            "status_disabled_2026-10-16"
        );
    }

    #[test]
    fn page_math() {
        assert_eq!(total_pages(0, 10), 1);
        assert_eq!(total_pages(10, 10), 1);
        assert_eq!(total_pages(11, 10), 2);
        assert_eq!(parse_callback_page("bindings_page:0", "bindings_page:").unwrap(), 1);
        assert!(parse_callback_page("bindings_page:x", "bindings_page:").is_err());
        assert!(callback_payload("toggle:", "toggle:").is_err());
    }

    fn binding(id: i64, panel_username: &str) -> Binding {
        Binding {
            id,
            telegram_id: 1000 + id,
            panel_username: panel_username.to_string(),
            is_admin: false,
            is_primary: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn broad_search_is_truncated_to_fit_one_message() {
        let results: Vec<Binding> = (0..150)
            .map(|i| binding(i, &format!("user_{:03}", i)))
            .collect();

        let (text, usernames) = search_results_view(&results);
        assert!(text.starts_with("🔍 Найдено: 150 (показано 25 из 150"));
        assert_eq!(text.matches("<code>user_").count(), SEARCH_RESULT_LIMIT);
        assert!(text.chars().count() < 4096);
        assert_eq!(usernames.len(), SEARCH_RESULT_LIMIT);
        assert_eq!(usernames[0], "user_000");
    }

    #[test]
    fn small_search_lists_everything_once_per_username() {
        let results = vec![binding(1, "alice"), binding(2, "alice"), binding(3, "bob")];
        let (text, usernames) = search_results_view(&results);
        assert!(text.starts_with("🔍 Найдено: 3\n\n"));
        assert!(!text.contains("показано"));
        assert_eq!(usernames, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn unchanged_edit_is_recognised() {
        assert!(is_message_not_modified(&teloxide::RequestError::Api(
            teloxide::ApiError::MessageNotModified
        )));
        assert!(!is_message_not_modified(&teloxide::RequestError::Api(
            teloxide::ApiError::MessageToEditNotFound
        )));
    }

    #[test]
    fn qr_is_png() {
        let bytes = build_qr_png_bytes("https://panel.example.com/sub/abc").unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }
}
