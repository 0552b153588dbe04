use super::shared::{
    HandlerResult, admin_show_bindings_page, admin_show_logs_page, allow_callback_action,
    apply_status_change, ask_toggle_confirmation, callback_exact_filter, callback_message_target,
    callback_payload, callback_prefix_filter, finish_new_binding, parse_callback_page,
    parse_toggle_confirm, require_admin_callback, send_subscription, show_notification_settings,
    take_dialog,
};
use super::state::{BotState, resolve_caller};
use crate::bot::keyboards;
use crate::bot::throttle::{ACTION_SUBSCRIPTION, ACTION_TOGGLE};
use crate::db::{NOTIFY_EXPIRY, NOTIFY_STATUS, NOTIFY_TRAFFIC, NotificationSettingsUpdate};
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::InlineKeyboardMarkup;

pub fn handler() -> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    Update::filter_callback_query()
        .branch(
            dptree::filter_map(callback_prefix_filter("bindings_page:"))
                .endpoint(callback_bindings_page),
        )
        .branch(dptree::filter_map(callback_prefix_filter("logs_page:")).endpoint(callback_logs_page))
        .branch(dptree::filter_map(callback_prefix_filter("toggle:")).endpoint(callback_toggle))
        .branch(
            dptree::filter_map(callback_prefix_filter("toggle_ok:")).endpoint(callback_toggle_confirm),
        )
        .branch(dptree::filter_map(callback_exact_filter("add_ok")).endpoint(callback_add_confirm))
        .branch(dptree::filter_map(callback_exact_filter("cancel")).endpoint(callback_cancel))
        .branch(
            dptree::filter_map(callback_exact_filter("notify_settings"))
                .endpoint(callback_notify_settings),
        )
        .branch(
            dptree::filter_map(callback_prefix_filter("notify_toggle:"))
                .endpoint(callback_notify_toggle),
        )
        .branch(dptree::filter_map(callback_exact_filter("sub_refresh")).endpoint(callback_sub_refresh))
        .branch(dptree::filter_map(callback_exact_filter("noop")).endpoint(callback_noop))
}

async fn callback_bindings_page(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    if require_admin_callback(&bot, &q, &state).await?.is_none() {
        return Ok(());
    }

    let data = q.data.as_deref().unwrap_or("");
    let page = parse_callback_page(data, "bindings_page:")?;
    bot.answer_callback_query(q.id.clone()).await?;

    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        admin_show_bindings_page(&bot, chat_id, &state, page, Some(message_id)).await?;
    }
    Ok(())
}

async fn callback_logs_page(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    if require_admin_callback(&bot, &q, &state).await?.is_none() {
        return Ok(());
    }

    let data = q.data.as_deref().unwrap_or("");
    let page = parse_callback_page(data, "logs_page:")?;
    bot.answer_callback_query(q.id.clone()).await?;

    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        admin_show_logs_page(&bot, chat_id, &state, page, Some(message_id)).await?;
    }
    Ok(())
}

async fn callback_toggle(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    if require_admin_callback(&bot, &q, &state).await?.is_none() {
        return Ok(());
    }

    let data = q.data.as_deref().unwrap_or("");
    let panel_username = callback_payload(data, "toggle:")?;
    bot.answer_callback_query(q.id.clone()).await?;

    if let Some((chat_id, _)) = callback_message_target(&q) {
        ask_toggle_confirmation(&bot, chat_id, &state, panel_username).await?;
    }
    Ok(())
}

async fn callback_toggle_confirm(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(caller) = require_admin_callback(&bot, &q, &state).await? else {
        return Ok(());
    };
    if !allow_callback_action(&bot, &q, &state, ACTION_TOGGLE).await? {
        return Ok(());
    }

    let data = q.data.as_deref().unwrap_or("");
    let Some((target, panel_username)) = parse_toggle_confirm(callback_payload(data, "toggle_ok:")?)
    else {
        bot.answer_callback_query(q.id.clone())
            .text("Некорректная кнопка")
            .show_alert(true)
            .await?;
        return Ok(());
    };
    tracing::info!(
        admin_id = caller.telegram_id,
        panel_username = %panel_username,
        status = target.as_str(),
        "Toggle status callback received"
    );
    bot.answer_callback_query(q.id.clone()).text("Выполняю...").await?;

    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        apply_status_change(
            &bot,
            chat_id,
            Some(message_id),
            &state,
            caller.telegram_id,
            panel_username,
            target,
        )
        .await?;
    }
    Ok(())
}

async fn callback_add_confirm(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(caller) = require_admin_callback(&bot, &q, &state).await? else {
        return Ok(());
    };
    bot.answer_callback_query(q.id.clone()).await?;

    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        finish_new_binding(&bot, chat_id, Some(message_id), &state, caller.telegram_id).await?;
    }
    Ok(())
}

async fn callback_cancel(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let telegram_id = q.from.id.0 as i64;
    let caller = resolve_caller(&state, telegram_id).await?;
    take_dialog(&state, telegram_id).await;
    bot.answer_callback_query(q.id.clone()).text("Отменено").await?;

    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        bot.edit_message_text(chat_id, message_id, "❌ Операция отменена")
            .reply_markup(InlineKeyboardMarkup::default())
            .await?;
        let reply_markup = if caller.is_admin {
            keyboards::admin_menu()
        } else {
            keyboards::user_menu(false)
        };
        bot.send_message(chat_id, "Выберите действие в меню.")
            .reply_markup(reply_markup)
            .await?;
    }
    Ok(())
}

async fn callback_notify_settings(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    bot.answer_callback_query(q.id.clone()).await?;
    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        show_notification_settings(&bot, chat_id, q.from.id.0 as i64, &state, Some(message_id))
            .await?;
    }
    Ok(())
}

async fn callback_notify_toggle(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let telegram_id = q.from.id.0 as i64;
    let data = q.data.as_deref().unwrap_or("");
    let kind = callback_payload(data, "notify_toggle:")?;

    let current = state
        .db
        .get_or_create_notification_settings(telegram_id)
        .await?;
    let (update, enabled, title) = match kind {
        NOTIFY_EXPIRY => (
            NotificationSettingsUpdate {
                notify_expiry: Some(!current.notify_expiry),
                ..Default::default()
            },
            !current.notify_expiry,
            "об истечении",
        ),
        NOTIFY_TRAFFIC => (
            NotificationSettingsUpdate {
                notify_traffic: Some(!current.notify_traffic),
                ..Default::default()
            },
            !current.notify_traffic,
            "о трафике",
        ),
        NOTIFY_STATUS => (
            NotificationSettingsUpdate {
                notify_status: Some(!current.notify_status),
                ..Default::default()
            },
            !current.notify_status,
            "о статусе",
        ),
        _ => {
            bot.answer_callback_query(q.id.clone())
                .text("Неизвестный тип уведомлений")
                .await?;
            return Ok(());
        }
    };

    state
        .db
        .update_notification_settings(telegram_id, update)
        .await?;
    tracing::info!(
        telegram_id = telegram_id,
        kind = kind,
        enabled = enabled,
        "Notification setting toggled"
    );

    bot.answer_callback_query(q.id.clone())
        .text(format!(
            "Уведомления {} {}",
            title,
            if enabled { "включены" } else { "выключены" }
        ))
        .await?;
    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        show_notification_settings(&bot, chat_id, telegram_id, &state, Some(message_id)).await?;
    }
    Ok(())
}

async fn callback_sub_refresh(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    if !allow_callback_action(&bot, &q, &state, ACTION_SUBSCRIPTION).await? {
        return Ok(());
    }
    let caller = resolve_caller(&state, q.from.id.0 as i64).await?;
    bot.answer_callback_query(q.id.clone()).text("Обновлено").await?;

    if let Some((chat_id, message_id)) = callback_message_target(&q) {
        send_subscription(&bot, chat_id, &caller, &state, Some(message_id)).await?;
    }
    Ok(())
}

async fn callback_noop(bot: Bot, q: CallbackQuery) -> HandlerResult {
    bot.answer_callback_query(q.id.clone()).await?;
    Ok(())
}
