use super::format::usage_guide_text;
use super::shared::{
    HandlerResult, add_accept_telegram_id, admin_run_search, admin_show_bindings_page,
    admin_show_logs_page, admin_show_stats, allow_message_action, current_dialog, send_link,
    send_subscription, set_dialog, show_notification_settings, stage_new_binding, take_dialog,
};
use super::state::{BotState, Caller, DialogState, DialogStep, resolve_caller, sender_user_id};
use crate::bot::keyboards;
use crate::bot::throttle::{ACTION_LINK, ACTION_SEARCH, ACTION_SUBSCRIPTION};
use teloxide::prelude::*;

const MENU_BUTTONS: &[&str] = &[
    keyboards::BTN_SUBSCRIPTION,
    keyboards::BTN_LINK,
    keyboards::BTN_GUIDE,
    keyboards::BTN_SETTINGS,
    keyboards::BTN_ADMIN_PANEL,
    keyboards::BTN_ADMIN_ADD,
    keyboards::BTN_ADMIN_LIST,
    keyboards::BTN_ADMIN_SEARCH,
    keyboards::BTN_ADMIN_STATS,
    keyboards::BTN_ADMIN_LOGS,
    keyboards::BTN_ADMIN_BACK,
    keyboards::BTN_CANCEL,
];

pub async fn handle_menu_buttons(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    let caller = resolve_caller(&state, user_id).await?;
    let chat_id = msg.chat.id;

    if text == keyboards::BTN_CANCEL {
        return cancel_dialog(&bot, chat_id, &state, &caller).await;
    }

    // Кнопка меню прерывает открытый диалог.
    if MENU_BUTTONS.iter().any(|button| *button == text) {
        take_dialog(&state, user_id).await;
    } else if let Some(dialog) = current_dialog(&state, user_id).await {
        return handle_dialog_text(&bot, chat_id, &state, &caller, dialog, text).await;
    }

    let is_admin = caller.is_admin;
    match text {
        keyboards::BTN_SUBSCRIPTION => {
            if allow_message_action(&bot, chat_id, &state, user_id, ACTION_SUBSCRIPTION).await? {
                send_subscription(&bot, chat_id, &caller, &state, None).await?;
            }
        }
        keyboards::BTN_LINK => {
            if allow_message_action(&bot, chat_id, &state, user_id, ACTION_LINK).await? {
                send_link(&bot, chat_id, &caller, &state).await?;
            }
        }
        keyboards::BTN_GUIDE => {
            bot.send_message(chat_id, usage_guide_text())
                .reply_markup(keyboards::client_apps())
                .await?;
        }
        keyboards::BTN_SETTINGS => {
            show_notification_settings(&bot, chat_id, user_id, &state, None).await?;
        }
        keyboards::BTN_ADMIN_PANEL if is_admin => {
            bot.send_message(chat_id, "👑 Админ-панель. Выберите действие.")
                .reply_markup(keyboards::admin_menu())
                .await?;
        }
        keyboards::BTN_ADMIN_ADD if is_admin => {
            start_add_dialog(&bot, chat_id, &state, user_id).await?;
        }
        keyboards::BTN_ADMIN_LIST if is_admin => {
            admin_show_bindings_page(&bot, chat_id, &state, 1, None).await?;
        }
        keyboards::BTN_ADMIN_SEARCH if is_admin => {
            start_search_dialog(&bot, chat_id, &state, user_id).await?;
        }
        keyboards::BTN_ADMIN_STATS if is_admin => {
            admin_show_stats(&bot, chat_id, &state).await?;
        }
        keyboards::BTN_ADMIN_LOGS if is_admin => {
            admin_show_logs_page(&bot, chat_id, &state, 1, None).await?;
        }
        keyboards::BTN_ADMIN_BACK => {
            bot.send_message(chat_id, "👤 Пользовательское меню.")
                .reply_markup(keyboards::user_menu(is_admin))
                .await?;
        }
        _ => {
            let reply_markup = keyboards::user_menu(is_admin);
            bot.send_message(chat_id, "Не понял запрос. Используйте кнопки меню ниже.")
                .reply_markup(reply_markup)
                .await?;
        }
    }
    Ok(())
}

pub async fn start_add_dialog(bot: &Bot, chat_id: ChatId, state: &BotState, admin_id: i64) -> HandlerResult {
    set_dialog(state, admin_id, DialogState::AddAwaitTelegramId).await;
    bot.send_message(
        chat_id,
        "➕ Добавление привязки\n\nВведите Telegram ID пользователя:",
    )
    .reply_markup(keyboards::cancel_menu())
    .await?;
    Ok(())
}

pub async fn start_search_dialog(bot: &Bot, chat_id: ChatId, state: &BotState, admin_id: i64) -> HandlerResult {
    set_dialog(state, admin_id, DialogState::SearchAwaitQuery).await;
    bot.send_message(chat_id, "🔍 Введите Telegram ID или часть username:")
        .reply_markup(keyboards::cancel_menu())
        .await?;
    Ok(())
}

pub async fn cancel_dialog(bot: &Bot, chat_id: ChatId, state: &BotState, caller: &Caller) -> HandlerResult {
    let cancelled = take_dialog(state, caller.telegram_id).await.is_some();
    let text = if cancelled {
        "❌ Операция отменена"
    } else {
        "Нечего отменять."
    };
    let reply_markup = if caller.is_admin {
        keyboards::admin_menu()
    } else {
        keyboards::user_menu(false)
    };
    bot.send_message(chat_id, text)
        .reply_markup(reply_markup)
        .await?;
    Ok(())
}

async fn handle_dialog_text(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    caller: &Caller,
    dialog: DialogState,
    text: &str,
) -> HandlerResult {
    if !caller.is_admin {
        take_dialog(state, caller.telegram_id).await;
        return Ok(());
    }
    let admin_id = caller.telegram_id;

    match dialog.advance(text) {
        DialogStep::Reprompt(prompt) => {
            bot.send_message(chat_id, prompt)
                .reply_markup(keyboards::cancel_menu())
                .await?;
        }
        DialogStep::CheckTelegramId { telegram_id } => {
            if add_accept_telegram_id(bot, chat_id, state, admin_id, telegram_id).await? {
                set_dialog(state, admin_id, DialogState::AddAwaitUsername { telegram_id }).await;
                bot.send_message(
                    chat_id,
                    format!(
                        "✅ Telegram ID: {}\n\nТеперь введите username в панели (не короче 3 символов):",
                        telegram_id
                    ),
                )
                .reply_markup(keyboards::cancel_menu())
                .await?;
            }
        }
        DialogStep::CheckUsername {
            telegram_id,
            panel_username,
        } => {
            stage_new_binding(bot, chat_id, state, admin_id, telegram_id, panel_username).await?;
        }
        DialogStep::RunSearch { query } => {
            if allow_message_action(bot, chat_id, state, admin_id, ACTION_SEARCH).await? {
                take_dialog(state, admin_id).await;
                admin_run_search(bot, chat_id, state, &query).await?;
                bot.send_message(chat_id, "Админ-панель")
                    .reply_markup(keyboards::admin_menu())
                    .await?;
            }
        }
        DialogStep::AwaitingConfirmation => {
            bot.send_message(
                chat_id,
                "Подтвердите добавление кнопкой выше или нажмите «❌ Отмена».",
            )
            .await?;
        }
    }
    Ok(())
}
