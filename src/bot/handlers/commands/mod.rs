use super::menu::{cancel_dialog, start_add_dialog, start_search_dialog};
use super::shared::{
    HandlerResult, admin_run_search, admin_show_logs_page, allow_message_action,
    remove_binding_with_audit, reply_admin_only, send_link, send_subscription,
    set_admin_with_audit, stage_new_binding, take_dialog,
};
use super::format::bindings_overview;
use super::state::{
    BotState, Caller, parse_telegram_id, resolve_caller, sender_user_id, validate_panel_username,
};
use crate::bot::keyboards;
use crate::bot::throttle::{ACTION_LINK, ACTION_SEARCH, ACTION_SUBSCRIPTION};
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::command::BotCommands;
use teloxide::utils::html::escape;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
pub enum BotCommand {
    #[command(description = "Начать работу")]
    Start,
    #[command(description = "Справка")]
    Help,
    #[command(description = "Ссылка на подписку и QR-код")]
    Link,
    #[command(description = "Состояние подписки")]
    Sub,
    #[command(description = "Добавить привязку (админ)")]
    Add,
    #[command(description = "Удалить привязку (админ)")]
    Remove,
    #[command(rename = "make_admin", description = "Выдать права админа (админ)")]
    MakeAdmin,
    #[command(rename = "revoke_admin", description = "Снять права админа (админ)")]
    RevokeAdmin,
    #[command(description = "Поиск привязок (админ)")]
    Search,
    #[command(description = "Журнал действий (админ)")]
    Logs,
    #[command(description = "Отменить текущую операцию")]
    Cancel,
}

pub fn handler() -> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    teloxide::filter_command::<BotCommand, _>()
        .branch(dptree::case![BotCommand::Start].endpoint(cmd_start))
        .branch(dptree::case![BotCommand::Help].endpoint(cmd_help))
        .branch(dptree::case![BotCommand::Link].endpoint(cmd_link))
        .branch(dptree::case![BotCommand::Sub].endpoint(cmd_sub))
        .branch(dptree::case![BotCommand::Add].endpoint(cmd_add))
        .branch(dptree::case![BotCommand::Remove].endpoint(cmd_remove))
        .branch(dptree::case![BotCommand::MakeAdmin].endpoint(cmd_make_admin))
        .branch(dptree::case![BotCommand::RevokeAdmin].endpoint(cmd_revoke_admin))
        .branch(dptree::case![BotCommand::Search].endpoint(cmd_search))
        .branch(dptree::case![BotCommand::Logs].endpoint(cmd_logs))
        .branch(dptree::case![BotCommand::Cancel].endpoint(cmd_cancel))
}

fn command_args(msg: &Message) -> Vec<&str> {
    msg.text()
        .unwrap_or("")
        .split_whitespace()
        .skip(1)
        .collect()
}

async fn message_caller(msg: &Message, state: &BotState) -> Result<Option<Caller>, anyhow::Error> {
    let Some(user_id) = sender_user_id(msg) else {
        return Ok(None);
    };
    Ok(Some(resolve_caller(state, user_id).await?))
}

/// Вызывающий, если он админ; иначе отвечает отказом.
async fn admin_caller(bot: &Bot, msg: &Message, state: &BotState) -> Result<Option<Caller>, Box<dyn std::error::Error + Send + Sync>> {
    let Some(caller) = message_caller(msg, state).await? else {
        return Ok(None);
    };
    if !caller.is_admin {
        reply_admin_only(bot, msg.chat.id).await?;
        return Ok(None);
    }
    Ok(Some(caller))
}

async fn cmd_start(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(caller) = message_caller(&msg, &state).await? else {
        tracing::warn!("Received /start without sender");
        return Ok(());
    };
    tracing::info!(
        telegram_id = caller.telegram_id,
        bound = caller.binding.is_some(),
        is_admin = caller.is_admin,
        "Received /start command"
    );
    take_dialog(&state, caller.telegram_id).await;

    let text = match caller.binding.as_ref() {
        Some(binding) => format!(
            "👋 Добро пожаловать!\n\nВаш аккаунт: <code>{}</code>\nИспользуйте кнопки меню ниже.",
            escape(&binding.panel_username)
        ),
        None => format!(
            "👋 Добро пожаловать!\n\nУ вас пока нет привязанного аккаунта VPN.\n\
             Сообщите администратору ваш Telegram ID: <code>{}</code>",
            caller.telegram_id
        ),
    };
    bot.send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboards::user_menu(caller.is_admin))
        .await?;
    Ok(())
}

async fn cmd_help(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(caller) = message_caller(&msg, &state).await? else {
        return Ok(());
    };
    let mut text = String::from(
        "Команды:\n\
         /start — главное меню\n\
         /sub — состояние подписки\n\
         /link — ссылка на подписку и QR-код\n\
         /cancel — отменить текущую операцию",
    );
    if caller.is_admin {
        text.push_str(
            "\n\nДля администраторов:\n\
             /add <tg_id> <username> — добавить привязку\n\
             /remove <tg_id> — удалить привязку\n\
             /make_admin <tg_id> — выдать права админа\n\
             /revoke_admin <tg_id> — снять права админа\n\
             /search <запрос> — поиск по Telegram ID или username\n\
             /logs — журнал действий",
        );
    }
    bot.send_message(msg.chat.id, text)
        .reply_markup(keyboards::user_menu(caller.is_admin))
        .await?;
    Ok(())
}

async fn cmd_link(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(caller) = message_caller(&msg, &state).await? else {
        return Ok(());
    };
    tracing::info!(telegram_id = caller.telegram_id, "Received /link command");
    if allow_message_action(&bot, msg.chat.id, &state, caller.telegram_id, ACTION_LINK).await? {
        send_link(&bot, msg.chat.id, &caller, &state).await?;
    }
    Ok(())
}

async fn cmd_sub(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(caller) = message_caller(&msg, &state).await? else {
        return Ok(());
    };
    tracing::info!(telegram_id = caller.telegram_id, "Received /sub command");
    if allow_message_action(&bot, msg.chat.id, &state, caller.telegram_id, ACTION_SUBSCRIPTION).await? {
        send_subscription(&bot, msg.chat.id, &caller, &state, None).await?;
    }
    Ok(())
}

async fn cmd_add(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(caller) = admin_caller(&bot, &msg, &state).await? else {
        return Ok(());
    };

    let args = command_args(&msg);
    if args.is_empty() {
        return start_add_dialog(&bot, msg.chat.id, &state, caller.telegram_id).await;
    }

    let parsed = match args.as_slice() {
        [telegram_id, username] => parse_telegram_id(telegram_id).zip(validate_panel_username(username)),
        _ => None,
    };
    let Some((telegram_id, panel_username)) = parsed else {
        bot.send_message(
            msg.chat.id,
            "Использование: /add <telegram_id> <username>\nUsername не короче 3 символов.",
        )
        .await?;
        return Ok(());
    };
    tracing::info!(
        admin_id = caller.telegram_id,
        telegram_id = telegram_id,
        panel_username = %panel_username,
        "Admin command /add"
    );

    stage_new_binding(
        &bot,
        msg.chat.id,
        &state,
        caller.telegram_id,
        telegram_id,
        panel_username,
    )
    .await
}

async fn cmd_remove(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(caller) = admin_caller(&bot, &msg, &state).await? else {
        return Ok(());
    };
    let Some(telegram_id) = command_args(&msg).first().and_then(|arg| parse_telegram_id(arg)) else {
        bot.send_message(msg.chat.id, "Использование: /remove <telegram_id>")
            .await?;
        return Ok(());
    };
    tracing::info!(
        admin_id = caller.telegram_id,
        telegram_id = telegram_id,
        "Admin command /remove"
    );

    let text = match remove_binding_with_audit(&state, caller.telegram_id, telegram_id).await? {
        Some(removed) => {
            let remaining = state
                .db
                .list_bindings_for_panel_username(&removed.panel_username)
                .await?;
            format!(
                "🗑 Привязка <code>{}</code> удалена.\n\n{}",
                telegram_id,
                bindings_overview(&removed.panel_username, &remaining)
            )
        }
        None => format!("Привязка <code>{}</code> не найдена.", telegram_id),
    };
    bot.send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

async fn change_admin_flag(bot: Bot, msg: Message, state: BotState, is_admin: bool) -> HandlerResult {
    let Some(caller) = admin_caller(&bot, &msg, &state).await? else {
        return Ok(());
    };
    let Some(telegram_id) = command_args(&msg).first().and_then(|arg| parse_telegram_id(arg)) else {
        let usage = if is_admin {
            "Использование: /make_admin <telegram_id>"
        } else {
            "Использование: /revoke_admin <telegram_id>"
        };
        bot.send_message(msg.chat.id, usage).await?;
        return Ok(());
    };

    let text = match set_admin_with_audit(&state, caller.telegram_id, telegram_id, is_admin).await? {
        Some(binding) if is_admin => format!(
            "👑 {} (<code>{}</code>) теперь администратор.",
            telegram_id,
            escape(&binding.panel_username)
        ),
        Some(binding) => {
            let mut text = format!(
                "Права администратора сняты с {} (<code>{}</code>).",
                telegram_id,
                escape(&binding.panel_username)
            );
            if state.config.is_admin(telegram_id) {
                text.push_str("\nID остаётся в admin_ids конфига, права сохраняются.");
            }
            text
        }
        None => format!("Привязка <code>{}</code> не найдена.", telegram_id),
    };
    bot.send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

async fn cmd_make_admin(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    change_admin_flag(bot, msg, state, true).await
}

async fn cmd_revoke_admin(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    change_admin_flag(bot, msg, state, false).await
}

async fn cmd_search(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(caller) = admin_caller(&bot, &msg, &state).await? else {
        return Ok(());
    };
    let query = command_args(&msg).join(" ");
    if query.is_empty() {
        return start_search_dialog(&bot, msg.chat.id, &state, caller.telegram_id).await;
    }
    if allow_message_action(&bot, msg.chat.id, &state, caller.telegram_id, ACTION_SEARCH).await? {
        admin_run_search(&bot, msg.chat.id, &state, &query).await?;
    }
    Ok(())
}

async fn cmd_logs(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if admin_caller(&bot, &msg, &state).await?.is_none() {
        return Ok(());
    }
    admin_show_logs_page(&bot, msg.chat.id, &state, 1, None).await
}

async fn cmd_cancel(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(caller) = message_caller(&msg, &state).await? else {
        return Ok(());
    };
    cancel_dialog(&bot, msg.chat.id, &state, &caller).await
}
