use crate::db::{AdminActionLog, Binding, BindingStats, NotificationSettings};
use crate::panel::{PanelAccount, PanelUserStatus};
use chrono::{DateTime, Datelike, Local, Utc};
use teloxide::utils::html::escape;

const SECONDS_PER_DAY: i64 = 86_400;
const PROGRESS_BAR_LEN: u64 = 10;
const EXPIRY_WARNING_DAYS: i64 = 7;

const MONTHS_RU: [&str; 12] = [
    "января",
    "февраля",
    "марта",
    "апреля",
    "мая",
    "июня",
    "июля",
    "августа",
    "сентября",
    "октября",
    "ноября",
    "декабря",
];

pub fn format_bytes(bytes: Option<u64>) -> String {
    let Some(bytes) = bytes else {
        return "∞".to_string();
    };
    if bytes == 0 {
        return "0 B".to_string();
    }

    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

pub fn progress_bar(current: u64, total: u64) -> String {
    let percent = if total == 0 {
        0
    } else {
        ((current as u128 * 100) / total as u128).min(100) as u64
    };
    let filled = (percent * PROGRESS_BAR_LEN / 100) as usize;
    let empty = PROGRESS_BAR_LEN as usize - filled;
    format!("[{}{}] {}%", "█".repeat(filled), "░".repeat(empty), percent)
}

pub fn status_emoji(account: &PanelAccount, now: DateTime<Utc>) -> &'static str {
    match account.status {
        PanelUserStatus::Disabled => return "⚫",
        PanelUserStatus::Expired | PanelUserStatus::Limited => return "🔴",
        _ => {}
    }

    if let Some(expire) = account.expire {
        if expire < now {
            return "🔴";
        }
        if (expire - now).num_seconds() / SECONDS_PER_DAY <= EXPIRY_WARNING_DAYS {
            return "🟡";
        }
    }

    if let Some(limit) = account.data_limit
        && account.used_traffic as u128 * 10 >= limit as u128 * 9
    {
        return "🟡";
    }

    "🟢"
}

pub fn status_label(status: PanelUserStatus) -> &'static str {
    match status {
        PanelUserStatus::Active => "Активна",
        PanelUserStatus::Disabled => "Отключена",
        PanelUserStatus::Limited => "Ограничена",
        PanelUserStatus::Expired => "Истекла",
        PanelUserStatus::OnHold => "Ожидает активации",
        PanelUserStatus::Unknown => "Неизвестно",
    }
}

pub fn format_date_relative(target: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(target) = target else {
        return "бессрочно".to_string();
    };

    let local = target.with_timezone(&Local);
    let date = format!(
        "{} {} {}",
        local.day(),
        MONTHS_RU[local.month0() as usize],
        local.year()
    );

    let seconds = (target - now).num_seconds();
    if seconds < 0 {
        let days_ago = (seconds.abs() + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY;
        return format!("{} (истекло {} дн. назад)", date, days_ago);
    }

    let days = seconds / SECONDS_PER_DAY;
    let relative = match days {
        0 => match seconds / 3600 {
            0 => "истекает сегодня".to_string(),
            hours => format!("через {} ч.", hours),
        },
        1 => "завтра".to_string(),
        2..=6 => format!("через {} дн.", days),
        7..=29 => format!("через {} нед.", days / 7),
        _ => format!("через {} мес.", days / 30),
    };
    format!("{} ({})", date, relative)
}

pub fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.with_timezone(&Local).format("%d.%m.%Y %H:%M").to_string())
        .unwrap_or_else(|| format!("Некорректный timestamp: {}", ts))
}

pub fn binding_line(binding: &Binding) -> String {
    format!(
        "{} <code>{}</code> → <code>{}</code>{}",
        if binding.is_primary { "⭐️" } else { "•" },
        binding.telegram_id,
        escape(&binding.panel_username),
        if binding.is_admin { " 👑" } else { "" }
    )
}

pub fn bindings_overview(panel_username: &str, bindings: &[Binding]) -> String {
    if bindings.is_empty() {
        return format!("Привязок к <code>{}</code> нет.", escape(panel_username));
    }
    let lines: Vec<String> = bindings.iter().map(binding_line).collect();
    format!(
        "🔗 Привязки <code>{}</code> ({}):\n{}",
        escape(panel_username),
        bindings.len(),
        lines.join("\n")
    )
}

pub fn subscription_text(account: &PanelAccount, now: DateTime<Utc>) -> String {
    let mut text = format!(
        "{} <b>Подписка</b>\n\n\
         👤 Пользователь: <code>{}</code>\n\
         Статус: <b>{}</b>\n\n\
         📈 Трафик: <b>{}</b> / {}\n",
        status_emoji(account, now),
        escape(&account.username),
        status_label(account.status),
        format_bytes(Some(account.used_traffic)),
        format_bytes(account.data_limit),
    );
    if let Some(limit) = account.data_limit {
        text.push_str(&progress_bar(account.used_traffic, limit));
        text.push('\n');
    }
    text.push_str(&format!(
        "📅 Действует до: {}",
        format_date_relative(account.expire, now)
    ));
    text
}

pub fn action_log_line(entry: &AdminActionLog) -> String {
    let mut line = format!(
        "{} | <code>{}</code> | {}",
        format_timestamp(entry.created_at),
        entry.admin_telegram_id,
        escape(&entry.action)
    );
    if let Some(target) = entry.target_username.as_deref() {
        line.push_str(&format!(" | <code>{}</code>", escape(target)));
    }
    if let Some(details) = entry.details.as_deref() {
        line.push_str(&format!(" | {}", escape(details)));
    }
    line
}

pub fn stats_text(stats: &BindingStats, panel_total: Option<i64>) -> String {
    let panel_line = panel_total
        .map(|total| total.to_string())
        .unwrap_or_else(|| "недоступно".to_string());
    format!(
        "📈 Статистика\n\n\
         Привязок: {}\n\
         Основных: {}\n\
         Дополнительных: {}\n\
         Админов: {}\n\
         Пользователей в панели: {}",
        stats.total, stats.primary, stats.secondary, stats.admins, panel_line
    )
}

fn bell(enabled: bool) -> &'static str {
    if enabled { "🔔" } else { "🔕" }
}

pub fn notification_settings_text(settings: &NotificationSettings) -> String {
    format!(
        "🔔 <b>Настройки уведомлений</b>\n\n\
         Нажмите на кнопку, чтобы включить или выключить тип уведомлений:\n\n\
         {} <b>Истечение подписки</b>\n   Предупреждать за {} дн.\n\n\
         {} <b>Превышение трафика</b>\n\n\
         {} <b>Смена статуса</b>\n   Уведомление об активации и отключении",
        bell(settings.notify_expiry),
        settings.expiry_days,
        bell(settings.notify_traffic),
        bell(settings.notify_status),
    )
}

pub fn status_change_notice(panel_username: &str, status: PanelUserStatus) -> String {
    let headline = match status {
        PanelUserStatus::Active => "✅ Ваша подписка включена администратором.",
        PanelUserStatus::Disabled => "⛔ Ваша подписка отключена администратором.",
        _ => "ℹ️ Статус вашей подписки изменён.",
    };
    format!(
        "{}\n\nАккаунт: <code>{}</code>\nНовый статус: <b>{}</b>",
        headline,
        escape(panel_username),
        status_label(status)
    )
}

pub fn usage_guide_text() -> &'static str {
    r#"Как подключиться к VPN:

1) Установите клиент для своего устройства (кнопки ниже).
2) Нажмите «🔗 Ссылка» — бот пришлёт ссылку на подписку и QR-код.
3) Импортируйте ссылку в клиент (или отсканируйте QR) и подключитесь.

Если не получается, обратитесь к администратору."#
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    fn account(status: PanelUserStatus) -> PanelAccount {
        PanelAccount {
            username: "alice".to_string(),
            status,
            used_traffic: 0,
            data_limit: None,
            expire: None,
            subscription_url: String::new(),
            links: Vec::new(),
        }
    }

    #[test]
    fn bytes_are_scaled_with_two_decimals() {
        assert_eq!(format_bytes(None), "∞");
        assert_eq!(format_bytes(Some(0)), "0 B");
        assert_eq!(format_bytes(Some(512)), "512.00 B");
        assert_eq!(format_bytes(Some(1536)), "1.50 KB");
        assert_eq!(format_bytes(Some(5 * 1024 * 1024 * 1024)), "5.00 GB");
        assert_eq!(format_bytes(Some(3 * 1024u64.pow(5))), "3072.00 TB");
    }

    #[test]
    fn progress_bar_fills_proportionally() {
        assert_eq!(progress_bar(40, 100), "[████░░░░░░] 40%");
        assert_eq!(progress_bar(0, 0), "[░░░░░░░░░░] 0%");
        assert_eq!(progress_bar(250, 100), "[██████████] 100%");
    }

    #[test]
    fn status_emoji_follows_priority() {
        assert_eq!(status_emoji(&account(PanelUserStatus::Disabled), now()), "⚫");
        assert_eq!(status_emoji(&account(PanelUserStatus::Limited), now()), "🔴");
        assert_eq!(status_emoji(&account(PanelUserStatus::Active), now()), "🟢");

        let mut past = account(PanelUserStatus::Active);
        past.expire = Some(now() - Duration::hours(1));
        assert_eq!(status_emoji(&past, now()), "🔴");

        let mut soon = account(PanelUserStatus::Active);
        soon.expire = Some(now() + Duration::days(5));
        assert_eq!(status_emoji(&soon, now()), "🟡");

        let mut heavy = account(PanelUserStatus::Active);
        heavy.expire = Some(now() + Duration::days(60));
        heavy.data_limit = Some(100);
        heavy.used_traffic = 90;
        assert_eq!(status_emoji(&heavy, now()), "🟡");
        heavy.used_traffic = 89;
        assert_eq!(status_emoji(&heavy, now()), "🟢");
    }

    #[test]
    fn relative_dates() {
        assert_eq!(format_date_relative(None, now()), "бессрочно");
        let cases = [
            (Duration::minutes(30), "(истекает сегодня)"),
            (Duration::hours(5), "(через 5 ч.)"),
            (Duration::hours(30), "(завтра)"),
            (Duration::days(3), "(через 3 дн.)"),
            (Duration::days(15), "(через 2 нед.)"),
            (Duration::days(95), "(через 3 мес.)"),
            (Duration::hours(-12), "(истекло 1 дн. назад)"),
            (Duration::days(-3), "(истекло 3 дн. назад)"),
        ];
        for (offset, expected) in cases {
            let text = format_date_relative(Some(now() + offset), now());
            assert!(text.ends_with(expected), "{offset:?}: {text}");
        }
    }

    #[test]
    fn binding_line_marks_primary_and_admin() {
        let binding = Binding {
            id: 1,
            telegram_id: 111,
            panel_username: "a<b".to_string(),
            is_admin: true,
            is_primary: true,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(
            binding_line(&binding),
            "⭐️ <code>111</code> → <code>a&lt;b</code> 👑"
        );
        let secondary = Binding {
            is_admin: false,
            is_primary: false,
            ..binding
        };
        assert!(binding_line(&secondary).starts_with("• "));
    }

    #[test]
    fn subscription_text_includes_bar_only_with_limit() {
        let mut acc = account(PanelUserStatus::Active);
        assert!(!subscription_text(&acc, now()).contains('['));
        acc.data_limit = Some(1000);
        acc.used_traffic = 400;
        assert!(subscription_text(&acc, now()).contains("[████░░░░░░] 40%"));
    }
}
