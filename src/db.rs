//! SQLite-слой: привязки tg_user_id -> пользователь панели, журнал действий админов,
//! настройки уведомлений и отметки об отправленных уведомлениях.
//!
//! На один panel_username может приходиться несколько привязок, но основная (primary)
//! всегда ровно одна. Все операции, меняющие флаг primary, выполняются в одной транзакции.

use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool};
use sqlx::{Executor, FromRow};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub const NOTIFY_EXPIRY: &str = "expiry";
pub const NOTIFY_TRAFFIC: &str = "traffic";
pub const NOTIFY_STATUS: &str = "status";

const DEFAULT_EXPIRY_DAYS: i64 = 7;

const SELECT_BINDING: &str = "SELECT id, telegram_id, panel_username, is_admin, is_primary, created_at, updated_at FROM bindings";
const SELECT_ADMIN_LOG: &str =
    "SELECT id, admin_telegram_id, action, target_username, details, created_at FROM admin_logs";
const SELECT_SETTINGS: &str = "SELECT telegram_id, notify_expiry, notify_traffic, notify_status, expiry_days, created_at, updated_at FROM notification_settings";

/// Связь Telegram-аккаунта с пользователем панели.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Binding {
    pub id: i64,
    pub telegram_id: i64,
    pub panel_username: String,
    pub is_admin: bool,
    pub is_primary: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct AdminActionLog {
    pub id: i64,
    pub admin_telegram_id: i64,
    pub action: String,
    pub target_username: Option<String>,
    pub details: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct NotificationSettings {
    pub telegram_id: i64,
    pub notify_expiry: bool,
    pub notify_traffic: bool,
    pub notify_status: bool,
    pub expiry_days: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Частичное обновление настроек: `None` оставляет текущее значение.
#[derive(Debug, Clone, Default)]
pub struct NotificationSettingsUpdate {
    pub notify_expiry: Option<bool>,
    pub notify_traffic: Option<bool>,
    pub notify_status: Option<bool>,
    pub expiry_days: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingStats {
    pub total: i64,
    pub primary: i64,
    pub secondary: i64,
    pub admins: i64,
}

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("Telegram ID {telegram_id} уже привязан к {panel_username}")]
    DuplicateTelegramBinding {
        telegram_id: i64,
        panel_username: String,
    },
    #[error("Ошибка БД: {0}")]
    Storage(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct Db {
    pool: SqlitePool,
}

fn current_unix_timestamp() -> Result<i64, anyhow::Error> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .map_err(|err| anyhow::anyhow!("Системное время меньше UNIX_EPOCH: {}", err))
}

fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for ch in query.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

async fn fetch_binding_by_telegram_id<'e, E>(
    executor: E,
    telegram_id: i64,
) -> Result<Option<Binding>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Binding>(&format!("{SELECT_BINDING} WHERE telegram_id = ?"))
        .bind(telegram_id)
        .fetch_optional(executor)
        .await
}

async fn fetch_primary_binding<'e, E>(
    executor: E,
    panel_username: &str,
) -> Result<Option<Binding>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Binding>(&format!(
        "{SELECT_BINDING} WHERE panel_username = ? AND is_primary = 1 ORDER BY created_at DESC, id DESC LIMIT 1"
    ))
    .bind(panel_username)
    .fetch_optional(executor)
    .await
}

async fn fetch_settings<'e, E>(
    executor: E,
    telegram_id: i64,
) -> Result<NotificationSettings, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, NotificationSettings>(&format!("{SELECT_SETTINGS} WHERE telegram_id = ?"))
        .bind(telegram_id)
        .fetch_one(executor)
        .await
}

async fn insert_default_settings<'e, E>(
    executor: E,
    telegram_id: i64,
    now: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO notification_settings
         (telegram_id, notify_expiry, notify_traffic, notify_status, expiry_days, created_at, updated_at)
         VALUES (?, 1, 1, 1, ?, ?, ?)
         ON CONFLICT(telegram_id) DO NOTHING",
    )
    .bind(telegram_id)
    .bind(DEFAULT_EXPIRY_DAYS)
    .bind(now)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

impl Db {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Не удалось создать директорию для БД: {}", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| anyhow::anyhow!("Не удалось подключиться к SQLite: {}", e))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, anyhow::Error> {
        // У каждого соединения своя in-memory база, поэтому пул из одного соединения.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bindings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                telegram_id INTEGER NOT NULL,
                panel_username TEXT NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0,
                is_primary INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(telegram_id)
            );
            CREATE INDEX IF NOT EXISTS idx_bindings_panel_username ON bindings(panel_username);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция bindings: {}", e))?;

        if self
            .ensure_column_exists("bindings", "is_primary", "INTEGER NOT NULL DEFAULT 0")
            .await?
        {
            // Базы до появления флага: основной становится самая ранняя привязка username.
            let promoted = sqlx::query(
                "UPDATE bindings SET is_primary = 1
                 WHERE id IN (
                     SELECT b.id FROM bindings b
                     WHERE NOT EXISTS (
                         SELECT 1 FROM bindings o
                         WHERE o.panel_username = b.panel_username
                           AND (o.created_at < b.created_at
                                OR (o.created_at = b.created_at AND o.id < b.id))
                     )
                 )",
            )
            .execute(&self.pool)
            .await?;
            tracing::info!(
                promoted = promoted.rows_affected(),
                "Backfilled primary flag for existing bindings"
            );
        }

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_bindings_single_primary
                ON bindings(panel_username) WHERE is_primary = 1;

            CREATE TABLE IF NOT EXISTS admin_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                admin_telegram_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                target_username TEXT,
                details TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_admin_logs_admin ON admin_logs(admin_telegram_id);

            CREATE TABLE IF NOT EXISTS notification_settings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                telegram_id INTEGER NOT NULL,
                notify_expiry INTEGER NOT NULL DEFAULT 1,
                notify_traffic INTEGER NOT NULL DEFAULT 1,
                notify_status INTEGER NOT NULL DEFAULT 1,
                expiry_days INTEGER NOT NULL DEFAULT 7,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(telegram_id)
            );

            CREATE TABLE IF NOT EXISTS sent_notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                telegram_id INTEGER NOT NULL,
                notification_type TEXT NOT NULL,
                notification_key TEXT NOT NULL,
                sent_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sent_notifications_identity
                ON sent_notifications(telegram_id, notification_type, notification_key);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция БД: {}", e))?;

        Ok(())
    }

    /// Добавляет колонку, если её нет. Возвращает `true`, если колонка была создана.
    async fn ensure_column_exists(
        &self,
        table: &str,
        column: &str,
        sql_type: &str,
    ) -> Result<bool, anyhow::Error> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = '{}'",
            table, column
        ))
        .fetch_one(&self.pool)
        .await?;
        if count == 0 {
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                table, column, sql_type
            ))
            .execute(&self.pool)
            .await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn find_by_telegram_id(
        &self,
        telegram_id: i64,
    ) -> Result<Option<Binding>, anyhow::Error> {
        Ok(fetch_binding_by_telegram_id(&self.pool, telegram_id).await?)
    }

    /// Основная привязка username. С `primary_only = false`: самая свежая привязка
    /// независимо от флага.
    pub async fn find_by_panel_username(
        &self,
        panel_username: &str,
        primary_only: bool,
    ) -> Result<Option<Binding>, anyhow::Error> {
        if primary_only {
            return Ok(fetch_primary_binding(&self.pool, panel_username).await?);
        }
        let binding = sqlx::query_as::<_, Binding>(&format!(
            "{SELECT_BINDING} WHERE panel_username = ? ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(panel_username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(binding)
    }

    /// Все привязки username: сначала основная, затем от новых к старым.
    pub async fn list_bindings_for_panel_username(
        &self,
        panel_username: &str,
    ) -> Result<Vec<Binding>, anyhow::Error> {
        let rows = sqlx::query_as::<_, Binding>(&format!(
            "{SELECT_BINDING} WHERE panel_username = ? ORDER BY is_primary DESC, created_at DESC, id DESC"
        ))
        .bind(panel_username)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Создаёт привязку. Если `is_primary` не задан, привязка становится основной только
    /// когда у username ещё нет основной. Новая основная снимает флаг с прежней.
    pub async fn create_binding(
        &self,
        telegram_id: i64,
        panel_username: &str,
        is_admin: bool,
        is_primary: Option<bool>,
    ) -> Result<Binding, BindingError> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;

        if let Some(existing) = fetch_binding_by_telegram_id(&mut *tx, telegram_id).await? {
            return Err(BindingError::DuplicateTelegramBinding {
                telegram_id,
                panel_username: existing.panel_username,
            });
        }

        let current_primary = fetch_primary_binding(&mut *tx, panel_username).await?;
        let is_primary = is_primary.unwrap_or(current_primary.is_none());

        if is_primary && let Some(previous) = current_primary.as_ref() {
            sqlx::query("UPDATE bindings SET is_primary = 0, updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(previous.id)
                .execute(&mut *tx)
                .await?;
        }

        let id = sqlx::query(
            "INSERT INTO bindings (telegram_id, panel_username, is_admin, is_primary, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(telegram_id)
        .bind(panel_username)
        .bind(is_admin)
        .bind(is_primary)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let binding = sqlx::query_as::<_, Binding>(&format!("{SELECT_BINDING} WHERE id = ?"))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            telegram_id = telegram_id,
            panel_username = %panel_username,
            is_primary = binding.is_primary,
            demoted = ?current_primary.filter(|_| is_primary).map(|b| b.telegram_id),
            "Binding created"
        );
        Ok(binding)
    }

    /// Удаляет привязку. Если удалена основная, основной становится самая ранняя из оставшихся.
    pub async fn delete_binding(&self, telegram_id: i64) -> Result<bool, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;

        let Some(binding) = fetch_binding_by_telegram_id(&mut *tx, telegram_id).await? else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM bindings WHERE id = ?")
            .bind(binding.id)
            .execute(&mut *tx)
            .await?;

        let mut promoted = None;
        if binding.is_primary {
            promoted = sqlx::query_scalar::<_, i64>(
                "SELECT id FROM bindings WHERE panel_username = ? ORDER BY created_at ASC, id ASC LIMIT 1",
            )
            .bind(&binding.panel_username)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(replacement_id) = promoted {
                sqlx::query("UPDATE bindings SET is_primary = 1, updated_at = ? WHERE id = ?")
                    .bind(now)
                    .bind(replacement_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        tracing::info!(
            telegram_id = telegram_id,
            panel_username = %binding.panel_username,
            was_primary = binding.is_primary,
            promoted_binding_id = ?promoted,
            "Binding deleted"
        );
        Ok(true)
    }

    pub async fn list_bindings(
        &self,
        offset: i64,
        limit: i64,
        admin_only: bool,
    ) -> Result<(Vec<Binding>, i64), anyhow::Error> {
        let filter = if admin_only { " WHERE is_admin = 1" } else { "" };

        let total = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM bindings{filter}"))
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, Binding>(&format!(
            "{SELECT_BINDING}{filter} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }

    pub async fn set_admin_flag(
        &self,
        telegram_id: i64,
        is_admin: bool,
    ) -> Result<Option<Binding>, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result =
            sqlx::query("UPDATE bindings SET is_admin = ?, updated_at = ? WHERE telegram_id = ?")
                .bind(is_admin)
                .bind(now)
                .bind(telegram_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_by_telegram_id(telegram_id).await
    }

    /// Число трактуется как точный telegram_id, иначе подстрока panel_username без учёта регистра.
    pub async fn search_bindings(&self, query: &str) -> Result<Vec<Binding>, anyhow::Error> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        if let Ok(telegram_id) = query.parse::<i64>() {
            return Ok(self
                .find_by_telegram_id(telegram_id)
                .await?
                .into_iter()
                .collect());
        }

        let rows = sqlx::query_as::<_, Binding>(&format!(
            r"{SELECT_BINDING} WHERE panel_username LIKE ? ESCAPE '\' ORDER BY created_at DESC, id DESC"
        ))
        .bind(like_pattern(query))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn binding_stats(&self) -> Result<BindingStats, anyhow::Error> {
        let (total, primary, admins) = sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(is_primary), 0), COALESCE(SUM(is_admin), 0) FROM bindings",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(BindingStats {
            total,
            primary,
            secondary: total - primary,
            admins,
        })
    }

    pub async fn record_admin_action(
        &self,
        admin_telegram_id: i64,
        action: &str,
        target_username: Option<&str>,
        details: Option<&str>,
    ) -> Result<AdminActionLog, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let id = sqlx::query(
            "INSERT INTO admin_logs (admin_telegram_id, action, target_username, details, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(admin_telegram_id)
        .bind(action)
        .bind(target_username)
        .bind(details)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        tracing::info!(
            admin_telegram_id = admin_telegram_id,
            action = %action,
            target_username = ?target_username,
            "Admin action recorded"
        );

        let log = sqlx::query_as::<_, AdminActionLog>(&format!("{SELECT_ADMIN_LOG} WHERE id = ?"))
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(log)
    }

    pub async fn list_admin_actions(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<AdminActionLog>, i64), anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM admin_logs")
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query_as::<_, AdminActionLog>(&format!(
            "{SELECT_ADMIN_LOG} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok((rows, total))
    }

    pub async fn get_or_create_notification_settings(
        &self,
        telegram_id: i64,
    ) -> Result<NotificationSettings, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        insert_default_settings(&mut *tx, telegram_id, now).await?;
        let settings = fetch_settings(&mut *tx, telegram_id).await?;
        tx.commit().await?;
        Ok(settings)
    }

    pub async fn update_notification_settings(
        &self,
        telegram_id: i64,
        update: NotificationSettingsUpdate,
    ) -> Result<NotificationSettings, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;
        insert_default_settings(&mut *tx, telegram_id, now).await?;

        sqlx::query(
            "UPDATE notification_settings
             SET notify_expiry = COALESCE(?, notify_expiry),
                 notify_traffic = COALESCE(?, notify_traffic),
                 notify_status = COALESCE(?, notify_status),
                 expiry_days = COALESCE(?, expiry_days),
                 updated_at = ?
             WHERE telegram_id = ?",
        )
        .bind(update.notify_expiry)
        .bind(update.notify_traffic)
        .bind(update.notify_status)
        .bind(update.expiry_days)
        .bind(now)
        .bind(telegram_id)
        .execute(&mut *tx)
        .await?;

        let settings = fetch_settings(&mut *tx, telegram_id).await?;
        tx.commit().await?;
        Ok(settings)
    }

    pub async fn has_notification_been_sent(
        &self,
        telegram_id: i64,
        notification_type: &str,
        notification_key: &str,
    ) -> Result<bool, anyhow::Error> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM sent_notifications
             WHERE telegram_id = ? AND notification_type = ? AND notification_key = ?
             LIMIT 1",
        )
        .bind(telegram_id)
        .bind(notification_type)
        .bind(notification_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    /// Отмечает уведомление отправленным. `false`, если такая отметка уже была.
    pub async fn mark_notification_sent(
        &self,
        telegram_id: i64,
        notification_type: &str,
        notification_key: &str,
    ) -> Result<bool, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "INSERT INTO sent_notifications (telegram_id, notification_type, notification_key, sent_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(telegram_id, notification_type, notification_key) DO NOTHING",
        )
        .bind(telegram_id)
        .bind(notification_type)
        .bind(notification_key)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn db() -> Db {
        Db::open_in_memory().await.expect("in-memory db")
    }

    async fn primaries(db: &Db, panel_username: &str) -> Vec<i64> {
        db.list_bindings_for_panel_username(panel_username)
            .await
            .unwrap()
            .into_iter()
            .filter(|b| b.is_primary)
            .map(|b| b.telegram_id)
            .collect()
    }

    async fn set_created_at(db: &Db, telegram_id: i64, created_at: i64) {
        sqlx::query("UPDATE bindings SET created_at = ? WHERE telegram_id = ?")
            .bind(created_at)
            .bind(telegram_id)
            .execute(&db.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_binding_is_primary_and_second_is_secondary() {
        let db = db().await;

        let first = db.create_binding(111, "alice", false, None).await.unwrap();
        assert!(first.is_primary);

        let second = db.create_binding(222, "alice", false, None).await.unwrap();
        assert!(!second.is_primary);
        assert_eq!(primaries(&db, "alice").await, vec![111]);

        assert!(db.delete_binding(111).await.unwrap());
        assert_eq!(primaries(&db, "alice").await, vec![222]);
    }

    #[tokio::test]
    async fn explicit_primary_demotes_previous_primary() {
        let db = db().await;
        db.create_binding(1, "bob", false, None).await.unwrap();
        let promoted = db.create_binding(2, "bob", false, Some(true)).await.unwrap();

        assert!(promoted.is_primary);
        assert_eq!(primaries(&db, "bob").await, vec![2]);
        assert!(!db.find_by_telegram_id(1).await.unwrap().unwrap().is_primary);
    }

    #[tokio::test]
    async fn duplicate_telegram_binding_fails_without_changes() {
        let db = db().await;
        db.create_binding(111, "alice", false, None).await.unwrap();
        db.create_binding(222, "carol", false, None).await.unwrap();

        let err = db
            .create_binding(111, "carol", true, Some(true))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("alice"));
        match err {
            BindingError::DuplicateTelegramBinding {
                telegram_id,
                panel_username,
            } => {
                assert_eq!(telegram_id, 111);
                assert_eq!(panel_username, "alice");
            }
            other => panic!("unexpected error: {other}"),
        }

        let (all, total) = db.list_bindings(0, 100, false).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(all.len(), 2);
        assert_eq!(primaries(&db, "carol").await, vec![222]);
        assert_eq!(
            db.find_by_telegram_id(111).await.unwrap().unwrap().panel_username,
            "alice"
        );
    }

    #[tokio::test]
    async fn deleting_missing_binding_returns_false() {
        let db = db().await;
        db.create_binding(5, "dave", false, None).await.unwrap();

        assert!(!db.delete_binding(999).await.unwrap());
        let (_, total) = db.list_bindings(0, 10, false).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(primaries(&db, "dave").await, vec![5]);
    }

    #[tokio::test]
    async fn deleting_primary_promotes_oldest_remaining() {
        let db = db().await;
        db.create_binding(111, "eve", false, None).await.unwrap();
        db.create_binding(222, "eve", false, None).await.unwrap();
        db.create_binding(333, "eve", false, None).await.unwrap();
        set_created_at(&db, 222, 2_000).await;
        set_created_at(&db, 333, 1_000).await;

        assert!(db.delete_binding(111).await.unwrap());
        assert_eq!(primaries(&db, "eve").await, vec![333]);
    }

    #[tokio::test]
    async fn deleting_secondary_keeps_primary() {
        let db = db().await;
        db.create_binding(1, "frank", false, None).await.unwrap();
        db.create_binding(2, "frank", false, None).await.unwrap();

        assert!(db.delete_binding(2).await.unwrap());
        assert_eq!(primaries(&db, "frank").await, vec![1]);
    }

    #[tokio::test]
    async fn exactly_one_primary_after_mixed_operations() {
        let db = db().await;
        let ops: &[(bool, i64, Option<bool>)] = &[
            (true, 1, None),
            (true, 2, None),
            (true, 3, Some(true)),
            (false, 3, None),
            (true, 4, Some(false)),
            (false, 1, None),
            (true, 5, Some(true)),
            (false, 5, None),
            (false, 2, None),
        ];

        for (create, telegram_id, primary) in ops {
            if *create {
                db.create_binding(*telegram_id, "grace", false, *primary)
                    .await
                    .unwrap();
            } else {
                db.delete_binding(*telegram_id).await.unwrap();
            }
            let bindings = db.list_bindings_for_panel_username("grace").await.unwrap();
            let primary_count = bindings.iter().filter(|b| b.is_primary).count();
            if bindings.is_empty() {
                assert_eq!(primary_count, 0);
            } else {
                assert_eq!(primary_count, 1, "after op on {telegram_id}");
            }
        }
        assert_eq!(primaries(&db, "grace").await, vec![4]);
    }

    #[tokio::test]
    async fn find_by_panel_username_respects_primary_only() {
        let db = db().await;
        db.create_binding(10, "heidi", false, None).await.unwrap();
        db.create_binding(20, "heidi", false, None).await.unwrap();
        set_created_at(&db, 10, 100).await;
        set_created_at(&db, 20, 200).await;

        let primary = db.find_by_panel_username("heidi", true).await.unwrap().unwrap();
        assert_eq!(primary.telegram_id, 10);
        let newest = db.find_by_panel_username("heidi", false).await.unwrap().unwrap();
        assert_eq!(newest.telegram_id, 20);
        assert!(db.find_by_panel_username("nobody", false).await.unwrap().is_none());

        let listed: Vec<i64> = db
            .list_bindings_for_panel_username("heidi")
            .await
            .unwrap()
            .iter()
            .map(|b| b.telegram_id)
            .collect();
        assert_eq!(listed, vec![10, 20]);
    }

    #[tokio::test]
    async fn list_bindings_paginates_newest_first_with_filtered_total() {
        let db = db().await;
        for (i, telegram_id) in (1..=5).enumerate() {
            db.create_binding(telegram_id, &format!("user{telegram_id}"), telegram_id % 2 == 0, None)
                .await
                .unwrap();
            set_created_at(&db, telegram_id, 1_000 + i as i64).await;
        }

        let (page, total) = db.list_bindings(0, 2, false).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(
            page.iter().map(|b| b.telegram_id).collect::<Vec<_>>(),
            vec![5, 4]
        );

        let (page, total) = db.list_bindings(4, 2, false).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 1);

        let (admins, total) = db.list_bindings(0, 10, true).await.unwrap();
        assert_eq!(total, 2);
        assert!(admins.iter().all(|b| b.is_admin));
    }

    #[tokio::test]
    async fn set_admin_flag_updates_existing_only() {
        let db = db().await;
        db.create_binding(7, "ivan", false, None).await.unwrap();

        let updated = db.set_admin_flag(7, true).await.unwrap().unwrap();
        assert!(updated.is_admin);
        assert!(db.set_admin_flag(8, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn numeric_search_never_matches_usernames() {
        let db = db().await;
        db.create_binding(555, "user123", false, None).await.unwrap();
        db.create_binding(123, "judy", false, None).await.unwrap();
        db.create_binding(777, "ABC_team", false, None).await.unwrap();

        let by_id = db.search_bindings("123").await.unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].panel_username, "judy");

        assert!(db.search_bindings("99999").await.unwrap().is_empty());

        let by_name = db.search_bindings("abc").await.unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].telegram_id, 777);

        // `_` ищется буквально, а не как любой символ.
        assert_eq!(db.search_bindings("c_t").await.unwrap().len(), 1);
        assert!(db.search_bindings("r_2").await.unwrap().is_empty());
        assert!(db.search_bindings("   ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn admin_actions_are_listed_newest_first() {
        let db = db().await;
        db.record_admin_action(1, "add_user", Some("alice"), Some("tg: 111"))
            .await
            .unwrap();
        db.record_admin_action(1, "remove_user", Some("alice"), None)
            .await
            .unwrap();
        let last = db.record_admin_action(2, "make_admin", None, None).await.unwrap();
        assert_eq!(last.action, "make_admin");

        let (logs, total) = db.list_admin_actions(0, 2).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].action, "make_admin");
        assert_eq!(logs[1].action, "remove_user");
        assert!(logs[1].details.is_none());
    }

    #[tokio::test]
    async fn notification_settings_are_created_with_defaults() {
        let db = db().await;
        let settings = db.get_or_create_notification_settings(42).await.unwrap();
        assert!(settings.notify_expiry);
        assert!(settings.notify_traffic);
        assert!(settings.notify_status);
        assert_eq!(settings.expiry_days, 7);

        let again = db.get_or_create_notification_settings(42).await.unwrap();
        assert_eq!(settings, again);
    }

    #[tokio::test]
    async fn partial_settings_update_keeps_other_fields() {
        let db = db().await;
        let updated = db
            .update_notification_settings(
                9,
                NotificationSettingsUpdate {
                    notify_traffic: Some(false),
                    expiry_days: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.notify_expiry);
        assert!(!updated.notify_traffic);
        assert!(updated.notify_status);
        assert_eq!(updated.expiry_days, 3);

        let updated = db
            .update_notification_settings(
                9,
                NotificationSettingsUpdate {
                    notify_status: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.notify_traffic);
        assert!(!updated.notify_status);
        assert_eq!(updated.expiry_days, 3);
    }

    #[tokio::test]
    async fn sent_notifications_are_deduplicated() {
        let db = db().await;
        assert!(
            !db.has_notification_been_sent(1, NOTIFY_EXPIRY, "expiry_7days_2025-01-15")
                .await
                .unwrap()
        );
        assert!(
            db.mark_notification_sent(1, NOTIFY_EXPIRY, "expiry_7days_2025-01-15")
                .await
                .unwrap()
        );
        assert!(
            db.has_notification_been_sent(1, NOTIFY_EXPIRY, "expiry_7days_2025-01-15")
                .await
                .unwrap()
        );
        assert!(
            !db.mark_notification_sent(1, NOTIFY_EXPIRY, "expiry_7days_2025-01-15")
                .await
                .unwrap()
        );
        assert!(
            !db.has_notification_been_sent(1, NOTIFY_TRAFFIC, "expiry_7days_2025-01-15")
                .await
                .unwrap()
        );
        assert!(
            !db.has_notification_been_sent(2, NOTIFY_EXPIRY, "expiry_7days_2025-01-15")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn stats_count_primary_and_admin_bindings() {
        let db = db().await;
        assert_eq!(db.binding_stats().await.unwrap(), BindingStats::default());

        db.create_binding(1, "kate", true, None).await.unwrap();
        db.create_binding(2, "kate", false, None).await.unwrap();
        db.create_binding(3, "leo", false, None).await.unwrap();

        let stats = db.binding_stats().await.unwrap();
        assert_eq!(
            stats,
            BindingStats {
                total: 3,
                primary: 2,
                secondary: 1,
                admins: 1,
            }
        );
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("a_b%c"), r"%a\_b\%c%");
        assert_eq!(like_pattern(r"x\y"), r"%x\\y%");
    }
}
