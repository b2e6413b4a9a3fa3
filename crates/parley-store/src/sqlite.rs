//! SQLite implementation of [`ChatStore`].

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    now_millis, MarkRead, Message, MessageEdit, MessageList, NewMember, NewMessage, NewRoom, Page,
    Presence, PresenceStatus, Room, RoomCreated, RoomKind, RoomList, RoomLookup, RoomMember,
    RoomQuery, RoomSummary,
};
use crate::store::ChatStore;

/// Database schema, applied idempotently on open.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rooms (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL DEFAULT '',
    type        TEXT NOT NULL,
    project_id  TEXT NOT NULL,
    item_id     TEXT,
    pair_key    TEXT,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS rooms_single_pair
    ON rooms (project_id, pair_key) WHERE type = 'single';
CREATE UNIQUE INDEX IF NOT EXISTS rooms_item
    ON rooms (project_id, type, item_id) WHERE type != 'single' AND item_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS room_members (
    id           TEXT PRIMARY KEY,
    room_id      TEXT NOT NULL REFERENCES rooms (id),
    row_id       TEXT NOT NULL,
    to_name      TEXT NOT NULL DEFAULT '',
    to_row_id    TEXT,
    attributes   TEXT NOT NULL DEFAULT '{}',
    last_read_at INTEGER,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    UNIQUE (room_id, row_id)
);
CREATE INDEX IF NOT EXISTS room_members_row ON room_members (row_id);

CREATE TABLE IF NOT EXISTS messages (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT NOT NULL UNIQUE,
    room_id       TEXT NOT NULL REFERENCES rooms (id),
    message       TEXT NOT NULL DEFAULT '',
    type          TEXT NOT NULL DEFAULT 'text',
    file          TEXT NOT NULL DEFAULT '',
    author_row_id TEXT NOT NULL,
    from_name     TEXT NOT NULL DEFAULT '',
    parent_id     TEXT,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    read_at       INTEGER
);
CREATE INDEX IF NOT EXISTS messages_room_created ON messages (room_id, created_at);

CREATE TABLE IF NOT EXISTS presence (
    row_id       TEXT PRIMARY KEY,
    status       TEXT NOT NULL,
    last_seen_at INTEGER NOT NULL,
    project_id   TEXT,
    updated_at   INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS presence_last_seen ON presence (last_seen_at);
"#;

macro_rules! room_columns {
    () => {
        "id, name, type, project_id, item_id, created_at, updated_at"
    };
}

macro_rules! message_columns {
    () => {
        "id, room_id, message, type, file, author_row_id, from_name, parent_id, created_at, updated_at, read_at"
    };
}

macro_rules! member_columns {
    () => {
        "id, room_id, row_id, to_name, to_row_id, attributes, last_read_at, created_at, updated_at"
    };
}

const ROOM_LIST: &str = r#"
SELECT
    r.id AS id,
    r.name AS name,
    r.type AS type,
    r.project_id AS project_id,
    r.item_id AS item_id,
    r.created_at AS created_at,
    r.updated_at AS updated_at,
    rm.to_name AS to_name,
    rm.to_row_id AS to_row_id,
    rm.attributes AS attributes,
    lm.message AS last_message,
    lm.type AS last_message_type,
    lm.file AS last_message_file,
    lm.from_name AS last_message_from,
    lm.created_at AS last_message_created_at,
    (
        SELECT COUNT(*) FROM messages m
        WHERE m.room_id = r.id
          AND m.author_row_id != rm.row_id
          AND m.created_at > COALESCE(rm.last_read_at, 0)
    ) AS unread_message_count,
    up.status AS user_presence_status,
    up.last_seen_at AS user_presence_last_seen_at,
    COUNT(*) OVER () AS total
FROM rooms r
JOIN room_members rm ON rm.room_id = r.id
LEFT JOIN messages lm ON lm.seq = (
    SELECT m.seq FROM messages m
    WHERE m.room_id = r.id
    ORDER BY m.created_at DESC, m.seq DESC
    LIMIT 1
)
LEFT JOIN presence up ON up.row_id = rm.to_row_id
WHERE rm.row_id = ?1 AND (?2 IS NULL OR r.type = ?2)
ORDER BY r.updated_at DESC, r.id
LIMIT ?3 OFFSET ?4
"#;

/// A [`ChatStore`] backed by a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database file.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created, the database cannot be
    /// opened, or the schema cannot be applied.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "Opened chat database");
        Self::with_pool(pool).await
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Fails if the schema cannot be applied.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // A single connection that never expires, or the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn existing_room(&self, room: &NewRoom) -> Result<Option<Room>> {
        let found = match room.pair_key() {
            Some(key) => {
                sqlx::query_as::<_, Room>(concat!(
                    "SELECT ",
                    room_columns!(),
                    " FROM rooms WHERE project_id = ? AND type = 'single' AND pair_key = ?"
                ))
                .bind(&room.project_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Room>(concat!(
                    "SELECT ",
                    room_columns!(),
                    " FROM rooms WHERE project_id = ? AND type = ? AND item_id = ?"
                ))
                .bind(&room.project_id)
                .bind(room.kind)
                .bind(&room.item_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(found)
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn room_create(&self, room: &NewRoom) -> Result<RoomCreated> {
        let now = now_millis();

        let inserted = sqlx::query_as::<_, Room>(concat!(
            "INSERT INTO rooms (id, name, type, project_id, item_id, pair_key, created_at, updated_at) ",
            "VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING RETURNING ",
            room_columns!()
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&room.name)
        .bind(room.kind)
        .bind(&room.project_id)
        .bind(&room.item_id)
        .bind(room.pair_key())
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(room) = inserted {
            debug!(room = %room.id, kind = %room.kind, "Room created");
            return Ok(RoomCreated {
                room,
                created: true,
            });
        }

        let existing = self
            .existing_room(room)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        debug!(room = %existing.id, "Room already existed");
        Ok(RoomCreated {
            room: existing,
            created: false,
        })
    }

    async fn room_get(&self, id: &str) -> Result<Option<Room>> {
        let room = sqlx::query_as::<_, Room>(concat!(
            "SELECT ",
            room_columns!(),
            " FROM rooms WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(room)
    }

    async fn room_list(&self, query: &RoomQuery) -> Result<RoomList> {
        let rows = sqlx::query(ROOM_LIST)
            .bind(&query.row_id)
            .bind(query.kind)
            .bind(query.page.limit as i64)
            .bind(query.page.offset as i64)
            .fetch_all(&self.pool)
            .await?;

        let count = match rows.first() {
            Some(row) => row.try_get::<i64, _>("total")?,
            None => 0,
        };
        let rooms = rows
            .iter()
            .map(RoomSummary::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RoomList {
            count: count as u64,
            rooms,
        })
    }

    async fn room_exists(&self, lookup: &RoomLookup) -> Result<Option<String>> {
        let id = match lookup.kind {
            RoomKind::Single => {
                let Some(peer) = lookup.to_row_id.as_deref() else {
                    return Ok(None);
                };
                sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT r.id FROM rooms r
                    JOIN room_members rm1 ON rm1.room_id = r.id
                    JOIN room_members rm2 ON rm2.room_id = r.id
                    WHERE r.project_id = ? AND r.type = 'single'
                      AND rm1.row_id = ? AND rm2.row_id = ?
                    LIMIT 1
                    "#,
                )
                .bind(&lookup.project_id)
                .bind(&lookup.row_id)
                .bind(peer)
                .fetch_optional(&self.pool)
                .await?
            }
            kind => {
                sqlx::query_scalar::<_, String>(
                    "SELECT id FROM rooms WHERE project_id = ? AND type = ? AND item_id = ? LIMIT 1",
                )
                .bind(&lookup.project_id)
                .bind(kind)
                .bind(&lookup.item_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(id)
    }

    async fn room_id_by_item(&self, project_id: &str, item_id: &str) -> Result<Option<String>> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT id FROM rooms WHERE project_id = ? AND item_id = ? ORDER BY created_at LIMIT 1",
        )
        .bind(project_id)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn member_add(&self, member: &NewMember) -> Result<bool> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO room_members (id, room_id, row_id, to_name, to_row_id, attributes, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (room_id, row_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&member.room_id)
        .bind(&member.row_id)
        .bind(&member.to_name)
        .bind(&member.to_row_id)
        .bind(serde_json::to_string(&member.attributes)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn members_by_room(&self, room_id: &str) -> Result<Vec<RoomMember>> {
        let members = sqlx::query_as::<_, RoomMember>(concat!(
            "SELECT ",
            member_columns!(),
            " FROM room_members WHERE room_id = ? ORDER BY created_at, id"
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn member_touch_read(&self, room_id: &str, row_id: &str, at: i64) -> Result<()> {
        sqlx::query(
            "UPDATE room_members SET last_read_at = ?, updated_at = ? WHERE room_id = ? AND row_id = ?",
        )
        .bind(at)
        .bind(at)
        .bind(room_id)
        .bind(row_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn message_create(&self, message: &NewMessage) -> Result<Message> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, Message>(concat!(
            "INSERT INTO messages (id, room_id, message, type, file, author_row_id, from_name, parent_id, created_at, updated_at) ",
            "VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING ",
            message_columns!()
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&message.room_id)
        .bind(&message.message)
        .bind(&message.kind)
        .bind(&message.file)
        .bind(&message.author_row_id)
        .bind(&message.from_name)
        .bind(&message.parent_id)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE rooms SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(&message.room_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn message_list(&self, room_id: &str, page: Page) -> Result<MessageList> {
        let rows = sqlx::query(concat!(
            "SELECT * FROM (SELECT seq, COUNT(*) OVER () AS total, ",
            message_columns!(),
            " FROM messages WHERE room_id = ? ORDER BY created_at DESC, seq DESC LIMIT ? OFFSET ?) ",
            "ORDER BY created_at ASC, seq ASC"
        ))
        .bind(room_id)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let count = match rows.first() {
            Some(row) => row.try_get::<i64, _>("total")?,
            None => 0,
        };
        let messages = rows
            .iter()
            .map(Message::from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MessageList {
            count: count as u64,
            messages,
        })
    }

    async fn message_update(&self, edit: &MessageEdit) -> Result<Option<Message>> {
        let updated = sqlx::query_as::<_, Message>(concat!(
            "UPDATE messages SET message = COALESCE(?, message), file = COALESCE(?, file), ",
            "type = COALESCE(?, type), updated_at = ? WHERE id = ? RETURNING ",
            message_columns!()
        ))
        .bind(&edit.message)
        .bind(&edit.file)
        .bind(&edit.kind)
        .bind(now_millis())
        .bind(&edit.id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(updated)
    }

    async fn message_mark_read(&self, room_id: &str, reader: &str, at: i64) -> Result<MarkRead> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET read_at = ?
            WHERE room_id = ? AND author_row_id != ? AND read_at IS NULL
            "#,
        )
        .bind(at)
        .bind(room_id)
        .bind(reader)
        .execute(&self.pool)
        .await?;

        Ok(MarkRead {
            room_id: room_id.to_string(),
            read_at: at,
            updated: result.rows_affected() > 0,
        })
    }

    async fn presence_upsert(
        &self,
        row_id: &str,
        status: PresenceStatus,
        at: i64,
    ) -> Result<Presence> {
        let presence = sqlx::query_as::<_, Presence>(
            r#"
            INSERT INTO presence (row_id, status, last_seen_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT (row_id) DO UPDATE SET
                status = excluded.status,
                last_seen_at = excluded.last_seen_at,
                updated_at = excluded.updated_at
            RETURNING row_id, status, last_seen_at, project_id
            "#,
        )
        .bind(row_id)
        .bind(status)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(presence)
    }

    async fn presence_heartbeat(
        &self,
        row_id: &str,
        project_id: Option<&str>,
        at: i64,
    ) -> Result<Presence> {
        let presence = sqlx::query_as::<_, Presence>(
            r#"
            INSERT INTO presence (row_id, status, last_seen_at, project_id, updated_at)
            VALUES (?1, 'online', ?2, ?3, ?2)
            ON CONFLICT (row_id) DO UPDATE SET
                status = 'online',
                last_seen_at = excluded.last_seen_at,
                project_id = COALESCE(excluded.project_id, presence.project_id),
                updated_at = excluded.updated_at
            RETURNING row_id, status, last_seen_at, project_id
            "#,
        )
        .bind(row_id)
        .bind(at)
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(presence)
    }

    async fn presence_get(&self, row_id: &str) -> Result<Option<Presence>> {
        let presence = sqlx::query_as::<_, Presence>(
            "SELECT row_id, status, last_seen_at, project_id FROM presence WHERE row_id = ?",
        )
        .bind(row_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(presence)
    }

    async fn presence_sweep(&self, cutoff: i64) -> Result<Vec<String>> {
        let flipped = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE presence SET status = 'offline', updated_at = ?
            WHERE last_seen_at < ? AND status != 'offline'
            RETURNING row_id
            "#,
        )
        .bind(now_millis())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(flipped)
    }
}
