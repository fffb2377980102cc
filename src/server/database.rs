use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // In-memory databases get a single connection so every handle sees
        // the same schema.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                phone TEXT,
                full_name TEXT NOT NULL DEFAULT '',
                avatar_url TEXT,
                role TEXT NOT NULL DEFAULT 'user',
                is_ghost_mode INTEGER NOT NULL DEFAULT 0,
                is_shadow_banned INTEGER NOT NULL DEFAULT 0,
                is_premium INTEGER NOT NULL DEFAULT 0,
                last_active_at INTEGER,
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Sessions
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Location pings. Coarse geohash plus raw coordinates; the raw pair
        // is only ever read back by the server-side geo index.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                geohash TEXT NOT NULL,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                time_bucket INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_locations_bucket ON locations(geohash, time_bucket);",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_locations_expiry ON locations(expires_at);",
        )
        .execute(&self.pool)
        .await?;

        // Crossings. user_id1 < user_id2 always. One row per pair within any
        // sliding 24 h window; a UNIQUE index cannot express that, so the
        // insert path enforces it transactionally. The index below serves
        // the window lookup.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS crossings (
                id TEXT PRIMARY KEY,
                user_id1 TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                user_id2 TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                location_center TEXT NOT NULL,
                occurred_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_crossings_pair_time
            ON crossings(user_id1, user_id2, occurred_at);
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Connections
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                requester_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                target_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                PRIMARY KEY (requester_id, target_id)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Blocks
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blocks (
                blocker_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                blocked_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (blocker_id, blocked_id)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Privacy settings; absence of a row means the defaults apply.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS privacy_settings (
                user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                who_can_message TEXT NOT NULL DEFAULT 'connections',
                who_can_see_stories TEXT NOT NULL DEFAULT 'connections',
                show_location INTEGER NOT NULL DEFAULT 1
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Messages
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                receiver_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                read_at INTEGER,
                expires_at INTEGER
            );
        "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(sender_id, receiver_id, created_at);",
        )
        .execute(&self.pool)
        .await?;

        // Message reactions, unique per (message, user, emoji)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_reactions (
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                emoji TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id, emoji)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Notifications
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                type TEXT NOT NULL,
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                related_user_id TEXT,
                related_crossing_id TEXT,
                related_story_id TEXT,
                read_at INTEGER,
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Stories (TTL-bound, swept with locations and messages)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stories (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                content TEXT NOT NULL DEFAULT '',
                media_url TEXT,
                geohash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Reports
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                reporter_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                reported_user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                reason TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
