#![forbid(unsafe_code)]

use std::str::FromStr;

use anyhow::{Context, anyhow};
use relay_domain::{Message, MessageDraft, MessageId, RoomId, UserId};
use relay_util::time::unix_ms_now;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use super::MessageStore;

type MessageRow = (String, String, String, String, i64);

/// Message store over sqlx. Supports `sqlite:` and `postgres:` URLs.
#[derive(Clone)]
pub struct SqlMessageStore {
	backend: Backend,
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl SqlMessageStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);
			// Every connection to an in-memory database is a separate database.
			let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
			let pool = SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect_with(opts)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: Backend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: Backend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

fn row_to_message((id, room_id, sender_id, text, created_at_unix_ms): MessageRow) -> anyhow::Result<Message> {
	Ok(Message {
		id: MessageId::new(id).context("stored message id")?,
		room_id: RoomId::new(room_id).context("stored room id")?,
		sender_id: UserId::new(sender_id).context("stored sender id")?,
		text,
		created_at_unix_ms,
	})
}

#[async_trait::async_trait]
impl MessageStore for SqlMessageStore {
	async fn create(&self, draft: MessageDraft, sender_id: &UserId) -> anyhow::Result<Message> {
		let msg = Message::from_draft(MessageId::generate(), draft, sender_id.clone(), unix_ms_now());

		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, room_id, sender_id, text, created_at_unix_ms) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(msg.id.as_str())
				.bind(msg.room_id.as_str())
				.bind(msg.sender_id.as_str())
				.bind(&msg.text)
				.bind(msg.created_at_unix_ms)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO messages (id, room_id, sender_id, text, created_at_unix_ms) VALUES ($1, $2, $3, $4, $5)",
				)
				.bind(msg.id.as_str())
				.bind(msg.room_id.as_str())
				.bind(msg.sender_id.as_str())
				.bind(&msg.text)
				.bind(msg.created_at_unix_ms)
				.execute(pool)
				.await
				.context("insert message (postgres)")?;
			}
		}

		Ok(msg)
	}

	async fn get(&self, id: &MessageId) -> anyhow::Result<Option<Message>> {
		let row: Option<MessageRow> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, room_id, sender_id, text, created_at_unix_ms FROM messages WHERE id = ?",
			)
			.bind(id.as_str())
			.fetch_optional(pool)
			.await
			.context("select message (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT id, room_id, sender_id, text, created_at_unix_ms FROM messages WHERE id = $1",
			)
			.bind(id.as_str())
			.fetch_optional(pool)
			.await
			.context("select message (postgres)")?,
		};

		row.map(row_to_message).transpose()
	}

	async fn delete(&self, id: &MessageId) -> anyhow::Result<bool> {
		let affected = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query("DELETE FROM messages WHERE id = ?")
				.bind(id.as_str())
				.execute(pool)
				.await
				.context("delete message (sqlite)")?
				.rows_affected(),
			Backend::Postgres(pool) => sqlx::query("DELETE FROM messages WHERE id = $1")
				.bind(id.as_str())
				.execute(pool)
				.await
				.context("delete message (postgres)")?
				.rows_affected(),
		};

		Ok(affected > 0)
	}
}
