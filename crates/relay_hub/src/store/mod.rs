#![forbid(unsafe_code)]

mod memory;
mod sql;

pub use memory::InMemoryMessageStore;
pub use sql::SqlMessageStore;

use relay_domain::{Message, MessageDraft, MessageId, UserId};

/// Durable message storage. The store assigns `id` and `created_at`.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	async fn create(&self, draft: MessageDraft, sender_id: &UserId) -> anyhow::Result<Message>;

	async fn get(&self, id: &MessageId) -> anyhow::Result<Option<Message>>;

	/// Returns whether a message was removed.
	async fn delete(&self, id: &MessageId) -> anyhow::Result<bool>;
}
