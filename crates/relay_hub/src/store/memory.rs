#![forbid(unsafe_code)]

use std::collections::HashMap;

use parking_lot::Mutex;
use relay_domain::{Message, MessageDraft, MessageId, UserId};
use relay_util::time::unix_ms_now;

use super::MessageStore;

#[derive(Default)]
pub struct InMemoryMessageStore {
	inner: Mutex<HashMap<MessageId, Message>>,
}

impl InMemoryMessageStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn create(&self, draft: MessageDraft, sender_id: &UserId) -> anyhow::Result<Message> {
		let msg = Message::from_draft(MessageId::generate(), draft, sender_id.clone(), unix_ms_now());
		self.inner.lock().insert(msg.id.clone(), msg.clone());
		Ok(msg)
	}

	async fn get(&self, id: &MessageId) -> anyhow::Result<Option<Message>> {
		Ok(self.inner.lock().get(id).cloned())
	}

	async fn delete(&self, id: &MessageId) -> anyhow::Result<bool> {
		Ok(self.inner.lock().remove(id).is_some())
	}
}
