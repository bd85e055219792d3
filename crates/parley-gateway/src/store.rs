use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::error;
use uuid::Uuid;

use parley_db::Database;
use parley_types::models::{Channel, Identity, Message, NewMessage};

use crate::error::{HubError, HubResult};

/// Durable storage the hub delegates to. Implementations may block; the
/// hub always calls them from the blocking pool.
pub trait Store: Send + Sync + 'static {
    fn get_channel(&self, id: Uuid) -> Result<Option<Channel>>;

    /// Persist a new message, assigning its id and timestamp.
    fn create_message(&self, new: NewMessage) -> Result<Message>;

    fn get_message(&self, id: Uuid) -> Result<Option<Message>>;

    fn append_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> Result<()>;

    fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> Result<()>;

    /// Returns false when the user was already in the read set.
    fn append_read_by(&self, message_id: Uuid, user_id: Uuid) -> Result<bool>;

    fn set_channel_last_message(&self, channel_id: Uuid, message_id: Uuid) -> Result<()>;

    fn record_presence(
        &self,
        identity: &Identity,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

impl Store for Database {
    fn get_channel(&self, id: Uuid) -> Result<Option<Channel>> {
        Database::get_channel(self, id)
    }

    fn create_message(&self, new: NewMessage) -> Result<Message> {
        Database::create_message(self, new)
    }

    fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        Database::get_message(self, id)
    }

    fn append_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> Result<()> {
        Database::append_reaction(self, message_id, user_id, emoji)
    }

    fn remove_reaction(&self, message_id: Uuid, user_id: Uuid, emoji: &str) -> Result<()> {
        Database::remove_reaction(self, message_id, user_id, emoji)
    }

    fn append_read_by(&self, message_id: Uuid, user_id: Uuid) -> Result<bool> {
        Database::append_read_by(self, message_id, user_id)
    }

    fn set_channel_last_message(&self, channel_id: Uuid, message_id: Uuid) -> Result<()> {
        Database::set_channel_last_message(self, channel_id, message_id)
    }

    fn record_presence(
        &self,
        identity: &Identity,
        online: bool,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()> {
        Database::record_presence(self, identity, online, last_seen)
    }
}

/// Run a store call off the async runtime. Failures are logged here and
/// surface as `HubError::Store`.
pub(crate) async fn blocking<T, F>(store: &Arc<dyn Store>, op: &'static str, f: F) -> HubResult<T>
where
    F: FnOnce(&dyn Store) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error during {}: {}", op, e);
            HubError::Store(anyhow::anyhow!("store task failed: {}", e))
        })?
        .map_err(|e| {
            error!("Store {} failed: {:#}", op, e);
            HubError::Store(e)
        })
}
