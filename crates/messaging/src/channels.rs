//! Channel lifecycle and membership rules.
//!
//! Every mutation of a channel runs under that channel's async mutex, so
//! check-then-act sequences (the last-admin check before a leave or demote,
//! the membership check before a join) cannot interleave with each other.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sprout_database::{
    Channel, ChannelMember, ChannelUpdate, MemberRole, MessageStore, NewChannel, Visibility,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{with_deadline, MessagingError, MessagingResult};

pub const MAX_CHANNEL_NAME_CHARS: usize = 100;
pub const MAX_CHANNEL_DESCRIPTION_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left,
    /// The departing user was the last admin, so the channel went with them.
    ChannelDeleted,
}

pub struct ChannelManager {
    store: Arc<dyn MessageStore>,
    store_timeout: Duration,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl ChannelManager {
    pub fn new(store: Arc<dyn MessageStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
            locks: DashMap::new(),
        }
    }

    /// Serialize mutations of one channel.
    pub(crate) async fn lock(&self, channel_id: i64) -> ChannelGuard<'_> {
        let lock = self.locks.entry(channel_id).or_default().clone();
        ChannelGuard {
            guard: Some(lock.lock_owned().await),
            locks: &self.locks,
            channel_id,
        }
    }

    /// Create a channel; the creator becomes its only admin.
    pub async fn create(
        &self,
        creator_id: i64,
        name: &str,
        description: &str,
        visibility: Visibility,
    ) -> MessagingResult<Channel> {
        let name = validate_name(name)?;
        let description = validate_description(description)?;

        let channel = with_deadline(
            self.store_timeout,
            self.store.insert_channel(NewChannel {
                name,
                description,
                creator_id,
                visibility,
            }),
        )
        .await?;

        info!(channel_id = channel.id, user_id = creator_id, "channel created");
        Ok(channel)
    }

    /// Join a public channel. Joining a channel twice is not an error.
    pub async fn join(&self, user_id: i64, channel_id: i64) -> MessagingResult<JoinOutcome> {
        let _guard = self.lock(channel_id).await;

        let channel = self.require_channel(channel_id).await?;
        if self.membership(channel_id, user_id).await?.is_some() {
            debug!(channel_id, user_id, "join ignored, already a member");
            return Ok(JoinOutcome::AlreadyMember);
        }
        if channel.is_private() {
            return Err(MessagingError::PrivateChannelRequiresInvite { channel_id });
        }

        self.insert_member(channel_id, user_id, MemberRole::Member)
            .await?;
        info!(channel_id, user_id, "user joined channel");
        Ok(JoinOutcome::Joined)
    }

    /// Leave a channel. When the last admin leaves, the channel is deleted.
    pub async fn leave(&self, user_id: i64, channel_id: i64) -> MessagingResult<LeaveOutcome> {
        let _guard = self.lock(channel_id).await;
        self.leave_locked(user_id, channel_id).await
    }

    async fn leave_locked(&self, user_id: i64, channel_id: i64) -> MessagingResult<LeaveOutcome> {
        self.require_channel(channel_id).await?;
        let member = self
            .membership(channel_id, user_id)
            .await?
            .ok_or(MessagingError::NotMember { channel_id })?;

        if member.is_admin() && self.admin_count(channel_id).await? <= 1 {
            with_deadline(self.store_timeout, self.store.delete_channel(channel_id)).await?;
            info!(channel_id, user_id, "last admin left, channel deleted");
            return Ok(LeaveOutcome::ChannelDeleted);
        }

        with_deadline(
            self.store_timeout,
            self.store.remove_membership(channel_id, user_id),
        )
        .await?;
        info!(channel_id, user_id, "user left channel");
        Ok(LeaveOutcome::Left)
    }

    /// Add a user to a channel. This is the only way into a private channel.
    pub async fn add_member(
        &self,
        actor_id: i64,
        channel_id: i64,
        target_id: i64,
    ) -> MessagingResult<JoinOutcome> {
        let _guard = self.lock(channel_id).await;
        self.require_admin(actor_id, channel_id).await?;

        if self.membership(channel_id, target_id).await?.is_some() {
            return Ok(JoinOutcome::AlreadyMember);
        }

        self.insert_member(channel_id, target_id, MemberRole::Member)
            .await?;
        info!(channel_id, user_id = target_id, added_by = actor_id, "member added");
        Ok(JoinOutcome::Joined)
    }

    /// Remove a member. Removing yourself is the same as leaving.
    pub async fn remove_member(
        &self,
        actor_id: i64,
        channel_id: i64,
        target_id: i64,
    ) -> MessagingResult<LeaveOutcome> {
        if actor_id == target_id {
            return self.leave(actor_id, channel_id).await;
        }

        let _guard = self.lock(channel_id).await;
        self.require_admin(actor_id, channel_id).await?;

        let removed = with_deadline(
            self.store_timeout,
            self.store.remove_membership(channel_id, target_id),
        )
        .await?;
        if !removed {
            return Err(MessagingError::NotMember { channel_id });
        }

        info!(channel_id, user_id = target_id, removed_by = actor_id, "member removed");
        Ok(LeaveOutcome::Left)
    }

    pub async fn promote(
        &self,
        actor_id: i64,
        channel_id: i64,
        target_id: i64,
    ) -> MessagingResult<()> {
        let _guard = self.lock(channel_id).await;
        self.require_admin(actor_id, channel_id).await?;

        let target = self
            .membership(channel_id, target_id)
            .await?
            .ok_or(MessagingError::NotMember { channel_id })?;
        if target.is_admin() {
            return Ok(());
        }

        self.set_role(channel_id, target_id, MemberRole::Admin).await?;
        info!(channel_id, user_id = target_id, promoted_by = actor_id, "member promoted to admin");
        Ok(())
    }

    /// Demote an admin. The last admin of a channel cannot be demoted.
    pub async fn demote(
        &self,
        actor_id: i64,
        channel_id: i64,
        target_id: i64,
    ) -> MessagingResult<()> {
        let _guard = self.lock(channel_id).await;
        self.require_admin(actor_id, channel_id).await?;

        let target = self
            .membership(channel_id, target_id)
            .await?
            .ok_or(MessagingError::NotMember { channel_id })?;
        if !target.is_admin() {
            return Ok(());
        }
        if self.admin_count(channel_id).await? <= 1 {
            return Err(MessagingError::LastAdmin { channel_id });
        }

        self.set_role(channel_id, target_id, MemberRole::Member).await?;
        info!(channel_id, user_id = target_id, demoted_by = actor_id, "admin demoted");
        Ok(())
    }

    /// Apply `field = value` pairs to a channel's metadata.
    ///
    /// Only `name`, `description`, `visibility` and `is_private` are
    /// recognised; anything else is ignored. No recognised field means no
    /// change.
    pub async fn update_metadata<'a>(
        &self,
        actor_id: i64,
        channel_id: i64,
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> MessagingResult<()> {
        let update = parse_update(fields)?;

        let _guard = self.lock(channel_id).await;
        self.require_admin(actor_id, channel_id).await?;

        if update.is_empty() {
            debug!(channel_id, "metadata update without recognised fields");
            return Ok(());
        }

        with_deadline(
            self.store_timeout,
            self.store.update_channel_metadata(channel_id, &update),
        )
        .await?;
        info!(channel_id, user_id = actor_id, "channel metadata updated");
        Ok(())
    }

    /// Delete a channel with all its memberships and messages.
    pub async fn delete(&self, actor_id: i64, channel_id: i64) -> MessagingResult<()> {
        let _guard = self.lock(channel_id).await;
        self.require_admin(actor_id, channel_id).await?;

        with_deadline(self.store_timeout, self.store.delete_channel(channel_id)).await?;

        info!(channel_id, user_id = actor_id, "channel deleted");
        Ok(())
    }

    pub async fn channel(&self, channel_id: i64) -> MessagingResult<Channel> {
        self.require_channel(channel_id).await
    }

    pub async fn is_member(&self, user_id: i64, channel_id: i64) -> MessagingResult<bool> {
        Ok(self.membership(channel_id, user_id).await?.is_some())
    }

    pub async fn is_admin(&self, user_id: i64, channel_id: i64) -> MessagingResult<bool> {
        Ok(self
            .membership(channel_id, user_id)
            .await?
            .is_some_and(|member| member.is_admin()))
    }

    /// Members of an existing channel, in join order.
    pub async fn members(&self, channel_id: i64) -> MessagingResult<Vec<ChannelMember>> {
        self.require_channel(channel_id).await?;
        with_deadline(self.store_timeout, self.store.fetch_members(channel_id)).await
    }

    pub async fn channels_for_user(&self, user_id: i64) -> MessagingResult<Vec<Channel>> {
        with_deadline(
            self.store_timeout,
            self.store.fetch_channels_for_user(user_id),
        )
        .await
    }

    /// Fails with `NotFound` for a missing channel and `NotMember` for an outsider.
    pub async fn require_member(&self, user_id: i64, channel_id: i64) -> MessagingResult<()> {
        self.require_channel(channel_id).await?;
        match self.membership(channel_id, user_id).await? {
            Some(_) => Ok(()),
            None => Err(MessagingError::NotMember { channel_id }),
        }
    }

    async fn require_channel(&self, channel_id: i64) -> MessagingResult<Channel> {
        with_deadline(self.store_timeout, self.store.fetch_channel(channel_id))
            .await?
            .ok_or_else(|| MessagingError::channel_not_found(channel_id))
    }

    async fn require_admin(&self, user_id: i64, channel_id: i64) -> MessagingResult<Channel> {
        let channel = self.require_channel(channel_id).await?;
        match self.membership(channel_id, user_id).await? {
            Some(member) if member.is_admin() => Ok(channel),
            _ => Err(MessagingError::forbidden(format!(
                "only admins of channel {channel_id} may do that"
            ))),
        }
    }

    async fn membership(
        &self,
        channel_id: i64,
        user_id: i64,
    ) -> MessagingResult<Option<ChannelMember>> {
        with_deadline(
            self.store_timeout,
            self.store.fetch_membership(channel_id, user_id),
        )
        .await
    }

    async fn admin_count(&self, channel_id: i64) -> MessagingResult<usize> {
        let members =
            with_deadline(self.store_timeout, self.store.fetch_members(channel_id)).await?;
        Ok(members.iter().filter(|member| member.is_admin()).count())
    }

    async fn insert_member(
        &self,
        channel_id: i64,
        user_id: i64,
        role: MemberRole,
    ) -> MessagingResult<ChannelMember> {
        with_deadline(
            self.store_timeout,
            self.store.insert_membership(channel_id, user_id, role),
        )
        .await
    }

    async fn set_role(&self, channel_id: i64, user_id: i64, role: MemberRole) -> MessagingResult<()> {
        with_deadline(
            self.store_timeout,
            self.store.update_member_role(channel_id, user_id, role),
        )
        .await
    }
}

/// Holds one channel's mutex. The map entry is dropped with the last holder,
/// so ids that are only probed leave nothing behind.
pub(crate) struct ChannelGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a DashMap<i64, Arc<Mutex<()>>>,
    channel_id: i64,
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.channel_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Build a metadata update from raw `field = value` pairs.
pub fn parse_update<'a>(
    fields: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> MessagingResult<ChannelUpdate> {
    let mut update = ChannelUpdate::default();
    let mut ignored = HashSet::new();

    for (field, value) in fields {
        match field.trim().to_ascii_lowercase().as_str() {
            "name" => update.name = Some(validate_name(value)?),
            "description" => update.description = Some(validate_description(value)?),
            "visibility" | "is_private" => {
                let visibility = value
                    .parse::<Visibility>()
                    .map_err(MessagingError::validation)?;
                update.visibility = Some(visibility);
            }
            other => {
                ignored.insert(other.to_string());
            }
        }
    }

    if !ignored.is_empty() {
        debug!(?ignored, "ignoring unknown channel fields");
    }
    Ok(update)
}

fn validate_name(name: &str) -> MessagingResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(MessagingError::validation("channel name must not be empty"));
    }
    if name.chars().count() > MAX_CHANNEL_NAME_CHARS {
        return Err(MessagingError::validation(format!(
            "channel name is longer than {MAX_CHANNEL_NAME_CHARS} characters"
        )));
    }
    Ok(name.to_string())
}

fn validate_description(description: &str) -> MessagingResult<String> {
    let description = description.trim();
    if description.chars().count() > MAX_CHANNEL_DESCRIPTION_CHARS {
        return Err(MessagingError::validation(format!(
            "channel description is longer than {MAX_CHANNEL_DESCRIPTION_CHARS} characters"
        )));
    }
    Ok(description.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprout_database::MemoryStore;

    fn manager() -> ChannelManager {
        ChannelManager::new(Arc::new(MemoryStore::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn lock_entries_do_not_outlive_their_holders() {
        let manager = manager();

        for channel_id in 1_000..3_000 {
            assert!(matches!(
                manager.join(7, channel_id).await,
                Err(MessagingError::NotFound { .. })
            ));
            assert!(manager.leave(7, channel_id).await.is_err());
        }
        assert_eq!(manager.locks.len(), 0);

        let channel = manager
            .create(1, "general", "", Visibility::Public)
            .await
            .unwrap();
        manager.join(2, channel.id).await.unwrap();
        manager.promote(1, channel.id, 2).await.unwrap();
        assert_eq!(manager.locks.len(), 0);
    }

    #[tokio::test]
    async fn waiting_holder_keeps_the_entry() {
        let manager = manager();

        let first = manager.lock(5).await;
        let waiting = manager.lock(5);
        tokio::pin!(waiting);
        assert!(still_pending(waiting.as_mut()).await);

        drop(first);
        assert_eq!(manager.locks.len(), 1);
        let second = waiting.await;
        drop(second);
        assert_eq!(manager.locks.len(), 0);
    }

    async fn still_pending<F: std::future::Future>(future: std::pin::Pin<&mut F>) -> bool {
        tokio::time::timeout(Duration::from_millis(20), future)
            .await
            .is_err()
    }

    #[test]
    fn parse_update_keeps_only_known_fields() {
        let update = parse_update([
            ("name", "  crabs  "),
            ("topic", "ignored"),
            ("is_private", "true"),
        ])
        .unwrap();

        assert_eq!(update.name.as_deref(), Some("crabs"));
        assert_eq!(update.description, None);
        assert_eq!(update.visibility, Some(Visibility::Private));
    }

    #[test]
    fn parse_update_with_only_unknown_fields_is_empty() {
        let update = parse_update([("color", "green"), ("owner", "7")]).unwrap();
        assert!(update.is_empty());
    }

    #[test]
    fn parse_update_rejects_bad_values() {
        assert!(matches!(
            parse_update([("name", "   ")]),
            Err(MessagingError::Validation { .. })
        ));
        assert!(matches!(
            parse_update([("visibility", "sometimes")]),
            Err(MessagingError::Validation { .. })
        ));
        let long = "x".repeat(MAX_CHANNEL_DESCRIPTION_CHARS + 1);
        assert!(matches!(
            parse_update([("description", long.as_str())]),
            Err(MessagingError::Validation { .. })
        ));
    }

    #[test]
    fn name_limit_counts_characters() {
        let name = "é".repeat(MAX_CHANNEL_NAME_CHARS);
        assert!(validate_name(&name).is_ok());
        assert!(validate_name(&format!("{name}é")).is_err());
    }
}
