use sprout_config::DatabaseConfig;
use sprout_database::{
    initialize_database, Conversation, ConversationFilter, MemberRole, MessageStore, NewChannel,
    NewMessage, Page, SqliteStore, StoreError, Visibility,
};
use tempfile::TempDir;

async fn setup_store() -> (SqliteStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = DatabaseConfig {
        url: format!("sqlite://{}", temp_dir.path().join("store.db").display()),
        max_connections: 4,
    };
    let pool = initialize_database(&config).await.unwrap();
    (SqliteStore::new(pool), temp_dir)
}

fn channel_request(creator_id: i64, visibility: Visibility) -> NewChannel {
    NewChannel {
        name: "rustaceans".to_string(),
        description: "all things ferris".to_string(),
        creator_id,
        visibility,
    }
}

fn direct(sender_id: i64, recipient_id: i64, content: &str) -> NewMessage {
    NewMessage {
        sender_id,
        conversation: Conversation::Direct { recipient_id },
        content: content.to_string(),
        attachments: Vec::new(),
    }
}

#[tokio::test]
async fn creating_a_channel_makes_the_creator_its_admin() {
    let (store, _dir) = setup_store().await;

    let channel = store
        .insert_channel(channel_request(7, Visibility::Private))
        .await
        .unwrap();

    let fetched = store.fetch_channel(channel.id).await.unwrap().unwrap();
    assert_eq!(fetched.name, "rustaceans");
    assert!(fetched.is_private());

    let members = store.fetch_members(channel.id).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].user_id, 7);
    assert_eq!(members[0].role, MemberRole::Admin);

    let channels = store.fetch_channels_for_user(7).await.unwrap();
    assert_eq!(channels.len(), 1);
    assert!(store.fetch_channels_for_user(8).await.unwrap().is_empty());
}

#[tokio::test]
async fn direct_history_covers_both_directions_newest_first() {
    let (store, _dir) = setup_store().await;

    store.insert_message(direct(1, 2, "first")).await.unwrap();
    store.insert_message(direct(2, 1, "second")).await.unwrap();
    store.insert_message(direct(1, 3, "elsewhere")).await.unwrap();

    let history = store
        .fetch_messages_by_conversation(
            ConversationFilter::Direct { user_a: 1, user_b: 2 },
            Page::default(),
        )
        .await
        .unwrap();

    let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["second", "first"]);
}

#[tokio::test]
async fn soft_deleted_messages_are_hidden_from_history() {
    let (store, _dir) = setup_store().await;

    let kept = store.insert_message(direct(1, 2, "kept")).await.unwrap();
    let removed = store.insert_message(direct(1, 2, "removed")).await.unwrap();

    store.soft_delete_message(removed.id).await.unwrap();

    let history = store
        .fetch_messages_by_conversation(
            ConversationFilter::Direct { user_a: 2, user_b: 1 },
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, kept.id);

    // The row survives with its flag set.
    let stored = store.fetch_message(removed.id).await.unwrap().unwrap();
    assert!(stored.is_deleted);
}

#[tokio::test]
async fn attachments_keep_their_order() {
    let (store, _dir) = setup_store().await;

    let mut message = direct(1, 2, "photos");
    message.attachments = vec!["a.png".to_string(), "b.png".to_string()];
    let stored = store.insert_message(message).await.unwrap();

    store.insert_attachment(stored.id, "c.png").await.unwrap();

    let fetched = store.fetch_message(stored.id).await.unwrap().unwrap();
    assert_eq!(fetched.attachments, vec!["a.png", "b.png", "c.png"]);

    let missing = store.insert_attachment(9999, "d.png").await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn mark_read_sets_the_flag_and_reports_missing_messages() {
    let (store, _dir) = setup_store().await;

    let stored = store.insert_message(direct(1, 2, "ping")).await.unwrap();
    store.mark_message_read(stored.id).await.unwrap();
    assert!(store.fetch_message(stored.id).await.unwrap().unwrap().is_read);

    let missing = store.mark_message_read(4242).await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn duplicate_membership_is_a_constraint_violation() {
    let (store, _dir) = setup_store().await;

    let channel = store
        .insert_channel(channel_request(1, Visibility::Public))
        .await
        .unwrap();
    store
        .insert_membership(channel.id, 2, MemberRole::Member)
        .await
        .unwrap();

    let duplicate = store.insert_membership(channel.id, 2, MemberRole::Member).await;
    assert!(matches!(duplicate, Err(StoreError::Constraint(_))));
}

#[tokio::test]
async fn role_changes_and_removal_are_persisted() {
    let (store, _dir) = setup_store().await;

    let channel = store
        .insert_channel(channel_request(1, Visibility::Public))
        .await
        .unwrap();
    store
        .insert_membership(channel.id, 2, MemberRole::Member)
        .await
        .unwrap();

    store
        .update_member_role(channel.id, 2, MemberRole::Admin)
        .await
        .unwrap();
    let member = store.fetch_membership(channel.id, 2).await.unwrap().unwrap();
    assert!(member.is_admin());

    assert!(store.remove_membership(channel.id, 2).await.unwrap());
    assert!(!store.remove_membership(channel.id, 2).await.unwrap());
    assert!(store.fetch_membership(channel.id, 2).await.unwrap().is_none());
}

#[tokio::test]
async fn metadata_update_touches_only_given_fields() {
    let (store, _dir) = setup_store().await;

    let channel = store
        .insert_channel(channel_request(1, Visibility::Public))
        .await
        .unwrap();

    let update = sprout_database::ChannelUpdate {
        name: Some("crabs".to_string()),
        description: None,
        visibility: Some(Visibility::Private),
    };
    store.update_channel_metadata(channel.id, &update).await.unwrap();

    let fetched = store.fetch_channel(channel.id).await.unwrap().unwrap();
    assert_eq!(fetched.name, "crabs");
    assert_eq!(fetched.description, "all things ferris");
    assert!(fetched.is_private());

    let missing = store
        .update_channel_metadata(999, &sprout_database::ChannelUpdate::default())
        .await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn deleting_a_channel_cascades() {
    let (store, _dir) = setup_store().await;

    let channel = store
        .insert_channel(channel_request(1, Visibility::Public))
        .await
        .unwrap();
    store
        .insert_membership(channel.id, 2, MemberRole::Member)
        .await
        .unwrap();
    let posted = store
        .insert_message(NewMessage {
            sender_id: 2,
            conversation: Conversation::Channel { channel_id: channel.id },
            content: "hello channel".to_string(),
            attachments: vec!["file.txt".to_string()],
        })
        .await
        .unwrap();

    store.delete_channel(channel.id).await.unwrap();

    assert!(store.fetch_channel(channel.id).await.unwrap().is_none());
    assert!(store.fetch_members(channel.id).await.unwrap().is_empty());
    assert!(store.fetch_channels_for_user(2).await.unwrap().is_empty());

    let history = store
        .fetch_messages_by_conversation(
            ConversationFilter::Channel { channel_id: channel.id },
            Page::default(),
        )
        .await
        .unwrap();
    assert!(history.is_empty());
    assert!(store.fetch_message(posted.id).await.unwrap().unwrap().is_deleted);

    let again = store.delete_channel(channel.id).await;
    assert!(matches!(again, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn failed_cascade_leaves_the_channel_untouched() {
    let (store, _dir) = setup_store().await;

    let channel = store
        .insert_channel(channel_request(1, Visibility::Public))
        .await
        .unwrap();
    store
        .insert_membership(channel.id, 2, MemberRole::Member)
        .await
        .unwrap();
    let posted = store
        .insert_message(NewMessage {
            sender_id: 2,
            conversation: Conversation::Channel { channel_id: channel.id },
            content: "still here".to_string(),
            attachments: Vec::new(),
        })
        .await
        .unwrap();

    // The channel row goes last, after messages are flagged and members removed.
    sqlx::query(
        "CREATE TRIGGER keep_channels BEFORE DELETE ON channels
         BEGIN SELECT RAISE(ABORT, 'channel deletion blocked'); END",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let result = store.delete_channel(channel.id).await;
    assert!(result.is_err());
    assert!(!matches!(result, Err(StoreError::NotFound(_))));

    assert!(store.fetch_channel(channel.id).await.unwrap().is_some());
    let members = store.fetch_members(channel.id).await.unwrap();
    assert_eq!(members.len(), 2);
    assert!(!store.fetch_message(posted.id).await.unwrap().unwrap().is_deleted);
}

#[tokio::test]
async fn failed_admin_insert_leaves_no_channel() {
    let (store, _dir) = setup_store().await;

    sqlx::query(
        "CREATE TRIGGER block_members BEFORE INSERT ON channel_members
         BEGIN SELECT RAISE(ABORT, 'membership blocked'); END",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let result = store
        .insert_channel(channel_request(1, Visibility::Private))
        .await;
    assert!(result.is_err());

    let channels: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM channels")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(channels, 0);
    assert!(store.fetch_channels_for_user(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn history_pages_respect_limit_and_offset() {
    let (store, _dir) = setup_store().await;

    for index in 0..5 {
        store
            .insert_message(direct(1, 2, &format!("message {index}")))
            .await
            .unwrap();
    }

    let page = store
        .fetch_messages_by_conversation(
            ConversationFilter::Direct { user_a: 1, user_b: 2 },
            Page::new(2, 1),
        )
        .await
        .unwrap();
    let contents: Vec<&str> = page.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["message 3", "message 2"]);
}
