//! End-to-end client sessions over the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use agora_client::backend::memory::MemoryBackend;
use agora_client::backend::DocumentBackend;
use agora_client::events::{event_channel, Action, ClientEvent, EventReceiver};
use agora_client::presence::PresenceStatus;
use agora_client::state::AppState;
use agora_client::{AgoraClient, ClientConfig, ClientError};
use agora_shared::{
    ConversationId, Locale, Message, MessageId, MessageRef, Reactions, Topic, UserId,
};
use agora_store::Database;

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn client_with(
    backend: &Arc<MemoryBackend>,
    database: Database,
) -> (AgoraClient<MemoryBackend>, EventReceiver) {
    let state = AppState::new(ClientConfig::default(), database).shared();
    let (tx, rx) = event_channel();
    let client = AgoraClient::new(Arc::clone(backend), state, tx).unwrap();
    (client, rx)
}

fn drain(rx: &mut EventReceiver) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn last_unread_total(events: &[ClientEvent]) -> Option<u32> {
    events.iter().rev().find_map(|e| match e {
        ClientEvent::UnreadChanged { total, .. } => Some(*total),
        _ => None,
    })
}

#[tokio::test]
async fn unread_counters_persist_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    backend.sign_in_as("alice");
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");

    let (client, mut rx) = client_with(&backend, Database::open_in_dir(dir.path()).unwrap());
    client.sign_in(alice.clone()).unwrap();

    let conversation = client.chat().open_conversation(&bob, &alice).await.unwrap();
    assert_eq!(conversation.id, ConversationId::for_participants(&alice, &bob));

    for text in ["one", "two", "three"] {
        client
            .chat()
            .send_direct_message(&conversation.id, &bob, text)
            .await
            .unwrap();
    }
    assert_eq!(client.unread_total(), 3);
    assert_eq!(last_unread_total(&drain(&mut rx)), Some(3));

    client.sign_out().await;
    assert_eq!(client.unread_total(), 0);
    drop(client);

    // Same data directory, fresh process.
    let (client, mut rx) = client_with(&backend, Database::open_in_dir(dir.path()).unwrap());
    client.sign_in(alice.clone()).unwrap();
    assert_eq!(client.unread_total(), 3);

    let reopened = client.open_conversation(&bob).await.unwrap();
    assert_eq!(reopened.id, conversation.id);
    assert_eq!(client.unread_total(), 0);

    // Messages in the open conversation are read on arrival.
    client
        .chat()
        .send_direct_message(&conversation.id, &bob, "four")
        .await
        .unwrap();
    assert_eq!(client.unread_total(), 0);

    client.close_conversation();
    client
        .chat()
        .send_direct_message(&conversation.id, &bob, "five")
        .await
        .unwrap();
    client
        .handle(Action::SendDirectMessage {
            conversation_id: conversation.id.clone(),
            text: "my reply".into(),
        })
        .await
        .unwrap();
    assert_eq!(client.unread_total(), 1);
    assert_eq!(last_unread_total(&drain(&mut rx)), Some(1));

    client.sign_out().await;
}

#[tokio::test]
async fn switching_accounts_does_not_share_counters() {
    let backend = Arc::new(MemoryBackend::new());
    backend.sign_in_as("alice");
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");
    let carol = UserId::from("carol");
    let (client, _rx) = client_with(&backend, Database::open_in_memory().unwrap());
    client.sign_in(alice.clone()).unwrap();

    let conversation = client.chat().open_conversation(&bob, &alice).await.unwrap();
    for text in ["one", "two", "three"] {
        client
            .chat()
            .send_direct_message(&conversation.id, &bob, text)
            .await
            .unwrap();
    }
    assert_eq!(client.unread_total(), 3);

    // Another account on the same device and database.
    backend.sign_in_as(carol.clone());
    client.sign_in(carol.clone()).unwrap();
    assert_eq!(client.current_user(), Some(carol));
    assert_eq!(client.unread_total(), 0);

    backend.sign_in_as(alice.clone());
    client.sign_in(alice).unwrap();
    assert_eq!(client.unread_total(), 3);
}

#[tokio::test]
async fn conversation_started_while_signed_out_counts_as_unread() {
    let backend = Arc::new(MemoryBackend::new());
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");

    // Bob writes first; alice has no session anywhere.
    backend.sign_in_as(bob.clone());
    let (bob_client, _bob_rx) = client_with(&backend, Database::open_in_memory().unwrap());
    let conversation = bob_client.chat().open_conversation(&bob, &alice).await.unwrap();
    for text in ["ping", "still there?"] {
        bob_client
            .chat()
            .send_direct_message(&conversation.id, &bob, text)
            .await
            .unwrap();
    }

    backend.sign_in_as(alice.clone());
    let (client, mut rx) = client_with(&backend, Database::open_in_memory().unwrap());
    client.sign_in(alice.clone()).unwrap();
    assert_eq!(client.unread_total(), 2);
    assert_eq!(last_unread_total(&drain(&mut rx)), Some(2));

    client.open_conversation(&bob).await.unwrap();
    assert_eq!(client.unread_total(), 0);
}

#[tokio::test]
async fn channel_timeline_and_thread_events() {
    let backend = Arc::new(MemoryBackend::new());
    backend.sign_in_as("alice");
    let alice = UserId::from("alice");
    let (client, mut rx) = client_with(&backend, Database::open_in_memory().unwrap());
    client.sign_in(alice.clone()).unwrap();

    let channel = client
        .chat()
        .create_channel("design", "", &alice)
        .await
        .unwrap();
    let second: Topic = client.chat().create_topic(&channel.id, "review").await.unwrap();

    let timeline = client.watch_channel(&channel.id);
    let root = Message {
        id: MessageId::from("m1"),
        text: "proposal".into(),
        sender_id: alice.clone(),
        timestamp: ts(100),
        topic_id: second.id.clone(),
        channel_id: channel.id.clone(),
        parent_message_id: None,
        reactions: Reactions::new(),
        thread_count: 0,
        edited_at: None,
    };
    backend.add_message(root.clone()).await.unwrap();
    let thread = client.watch_thread(&channel.id, &root.id);

    client
        .handle(Action::SendMessage {
            channel_id: channel.id.clone(),
            topic_id: second.id.clone(),
            text: "looks good".into(),
            parent: Some(root.id.clone()),
        })
        .await
        .unwrap();

    let events = drain(&mut rx);
    let roots = events
        .iter()
        .rev()
        .find_map(|e| match e {
            ClientEvent::TimelineUpdated { messages, .. } => Some(messages.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].id, root.id);
    assert_eq!(roots[0].thread_count, 1);

    let replies = events
        .iter()
        .rev()
        .find_map(|e| match e {
            ClientEvent::ThreadUpdated { replies, .. } => Some(replies.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].text, "looks good");

    // An empty message is rejected and reported to the view layer.
    let err = client
        .handle(Action::SendMessage {
            channel_id: channel.id.clone(),
            topic_id: second.id.clone(),
            text: "   ".into(),
            parent: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidInput(_)));
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, ClientEvent::Error { .. })));

    thread.unsubscribe();
    timeline.unsubscribe();
    assert_eq!(backend.topic_listener_count(&channel.id, &second.id), 0);
}

#[tokio::test]
async fn reactions_keep_one_emoji_per_user() {
    let backend = Arc::new(MemoryBackend::new());
    backend.sign_in_as("alice");
    let alice = UserId::from("alice");
    let bob = UserId::from("bob");
    let (client, _rx) = client_with(&backend, Database::open_in_memory().unwrap());
    client.sign_in(alice.clone()).unwrap();

    let conversation = client.chat().open_conversation(&alice, &bob).await.unwrap();
    let message = client
        .chat()
        .send_direct_message(&conversation.id, &bob, "lunch?")
        .await
        .unwrap();
    let target = MessageRef::from(&message);

    client.reactions().select_emoji(&target, &bob, "👍").await.unwrap();
    client
        .handle(Action::React {
            target: target.clone(),
            emoji: "👍".into(),
        })
        .await
        .unwrap();
    client
        .handle(Action::React {
            target: target.clone(),
            emoji: "🍕".into(),
        })
        .await
        .unwrap();

    let reactions = backend.get_reactions(&target).await.unwrap();
    assert_eq!(reactions.get("👍").map(|e| e.count), Some(1));
    assert_eq!(reactions.held_by(&alice), Some("🍕"));
    assert_eq!(reactions.held_by(&bob), Some("👍"));

    // Clicking the held chip again removes it.
    client
        .handle(Action::React {
            target: target.clone(),
            emoji: "🍕".into(),
        })
        .await
        .unwrap();
    let reactions = backend.get_reactions(&target).await.unwrap();
    assert_eq!(reactions.held_by(&alice), None);
    assert_eq!(reactions.total(), 1);

    let frequent = client.reactions().frequent_emojis(5).unwrap();
    assert!(frequent.iter().any(|u| u.emoji == "🍕"));
}

#[tokio::test]
async fn presence_follows_the_session() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set_connected(true);
    backend.sign_in_as("alice");
    let alice = UserId::from("alice");
    let (client, mut rx) = client_with(&backend, Database::open_in_memory().unwrap());

    let mut status = client.presence().watch_status();
    client.sign_in(alice.clone()).unwrap();
    tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| *s == PresenceStatus::Online),
    )
    .await
    .expect("timed out waiting for online")
    .unwrap();
    assert!(backend.presence_of(&alice).unwrap().is_online());
    assert!(backend.has_on_disconnect(&alice));

    let watcher = client.watch_presence(&alice);
    client.handle(Action::SignOut).await.unwrap();

    assert!(!backend.presence_of(&alice).unwrap().is_online());
    assert!(!backend.has_on_disconnect(&alice));
    assert_eq!(client.presence().status(), PresenceStatus::Offline);
    assert_eq!(client.current_user(), None);

    let events = drain(&mut rx);
    let last_record = events
        .iter()
        .rev()
        .find_map(|e| match e {
            ClientEvent::PresenceChanged { record, .. } => Some(*record),
            _ => None,
        })
        .unwrap();
    assert!(!last_record.unwrap().is_online());

    watcher.unsubscribe();
    assert_eq!(backend.presence_listener_count(&alice), 0);
}

#[tokio::test]
async fn rejected_sign_in_reports_localised_message() {
    let backend = Arc::new(MemoryBackend::new());
    let state = AppState::new(ClientConfig::default(), Database::open_in_memory().unwrap()).shared();
    let (tx, mut rx) = event_channel();
    let client = AgoraClient::new(backend, state, tx)
        .unwrap()
        .with_locale(Locale::Fr);

    let err = client.sign_in_failed("auth/wrong-password");
    assert_eq!(err.user_message(Locale::En), "Incorrect email or password.");

    match drain(&mut rx).pop() {
        Some(ClientEvent::Error { message }) => {
            assert_eq!(message, "E-mail ou mot de passe incorrect.")
        }
        other => panic!("expected an error event, got {other:?}"),
    }
    assert!(client.watch_typing("dm:x").is_err());
}
