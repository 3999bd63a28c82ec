//! # agora-sim
//!
//! Scripted two-user session against the in-memory backend.
//!
//! Exercises the client core end to end: channel creation, threaded
//! messages across topics, reactions, direct messages with unread
//! counters, presence and typing indicators.  Every client event is
//! printed as JSON.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::info;

use agora_client::backend::memory::MemoryBackend;
use agora_client::backend::{BackendError, DocumentBackend};
use agora_client::events::{event_channel, Action};
use agora_client::state::AppState;
use agora_client::subscription::lock;
use agora_client::{init_tracing, AgoraClient, ClientConfig};
use agora_shared::time::{group_by_day, time_label};
use agora_shared::{ChannelId, Message, MessageRef, Topic, UserId};
use agora_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    init_tracing();
    info!("Starting Agora simulator v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and local storage
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");

    let offset = config.utc_offset();
    let database = match &config.data_dir {
        Some(dir) => Database::open_in_dir(dir)?,
        None => Database::open_in_memory()?,
    };
    let state = AppState::new(config, database).shared();

    // -----------------------------------------------------------------------
    // 3. Wire the client to the in-memory backend
    // -----------------------------------------------------------------------
    let backend = Arc::new(MemoryBackend::new());
    backend.set_connected(true);

    let (events_tx, mut events_rx) = event_channel();
    let client = AgoraClient::new(Arc::clone(&backend), state, events_tx)?;

    let alice = UserId::from("alice");
    let bob = UserId::from("bob");

    backend.sign_in_as(alice.clone());
    client.sign_in(alice.clone())?;

    // -----------------------------------------------------------------------
    // 4. Channel with two topics and a thread
    // -----------------------------------------------------------------------
    let channel = client
        .chat()
        .create_channel("launch", "Release coordination", &alice)
        .await?;
    let checklist = client.chat().create_topic(&channel.id, "checklist").await?;
    let timeline = client.watch_channel(&channel.id);

    let root = client
        .chat()
        .send_message(&channel.id, &checklist.id, &alice, "Ship it on Friday?", None)
        .await?;
    let thread = client.watch_thread(&channel.id, &root.id);

    client.chat().join_channel(&channel.id, &bob).await?;
    client
        .handle(Action::SendMessage {
            channel_id: channel.id.clone(),
            topic_id: checklist.id.clone(),
            text: "Docs are ready".into(),
            parent: Some(root.id.clone()),
        })
        .await?;

    let target = MessageRef::from(&root);
    client
        .reactions()
        .select_emoji(&target, &bob, "👍")
        .await?;
    client
        .reactions()
        .select_emoji(&target, &alice, "🎉")
        .await?;

    // -----------------------------------------------------------------------
    // 5. Direct messages and unread counters
    // -----------------------------------------------------------------------
    let conversation = client.chat().open_conversation(&bob, &alice).await?;
    let presence = client.watch_presence(&bob);
    let typing = client.watch_typing(&format!("dm:{}", conversation.id))?;

    for text in ["hey", "are you around?", "need a review"] {
        client
            .chat()
            .send_direct_message(&conversation.id, &bob, text)
            .await?;
    }
    info!(unread = client.unread_total(), "after bob's messages");

    client.open_conversation(&bob).await?;
    info!(unread = client.unread_total(), "after opening the conversation");

    // -----------------------------------------------------------------------
    // 6. Day grouping of the channel history
    // -----------------------------------------------------------------------
    let history = topic_snapshot(&backend, &channel.id, &checklist);
    for group in group_by_day(&history, Utc::now(), offset) {
        for message in &group.messages {
            info!(
                day = %group.label,
                time = %time_label(message.timestamp, offset),
                text = %message.text,
                "history"
            );
        }
    }

    // -----------------------------------------------------------------------
    // 7. Tear down
    // -----------------------------------------------------------------------
    typing.unsubscribe();
    presence.unsubscribe();
    thread.unsubscribe();
    timeline.unsubscribe();
    client.handle(Action::SignOut).await?;

    let mut count = 0usize;
    while let Ok(event) = events_rx.try_recv() {
        println!("{}", serde_json::to_string(&event)?);
        count += 1;
    }
    info!(events = count, "Simulator finished");
    Ok(())
}

/// Current messages of one topic, read through a short-lived watch.
fn topic_snapshot(backend: &MemoryBackend, channel_id: &ChannelId, topic: &Topic) -> Vec<Message> {
    let snapshot: Arc<Mutex<Vec<Message>>> = Arc::default();
    let sink = Arc::clone(&snapshot);
    let sub = backend.watch_topic_messages(
        channel_id,
        topic,
        Box::new(move |result: Result<Vec<Message>, BackendError>| {
            if let Ok(messages) = result {
                *lock(&sink) = messages;
            }
        }),
    );
    sub.unsubscribe();
    let messages = lock(&snapshot).clone();
    messages
}
