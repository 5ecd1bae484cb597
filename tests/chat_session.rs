mod common;

use ai_chat_lib::db::models::Role;
use ai_chat_lib::{ChatError, ChatStore, LlmError, SendOutcome, SessionState};
use common::{content_frame, session_with, Reply};
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_streamed_reply_is_persisted_with_timing() {
    let hi = content_frame("Hi");
    let there = content_frame(" there");
    let (mut session, store, transport) =
        session_with(vec![Reply::frames(&[(200, &hi), (300, &there)])]);

    let outcome = session.send_message("Hello").await;
    let reply = match outcome {
        SendOutcome::Completed(Some(reply)) => reply,
        other => panic!("expected a completed reply, got {:?}", other),
    };
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.content, "Hi there");
    assert_eq!(reply.duration, Some(300));
    assert_eq!(reply.model.as_deref(), Some("llama3-70b"));
    assert_eq!(reply.provider.as_deref(), Some("groq"));
    assert_eq!(reply.thinking, None);
    assert_eq!(session.state(), SessionState::Idle);

    let chat = store
        .get_chat_by_id(session.current_chat_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chat.title, "Hello");
    assert_eq!(chat.messages.len(), 2);
    assert_eq!(chat.messages[0].content, "Hello");
    assert_eq!(chat.messages[0].model.as_deref(), Some("llama3-70b"));
    assert_eq!(chat.messages[1].id, reply.id);

    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].conversation.len(), 1);
    assert_eq!(requests[0].model.provider, "groq");
    assert_eq!(requests[0].model.key, "gsk_test");
    assert!(requests[0].web_search);
    assert_eq!(requests[0].tavily_api_key, "tvly_test");
}

#[tokio::test(start_paused = true)]
async fn test_final_view_is_flushed_and_chat_list_refreshed() {
    let frame = content_frame("done");
    let (mut session, _store, _transport) = session_with(vec![Reply::frames(&[(5, &frame)])]);
    let views = session.subscribe_stream();
    let chats = session.subscribe_chats();

    session.send_message("go").await;

    let view = views.borrow().clone().unwrap();
    assert_eq!(view.content, "done");
    assert!(!view.streaming);
    assert_eq!(view.chat_id, session.current_chat_id().unwrap());

    let listed = chats.borrow().clone();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].messages.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_second_send_continues_same_chat() {
    let a = content_frame("one");
    let b = content_frame("two");
    let (mut session, store, transport) =
        session_with(vec![Reply::frames(&[(1, &a)]), Reply::frames(&[(1, &b)])]);

    session.send_message("first").await;
    let chat_id = session.current_chat_id().unwrap().to_string();
    session.send_message("second").await;
    assert_eq!(session.current_chat_id(), Some(chat_id.as_str()));

    let chat = store.get_chat_by_id(&chat_id).await.unwrap().unwrap();
    let contents: Vec<_> = chat.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["first", "one", "second", "two"]);
    assert_eq!(transport.requests()[1].conversation.len(), 3);
    assert_eq!(store.get_chats().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_keeps_partial_reply() {
    let par = content_frame("Par");
    let (mut session, store, _transport) =
        session_with(vec![Reply::frames_then_hang(&[(10, &par)])]);
    let stop = session.stop_handle();

    let (outcome, stopped) = tokio::join!(session.send_message("Tell me a story"), async {
        sleep(Duration::from_millis(50)).await;
        stop.stop_inference()
    });

    assert!(stopped);
    let reply = match outcome {
        SendOutcome::Cancelled(Some(reply)) => reply,
        other => panic!("expected a cancelled reply, got {:?}", other),
    };
    assert_eq!(reply.content, "Par");
    assert_eq!(reply.duration, Some(40));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(!session.stop_inference());

    let chat = store
        .get_chat_by_id(session.current_chat_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chat.messages.len(), 2);
    assert_eq!(chat.messages[1].content, "Par");
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_any_content_persists_nothing() {
    let (mut session, store, _transport) = session_with(vec![Reply::frames_then_hang(&[])]);
    let stop = session.stop_handle();

    let (outcome, _) = tokio::join!(session.send_message("Hi"), async {
        sleep(Duration::from_millis(50)).await;
        stop.stop_inference()
    });

    assert!(matches!(outcome, SendOutcome::Cancelled(None)));
    let chat = store
        .get_chat_by_id(session.current_chat_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chat.messages.len(), 1);
    assert_eq!(chat.messages[0].role, Role::User);
}

#[tokio::test(start_paused = true)]
async fn test_backend_error_keeps_user_turn_only() {
    let (mut session, store, _transport) = session_with(vec![Reply::Status(500)]);

    let outcome = session.send_message("Hello").await;
    assert!(matches!(
        outcome.error(),
        Some(ChatError::Transport(LlmError::Api { status: 500, .. }))
    ));
    assert_eq!(session.state(), SessionState::Idle);

    let chat = store
        .get_chat_by_id(session.current_chat_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chat.messages.len(), 1);
    assert_eq!(chat.messages[0].content, "Hello");
}

#[tokio::test(start_paused = true)]
async fn test_blank_message_is_ignored() {
    let (mut session, store, transport) = session_with(vec![]);

    assert!(matches!(session.send_message("   ").await, SendOutcome::Ignored));
    assert!(session.current_chat_id().is_none());
    assert!(store.get_chats().await.unwrap().is_empty());
    assert!(transport.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_first_turn_discards_new_chat() {
    let (mut session, store, transport) = session_with(vec![]);
    store.reject_user_turns(true);

    assert!(matches!(session.send_message("hello").await, SendOutcome::Ignored));
    assert!(session.current_chat_id().is_none());
    assert!(store.get_chats().await.unwrap().is_empty());
    assert!(transport.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_missing_active_model_fails_after_user_turn() {
    let (mut session, store, transport) = session_with(vec![]);
    let mut settings = session.settings().clone();
    settings.active = None;
    session.set_settings(settings);

    let outcome = session.send_message("anyone there?").await;
    assert!(matches!(outcome.error(), Some(ChatError::NoActiveModel)));
    assert!(transport.requests().is_empty());

    let chat = store
        .get_chat_by_id(session.current_chat_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chat.messages.len(), 1);
    assert_eq!(chat.messages[0].model, None);
}

#[tokio::test(start_paused = true)]
async fn test_thinking_and_sources_are_recorded() {
    let frames = [
        (10, r#"data: {"thinking":"Let me "}"#.to_string() + "\n"),
        (20, r#"data: {"thinking":"check."}"#.to_string() + "\n"),
        (
            30,
            r#"data: {"content":"Answer","sources":{"1":{"url":"https://a.example"}}}"#
                .to_string()
                + "\n",
        ),
        (
            40,
            r#"data: {"content":"!","sources":{"2":{"url":"https://b.example"}}}"#.to_string()
                + "\n",
        ),
    ];
    let frames: Vec<(u64, &str)> = frames.iter().map(|(d, f)| (*d, f.as_str())).collect();
    let (mut session, _store, _transport) = session_with(vec![Reply::frames(&frames)]);

    let outcome = session.send_message("why?").await;
    let reply = outcome.message().unwrap();
    assert_eq!(reply.content, "Answer!");
    assert_eq!(reply.thinking.as_deref(), Some("Let me check."));
    // thinking from t=10 until the first answer fragment at t=60
    assert_eq!(reply.thinking_duration, Some(50));
    assert_eq!(reply.duration, Some(90));

    let sources = reply.sources.as_ref().unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources["1"].url, "https://a.example");
}

#[tokio::test(start_paused = true)]
async fn test_error_frames_and_noise_do_not_break_the_stream() {
    let a = content_frame("still ");
    let b = content_frame("here");
    let chunks = [
        (1, a.as_str()),
        (1, "data: {\"error\":\"rate limited\"}\n"),
        (1, ": keep-alive\n\ndata: {not json}\n"),
        (1, b.as_str()),
    ];
    let (mut session, _store, _transport) = session_with(vec![Reply::frames(&chunks)]);

    let outcome = session.send_message("ping").await;
    assert_eq!(outcome.message().unwrap().content, "still here");
}

#[tokio::test(start_paused = true)]
async fn test_views_are_throttled_while_streaming() {
    let a = content_frame("a");
    let b = content_frame("b");
    let (mut session, _store, _transport) =
        session_with(vec![Reply::frames_then_hang(&[(10, &a), (10, &b)])]);
    let session_views = session.subscribe_stream();
    let stop = session.stop_handle();

    let (outcome, seen) = tokio::join!(session.send_message("go"), async {
        sleep(Duration::from_millis(50)).await;
        let seen = session_views.borrow().clone();
        stop.stop_inference();
        seen
    });

    // "b" arrived 10ms after "a", inside the publish interval
    let seen = seen.unwrap();
    assert_eq!(seen.content, "a");
    assert!(seen.streaming);
    assert_eq!(outcome.message().unwrap().content, "ab");
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_user_turn_write_skips_request() {
    let frame = content_frame("full reply");
    let (mut session, store, transport) = session_with(vec![Reply::frames(&[(1, &frame)])]);
    store.slow_user_turns(Duration::from_millis(50));
    let stop = session.stop_handle();

    let (outcome, stopped) = tokio::join!(session.send_message("Hello"), async {
        sleep(Duration::from_millis(10)).await;
        stop.stop_inference()
    });

    assert!(stopped);
    assert!(matches!(outcome, SendOutcome::Cancelled(None)));
    assert!(transport.requests().is_empty());
    assert_eq!(session.state(), SessionState::Idle);

    let chat = store
        .get_chat_by_id(session.current_chat_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chat.messages.len(), 1);
    assert_eq!(chat.messages[0].role, Role::User);
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_connecting_ends_session_for_subscribers() {
    let (mut session, _store, transport) = session_with(vec![Reply::Stall]);
    let mut views = session.subscribe_stream();
    let chats = session.subscribe_chats();
    let stop = session.stop_handle();

    let (outcome, stopped) = tokio::join!(session.send_message("Hello"), async {
        sleep(Duration::from_millis(30)).await;
        stop.stop_inference()
    });

    assert!(stopped);
    assert!(matches!(outcome, SendOutcome::Cancelled(None)));
    assert_eq!(transport.requests().len(), 1);
    assert!(views.has_changed().unwrap());
    assert!(views.borrow_and_update().is_none());

    let listed = chats.borrow().clone();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_mid_stream_drops_partial_reply() {
    let partial = content_frame("partial");
    let (mut session, store, _transport) =
        session_with(vec![Reply::broken(&[(10, &partial)], "connection reset")]);
    let views = session.subscribe_stream();

    let outcome = session.send_message("Hello").await;
    match outcome.error() {
        Some(ChatError::Transport(LlmError::Parse(message))) => {
            assert_eq!(message, "connection reset")
        }
        other => panic!("expected a transport failure, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Idle);
    assert!(views.borrow().is_none());

    let chat = store
        .get_chat_by_id(session.current_chat_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chat.messages.len(), 1);
    assert_eq!(chat.messages[0].content, "Hello");
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_caused_by_stop_counts_as_cancel() {
    let partial = content_frame("partial");
    let (mut session, store, transport) = session_with(vec![]);
    transport.push(Reply::Broken {
        chunks: vec![(10, partial)],
        error: "connection aborted".into(),
        stop: Some(session.stop_handle()),
    });

    let outcome = session.send_message("Hello").await;
    let reply = match outcome {
        SendOutcome::Cancelled(Some(reply)) => reply,
        other => panic!("expected a cancelled reply, got {:?}", other),
    };
    assert_eq!(reply.content, "partial");

    let chat = store
        .get_chat_by_id(session.current_chat_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chat.messages.len(), 2);
    assert_eq!(chat.messages[1].content, "partial");
}
