use crate::chat::notifier::StreamView;
use crate::chat::{ChatSession, SendOutcome, StopHandle};
use crate::db::models::{Chat, ChatMessage, Role};
use crate::db::ChatStore;
use crate::llm::ChatTransport;
use std::future::Future;
use std::io::Write;
use tokio::sync::watch;

pub async fn send_message<S, T>(
    session: &mut ChatSession<S, T>,
    chat_id: Option<&str>,
    content: &str,
) -> Result<(), String>
where
    S: ChatStore,
    T: ChatTransport,
{
    match chat_id {
        Some(id) => {
            session.select_chat(id).await.map_err(|e| e.to_string())?;
        }
        None => session.start_new_chat(),
    }

    let views = session.subscribe_stream();
    let stop = session.stop_handle();
    let outcome = stream_to_stdout(session.send_message(content), views, stop).await;
    report(session.current_chat_id(), outcome)
}

pub async fn edit_message<S, T>(
    session: &mut ChatSession<S, T>,
    chat_id: &str,
    message_id: &str,
    content: &str,
) -> Result<(), String>
where
    S: ChatStore,
    T: ChatTransport,
{
    session.select_chat(chat_id).await.map_err(|e| e.to_string())?;

    let views = session.subscribe_stream();
    let stop = session.stop_handle();
    let outcome = stream_to_stdout(session.edit_and_resend(message_id, content), views, stop)
        .await
        .map_err(|e| e.to_string())?;
    report(Some(chat_id), outcome)
}

pub async fn delete_pair<S, T>(
    session: &mut ChatSession<S, T>,
    chat_id: &str,
    message_id: &str,
) -> Result<(), String>
where
    S: ChatStore,
    T: ChatTransport,
{
    session.select_chat(chat_id).await.map_err(|e| e.to_string())?;
    let chat = session
        .delete_pair(message_id)
        .await
        .map_err(|e| e.to_string())?;
    println!("{} message(s) left in {}", chat.messages.len(), chat.id);
    Ok(())
}

pub async fn delete_chat<S, T>(session: &mut ChatSession<S, T>, chat_id: &str) -> Result<(), String>
where
    S: ChatStore,
    T: ChatTransport,
{
    session.delete_chat(chat_id).await.map_err(|e| e.to_string())
}

pub async fn list_chats<S, T>(session: &mut ChatSession<S, T>) -> Result<(), String>
where
    S: ChatStore,
    T: ChatTransport,
{
    let chats = session.refresh_chats().await.map_err(|e| e.to_string())?;
    if chats.is_empty() {
        println!("No chats yet.");
    }
    for chat in &chats {
        println!(
            "{}  {:<50}  {:>3} msgs  {}",
            chat.id,
            chat.title,
            chat.messages.len(),
            chat.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub async fn show_chat<S, T>(session: &mut ChatSession<S, T>, chat_id: &str) -> Result<(), String>
where
    S: ChatStore,
    T: ChatTransport,
{
    let chat = session.select_chat(chat_id).await.map_err(|e| e.to_string())?;
    print_transcript(&chat);
    Ok(())
}

/// Runs `work` while echoing streamed text and turning Ctrl-C into a stop.
async fn stream_to_stdout<F, O>(
    work: F,
    mut views: watch::Receiver<Option<StreamView>>,
    stop: StopHandle,
) -> O
where
    F: Future<Output = O>,
{
    tokio::pin!(work);
    let mut printed = 0;
    let mut views_open = true;
    let mut signals_open = true;

    let output = loop {
        tokio::select! {
            output = &mut work => break output,
            changed = views.changed(), if views_open => match changed {
                Ok(()) => {
                    let view = views.borrow_and_update().clone();
                    printed = print_delta(view.as_ref(), printed);
                }
                Err(_) => views_open = false,
            },
            signal = tokio::signal::ctrl_c(), if signals_open => match signal {
                Ok(()) => {
                    if stop.stop_inference() {
                        eprintln!("\n[stopping]");
                    }
                }
                Err(_) => signals_open = false,
            },
        }
    };

    // final flush lands after the last poll of `views`
    let view = views.borrow_and_update().clone();
    print_delta(view.as_ref(), printed);
    output
}

fn print_delta(view: Option<&StreamView>, printed: usize) -> usize {
    let Some(view) = view else {
        return printed;
    };
    if view.content.len() > printed {
        print!("{}", &view.content[printed..]);
        std::io::stdout().flush().ok();
        return view.content.len();
    }
    printed
}

fn report(chat_id: Option<&str>, outcome: SendOutcome) -> Result<(), String> {
    match outcome {
        SendOutcome::Ignored => Ok(()),
        SendOutcome::Completed(message) | SendOutcome::Cancelled(message) => {
            println!();
            if let Some(message) = message {
                print_footer(&message);
            }
            if let Some(id) = chat_id {
                eprintln!("chat: {}", id);
            }
            Ok(())
        }
        SendOutcome::Failed(e) => Err(e.to_string()),
    }
}

fn print_transcript(chat: &Chat) {
    println!("# {}", chat.title);
    for message in &chat.messages {
        println!();
        let label = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        println!("[{}] {}", label, message.id);
        if let Some(thinking) = &message.thinking {
            println!("  (thinking) {}", thinking.replace('\n', "\n  "));
        }
        println!("{}", message.content);
        if message.role == Role::Assistant {
            print_footer(message);
        }
    }
}

fn print_footer(message: &ChatMessage) {
    let mut parts = Vec::new();
    if let Some(model) = &message.model {
        parts.push(model.clone());
    }
    if let Some(ms) = message.duration {
        parts.push(format!("{:.1}s", ms as f64 / 1000.0));
    }
    if let Some(ms) = message.thinking_duration {
        parts.push(format!("thought {:.1}s", ms as f64 / 1000.0));
    }
    if !parts.is_empty() {
        println!("-- {}", parts.join(" · "));
    }
    if let Some(sources) = &message.sources {
        for (id, source) in sources {
            match source.score {
                Some(score) => println!("  [{}] {} ({:.2})", id, source.url, score),
                None => println!("  [{}] {}", id, source.url),
            }
        }
    }
}
