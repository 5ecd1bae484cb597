use ai_chat_lib::commands::{chat, settings};
use ai_chat_lib::config::ConfigArgs;
use ai_chat_lib::{AppConfig, BackendClient};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ai-chat", version, about = "Chat with LLMs through a streaming backend")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message and stream the reply (Ctrl-C stops it)
    Send {
        /// Continue this chat instead of starting a new one
        #[arg(long)]
        chat: Option<String>,
        text: String,
    },
    /// List chats
    Chats,
    /// Print a chat transcript
    Show { chat_id: String },
    /// Replace a message and everything after it with a new turn
    Edit {
        chat_id: String,
        message_id: String,
        text: String,
    },
    /// Delete a message together with its question or answer
    DeletePair { chat_id: String, message_id: String },
    /// Delete a whole chat
    DeleteChat { chat_id: String },
    /// Inspect or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// List the models the backend reports for a provider
    Models { provider: String, api_key: String },
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    Set { key: String, value: String },
    AddProvider {
        name: String,
        api_key: String,
        /// Comma-separated model names
        models: String,
    },
    Use { provider: String, model: String },
}

#[tokio::main]
async fn main() {
    ai_chat_lib::init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from(cli.config);

    if let Err(e) = run(config, cli.command).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: AppConfig, command: Command) -> Result<(), String> {
    if let Command::Models { provider, api_key } = &command {
        let client = BackendClient::new(config.backend_url.clone());
        return settings::list_models(&client, provider, api_key).await;
    }

    let (db, mut session) = ai_chat_lib::open_session(&config).map_err(|e| e.to_string())?;
    match command {
        Command::Send { chat: chat_id, text } => {
            chat::send_message(&mut session, chat_id.as_deref(), &text).await
        }
        Command::Chats => chat::list_chats(&mut session).await,
        Command::Show { chat_id } => chat::show_chat(&mut session, &chat_id).await,
        Command::Edit {
            chat_id,
            message_id,
            text,
        } => chat::edit_message(&mut session, &chat_id, &message_id, &text).await,
        Command::DeletePair {
            chat_id,
            message_id,
        } => chat::delete_pair(&mut session, &chat_id, &message_id).await,
        Command::DeleteChat { chat_id } => chat::delete_chat(&mut session, &chat_id).await,
        Command::Settings { action } => match action {
            SettingsAction::Show => settings::show_settings(&db),
            SettingsAction::Set { key, value } => settings::set_setting(&db, &key, &value),
            SettingsAction::AddProvider {
                name,
                api_key,
                models,
            } => settings::add_provider(&db, &name, &api_key, &models),
            SettingsAction::Use { provider, model } => settings::use_model(&db, &provider, &model),
        },
        Command::Models { .. } => Ok(()),
    }
}
