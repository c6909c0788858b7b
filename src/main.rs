use anyhow::Result;
use clap::{Parser, Subcommand};
use mdchat::config::config;
use mdchat::export::export_conversation;
use mdchat::logging;
use mdchat::provider::HttpProvider;
use mdchat::render::Renderer;
use mdchat::session::{ChatContext, UiEvent};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "mdchat", version, about = "Terminal client for a conversational AI service")]
struct Cli {
    /// Model to chat with (overrides config)
    #[arg(long)]
    model: Option<String>,

    /// Base URL of the chat service (overrides config)
    #[arg(long)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat (the default)
    Chat,
    /// List stored conversations
    List,
    /// Search stored conversations
    Search { query: String },
    /// Export a conversation to a standalone HTML file
    Export { id: String, output: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    logging::cleanup_old_logs();

    let cli = Cli::parse();

    let provider = match &cli.base_url {
        Some(url) => HttpProvider::with_base_url(url),
        None => HttpProvider::new(),
    };
    let ctx = ChatContext::new(Arc::new(provider), Renderer::plain())?;
    if let Some(model) = &cli.model {
        ctx.set_model(model);
    }

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => repl(ctx).await,
        Command::List => {
            list_conversations(&ctx);
            Ok(())
        }
        Command::Search { query } => {
            search(&ctx, &query);
            Ok(())
        }
        Command::Export { id, output } => export(&ctx, &id, &output).await,
    }
}

fn list_conversations(ctx: &Arc<ChatContext>) -> Vec<String> {
    let store = ctx.store();
    let mut ids = Vec::new();
    for (n, conv) in store.sorted_for_display().iter().enumerate() {
        println!(
            "{:>3}. {}  [{} messages, {}]",
            n + 1,
            conv.title,
            conv.messages.len(),
            conv.timestamp.format("%Y-%m-%d %H:%M")
        );
        ids.push(conv.id.clone());
    }
    if ids.is_empty() {
        println!("No stored conversations.");
    }
    ids
}

fn search(ctx: &Arc<ChatContext>, query: &str) {
    let hits = ctx.store().search(query);
    if hits.is_empty() {
        println!("No results found.");
        return;
    }
    for hit in hits {
        println!("{}\n    {}", hit.title, hit.context);
    }
}

async fn export(ctx: &Arc<ChatContext>, id: &str, output: &PathBuf) -> Result<()> {
    let conv = ctx
        .store()
        .get(id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("No conversation with id {}", id))?;
    let html = export_conversation(ctx.renderer(), &conv).await;
    std::fs::write(output, html)?;
    println!("Exported {} to {}", conv.title, output.display());
    Ok(())
}

/// Resolve a `:open`/`:delete` argument: a number from the last `:list`
/// output, or a raw conversation id.
fn resolve_id(listing: &[String], arg: &str) -> Option<String> {
    if let Ok(n) = arg.parse::<usize>() {
        return listing.get(n.checked_sub(1)?).cloned();
    }
    Some(arg.to_string())
}

async fn repl(ctx: Arc<ChatContext>) -> Result<()> {
    println!("mdchat — type a message to chat, :help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut listing: Vec<String> = Vec::new();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix(':') {
            let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
            let rest = rest.trim();
            match name {
                "help" => print_help(),
                "q" | "quit" | "exit" => break,
                "new" => {
                    if let Err(e) = ctx.handle(UiEvent::NewChat).await {
                        eprintln!("Error: {}", e);
                    } else {
                        println!("Started a new chat.");
                    }
                }
                "list" => listing = list_conversations(&ctx),
                "open" => match resolve_id(&listing, rest) {
                    Some(id) => match ctx.handle(UiEvent::OpenConversation { id }).await {
                        Ok(()) => show_transcript(&ctx).await,
                        Err(e) => eprintln!("Error: {}", e),
                    },
                    None => eprintln!("Unknown conversation: {}", rest),
                },
                "delete" => match resolve_id(&listing, rest) {
                    Some(id) => {
                        if let Err(e) = ctx.handle(UiEvent::DeleteConversation { id }).await {
                            eprintln!("Error: {}", e);
                        }
                    }
                    None => eprintln!("Unknown conversation: {}", rest),
                },
                "retry" => run_generation(&ctx, Action::Retry).await,
                "edit" => match rest.split_once(' ') {
                    Some((index, text)) => match index.parse::<usize>() {
                        Ok(index) => {
                            run_generation(&ctx, Action::Edit(index, text.to_string())).await
                        }
                        Err(_) => eprintln!("Usage: :edit <index> <new text>"),
                    },
                    None => eprintln!("Usage: :edit <index> <new text>"),
                },
                "search" => search(&ctx, rest),
                "model" => {
                    if rest.is_empty() {
                        println!("model: {}", ctx.model());
                    } else {
                        ctx.set_model(rest);
                    }
                }
                "image" => {
                    let previous = ctx.model();
                    ctx.set_model(&config().chat.image_model);
                    run_generation(&ctx, Action::Send(rest.to_string())).await;
                    ctx.set_model(&previous);
                    if let Some(last) = ctx.transcript().await.last() {
                        for url in last.content.image_urls() {
                            println!("image: {}", url);
                        }
                    }
                }
                "export" => {
                    let id = ctx.conversation_id().await;
                    if let Err(e) = export(&ctx, &id, &PathBuf::from(rest)).await {
                        eprintln!("Error: {}", e);
                    }
                }
                _ => eprintln!("Unknown command :{} (:help for help)", name),
            }
        } else {
            run_generation(&ctx, Action::Send(line)).await;
        }
    }

    Ok(())
}

enum Action {
    Send(String),
    Retry,
    Edit(usize, String),
}

/// Drive one generation, letting ctrl-c stop it mid-stream (the accumulated
/// text commits as a partial response).
async fn run_generation(ctx: &Arc<ChatContext>, action: Action) {
    let work = async {
        match action {
            Action::Send(text) => ctx.send(&text, Vec::new(), true).await,
            Action::Retry => ctx.regenerate(true).await,
            Action::Edit(index, text) => ctx.edit(index, &text, true).await,
        }
    };

    tokio::select! {
        result = work => {
            if let Err(e) = result {
                eprintln!("Error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            ctx.cancel().await;
            println!("\n[stopped]");
        }
    }
}

async fn show_transcript(ctx: &Arc<ChatContext>) {
    for message in ctx.transcript().await {
        let who = match message.role {
            mdchat::message::Role::User => "you",
            mdchat::message::Role::Assistant => "ai",
        };
        let text = message.content.text();
        if text.is_empty() {
            for url in message.content.image_urls() {
                println!("[{}] (image) {}", who, url);
            }
        } else {
            println!("[{}] {}", who, text);
        }
    }
}

fn print_help() {
    println!(
        "commands:\n  \
         :new                 start a new chat\n  \
         :list                list stored conversations\n  \
         :open <n|id>         open a conversation\n  \
         :delete <n|id>       delete a conversation\n  \
         :retry               regenerate the last response\n  \
         :edit <i> <text>     edit message i and regenerate from it\n  \
         :image <prompt>      generate an image\n  \
         :search <query>      search stored conversations\n  \
         :export <file>       export the current chat as HTML\n  \
         :model [name]        show or set the model\n  \
         :quit                exit\n\
         ctrl-c stops a response mid-stream and keeps the partial text"
    );
}
