//! Command-line front end for the document chat pipeline.
//!
//! Environment: `DOCCHAT_CONFIG` points at a JSON config file, `DOCCHAT_USER`
//! names the caller (defaults to `$USER`), `RUST_LOG` sets the log filter.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};

use docchat_rag::{
    AppConfig, ChatRequest, ChatType, ConversationStyle, RagChat, UploadedFile, UserIdentity,
};

#[derive(Parser, Debug)]
#[command(name = "docchat")]
#[command(version, about = "Chat with your documents from the terminal")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index a file into a thread
    Upload {
        thread_id: String,
        file: PathBuf,
    },
    /// Ask a question, the answer is streamed to stdout
    Chat {
        thread_id: String,

        /// Answer from the thread's documents
        #[arg(long)]
        data: bool,

        /// Model for a new thread
        #[arg(long, default_value = "gpt-4o")]
        model: String,

        /// Style for a new thread
        #[arg(long, value_enum, default_value_t = Style::Balanced)]
        style: Style,

        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// List your threads
    Threads,
    /// Print a thread's transcript as JSON
    #[command(alias = "report")]
    History { thread_id: String },
    /// Delete a thread
    Delete { thread_id: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Creative,
    Balanced,
    Precise,
}

impl From<Style> for ConversationStyle {
    fn from(style: Style) -> Self {
        match style {
            Style::Creative => ConversationStyle::Creative,
            Style::Balanced => ConversationStyle::Balanced,
            Style::Precise => ConversationStyle::Precise,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli.command).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<()> {
    let rag = RagChat::from_config(load_config()?).await?;
    let user = current_user();

    match command {
        Command::Upload { thread_id, file } => {
            let name = rag
                .upload_document(&user, Some(thread_id.as_str()), Some(read_upload(&file)?))
                .await?;
            println!("Indexed {}", name);
        }
        Command::Chat {
            thread_id,
            data,
            model,
            style,
            message,
        } => {
            let chat_type = if data { ChatType::Document } else { ChatType::Simple };
            let mut request =
                ChatRequest::single_turn(thread_id, model, chat_type, message.join(" "));
            request.conversation_style = style.into();

            let mut stream = rag.chat(&user, request).await?;
            let mut stdout = std::io::stdout();
            while let Some(token) = stream.next().await {
                write!(stdout, "{}", token?)?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }
        Command::Threads => {
            for thread in rag.list_threads(&user).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    thread.id,
                    thread.created_at.format("%Y-%m-%d %H:%M"),
                    thread.chat_type.as_str(),
                    thread.name
                );
            }
        }
        Command::History { thread_id } => {
            let report = rag.thread_report(&user, &thread_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Delete { thread_id } => {
            rag.delete_thread(&user, &thread_id).await?;
            println!("Deleted {}", thread_id);
        }
    }
    Ok(())
}

fn load_config() -> Result<AppConfig> {
    let config = match std::env::var("DOCCHAT_CONFIG") {
        Ok(path) => AppConfig::from_file(&PathBuf::from(path)).map_err(|e| anyhow!(e))?,
        Err(_) => AppConfig::default(),
    };
    config.with_env_overrides().map_err(|e| anyhow!(e))
}

fn current_user() -> UserIdentity {
    let id = std::env::var("DOCCHAT_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "local".to_string());
    UserIdentity::new(id.clone(), id)
}

fn read_upload(path: &Path) -> Result<UploadedFile> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let mime_type = mime_guess::from_path(path).first_or_octet_stream();
    Ok(UploadedFile::new(name, mime_type.essence_str(), bytes))
}
