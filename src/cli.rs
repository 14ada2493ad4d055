use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::ClientConfig;

#[derive(Parser, Debug)]
#[command(name = "turnstream")]
#[command(version)]
#[command(about = "Streaming conversation client with live push updates")]
pub struct Args {
    /// TOML config file (defaults, then this file, then TURNSTREAM_* env vars)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the backend base URL
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a prompt and stream the reply to the terminal. Ctrl-C stops the
    /// generation and keeps the partial reply.
    Chat {
        /// Prompt text
        prompt: String,

        /// Continue an existing conversation instead of creating one
        #[arg(long)]
        conversation: Option<String>,

        /// Model to request (defaults to the configured model)
        #[arg(long)]
        model: Option<String>,

        /// System prompt for this request
        #[arg(long)]
        system: Option<String>,

        /// Attach a file (repeatable)
        #[arg(long = "attach", value_name = "FILE")]
        attachments: Vec<PathBuf>,

        /// Hide reasoning output
        #[arg(long)]
        no_reasoning: bool,
    },

    /// Print the conversation list
    List,

    /// Keep the notification channel open and print what it pushes
    Watch,
}

impl Args {
    /// Config file and env, with flags applied on top.
    pub fn resolve_config(&self) -> crate::error::Result<ClientConfig> {
        let mut config = ClientConfig::load(self.config.as_deref())?;
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        Ok(config)
    }
}
