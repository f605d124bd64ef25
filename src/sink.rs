//! Where rendered report chunks end up.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{Secret, SinkConfig};

const DISCORD_API: &str = "https://discord.com/api/v10";

pub trait Sink {
    fn deliver(&self, chunks: &[String]) -> Result<()>;
}

pub struct StdoutSink;

impl Sink for StdoutSink {
    fn deliver(&self, chunks: &[String]) -> Result<()> {
        let mut stdout = io::stdout().lock();
        for chunk in chunks {
            writeln!(stdout, "{chunk}\n")?;
        }
        Ok(())
    }
}

pub struct FileSink {
    pub path: PathBuf,
}

impl Sink for FileSink {
    fn deliver(&self, chunks: &[String]) -> Result<()> {
        let mut file = File::create(&self.path)
            .with_context(|| format!("Failed to create {}", self.path.display()))?;
        for chunk in chunks {
            writeln!(file, "{chunk}\n")?;
        }
        info!("Report written to {}", self.path.display());
        Ok(())
    }
}

#[derive(Serialize)]
struct DiscordMessage<'a> {
    content: &'a str,
}

/// Posts each chunk as one message to a Discord channel.
pub struct DiscordSink {
    api: String,
    channel_id: String,
    token: Secret,
    client: reqwest::blocking::Client,
}

impl DiscordSink {
    pub fn new(channel_id: String, token: Secret) -> Self {
        Self {
            api: DISCORD_API.to_string(),
            channel_id,
            token,
            client: reqwest::blocking::Client::new(),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/channels/{}/messages", self.api, self.channel_id)
    }
}

impl Sink for DiscordSink {
    fn deliver(&self, chunks: &[String]) -> Result<()> {
        let url = self.messages_url();
        for (i, chunk) in chunks.iter().enumerate() {
            debug!("Posting chunk {}/{} to channel {}", i + 1, chunks.len(), self.channel_id);
            self.client
                .post(&url)
                .header("Authorization", format!("Bot {}", self.token.expose()))
                .json(&DiscordMessage { content: chunk })
                .send()
                .and_then(|response| response.error_for_status())
                .with_context(|| format!("Failed to post to Discord channel {}", self.channel_id))?;
        }
        info!("Posted {} messages to Discord", chunks.len());
        Ok(())
    }
}

pub fn build(config: &SinkConfig) -> Box<dyn Sink> {
    match config {
        SinkConfig::Stdout => Box::new(StdoutSink),
        SinkConfig::File(path) => Box::new(FileSink { path: path.clone() }),
        SinkConfig::Discord { channel_id, token } => {
            Box::new(DiscordSink::new(channel_id.clone(), token.clone()))
        }
    }
}
