//! Line-oriented console over the store: parses operator commands and turns
//! store notifications into printable lines.

use crate::history::{FetchError, HistoryFetcher};
use crate::messages;
use crate::store::{MessageLog, Store};
use airmeter_core::protocol;
use airmeter_core::{Message, MessageKind, PublisherId, Reading};
use chrono::DateTime;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub const HELP: &str =
    "commands: /list | /join <id> | /history <id> [limit] | /archive | /show <id> | /quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    List,
    Join(PublisherId),
    History {
        publisher: PublisherId,
        limit: Option<u16>,
    },
    Archive,
    Show(PublisherId),
    Help,
    Quit,
    /// Anything else is passed to the relay untouched.
    Raw(String),
}

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl FromStr for ConsoleCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Ok(ConsoleCommand::Help);
        };
        let publisher = |word: Option<&str>, usage: &'static str| {
            word.and_then(|w| w.parse::<PublisherId>().ok())
                .ok_or(ConsoleError::Usage(usage))
        };
        match head {
            "/list" => Ok(ConsoleCommand::List),
            "/join" => Ok(ConsoleCommand::Join(publisher(words.next(), "/join <id>")?)),
            "/history" => {
                let usage = "/history <id> [limit]";
                let publisher = publisher(words.next(), usage)?;
                let limit = match words.next() {
                    Some(word) => Some(
                        word.parse::<u16>()
                            .ok()
                            .filter(|limit| *limit > 0)
                            .ok_or(ConsoleError::Usage(usage))?,
                    ),
                    None => None,
                };
                Ok(ConsoleCommand::History { publisher, limit })
            }
            "/archive" => Ok(ConsoleCommand::Archive),
            "/show" => Ok(ConsoleCommand::Show(publisher(words.next(), "/show <id>")?)),
            "/help" => Ok(ConsoleCommand::Help),
            "/quit" | "/exit" => Ok(ConsoleCommand::Quit),
            _ => Ok(ConsoleCommand::Raw(line.trim().to_string())),
        }
    }
}

pub fn format_time(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

pub fn render_reading(reading: &Reading) -> String {
    format!(
        "[{}] {} eco2={} evtoc={} ({})",
        reading.pub_id,
        format_time(reading.read_time),
        reading.eco2,
        reading.evtoc,
        reading.increment
    )
}

pub fn render_message(message: &Message) -> String {
    match message.kind {
        MessageKind::Info => format!("* {}", message.text),
        MessageKind::Error => format!("! {}", message.text),
    }
}

pub fn render_roster(roster: &[PublisherId]) -> String {
    if roster.is_empty() {
        return "publishers: none".to_string();
    }
    let ids: Vec<String> = roster.iter().map(PublisherId::to_string).collect();
    format!("publishers: {}", ids.join(", "))
}

pub struct Console {
    store: Arc<Store>,
    fetcher: HistoryFetcher,
    outbound: mpsc::Sender<String>,
    page_size: u16,
    watched: Mutex<HashSet<PublisherId>>,
}

impl Console {
    pub fn new(
        store: Arc<Store>,
        fetcher: HistoryFetcher,
        outbound: mpsc::Sender<String>,
        page_size: u16,
    ) -> Self {
        Self {
            store,
            fetcher,
            outbound,
            page_size,
            watched: Mutex::new(HashSet::new()),
        }
    }

    /// Runs one command and returns the lines to print.
    pub async fn execute(&self, command: ConsoleCommand) -> Result<Vec<String>, ConsoleError> {
        match command {
            ConsoleCommand::List => {
                self.send(protocol::roster_request()).await?;
                Ok(Vec::new())
            }
            ConsoleCommand::Join(publisher) => {
                self.send(protocol::join_request(publisher)).await?;
                Ok(vec![format!("joining {publisher}")])
            }
            ConsoleCommand::History { publisher, limit } => {
                let page = self
                    .fetcher
                    .fetch_page(publisher, limit.unwrap_or(self.page_size))
                    .await?;
                let mut lines = vec![format!(
                    "{} {} readings{}",
                    page.cursor,
                    page.readings.len(),
                    if page.cached { " (cached)" } else { "" }
                )];
                lines.extend(page.readings.iter().map(render_reading));
                Ok(lines)
            }
            ConsoleCommand::Archive => {
                let moved = messages::archive(&self.store);
                Ok(vec![format!("archived {moved} messages")])
            }
            ConsoleCommand::Show(publisher) => Ok(self.show(publisher)),
            ConsoleCommand::Help => Ok(vec![HELP.to_string()]),
            ConsoleCommand::Quit => Ok(Vec::new()),
            ConsoleCommand::Raw(line) => {
                self.send(line).await?;
                Ok(Vec::new())
            }
        }
    }

    fn show(&self, publisher: PublisherId) -> Vec<String> {
        let view = self.store.snapshot(publisher);
        let mut lines = vec![format!(
            "publisher {publisher}: earliest {} windows {}",
            view.earliest
                .map(format_time)
                .unwrap_or_else(|| "unknown".to_string()),
            view.cursors.len()
        )];
        lines.extend(view.timeline().iter().map(render_reading));
        lines
    }

    async fn send(&self, frame: String) -> Result<(), ConsoleError> {
        debug!("console_send: {frame}");
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ConsoleError::ChannelClosed)
    }

    /// Prints roster changes and every newly posted message, including
    /// messages archived before the watcher got to them.
    pub fn watch_store(&self, lines: mpsc::UnboundedSender<String>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let mut roster = store.roster().subscribe();
        let mut active = store.messages().subscribe();
        let mut next_seq = active.borrow_and_update().next_seq();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = roster.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let line = render_roster(&roster.borrow_and_update());
                        if lines.send(line).is_err() {
                            break;
                        }
                    }
                    changed = active.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let log = active.borrow_and_update().clone();
                        let unseen = unseen_messages(&store, &log, next_seq);
                        next_seq = next_seq.max(log.next_seq());
                        if unseen
                            .iter()
                            .any(|message| lines.send(render_message(message)).is_err())
                        {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Prints each new latest reading of `publisher`. Returns `None` when the
    /// publisher is already watched.
    pub fn watch_publisher(
        &self,
        publisher: PublisherId,
        lines: mpsc::UnboundedSender<String>,
    ) -> Option<JoinHandle<()>> {
        let newly_watched = self
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(publisher);
        if !newly_watched {
            debug!("publisher_already_watched: {publisher}");
            return None;
        }
        let mut latest = self.store.latest().subscribe(&publisher);
        Some(tokio::spawn(async move {
            while latest.changed().await.is_ok() {
                let line = latest.borrow_and_update().as_ref().map(render_reading);
                if let Some(line) = line {
                    if lines.send(line).is_err() {
                        break;
                    }
                }
            }
        }))
    }
}

/// Messages with sequence numbers from `from` up to the end of `log`. Ones
/// already moved out of `log` are read back from the archive, which `archive`
/// extends before `log.archived` grows.
fn unseen_messages(store: &Store, log: &MessageLog, from: usize) -> Vec<Message> {
    let mut unseen = Vec::new();
    if from < log.archived {
        let archived = store.archive().get();
        unseen.extend(archived.get(from..log.archived).unwrap_or(&[]).iter().cloned());
    }
    let skip = from.saturating_sub(log.archived);
    unseen.extend(log.entries.iter().skip(skip).cloned());
    unseen
}
