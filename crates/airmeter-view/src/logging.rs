use crate::config::Config;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

/// Keeps the session log open for the life of the process.
pub struct SessionLog {
    file: Option<Arc<Mutex<File>>>,
    path: Option<PathBuf>,
}

impl SessionLog {
    fn disabled() -> Self {
        Self {
            file: None,
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Copies each log line to the session file and, when asked, to stderr.
/// Stdout is left to the console.
struct LogTee {
    file: Option<Arc<Mutex<File>>>,
    stderr: bool,
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
/// Returns `None` if a subscriber was already installed.
pub fn init_logging(config: &Config) -> Option<SessionLog> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let session = open_session_log(Path::new(&config.log_dir), &config.ws_address)
        .unwrap_or_else(|err| {
            eprintln!("log_file_error: {err}");
            SessionLog::disabled()
        });
    let file = session.file.clone();
    let stderr = config.log_stderr;
    let make_writer = BoxMakeWriter::new(move || LogTee {
        file: file.clone(),
        stderr,
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(session)
}

impl Write for LogTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stderr {
            let _ = io::stderr().write_all(buf);
        }
        if let Some(file) = &self.file {
            let _ = file
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap_or_else(PoisonError::into_inner).flush();
        }
        Ok(())
    }
}

/// Opens the append-mode log for sessions against `relay`, one file per relay
/// so two viewers on different relays never share a log. An empty directory
/// disables file logging.
pub fn open_session_log(log_dir: &Path, relay: &Url) -> io::Result<SessionLog> {
    if log_dir.as_os_str().is_empty() {
        return Ok(SessionLog::disabled());
    }
    std::fs::create_dir_all(log_dir)?;
    let path = log_dir.join(session_log_name(relay));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(SessionLog {
        file: Some(Arc::new(Mutex::new(file))),
        path: Some(path),
    })
}

/// `airmeter-view-<host>-<port>.log`, with anything outside `[A-Za-z0-9_-]`
/// replaced so hosts like IPv6 literals stay valid file names.
pub fn session_log_name(relay: &Url) -> String {
    let host = relay.host_str().unwrap_or("relay");
    let relay_id = match relay.port_or_known_default() {
        Some(port) => format!("{host}-{port}"),
        None => host.to_string(),
    };
    let safe: String = relay_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!("airmeter-view-{safe}.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn relay(url: &str) -> Url {
        Url::parse(url).expect("relay url")
    }

    #[test]
    fn log_name_follows_relay() {
        assert_eq!(
            session_log_name(&relay("ws://127.0.0.1:8080/ws")),
            "airmeter-view-127_0_0_1-8080.log"
        );
        assert_eq!(
            session_log_name(&relay("wss://relay.example/ws")),
            "airmeter-view-relay_example-443.log"
        );
        assert_eq!(
            session_log_name(&relay("ws://[::1]:9000/")),
            "airmeter-view-__1_-9000.log"
        );
    }

    #[test]
    fn empty_dir_disables_file() {
        let session = open_session_log(Path::new(""), &relay("ws://127.0.0.1:1/")).expect("open");
        assert!(session.path().is_none());
    }

    #[test]
    fn tee_appends_to_session_log() {
        let dir = tempdir().expect("tempdir");
        let log_dir = dir.path().join("logs");
        let relay = relay("ws://127.0.0.1:8080/ws");

        let session = open_session_log(&log_dir, &relay).expect("open");
        let path = session.path().expect("file path").to_path_buf();
        assert_eq!(path, log_dir.join("airmeter-view-127_0_0_1-8080.log"));

        let mut tee = LogTee {
            file: session.file.clone(),
            stderr: false,
        };
        tee.write_all(b"ws_connected\n").expect("write");
        tee.flush().expect("flush");
        drop(session);

        let reopened = open_session_log(&log_dir, &relay).expect("reopen");
        let mut tee = LogTee {
            file: reopened.file.clone(),
            stderr: false,
        };
        tee.write_all(b"channel_closed\n").expect("write");
        tee.flush().expect("flush");

        let contents = std::fs::read_to_string(&path).expect("read log");
        assert_eq!(contents, "ws_connected\nchannel_closed\n");
    }
}
