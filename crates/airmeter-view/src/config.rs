use clap::Parser;
use std::env;
use thiserror::Error;
use url::Url;

pub const DEFAULT_PAGE_SIZE: u16 = 50;
pub const DEFAULT_LOG_DIR: &str = ".airmeter/logs";

#[derive(Parser, Debug, Default, Clone)]
#[command(name = "airmeter-view")]
pub struct Args {
    /// Relay websocket address; falls back to WS_ADDRESS.
    #[arg(long, default_value = "")]
    pub ws_address: String,
    /// History API base address; falls back to API_ADDRESS.
    #[arg(long, default_value = "")]
    pub api_address: String,
    #[arg(long, default_value_t = 0)]
    pub page_size: u16,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub log_stderr: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub ws_address: Url,
    pub api_address: Option<Url>,
    pub page_size: u16,
    pub log_level: String,
    pub log_dir: String,
    pub log_stderr: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("WS_ADDRESS is not set")]
    MissingChannelAddress,
    #[error("invalid channel address {value}: {reason}")]
    InvalidChannelAddress { value: String, reason: String },
    #[error("invalid API address {value}: {reason}")]
    InvalidApiAddress { value: String, reason: String },
    #[error("invalid page size {0}")]
    InvalidPageSize(String),
}

/// Resolves configuration from flags, then the process environment.
pub fn load_config(args: &Args) -> Result<Config, ConfigError> {
    resolve_config(args, |key| env::var(key).ok())
}

pub fn resolve_config<F>(args: &Args, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let ws_value = first_set(&args.ws_address, lookup("WS_ADDRESS"))
        .ok_or(ConfigError::MissingChannelAddress)?;
    let ws_address = parse_channel_address(&ws_value)?;

    let api_address = first_set(&args.api_address, lookup("API_ADDRESS"))
        .map(|value| parse_api_address(&value))
        .transpose()?;

    let page_size = if args.page_size > 0 {
        args.page_size
    } else {
        match non_empty(lookup("AIRMETER_PAGE_SIZE")) {
            Some(value) => match value.trim().parse::<u16>() {
                Ok(size) if size > 0 => size,
                _ => return Err(ConfigError::InvalidPageSize(value)),
            },
            None => DEFAULT_PAGE_SIZE,
        }
    };

    let log_level = non_empty(lookup("AIRMETER_LOG_LEVEL")).unwrap_or_else(|| "info".to_string());
    let log_dir = first_set(&args.log_dir, lookup("AIRMETER_LOG_DIR"))
        .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string());
    let log_stderr = args.log_stderr
        || lookup("AIRMETER_LOG_STDERR")
            .and_then(|value| parse_bool_flag(&value))
            .unwrap_or(false);

    Ok(Config {
        ws_address,
        api_address,
        page_size,
        log_level,
        log_dir,
        log_stderr,
    })
}

fn parse_channel_address(value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim()).map_err(|err| ConfigError::InvalidChannelAddress {
        value: value.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidChannelAddress {
            value: value.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

/// Parses the API base and makes sure its path ends in `/`, so relative
/// endpoint paths join beneath it instead of replacing its last segment.
fn parse_api_address(value: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(value.trim()).map_err(|err| ConfigError::InvalidApiAddress {
        value: value.to_string(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidApiAddress {
            value: value.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn first_set(flag: &str, fallback: Option<String>) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.to_string());
    }
    non_empty(fallback)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}
