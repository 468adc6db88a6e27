use std::fmt::Display;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use tracing::warn;

/// Connection parameters read from a game server's config file. The engine itself never
///  requires this; it is a convenience for callers that point the client at an existing
///  server installation.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ServerConfig {
    pub rcon_password: Option<String>,
    pub rcon_port: Option<u16>,
    pub rcon_ip: Option<IpAddr>,
    pub max_ping: Option<u32>,
}

impl ServerConfig {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<ServerConfig> {
        let text = tokio::fs::read_to_string(path.as_ref()).await
            .with_context(|| format!("reading server config {:?}", path.as_ref()))?;
        Ok(Self::parse(&text))
    }

    /// One `key value` pair per line, keys case-insensitive, the value running to the end of
    ///  the line. Lines of any other shape (and unknown keys) are ignored.
    pub fn parse(text: &str) -> ServerConfig {
        let mut config = ServerConfig::default();
        for line in text.lines() {
            let Some((key, value)) = split_key_value(line) else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "rconpassword" => config.rcon_password = Some(value.to_owned()),
                "rconport" => config.rcon_port = parse_or_warn(key, value),
                "rconip" => config.rcon_ip = parse_or_warn(key, value),
                "maxping" => config.max_ping = parse_or_warn(key, value),
                _ => {}
            }
        }
        config
    }
}

/// a key is a letter followed by word characters, separated from the value by a single space
fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(' ')?;
    let mut chars = key.chars();
    if !chars.next()?.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key, value))
}

fn parse_or_warn<T: FromStr>(key: &str, value: &str) -> Option<T>
where
    T::Err: Display,
{
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("ignoring unparsable config value for {}: {}", key, e);
            None
        }
    }
}
