use std::{str::FromStr, time::Duration};

use anyhow::{bail, Context};

/// Process configuration, read from the environment (a `.env` file is honoured).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub db_max_connections: u32,
    pub session_inactivity_minutes: i64,
    pub history_limit: i64,
    pub socket: SocketConfig,
    pub sequencer: SequencerConfig,
}

/// Per-connection limits for the websocket pumps.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub send_queue: usize,
    pub max_frame_bytes: usize,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
}

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub max_attempts: u32,
    /// Attempt `n` sleeps `n * backoff_step` before the next one.
    pub backoff_step: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            send_queue: 256,
            max_frame_bytes: 64 * 1024,
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(50),
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_millis(10),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let socket_defaults = SocketConfig::default();
        let seq_defaults = SequencerConfig::default();

        let config = Config {
            database_url: lookup("DATABASE_URL").unwrap_or("sqlite://ququchat.db?mode=rwc".to_owned()),
            bind_addr: lookup("BIND_ADDR").unwrap_or("0.0.0.0:8080".to_owned()),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 16)?,
            session_inactivity_minutes: parse_or(&lookup, "SESSION_INACTIVITY_MINUTES", 60)?,
            history_limit: parse_or(&lookup, "HISTORY_LIMIT", 50)?,
            socket: SocketConfig {
                send_queue: parse_or(&lookup, "WS_SEND_QUEUE", socket_defaults.send_queue)?,
                max_frame_bytes: parse_or(&lookup, "WS_MAX_FRAME_BYTES", socket_defaults.max_frame_bytes)?,
                write_wait: secs_or(&lookup, "WS_WRITE_WAIT_SECS", socket_defaults.write_wait)?,
                pong_wait: secs_or(&lookup, "WS_PONG_WAIT_SECS", socket_defaults.pong_wait)?,
                ping_period: secs_or(&lookup, "WS_PING_PERIOD_SECS", socket_defaults.ping_period)?,
            },
            sequencer: SequencerConfig {
                max_attempts: parse_or(&lookup, "SEQ_MAX_ATTEMPTS", seq_defaults.max_attempts)?,
                backoff_step: Duration::from_millis(parse_or(
                    &lookup,
                    "SEQ_BACKOFF_MS",
                    seq_defaults.backoff_step.as_millis() as u64,
                )?),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.db_max_connections == 0 {
            bail!("DB_MAX_CONNECTIONS must be at least 1");
        }
        if self.history_limit <= 0 {
            bail!("HISTORY_LIMIT must be at least 1");
        }
        if self.socket.send_queue == 0 {
            bail!("WS_SEND_QUEUE must be at least 1");
        }
        if self.socket.max_frame_bytes == 0 {
            bail!("WS_MAX_FRAME_BYTES must be at least 1");
        }
        if self.socket.ping_period >= self.socket.pong_wait {
            bail!("WS_PING_PERIOD_SECS must be shorter than WS_PONG_WAIT_SECS");
        }
        if self.sequencer.max_attempts == 0 {
            bail!("SEQ_MAX_ATTEMPTS must be at least 1");
        }
        Ok(())
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

fn secs_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> anyhow::Result<Duration> {
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}
