// SPDX-License-Identifier: Apache-2.0

use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::receivers::logrt::config::{
    Destination, RotationPolicy, WatchConfig, WatchKind as ConfigWatchKind,
};
use crate::receivers::logrt::error::Result;
use crate::receivers::logrt::input::Encoding;

/// What the pattern names
#[derive(Copy, Clone, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum WatchKind {
    /// A single file at an exact path
    Log,
    /// A directory plus a regular expression for file names
    #[default]
    Logrt,
}

impl From<WatchKind> for ConfigWatchKind {
    fn from(k: WatchKind) -> Self {
        match k {
            WatchKind::Log => ConfigWatchKind::Log,
            WatchKind::Logrt => ConfigWatchKind::LogRt,
        }
    }
}

/// How the log producer rotates its files
#[derive(Copy, Clone, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum RotationArg {
    /// Rename the file away and create a new one
    #[default]
    Rotate,
    /// Copy the file, then truncate it in place
    Copytruncate,
    /// Re-check content when only the modification time changes
    #[value(name = "mtime-reread")]
    MtimeReread,
    /// Ignore modification time changes until the size changes
    #[value(name = "mtime-noreread")]
    MtimeNoreread,
}

impl From<RotationArg> for RotationPolicy {
    fn from(r: RotationArg) -> Self {
        match r {
            RotationArg::Rotate => RotationPolicy::Rename,
            RotationArg::Copytruncate => RotationPolicy::CopyTruncate,
            RotationArg::MtimeReread => RotationPolicy::Reread,
            RotationArg::MtimeNoreread => RotationPolicy::NoReread,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct LogrtArgs {
    /// Exact path (log) or directory plus file name regex (logrt), e.g. "/var/log/app\.log.*"
    #[arg(long, env = "LOGRT_PATTERN")]
    pub pattern: String,

    /// Watch kind: log or logrt
    #[arg(value_enum, long, env = "LOGRT_KIND", default_value = "logrt")]
    pub kind: WatchKind,

    /// Rotation scheme: rotate, copytruncate, mtime-reread, mtime-noreread
    #[arg(value_enum, long, env = "LOGRT_ROTATION", default_value = "rotate")]
    pub rotation: RotationArg,

    /// Comma-separated regular expressions every record must match
    #[arg(long, env = "LOGRT_INCLUDE", value_delimiter = ',')]
    pub include: Vec<String>,

    /// Comma-separated regular expressions that drop a record when matched
    #[arg(long, env = "LOGRT_EXCLUDE", value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Output template, \0 is the matched text and \1..\9 its groups
    #[arg(long, env = "LOGRT_OUTPUT")]
    pub output: Option<String>,

    /// File encoding (UTF-8, ISO-8859-1, UTF-16LE, UTF-16BE, UTF-32LE, UTF-32BE)
    #[arg(long, env = "LOGRT_ENCODING", default_value = "UTF-8")]
    pub encoding: String,

    /// Maximum records delivered per cycle
    #[arg(long, env = "LOGRT_MAX_LINES", default_value = "100")]
    pub max_lines: usize,

    /// Maximum records analysed per cycle, defaults to four times --max-lines
    #[arg(long, env = "LOGRT_MAX_LINES_PROCESSED")]
    pub max_lines_processed: Option<usize>,

    /// Wall-clock budget of a cycle in milliseconds, 0 for none
    #[arg(long, env = "LOGRT_MAX_DELAY_MS", default_value = "0")]
    pub max_delay_ms: u64,

    /// Consecutive delivery failures after which a file is reported as stalled
    #[arg(long, env = "LOGRT_MAX_RETRIES", default_value = "3")]
    pub max_retries: u32,

    /// Bytes read from disk at a time
    #[arg(long, env = "LOGRT_CHUNK_SIZE", default_value = "65536")]
    pub chunk_size: usize,

    /// Longest record kept whole, longer ones are cut
    #[arg(long, env = "LOGRT_MAX_RECORD_SIZE", default_value = "262144")]
    pub max_record_size: usize,

    /// Leading bytes covered by the identity digest
    #[arg(long, env = "LOGRT_DIGEST_WINDOW", default_value = "512")]
    pub digest_window: usize,

    /// Start new watches at the end of existing files
    #[arg(long, env = "LOGRT_SKIP_OLD_DATA", default_value = "false")]
    pub skip_old_data: bool,

    /// Seconds between cycles
    #[arg(long, env = "LOGRT_REFRESH_SECS", default_value = "1")]
    pub refresh_secs: u64,

    /// Path of the position state file
    #[arg(
        long,
        env = "LOGRT_STATE_PATH",
        default_value = "/var/lib/logrt/state.json"
    )]
    pub state_path: PathBuf,

    /// Collector address records are addressed to
    #[arg(long, env = "LOGRT_SERVER", default_value = "127.0.0.1")]
    pub server: String,

    /// Collector port
    #[arg(long, env = "LOGRT_PORT", default_value = "10051")]
    pub port: u16,

    /// Host name records are reported for, defaults to the system host name
    #[arg(long, env = "LOGRT_HOSTNAME")]
    pub hostname: Option<String>,

    /// Check key records belong to, defaults to "<kind>[<pattern>]"
    #[arg(long, env = "LOGRT_KEY")]
    pub key: Option<String>,
}

impl LogrtArgs {
    /// Key identifying the watch, also used as its persistence scope
    pub fn watch_key(&self) -> String {
        match &self.key {
            Some(key) => key.clone(),
            None => {
                let kind = match self.kind {
                    WatchKind::Log => "log",
                    WatchKind::Logrt => "logrt",
                };
                format!("{}[{}]", kind, self.pattern)
            }
        }
    }

    /// Build the watch config from command line args
    pub fn build_config(&self, default_hostname: &str) -> Result<WatchConfig> {
        Ok(WatchConfig {
            kind: self.kind.into(),
            pattern: self.pattern.clone(),
            rotation: self.rotation.into(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            output_template: self.output.clone(),
            encoding: self.encoding.parse::<Encoding>()?,
            max_lines_sent: self.max_lines,
            max_lines_processed: self
                .max_lines_processed
                .unwrap_or(self.max_lines.saturating_mul(4)),
            max_delay: match self.max_delay_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            max_retries: self.max_retries,
            chunk_size: self.chunk_size,
            max_record_size: self.max_record_size,
            digest_window: self.digest_window,
            skip_old_data: self.skip_old_data,
            destination: Destination {
                server: self.server.clone(),
                port: self.port,
                hostname: self
                    .hostname
                    .clone()
                    .unwrap_or_else(|| default_hostname.to_string()),
                key: self.watch_key(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        logrt: LogrtArgs,
    }

    #[test]
    fn test_defaults_match_watch_config() {
        let cli = TestCli::parse_from(["logrt", "--pattern", "/var/log/app\\.log.*"]);
        let config = cli.logrt.build_config("web-1").unwrap();
        let defaults = WatchConfig::default();

        assert_eq!(config.kind, defaults.kind);
        assert_eq!(config.rotation, defaults.rotation);
        assert_eq!(config.max_lines_sent, defaults.max_lines_sent);
        assert_eq!(config.max_lines_processed, defaults.max_lines_processed);
        assert_eq!(config.chunk_size, defaults.chunk_size);
        assert_eq!(config.max_record_size, defaults.max_record_size);
        assert_eq!(config.digest_window, defaults.digest_window);
        assert_eq!(config.max_delay, None);
        assert_eq!(config.destination.hostname, "web-1");
        assert_eq!(config.destination.key, "logrt[/var/log/app\\.log.*]");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rotation_and_encoding_args() {
        let cli = TestCli::parse_from([
            "logrt",
            "--pattern",
            "/var/log/app.log",
            "--kind",
            "log",
            "--rotation",
            "mtime-noreread",
            "--encoding",
            "UTF-16LE",
            "--include",
            "ERROR,db",
            "--max-delay-ms",
            "250",
            "--key",
            "app.errors",
        ]);
        let config = cli.logrt.build_config("web-1").unwrap();

        assert_eq!(config.kind, ConfigWatchKind::Log);
        assert_eq!(config.rotation, RotationPolicy::NoReread);
        assert_eq!(config.encoding, Encoding::Utf16Le);
        assert_eq!(config.include, vec!["ERROR", "db"]);
        assert_eq!(config.max_delay, Some(Duration::from_millis(250)));
        assert_eq!(config.destination.key, "app.errors");
    }

    #[test]
    fn test_unknown_encoding_is_rejected() {
        let cli = TestCli::parse_from(["logrt", "--pattern", "/x/y", "--encoding", "EBCDIC"]);
        assert!(cli.logrt.build_config("h").is_err());
    }
}
