// SPDX-License-Identifier: Apache-2.0

//! Configuration for a single watched log.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;

use crate::receivers::logrt::error::{Error, Result};
use crate::receivers::logrt::filter::OutputTemplate;
use crate::receivers::logrt::input::Encoding;

/// What the pattern names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WatchKind {
    /// A single file at an exact path.
    Log,
    /// A directory plus a regular expression matched against file names in it.
    #[default]
    LogRt,
}

/// How the log producer rotates its files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotationPolicy {
    /// Files are renamed away and a fresh file is created in their place.
    #[default]
    Rename,
    /// Files are copied elsewhere and the original is truncated in place.
    CopyTruncate,
    /// Like `Rename`, and a modification time change with an unchanged size forces the digest
    /// prefix to be checked for in-place content replacement.
    Reread,
    /// Modification time changes are ignored until the size changes.
    NoReread,
}

impl RotationPolicy {
    /// Whether an mtime change alone triggers a digest re-check.
    pub fn recheck_on_mtime(&self) -> bool {
        !matches!(self, RotationPolicy::NoReread)
    }

    /// Whether the policy looks for copies of previously tracked files.
    pub fn detects_copies(&self) -> bool {
        matches!(self, RotationPolicy::CopyTruncate)
    }
}

impl FromStr for RotationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "rotate" => Ok(RotationPolicy::Rename),
            "copytruncate" => Ok(RotationPolicy::CopyTruncate),
            "mtime-reread" => Ok(RotationPolicy::Reread),
            "mtime-noreread" => Ok(RotationPolicy::NoReread),
            other => Err(Error::Config(format!("invalid rotation option: {:?}", other))),
        }
    }
}

/// Where delivered records are addressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destination {
    pub server: String,
    pub port: u16,
    /// Host identifier the records are reported for
    pub hostname: String,
    /// Check key the records belong to
    pub key: String,
}

/// Configuration for one watched log
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub kind: WatchKind,
    /// Exact path (`Log`) or `directory/filename-regex` (`LogRt`)
    pub pattern: String,
    pub rotation: RotationPolicy,
    /// Records must match every include expression
    pub include: Vec<String>,
    /// Records matching any exclude expression are dropped
    pub exclude: Vec<String>,
    /// Output template with `\0`..`\9` references into the first include expression
    pub output_template: Option<String>,
    pub encoding: Encoding,
    /// Maximum records delivered per cycle
    pub max_lines_sent: usize,
    /// Maximum records analysed per cycle
    pub max_lines_processed: usize,
    /// Wall-clock budget of a cycle
    pub max_delay: Option<Duration>,
    /// Consecutive delivery failures after which a file is reported as stalled
    pub max_retries: u32,
    /// Bytes read from disk at a time
    pub chunk_size: usize,
    /// Longest record kept whole; longer records are cut and the rest skipped
    pub max_record_size: usize,
    /// Bytes covered by the identity digest
    pub digest_window: usize,
    /// Start new watches at the end of existing files
    pub skip_old_data: bool,
    pub destination: Destination,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            kind: WatchKind::LogRt,
            pattern: String::new(),
            rotation: RotationPolicy::Rename,
            include: Vec::new(),
            exclude: Vec::new(),
            output_template: None,
            encoding: Encoding::Utf8,
            max_lines_sent: 100,
            max_lines_processed: 400,
            max_delay: None,
            max_retries: 3,
            chunk_size: 64 * 1024,
            max_record_size: 256 * 1024,
            digest_window: 512,
            skip_old_data: false,
            destination: Destination::default(),
        }
    }
}

impl WatchConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pattern.is_empty() {
            return Err(Error::Config("pattern cannot be empty".to_string()));
        }

        if self.kind == WatchKind::LogRt {
            let (dir, file_pattern) = split_pattern(&self.pattern)?;
            if dir.as_os_str().is_empty() {
                return Err(Error::Config(format!(
                    "pattern {:?} must name a directory",
                    self.pattern
                )));
            }
            Regex::new(file_pattern).map_err(|e| {
                Error::Config(format!("invalid file name pattern {:?}: {}", file_pattern, e))
            })?;
        }

        if self.kind == WatchKind::Log && self.rotation.detects_copies() {
            return Err(Error::Config(
                "copytruncate rotation requires a rotated (logrt) watch".to_string(),
            ));
        }

        for expr in self.include.iter().chain(self.exclude.iter()) {
            Regex::new(expr)
                .map_err(|e| Error::Config(format!("invalid regular expression {:?}: {}", expr, e)))?;
        }

        if let Some(template) = &self.output_template {
            let template = OutputTemplate::parse(template)?;
            let groups = match self.include.first() {
                Some(expr) => Regex::new(expr)
                    .map(|r| r.captures_len() - 1)
                    .unwrap_or_default(),
                None => 0,
            };
            if template.max_group() > groups {
                return Err(Error::Config(format!(
                    "output template references group \\{} but only {} are available",
                    template.max_group(),
                    groups
                )));
            }
        }

        if self.max_lines_sent == 0 || self.max_lines_processed == 0 {
            return Err(Error::Config("line limits must be positive".to_string()));
        }

        if self.max_lines_processed < self.max_lines_sent {
            return Err(Error::Config(
                "max_lines_processed cannot be lower than max_lines_sent".to_string(),
            ));
        }

        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".to_string()));
        }

        if self.max_record_size < self.chunk_size {
            return Err(Error::Config(
                "max_record_size cannot be lower than chunk_size".to_string(),
            ));
        }

        if !(16..=65536).contains(&self.digest_window) {
            return Err(Error::Config(
                "digest_window must be between 16 and 65536 bytes".to_string(),
            ));
        }

        Ok(())
    }
}

/// Split a rotated-log pattern into its directory and file name expression.
pub fn split_pattern(pattern: &str) -> Result<(&Path, &str)> {
    let idx = pattern
        .rfind(std::path::is_separator)
        .ok_or_else(|| Error::Config(format!("pattern {:?} must name a directory", pattern)))?;

    let (dir, file) = (&pattern[..idx], &pattern[idx + 1..]);
    if file.is_empty() {
        return Err(Error::Config(format!(
            "pattern {:?} has no file name expression",
            pattern
        )));
    }

    // A pattern directly under the root keeps the root as its directory
    let dir = if dir.is_empty() { &pattern[..=idx] } else { dir };
    Ok((Path::new(dir), file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pattern: &str) -> WatchConfig {
        WatchConfig {
            pattern: pattern.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = WatchConfig::default();
        assert_eq!(config.kind, WatchKind::LogRt);
        assert_eq!(config.rotation, RotationPolicy::Rename);
        assert_eq!(config.max_lines_processed, 4 * config.max_lines_sent);
        assert_eq!(config.digest_window, 512);
    }

    #[test]
    fn test_config_validation() {
        assert!(config("/var/log/app\\.log.*").validate().is_ok());
        assert!(config("").validate().is_err());
        assert!(config("app.log").validate().is_err());
        assert!(config("/var/log/app(").validate().is_err());

        let mut c = config("/var/log/app\\.log.*");
        c.include = vec!["[".to_string()];
        assert!(c.validate().is_err());

        let mut c = config("/var/log/app\\.log.*");
        c.digest_window = 8;
        assert!(c.validate().is_err());

        let mut c = config("/var/log/app.log");
        c.kind = WatchKind::Log;
        c.rotation = RotationPolicy::CopyTruncate;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_template_group_count_validated() {
        let mut c = config("/var/log/app\\.log.*");
        c.include = vec!["user=(\\w+) id=(\\d+)".to_string()];
        c.output_template = Some("\\2 \\1".to_string());
        assert!(c.validate().is_ok());

        c.output_template = Some("\\3".to_string());
        assert!(c.validate().is_err());

        c.include.clear();
        c.output_template = Some("\\1".to_string());
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_rotation_policy_from_str() {
        assert_eq!("".parse::<RotationPolicy>().unwrap(), RotationPolicy::Rename);
        assert_eq!(
            "copytruncate".parse::<RotationPolicy>().unwrap(),
            RotationPolicy::CopyTruncate
        );
        assert_eq!(
            "mtime-noreread".parse::<RotationPolicy>().unwrap(),
            RotationPolicy::NoReread
        );
        assert!("truncate".parse::<RotationPolicy>().is_err());
        assert!(!RotationPolicy::NoReread.recheck_on_mtime());
        assert!(RotationPolicy::Reread.recheck_on_mtime());
    }

    #[test]
    fn test_split_pattern() {
        let (dir, file) = split_pattern("/var/log/app\\.log.*").unwrap();
        assert_eq!(dir, Path::new("/var/log"));
        assert_eq!(file, "app\\.log.*");

        let (dir, file) = split_pattern("/app.*").unwrap();
        assert_eq!(dir, Path::new("/"));
        assert_eq!(file, "app.*");

        assert!(split_pattern("/var/log/").is_err());
        assert!(split_pattern("app.log").is_err());
    }
}
