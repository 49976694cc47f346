// SPDX-License-Identifier: Apache-2.0

//! Record filtering and output formatting.
//!
//! A record is kept when it matches every include expression and none of the exclude
//! expressions. Kept records are rendered through an optional output template in which `\0`
//! stands for the text matched by the first include expression and `\1`..`\9` for its capture
//! groups.

use regex::Regex;

use crate::receivers::logrt::config::WatchConfig;
use crate::receivers::logrt::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Group(usize),
}

/// A parsed output template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTemplate {
    segments: Vec<Segment>,
}

impl OutputTemplate {
    /// Parse a template. `\\` is a literal backslash; a backslash before anything other than a
    /// digit or another backslash is kept as is.
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '\\' {
                literal.push(c);
                continue;
            }
            match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    chars.next();
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Group(d as usize - '0' as usize));
                }
                Some('\\') => {
                    chars.next();
                    literal.push('\\');
                }
                _ => literal.push('\\'),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if segments.len() > 64 {
            return Err(Error::Config(
                "output template has too many parameters".to_string(),
            ));
        }

        Ok(Self { segments })
    }

    /// Highest group number referenced by the template.
    pub fn max_group(&self) -> usize {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Group(n) => Some(*n),
                Segment::Literal(_) => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Render the template; groups that did not participate in the match render empty.
    pub fn render(&self, groups: &[Option<&str>]) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Group(n) => {
                    if let Some(Some(text)) = groups.get(*n) {
                        out.push_str(text);
                    }
                }
            }
        }
        out
    }
}

/// Include/exclude filters plus output template for one watch.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    template: Option<OutputTemplate>,
}

impl RecordFilter {
    pub fn new(include: &[String], exclude: &[String], template: Option<&str>) -> Result<Self> {
        let compile = |expr: &String| {
            Regex::new(expr)
                .map_err(|e| Error::Config(format!("invalid regular expression {:?}: {}", expr, e)))
        };

        Ok(Self {
            include: include.iter().map(compile).collect::<Result<_>>()?,
            exclude: exclude.iter().map(compile).collect::<Result<_>>()?,
            template: template
                .filter(|t| !t.is_empty())
                .map(OutputTemplate::parse)
                .transpose()?,
        })
    }

    pub fn from_config(config: &WatchConfig) -> Result<Self> {
        Self::new(
            &config.include,
            &config.exclude,
            config.output_template.as_deref(),
        )
    }

    /// Apply the filters to one record. Returns the text to deliver, or `None` when the record
    /// is filtered out.
    pub fn apply(&self, record: &str) -> Option<String> {
        if self.exclude.iter().any(|r| r.is_match(record)) {
            return None;
        }

        let mut include = self.include.iter();
        let first = match include.next() {
            Some(first) => first,
            None => {
                return Some(match &self.template {
                    Some(template) => template.render(&[Some(record)]),
                    None => record.to_string(),
                });
            }
        };

        let captures = first.captures(record)?;
        if !include.all(|r| r.is_match(record)) {
            return None;
        }

        match &self.template {
            Some(template) => {
                let groups: Vec<Option<&str>> =
                    captures.iter().map(|m| m.map(|m| m.as_str())).collect();
                Some(template.render(&groups))
            }
            None => Some(record.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(include: &[&str], exclude: &[&str], template: Option<&str>) -> RecordFilter {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        RecordFilter::new(&include, &exclude, template).unwrap()
    }

    #[test]
    fn test_no_filters_passes_everything() {
        let f = filter(&[], &[], None);
        assert_eq!(f.apply("anything"), Some("anything".to_string()));
        assert_eq!(f.apply(""), Some(String::new()));
    }

    #[test]
    fn test_include_and_exclude() {
        let f = filter(&["ERROR", "db"], &["healthcheck"], None);

        assert_eq!(
            f.apply("ERROR db timeout"),
            Some("ERROR db timeout".to_string())
        );
        assert_eq!(f.apply("ERROR cache miss"), None);
        assert_eq!(f.apply("INFO db ok"), None);
        assert_eq!(f.apply("ERROR db healthcheck"), None);
    }

    #[test]
    fn test_output_template_substitution() {
        let f = filter(&[r"user=(\w+) status=(\d+)"], &[], Some(r"\2:\1"));
        assert_eq!(
            f.apply("ts=1 user=alice status=500 path=/"),
            Some("500:alice".to_string())
        );
    }

    #[test]
    fn test_output_template_whole_match_and_missing_group() {
        let f = filter(&[r"code=(\d+)(x)?"], &[], Some(r"[\0] \2."));
        assert_eq!(f.apply("a code=42 b"), Some("[code=42] .".to_string()));
    }

    #[test]
    fn test_template_without_include_uses_record() {
        let f = filter(&[], &[], Some(r"line: \0"));
        assert_eq!(f.apply("hello"), Some("line: hello".to_string()));
    }

    #[test]
    fn test_template_escapes() {
        let t = OutputTemplate::parse(r"a\\1 \x \3").unwrap();
        assert_eq!(t.max_group(), 3);
        assert_eq!(
            t.render(&[None, Some("one"), None, Some("three")]),
            r"a\1 \x three"
        );
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        let result = RecordFilter::new(&["(".to_string()], &[], None);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
