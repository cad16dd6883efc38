//! Query template grammar.
//!
//! Query authors write SQL against a virtual flow table and let the planner
//! fill in the physical details:
//!
//! | Placeholder            | Expansion                                              |
//! |------------------------|--------------------------------------------------------|
//! | `{table}`              | selected table name                                    |
//! | `{timefilter}`         | `TimeReceived BETWEEN <start> AND <stop>`              |
//! | `{timefilter.Start}`   | rounded start literal                                  |
//! | `{timefilter.Stop}`    | rounded end literal                                    |
//! | `{resolution}`         | table granularity in seconds (at least 1)              |
//! | `{resolution->N}`      | `N` floored to a multiple of `{resolution}`            |
//!
//! Timestamps render as `toDateTime('YYYY-MM-DD HH:MM:SS', 'UTC')`. Any other
//! `{...}` text, and a `{` without a closing brace, is copied verbatim.
//!
//! Templates are scanned in a single pass into [`Segment`]s. Scanning is the
//! only step that can fail, so [`validate_template`] is cheap enough to run
//! on every configured template at load time.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::error::{Result, TemplateError};

/// Column holding the flow timestamp in every flow table.
pub const TIME_COLUMN: &str = "TimeReceived";

const BUCKET_PREFIX: &str = "resolution->";

/// A recognized placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// `{table}`
    Table,
    /// `{timefilter}`
    TimeFilter,
    /// `{timefilter.Start}`
    TimeFilterStart,
    /// `{timefilter.Stop}`
    TimeFilterStop,
    /// `{resolution}`
    Resolution,
    /// `{resolution->N}`
    ResolutionBucket(u64),
}

/// A piece of a scanned template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Text copied as-is.
    Literal(&'a str),
    /// A placeholder to expand.
    Token(Token),
}

/// Splits a template into literal text and placeholders.
///
/// # Errors
///
/// Returns [`TemplateError::InvalidBucket`] for `{resolution->N}` where `N`
/// is not a non-negative integer.
///
/// # Examples
///
/// ```rust
/// use flowplan::template::{scan, Segment, Token};
///
/// let segments = scan("SELECT 1 FROM {table} -- {unknown}").unwrap();
/// assert_eq!(segments, vec![
///     Segment::Literal("SELECT 1 FROM "),
///     Segment::Token(Token::Table),
///     Segment::Literal(" -- "),
///     Segment::Literal("{unknown}"),
/// ]);
/// ```
pub fn scan(template: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut cursor = 0;

    while let Some(found) = template[cursor..].find('{') {
        let open = cursor + found;
        let body_start = open + 1;

        let Some(found_end) = template[body_start..].find(['{', '}']) else {
            break;
        };
        let delimiter = body_start + found_end;
        if template.as_bytes()[delimiter] == b'{' {
            // Nested opening brace: this one is literal, rescan from the inner one.
            cursor = delimiter;
            continue;
        }

        let body = &template[body_start..delimiter];
        match parse_token(body, open)? {
            Some(token) => {
                if literal_start < open {
                    segments.push(Segment::Literal(&template[literal_start..open]));
                }
                segments.push(Segment::Token(token));
                literal_start = delimiter + 1;
            }
            None => {
                if literal_start < open {
                    segments.push(Segment::Literal(&template[literal_start..open]));
                }
                segments.push(Segment::Literal(&template[open..=delimiter]));
                literal_start = delimiter + 1;
            }
        }
        cursor = delimiter + 1;
    }

    if literal_start < template.len() {
        segments.push(Segment::Literal(&template[literal_start..]));
    }
    Ok(segments)
}

fn parse_token(body: &str, offset: usize) -> Result<Option<Token>> {
    let token = match body {
        "table" => Token::Table,
        "timefilter" => Token::TimeFilter,
        "timefilter.Start" => Token::TimeFilterStart,
        "timefilter.Stop" => Token::TimeFilterStop,
        "resolution" => Token::Resolution,
        _ => {
            let Some(value) = body.strip_prefix(BUCKET_PREFIX) else {
                return Ok(None);
            };
            let width = value
                .parse::<u64>()
                .ok()
                .filter(|_| value.bytes().all(|b| b.is_ascii_digit()))
                .ok_or_else(|| TemplateError::InvalidBucket {
                    value: value.to_string(),
                    offset,
                })?;
            Token::ResolutionBucket(width)
        }
    };
    Ok(Some(token))
}

/// Checks that a template can be rendered.
///
/// # Errors
///
/// Returns [`TemplateError`] if the template contains a malformed
/// placeholder.
pub fn validate_template(template: &str) -> Result<()> {
    scan(template).map(|_| ())
}

/// Values substituted into a template.
#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    /// Physical table name.
    pub table: &'a str,
    /// Start of the time filter.
    pub start: DateTime<Utc>,
    /// End of the time filter.
    pub end: DateTime<Utc>,
    /// Table granularity in seconds. Zero renders as 1.
    pub resolution_secs: u64,
}

impl Bindings<'_> {
    fn step(&self) -> u64 {
        self.resolution_secs.max(1)
    }

    fn expand(&self, token: Token, out: &mut String) {
        match token {
            Token::Table => out.push_str(self.table),
            Token::TimeFilter => {
                let _ = write!(
                    out,
                    "{TIME_COLUMN} BETWEEN {} AND {}",
                    timestamp_literal(self.start),
                    timestamp_literal(self.end)
                );
            }
            Token::TimeFilterStart => out.push_str(&timestamp_literal(self.start)),
            Token::TimeFilterStop => out.push_str(&timestamp_literal(self.end)),
            Token::Resolution => {
                let _ = write!(out, "{}", self.step());
            }
            Token::ResolutionBucket(width) => {
                let step = self.step();
                let _ = write!(out, "{}", width / step * step);
            }
        }
    }
}

/// Renders a template with the given bindings.
///
/// # Errors
///
/// Returns [`TemplateError`] if the template contains a malformed
/// placeholder.
pub fn render(template: &str, bindings: &Bindings<'_>) -> Result<String> {
    let segments = scan(template)?;
    let mut out = String::with_capacity(template.len() + 64);
    for segment in segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Token(token) => bindings.expand(token, &mut out),
        }
    }
    Ok(out)
}

/// Formats an instant as a ClickHouse `DateTime` literal in UTC.
///
/// # Examples
///
/// ```rust
/// use chrono::{TimeZone, Utc};
/// use flowplan::template::timestamp_literal;
///
/// let t = Utc.with_ymd_and_hms(2022, 4, 10, 15, 45, 10).unwrap();
/// assert_eq!(timestamp_literal(t), "toDateTime('2022-04-10 15:45:10', 'UTC')");
/// ```
pub fn timestamp_literal(instant: DateTime<Utc>) -> String {
    format!("toDateTime('{}', 'UTC')", instant.format("%Y-%m-%d %H:%M:%S"))
}
