//! Conversational units ("LMC") and the append-only transcript
//!
//! Every turn of a conversation is one [`Lmc`]: a role, a unit type, the
//! text payload and, for code only, the language it is written in.
//!
//! ```text
//! (09:41 AM 10/16/2026) [type: code, format: python] *assistant*: print(2+2)
//!  └─ timestamp ──────┘  └─ type + format ─────────┘  └─ role ─┘  └─ content
//! ```
//!
//! The rendered line above is what the completion backend sees and what the
//! verbose transcript echo prints (with terminal styling).

pub mod parser;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use parser::{parse_response, primary_unit};

/// Timestamp layout used when rendering a unit, e.g. `09:41 AM 10/16/2026`
pub const TIMESTAMP_FORMAT: &str = "%I:%M %p %m/%d/%Y";

lazy_static! {
    static ref CHAT_LINE: Regex = Regex::new(
        r"^\((?P<time>[^)]*)\) \[type: (?P<type>[a-z]+)(?:, format: (?P<format>[^\]]+))?\] \*(?P<role>[a-z]+)\*: (?P<content>[\s\S]*)$"
    )
    .expect("chat line pattern is valid");
}

/// Who produced a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    /// Output of code run on the local machine
    Computer,
    /// Context fetched by a searcher
    Browser,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Computer => "computer",
            Role::Browser => "browser",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = LmcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "computer" => Ok(Role::Computer),
            "browser" => Ok(Role::Browser),
            other => Err(LmcError::UnknownRole(other.to_string())),
        }
    }
}

/// What kind of payload a unit carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    Message,
    Code,
    Info,
}

impl UnitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitType::Message => "message",
            UnitType::Code => "code",
            UnitType::Info => "info",
        }
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitType {
    type Err = LmcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(UnitType::Message),
            "code" => Ok(UnitType::Code),
            "info" => Ok(UnitType::Info),
            other => Err(LmcError::UnknownType(other.to_string())),
        }
    }
}

/// Errors raised while building or re-reading a unit
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LmcError {
    #[error("code units must declare a format")]
    MissingFormat,

    #[error("only code units may carry a format (got type `{unit_type}` with format `{format}`)")]
    UnexpectedFormat { unit_type: UnitType, format: String },

    #[error("unknown role `{0}`")]
    UnknownRole(String),

    #[error("unknown unit type `{0}`")]
    UnknownType(String),

    #[error("line is not a rendered unit: {0}")]
    MalformedLine(String),
}

/// One immutable turn of conversation.
///
/// `format` is present if and only if the unit is code; the constructors and
/// deserialization both enforce this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLmc")]
pub struct Lmc {
    role: Role,
    #[serde(rename = "type")]
    unit_type: UnitType,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
}

/// Wire shape accepted before the format/type invariant is checked
#[derive(Deserialize)]
struct RawLmc {
    role: Role,
    #[serde(rename = "type")]
    unit_type: UnitType,
    content: String,
    #[serde(default)]
    format: Option<String>,
}

impl TryFrom<RawLmc> for Lmc {
    type Error = LmcError;

    fn try_from(raw: RawLmc) -> Result<Self, Self::Error> {
        Lmc::new(raw.content, raw.role, raw.unit_type, raw.format)
    }
}

impl Lmc {
    /// Build a unit, rejecting a format on non-code units and a missing
    /// (or blank) format on code units.
    pub fn new(
        content: impl Into<String>,
        role: Role,
        unit_type: UnitType,
        format: Option<String>,
    ) -> Result<Self, LmcError> {
        let format = format.filter(|f| !f.trim().is_empty());
        match (unit_type, &format) {
            (UnitType::Code, None) => return Err(LmcError::MissingFormat),
            (UnitType::Message | UnitType::Info, Some(f)) => {
                return Err(LmcError::UnexpectedFormat {
                    unit_type,
                    format: f.clone(),
                })
            }
            _ => {}
        }
        Ok(Self {
            role,
            unit_type,
            content: content.into(),
            format,
        })
    }

    pub fn message(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            unit_type: UnitType::Message,
            content: content.into(),
            format: None,
        }
    }

    pub fn info(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            unit_type: UnitType::Info,
            content: content.into(),
            format: None,
        }
    }

    /// Build a code unit. Callers pass the language tag as declared by the
    /// model; it must be non-empty.
    pub fn code(
        role: Role,
        format: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, LmcError> {
        Self::new(content, role, UnitType::Code, Some(format.into()))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn unit_type(&self) -> UnitType {
        self.unit_type
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    pub fn is_code(&self) -> bool {
        self.unit_type == UnitType::Code
    }

    /// `code, format: python` for code, the bare type otherwise
    fn kind_label(&self) -> String {
        match &self.format {
            Some(format) => format!("{}, format: {}", self.unit_type, format),
            None => self.unit_type.to_string(),
        }
    }

    /// Render as one plain transcript line stamped with `at`.
    pub fn to_chat_line<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> String
    where
        Tz::Offset: fmt::Display,
    {
        format!(
            "({}) [type: {}] *{}*: {}",
            at.format(TIMESTAMP_FORMAT),
            self.kind_label(),
            self.role,
            self.content
        )
    }

    /// Same as [`Lmc::to_chat_line`] with ANSI styling for terminals: a dim
    /// timestamp and a bold role.
    pub fn to_log_line<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> String
    where
        Tz::Offset: fmt::Display,
    {
        format!(
            "\x1b[90m({})\x1b[0m [type: {}] \x1b[1m{}\x1b[0m: {}",
            at.format(TIMESTAMP_FORMAT),
            self.kind_label(),
            self.role,
            self.content
        )
    }

    /// Recover a unit from a line produced by [`Lmc::to_chat_line`]. The
    /// timestamp is discarded.
    pub fn from_chat_line(line: &str) -> Result<Self, LmcError> {
        let caps = CHAT_LINE
            .captures(line)
            .ok_or_else(|| LmcError::MalformedLine(line.chars().take(80).collect()))?;

        let unit_type: UnitType = caps["type"].parse()?;
        let role: Role = caps["role"].parse()?;
        let format = caps.name("format").map(|m| m.as_str().to_string());
        Self::new(&caps["content"], role, unit_type, format)
    }
}

/// Ordered, append-only history of one session.
///
/// There is deliberately no way to remove or edit a unit once pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    units: Vec<Lmc>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, unit: Lmc) {
        self.units.push(unit);
    }

    pub fn units(&self) -> &[Lmc] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn last(&self) -> Option<&Lmc> {
        self.units.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Lmc> {
        self.units.iter()
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a Lmc;
    type IntoIter = std::slice::Iter<'a, Lmc>;

    fn into_iter(self) -> Self::IntoIter {
        self.units.iter()
    }
}

/// Render units as newline-separated chat lines, all stamped with `at`
pub fn render_chat<Tz: TimeZone>(units: &[Lmc], at: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    units
        .iter()
        .map(|unit| unit.to_chat_line(at))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fixed_clock() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 21, 5, 0).unwrap()
    }

    #[test]
    fn test_code_requires_format() {
        assert_eq!(
            Lmc::new("print(1)", Role::Assistant, UnitType::Code, None),
            Err(LmcError::MissingFormat)
        );
        assert_eq!(
            Lmc::code(Role::Assistant, "  ", "print(1)"),
            Err(LmcError::MissingFormat)
        );
    }

    #[test]
    fn test_message_rejects_format() {
        let err = Lmc::new("hi", Role::User, UnitType::Message, Some("python".into()));
        assert!(matches!(err, Err(LmcError::UnexpectedFormat { .. })));
    }

    #[test]
    fn test_chat_line_layout() {
        let unit = Lmc::code(Role::Assistant, "python", "print(2+2)").unwrap();
        assert_eq!(
            unit.to_chat_line(&fixed_clock()),
            "(09:05 PM 10/16/2026) [type: code, format: python] *assistant*: print(2+2)"
        );

        let unit = Lmc::message(Role::User, "What is 2+2?");
        assert_eq!(
            unit.to_chat_line(&fixed_clock()),
            "(09:05 PM 10/16/2026) [type: message] *user*: What is 2+2?"
        );
    }

    #[test]
    fn test_log_line_is_styled_and_deterministic() {
        let unit = Lmc::info(Role::Browser, "sunny");
        let first = unit.to_log_line(&fixed_clock());
        assert_eq!(first, unit.to_log_line(&fixed_clock()));
        assert!(first.starts_with("\x1b[90m(09:05 PM 10/16/2026)\x1b[0m"));
        assert!(first.contains("\x1b[1mbrowser\x1b[0m: sunny"));
    }

    #[test]
    fn test_chat_line_reparse_recovers_fields() {
        let units = vec![
            Lmc::code(Role::Assistant, "bash", "ls -la\necho done").unwrap(),
            Lmc::message(Role::Computer, "Command executed with exit code: 0"),
            Lmc::info(Role::Browser, "[{\"title\": \"x\"}]"),
            Lmc::message(Role::System, "You are helpful."),
        ];
        for unit in units {
            let line = unit.to_chat_line(&fixed_clock());
            assert_eq!(Lmc::from_chat_line(&line).unwrap(), unit);
        }
    }

    #[test]
    fn test_from_chat_line_rejects_garbage() {
        assert!(matches!(
            Lmc::from_chat_line("just some words"),
            Err(LmcError::MalformedLine(_))
        ));
        assert!(matches!(
            Lmc::from_chat_line("(now) [type: message] *robot*: hi"),
            Err(LmcError::UnknownRole(_))
        ));
    }

    #[test]
    fn test_serde_omits_absent_format() {
        let json = serde_json::to_string(&Lmc::message(Role::User, "hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","type":"message","content":"hi"}"#);

        let code: Lmc = serde_json::from_str(
            r#"{"role":"assistant","type":"code","format":"js","content":"1"}"#,
        )
        .unwrap();
        assert_eq!(code.format(), Some("js"));
    }

    #[test]
    fn test_serde_enforces_format_invariant() {
        let bad = serde_json::from_str::<Lmc>(r#"{"role":"assistant","type":"code","content":"1"}"#);
        assert!(bad.is_err());
        let bad = serde_json::from_str::<Lmc>(
            r#"{"role":"user","type":"message","format":"python","content":"1"}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_transcript_appends_in_order() {
        let mut transcript = Transcript::new();
        transcript.push(Lmc::message(Role::User, "one"));
        transcript.push(Lmc::message(Role::Assistant, "two"));
        let contents: Vec<_> = transcript.iter().map(|u| u.content()).collect();
        assert_eq!(contents, vec!["one", "two"]);
        assert_eq!(transcript.last().map(|u| u.role()), Some(Role::Assistant));

        let json = serde_json::to_string(&transcript).unwrap();
        assert!(json.starts_with('['));
    }

    #[test]
    fn test_render_chat_joins_lines() {
        let units = vec![Lmc::message(Role::System, "sys"), Lmc::message(Role::User, "hi")];
        let rendered = render_chat(&units, &fixed_clock());
        assert_eq!(rendered.lines().count(), 2);
        assert!(rendered.ends_with("*user*: hi"));
    }
}
