//! Asynchronous control port events
//!
//! The daemon pushes `650` lines once events are enabled with SETEVENTS.
//! Each line body is parsed into an event kind, an optional severity and
//! action (for `STATUS_*` events), positional words, and keyword arguments.

use crate::error::{Result, TorError};
use std::collections::BTreeMap;
use std::fmt;

/// Event types the supervisor cares about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    StatusClient,
    StatusGeneral,
    StatusServer,
    Circ,
    Other(String),
}

impl EventKind {
    pub fn parse(word: &str) -> Self {
        match word {
            "STATUS_CLIENT" => EventKind::StatusClient,
            "STATUS_GENERAL" => EventKind::StatusGeneral,
            "STATUS_SERVER" => EventKind::StatusServer,
            "CIRC" => EventKind::Circ,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::StatusClient => "STATUS_CLIENT",
            EventKind::StatusGeneral => "STATUS_GENERAL",
            EventKind::StatusServer => "STATUS_SERVER",
            EventKind::Circ => "CIRC",
            EventKind::Other(name) => name,
        }
    }

    fn is_status(&self) -> bool {
        matches!(
            self,
            EventKind::StatusClient | EventKind::StatusGeneral | EventKind::StatusServer
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed asynchronous event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEvent {
    pub kind: EventKind,
    /// NOTICE / WARN / ERR for status events
    pub severity: Option<String>,
    /// Status action, e.g. BOOTSTRAP or CIRCUIT_ESTABLISHED
    pub action: Option<String>,
    /// Words that are not KEY=VALUE pairs
    pub positional: Vec<String>,
    pub args: BTreeMap<String, String>,
}

impl ControlEvent {
    /// Parse the body of a `650` line (without the status code)
    pub fn parse(body: &str) -> Result<Self> {
        let mut tokens = tokenize(body)?.into_iter();

        let kind = tokens
            .next()
            .map(|w| EventKind::parse(&w))
            .ok_or_else(|| TorError::EventParse("empty event".to_string()))?;

        let (severity, action) = if kind.is_status() {
            match (tokens.next(), tokens.next()) {
                (Some(severity), Some(action)) => (Some(severity), Some(action)),
                _ => {
                    return Err(TorError::EventParse(format!(
                        "{} event without severity and action: {:?}",
                        kind, body
                    )))
                },
            }
        } else {
            (None, None)
        };

        let mut positional = Vec::new();
        let mut args = BTreeMap::new();
        for token in tokens {
            match split_keyword(&token) {
                Some((key, value)) => {
                    args.insert(key.to_string(), value.to_string());
                },
                None => positional.push(token),
            }
        }

        Ok(Self {
            kind,
            severity,
            action,
            positional,
            args,
        })
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }

    /// Bootstrap percentage from a `STATUS_CLIENT ... BOOTSTRAP` event
    pub fn bootstrap_progress(&self) -> Option<u8> {
        if self.kind != EventKind::StatusClient || self.action.as_deref() != Some("BOOTSTRAP") {
            return None;
        }
        self.arg("PROGRESS")?.parse::<u8>().ok().map(|p| p.min(100))
    }

    /// `Some(true)` for CIRCUIT_ESTABLISHED, `Some(false)` for
    /// CIRCUIT_NOT_ESTABLISHED, `None` for anything else
    pub fn circuit_established(&self) -> Option<bool> {
        if self.kind != EventKind::StatusClient {
            return None;
        }
        match self.action.as_deref() {
            Some("CIRCUIT_ESTABLISHED") => Some(true),
            Some("CIRCUIT_NOT_ESTABLISHED") => Some(false),
            _ => None,
        }
    }
}

/// `KEY=VALUE` where KEY is a plain identifier
fn split_keyword(token: &str) -> Option<(&str, &str)> {
    let (key, value) = token.split_once('=')?;
    if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some((key, value))
    } else {
        None
    }
}

/// Split on spaces, honoring double quotes and backslash escapes inside them
pub(crate) fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            },
            '\\' if in_quotes => match chars.next() {
                Some('n') => current.push('\n'),
                Some('t') => current.push('\t'),
                Some(escaped) => current.push(escaped),
                None => break,
            },
            ' ' if !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            },
            _ => {
                current.push(c);
                has_token = true;
            },
        }
    }

    if in_quotes {
        return Err(TorError::EventParse(format!("unterminated quote in {:?}", line)));
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bootstrap_event() {
        let event = ControlEvent::parse(
            "STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=45 TAG=loading_descriptors SUMMARY=\"Loading relay descriptors\"",
        )
        .unwrap();

        assert_eq!(event.kind, EventKind::StatusClient);
        assert_eq!(event.severity.as_deref(), Some("NOTICE"));
        assert_eq!(event.action.as_deref(), Some("BOOTSTRAP"));
        assert_eq!(event.arg("SUMMARY"), Some("Loading relay descriptors"));
        assert_eq!(event.bootstrap_progress(), Some(45));
        assert_eq!(event.circuit_established(), None);
    }

    #[test]
    fn test_parse_circuit_established() {
        let up = ControlEvent::parse("STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED").unwrap();
        assert_eq!(up.circuit_established(), Some(true));

        let down =
            ControlEvent::parse("STATUS_CLIENT WARN CIRCUIT_NOT_ESTABLISHED REASON=CLOCK_JUMPED")
                .unwrap();
        assert_eq!(down.circuit_established(), Some(false));
        assert_eq!(down.arg("REASON"), Some("CLOCK_JUMPED"));
    }

    #[test]
    fn test_circ_event_path_stays_positional() {
        let event = ControlEvent::parse(
            "CIRC 7 BUILT $AAAA~alpha,$BBBB=beta PURPOSE=GENERAL",
        )
        .unwrap();
        assert_eq!(event.kind, EventKind::Circ);
        assert_eq!(event.positional, vec!["7", "BUILT", "$AAAA~alpha,$BBBB=beta"]);
        assert_eq!(event.arg("PURPOSE"), Some("GENERAL"));
    }

    #[test]
    fn test_malformed_events_rejected() {
        assert!(ControlEvent::parse("").is_err());
        assert!(ControlEvent::parse("STATUS_CLIENT NOTICE").is_err());
        assert!(ControlEvent::parse("STATUS_CLIENT NOTICE BOOTSTRAP SUMMARY=\"open").is_err());
    }

    #[test]
    fn test_unknown_kind_preserved() {
        let event = ControlEvent::parse("NETWORK_LIVENESS UP").unwrap();
        assert_eq!(event.kind, EventKind::Other("NETWORK_LIVENESS".to_string()));
        assert_eq!(event.positional, vec!["UP"]);
    }

    #[test]
    fn test_tokenize_escapes() {
        let tokens = tokenize(r#"A="x \"y\" z" B"#).unwrap();
        assert_eq!(tokens, vec![r#"A=x "y" z"#, "B"]);
    }

    #[test]
    fn test_progress_non_numeric_is_none() {
        let event = ControlEvent::parse("STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=abc").unwrap();
        assert_eq!(event.bootstrap_progress(), None);
    }
}
