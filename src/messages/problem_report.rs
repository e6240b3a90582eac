use crate::Error;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::Shape;

/// Problem codes this agent sends.
/// Format and semantics follow Aries RFC 0035.
pub mod codes {
    pub const UNSUPPORTED_MESSAGE: &str = "e.p.msg.unsupported";
    pub const INVALID_STATE: &str = "e.p.msg.invalid-state";
    pub const THREAD_NOT_FOUND: &str = "e.p.msg.not-found";
    pub const MESSAGE_PARSE_FAILURE: &str = "e.p.msg.parse-failure";
    pub const CONNECTION_NOT_READY: &str = "e.p.xfer.cant-use-endpoint";
    pub const NO_MATCH: &str = "e.p.req.no-match";
    pub const ABANDONED: &str = "e.p.req.abandoned";
    pub const INTERNAL: &str = "e.p.me.internal";
}

/// `description` of a problem report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Problem {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub en: Option<String>,
}

impl Problem {
    /// Parses given code into new instance of Problem
    /// If given string does not match the problem code format - returns Err.
    ///
    pub fn from_code(code: &str) -> Result<Self, Error> {
        let re = Regex::new(r"^[e|w]\.[a-z0-9]{1,32}\.[a-zA-Z]*\.?[-a-zA-Z\-]*\.?[-a-zA-Z\-]*$")?;
        if re.is_match(code) {
            Ok(Problem {
                code: code.into(),
                ..Default::default()
            })
        } else {
            Err(Error::InvalidMessage(format!(
                "'{}' is not a problem code",
                code
            )))
        }
    }
}

/// Body of `problem-report` messages. Every protocol uses the same body under
/// its own message type.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProblemReport {
    pub description: Problem,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub who_retries: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noticed_time: Option<String>,
}

impl ProblemReport {
    pub fn new(code: &str, comment: impl Into<String>) -> Result<Self, Error> {
        let mut description = Problem::from_code(code)?;
        description.en = Some(comment.into());
        Ok(ProblemReport {
            description,
            who_retries: Some("none".into()),
            impact: Some("thread".into()),
            noticed_time: Some(chrono::Utc::now().to_rfc3339()),
        })
    }

    pub fn from_error(error: &Error) -> Result<Self, Error> {
        Self::new(error.problem_code(), error.to_string())
    }

    pub fn code(&self) -> &str {
        &self.description.code
    }

    pub fn comment(&self) -> &str {
        self.description.en.as_deref().unwrap_or_default()
    }

    /// Text stored as `error_message` of the abandoned record.
    pub fn error_message(&self) -> String {
        format!("{}: {}", self.code(), self.comment())
    }
}

impl Shape for ProblemReport {
    const TYPE: &'static str = "https://didcomm.org/notification/1.0/problem-report";

    fn validate(&self) -> Result<(), Error> {
        Problem::from_code(&self.description.code).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_are_well_formed() {
        for code in [
            codes::UNSUPPORTED_MESSAGE,
            codes::INVALID_STATE,
            codes::THREAD_NOT_FOUND,
            codes::MESSAGE_PARSE_FAILURE,
            codes::CONNECTION_NOT_READY,
            codes::NO_MATCH,
            codes::ABANDONED,
            codes::INTERNAL,
        ] {
            assert!(Problem::from_code(code).is_ok(), "{}", code);
        }
    }

    #[test]
    fn bad_code_is_rejected() {
        assert!(Problem::from_code("no-match").is_err());
        assert!(Problem::from_code("x.p.req.no-match").is_err());
    }

    #[test]
    fn error_message_carries_code() -> Result<(), Error> {
        let report = ProblemReport::new(codes::NO_MATCH, "no credential matches")?;
        assert_eq!(report.error_message(), "e.p.req.no-match: no credential matches");
        Ok(())
    }
}
