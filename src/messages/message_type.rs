use std::{fmt, str::FromStr};

use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::Error;

/// Default documentation URI of community protocols.
pub const DIDCOMM_ORG: &str = "https://didcomm.org/";
/// Legacy prefix still sent by older agents; normalized to [`DIDCOMM_ORG`].
pub const LEGACY_DID_SOV_PREFIX: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/";

const MESSAGE_TYPE_PATTERN: &str =
    r"^(.*?/)([a-zA-Z0-9._-]+)/(\d+)\.(\d+)/([a-zA-Z0-9._-]+)$";

/// Parsed `@type` of a message: `<doc uri><family>/<major>.<minor>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageType {
    doc_uri: String,
    family: String,
    major: u32,
    minor: u32,
    name: String,
}

impl MessageType {
    /// Parses message type URI. Legacy `did:sov:...;spec/` prefix is
    /// accepted and replaced with `https://didcomm.org/`.
    ///
    /// # Example
    ///
    /// ```
    /// use didcomm_agent::messages::MessageType;
    /// let t = MessageType::parse("https://didcomm.org/connections/1.0/invitation").unwrap();
    /// assert_eq!(t.family(), "connections");
    /// assert_eq!((t.major(), t.minor()), (1, 0));
    /// assert_eq!(t.name(), "invitation");
    /// ```
    pub fn parse(uri: &str) -> Result<Self, Error> {
        let normalized = match uri.strip_prefix(LEGACY_DID_SOV_PREFIX) {
            Some(rest) => format!("{}{}", DIDCOMM_ORG, rest),
            None => uri.to_string(),
        };
        let re = Regex::new(MESSAGE_TYPE_PATTERN)?;
        let caps = re
            .captures(&normalized)
            .ok_or_else(|| Error::MessageTypeParse(uri.to_string()))?;
        let version = |i: usize| -> Result<u32, Error> {
            caps[i]
                .parse::<u32>()
                .map_err(|_| Error::MessageTypeParse(uri.to_string()))
        };
        Ok(MessageType {
            doc_uri: caps[1].to_string(),
            family: caps[2].to_string(),
            major: version(3)?,
            minor: version(4)?,
            name: caps[5].to_string(),
        })
    }

    pub fn doc_uri(&self) -> &str {
        &self.doc_uri
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical URI form.
    pub fn uri(&self) -> String {
        format!("{}/{}", self.protocol_uri(), self.name)
    }

    /// `<doc uri><family>/<major>.<minor>`
    pub fn protocol_uri(&self) -> String {
        self.protocol().uri()
    }

    /// `<doc uri><family>`, the prefix discovery queries filter on.
    pub fn family_uri(&self) -> String {
        format!("{}{}", self.doc_uri, self.family)
    }

    pub fn protocol(&self) -> Protocol {
        Protocol {
            doc_uri: self.doc_uri.clone(),
            family: self.family.clone(),
            major: self.major,
            minor: self.minor,
        }
    }

    /// Two types are compatible iff they share doc URI, family and major version.
    pub fn is_protocol_compatible(&self, other: &MessageType) -> bool {
        self.doc_uri == other.doc_uri && self.family == other.family && self.major == other.major
    }

    /// Same protocol version, other message name.
    pub fn with_name(&self, name: &str) -> MessageType {
        MessageType {
            name: name.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

impl FromStr for MessageType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::parse(s)
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.uri())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let uri = String::deserialize(d)?;
        MessageType::parse(&uri).map_err(de::Error::custom)
    }
}

/// Protocol version, as registered by handlers and disclosed to peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Protocol {
    pub doc_uri: String,
    pub family: String,
    pub major: u32,
    pub minor: u32,
}

impl Protocol {
    pub fn uri(&self) -> String {
        format!("{}{}/{}.{}", self.doc_uri, self.family, self.major, self.minor)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    #[test]
    fn parses_legacy_prefix() -> Result<(), Error> {
        let t = MessageType::parse(
            "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/issue-credential/1.0/offer-credential",
        )?;
        assert_eq!(
            t.uri(),
            "https://didcomm.org/issue-credential/1.0/offer-credential"
        );
        Ok(())
    }

    #[test]
    fn rejects_malformed() {
        for uri in [
            "",
            "https://didcomm.org/connections/invitation",
            "https://didcomm.org/connections/1/invitation",
            "https://didcomm.org/connections/1.x/invitation",
            "connections/1.0/invitation",
        ] {
            assert!(
                matches!(MessageType::parse(uri), Err(Error::MessageTypeParse(_))),
                "{} parsed",
                uri
            );
        }
    }

    #[test]
    fn compatibility_never_crosses_major() -> Result<(), Error> {
        let a = MessageType::parse("https://didcomm.org/present-proof/1.0/request-presentation")?;
        let b = MessageType::parse("https://didcomm.org/present-proof/1.3/presentation")?;
        let c = MessageType::parse("https://didcomm.org/present-proof/2.0/presentation")?;
        assert!(a.is_protocol_compatible(&b));
        assert!(!a.is_protocol_compatible(&c));
        Ok(())
    }

    #[derive(Clone, Debug)]
    struct Parts {
        family: String,
        major: u32,
        minor: u32,
        name: String,
    }

    impl Arbitrary for Parts {
        fn arbitrary(g: &mut Gen) -> Self {
            let word = |g: &mut Gen| -> String {
                let len = 1 + usize::arbitrary(g) % 12;
                (0..len)
                    .map(|_| *g.choose(b"abcdefghijklmnopqrstuvwxyz-_").unwrap_or(&b'a') as char)
                    .collect()
            };
            Parts {
                family: word(g),
                major: u32::arbitrary(g) % 100,
                minor: u32::arbitrary(g) % 100,
                name: word(g),
            }
        }
    }

    #[quickcheck_macros::quickcheck]
    fn parsed_parts_match_uri(p: Parts) -> bool {
        let uri = format!(
            "https://didcomm.org/{}/{}.{}/{}",
            p.family, p.major, p.minor, p.name
        );
        match MessageType::parse(&uri) {
            Ok(t) => {
                t.family() == p.family
                    && t.major() == p.major
                    && t.minor() == p.minor
                    && t.name() == p.name
                    && t.uri() == uri
            }
            Err(_) => false,
        }
    }
}
