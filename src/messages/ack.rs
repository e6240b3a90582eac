use serde::{Deserialize, Serialize};

use super::Shape;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckStatus {
    Ok,
    Fail,
    Pending,
}

/// Body of `ack` messages (Aries RFC 0015), sent under each protocol's own
/// `ack` type.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Ack {
    pub status: AckStatus,
}

impl Ack {
    pub fn ok() -> Self {
        Ack {
            status: AckStatus::Ok,
        }
    }
}

impl Shape for Ack {
    const TYPE: &'static str = "https://didcomm.org/notification/1.0/ack";
}
