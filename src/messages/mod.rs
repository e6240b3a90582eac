//! Plaintext DIDComm messages: message type URIs, decorators, attachments and
//! the bodies shared by every protocol (acks, problem reports).
mod ack;
mod attachment;
mod decorators;
mod message;
mod message_type;
pub mod problem_report;
pub(crate) mod serialization;

pub use ack::{Ack, AckStatus};
pub use attachment::{Attachment, AttachmentData};
pub use decorators::{ReturnRoute, ServiceDecorator, Thread, TransportDecorator};
pub use message::{PlaintextMessage, Shape};
pub use message_type::{MessageType, Protocol, DIDCOMM_ORG, LEGACY_DID_SOV_PREFIX};
pub use problem_report::{Problem, ProblemReport};
