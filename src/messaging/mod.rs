//! Messaging layer: wire envelope, contacts and the orchestrator that UI
//! collaborators call into.

pub mod contacts;
pub mod envelope;
pub mod service;

pub use contacts::{Contact, ContactDirectory, KeyChange};
pub use envelope::{Content, Envelope, Payload, ReceiptStatus, MESSAGING_PROTOCOL, PROTOCOL_VERSION};
pub use service::{MessagingEvent, MessagingService, MessagingStores};
