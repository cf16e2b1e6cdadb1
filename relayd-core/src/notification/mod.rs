//! Notification-channel client (spec §3, "Notification channel"; §4.7).

pub mod client;
pub mod wire;

pub use client::{Delivered, NotificationClient, NotificationTransport, ProtocolVersion, MAX_QUEUED};
pub use wire::{MessageHeader, MessageType};
