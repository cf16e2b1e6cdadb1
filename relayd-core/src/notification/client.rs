//! The notification-channel client state machine (spec §4.7).
//!
//! `NotificationTransport` is the seam a real duplex socket and a test
//! double both sit behind, the same role `IndexFileWriter` plays for
//! index files: the core never owns connection setup, framing is all it
//! is responsible for.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{RelayError, Result};
use crate::notification::wire::{MessageHeader, MessageType};

/// The FIFO's hard bound (spec §5, "Backpressure": "the notification FIFO
/// is the only bounded buffer in the core").
pub const MAX_QUEUED: usize = 64;

pub trait NotificationTransport: Send + Sync {
    fn send(&self, header: MessageHeader, payload: &[u8]) -> std::io::Result<()>;
    fn recv_header(&self) -> std::io::Result<MessageHeader>;
    fn recv_payload(&self, len: usize) -> std::io::Result<Vec<u8>>;
    /// Non-blocking: is there a framed message waiting to be read?
    fn poll_readable(&self) -> std::io::Result<bool>;
    /// Block until a framed message is available to read.
    fn wait_readable(&self) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FifoEntry {
    Notification(Vec<u8>),
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivered {
    Notification(Vec<u8>),
    Dropped,
}

struct ClientState {
    fifo: VecDeque<FifoEntry>,
    version: Option<ProtocolVersion>,
}

pub struct NotificationClient<T: NotificationTransport> {
    transport: T,
    state: Mutex<ClientState>,
}

impl<T: NotificationTransport> NotificationClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: Mutex::new(ClientState {
                fifo: VecDeque::new(),
                version: None,
            }),
        }
    }

    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.state.lock().expect("client lock poisoned").version
    }

    pub fn fifo_len(&self) -> usize {
        self.state.lock().expect("client lock poisoned").fifo.len()
    }

    /// Send `HANDSHAKE` with `{major, minor}` and drain the reply chain:
    /// any interleaved `NOTIFICATION`/`NOTIFICATION_DROPPED` are enqueued,
    /// terminated by a `COMMAND_REPLY`. Fails if no `HANDSHAKE` reply set
    /// the version, or if its major doesn't match.
    pub fn handshake(&self, major: u32, minor: u32) -> Result<()> {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&major.to_le_bytes());
        payload.extend_from_slice(&minor.to_le_bytes());
        self.send_command(MessageType::Handshake, &payload)?;

        let mut seen_version: Option<ProtocolVersion> = None;
        loop {
            let (msg_type, payload) = self.recv_one()?;
            match msg_type {
                MessageType::Notification => self.enqueue_notification(payload),
                MessageType::NotificationDropped => self.enqueue_dropped(),
                MessageType::Handshake => {
                    if payload.len() < 8 {
                        return Err(RelayError::ProtocolViolation(
                            "handshake reply too short".into(),
                        ));
                    }
                    seen_version = Some(ProtocolVersion {
                        major: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
                        minor: u32::from_le_bytes(payload[4..8].try_into().unwrap()),
                    });
                }
                MessageType::CommandReply => break,
                other => {
                    return Err(RelayError::ProtocolViolation(format!(
                        "unexpected message {other:?} during handshake"
                    )))
                }
            }
        }

        let version = seen_version.ok_or_else(|| {
            RelayError::ProtocolViolation("handshake reply never set a version".into())
        })?;
        if version.major != major {
            return Err(RelayError::ProtocolViolation(format!(
                "server major {} does not match client major {major}",
                version.major
            )));
        }
        self.state.lock().expect("client lock poisoned").version = Some(version);
        Ok(())
    }

    pub fn subscribe(&self, condition: &[u8]) -> Result<()> {
        self.send_command(MessageType::Subscribe, condition)?;
        self.drain_until_reply()
    }

    pub fn unsubscribe(&self, condition: &[u8]) -> Result<()> {
        self.send_command(MessageType::Unsubscribe, condition)?;
        self.drain_until_reply()
    }

    /// Deliver from the FIFO if non-empty; else block for the next
    /// framed message and deliver it directly (spec §4.7, "Receive next
    /// notification").
    pub fn next_notification(&self) -> Result<Delivered> {
        if let Some(entry) = self.state.lock().expect("client lock poisoned").fifo.pop_front() {
            return Ok(match entry {
                FifoEntry::Notification(n) => Delivered::Notification(n),
                FifoEntry::Dropped => Delivered::Dropped,
            });
        }

        self.transport.wait_readable().map_err(RelayError::IoFailure)?;
        let (msg_type, payload) = self.recv_one()?;
        match msg_type {
            MessageType::Notification => Ok(Delivered::Notification(payload)),
            MessageType::NotificationDropped => Ok(Delivered::Dropped),
            other => Err(RelayError::ProtocolViolation(format!(
                "unexpected message {other:?} outside a command"
            ))),
        }
    }

    /// Non-blocking: FIFO non-empty, or a readable socket drained into it
    /// (spec §4.7, "Has pending notification").
    pub fn has_pending(&self) -> Result<bool> {
        if !self.state.lock().expect("client lock poisoned").fifo.is_empty() {
            return Ok(true);
        }
        if !self.transport.poll_readable().map_err(RelayError::IoFailure)? {
            return Ok(false);
        }
        let (msg_type, payload) = self.recv_one()?;
        match msg_type {
            MessageType::Notification => self.enqueue_notification(payload),
            MessageType::NotificationDropped => self.enqueue_dropped(),
            other => {
                return Err(RelayError::ProtocolViolation(format!(
                    "unexpected message {other:?} outside a command"
                )))
            }
        }
        Ok(true)
    }

    fn send_command(&self, msg_type: MessageType, payload: &[u8]) -> Result<()> {
        let header = MessageHeader {
            msg_type,
            size: payload.len() as u32,
            fds: 0,
        };
        self.transport
            .send(header, payload)
            .map_err(RelayError::IoFailure)
    }

    fn recv_one(&self) -> Result<(MessageType, Vec<u8>)> {
        let header = self.transport.recv_header().map_err(RelayError::IoFailure)?;
        let payload = self
            .transport
            .recv_payload(header.size as usize)
            .map_err(RelayError::IoFailure)?;
        Ok((header.msg_type, payload))
    }

    fn drain_until_reply(&self) -> Result<()> {
        loop {
            let (msg_type, payload) = self.recv_one()?;
            match msg_type {
                MessageType::Notification => self.enqueue_notification(payload),
                MessageType::NotificationDropped => self.enqueue_dropped(),
                MessageType::CommandReply => return Ok(()),
                other => {
                    return Err(RelayError::ProtocolViolation(format!(
                        "unexpected message {other:?} during command"
                    )))
                }
            }
        }
    }

    /// Apply the FIFO's collapsing backpressure policy (spec §4.7,
    /// "Queueing policy"): at capacity, a fresh notification is dropped
    /// outright and folded into the trailing drop-marker rather than
    /// evicting anything already queued.
    fn enqueue_notification(&self, payload: Vec<u8>) {
        let mut state = self.state.lock().expect("client lock poisoned");
        if state.fifo.len() >= MAX_QUEUED {
            match state.fifo.back() {
                Some(FifoEntry::Dropped) => {}
                _ => {
                    state.fifo.pop_back();
                    state.fifo.push_back(FifoEntry::Dropped);
                }
            }
            return;
        }
        state.fifo.push_back(FifoEntry::Notification(payload));
    }

    /// A received `NOTIFICATION_DROPPED` always enqueues a drop-marker,
    /// collapsed with an adjacent one.
    fn enqueue_dropped(&self) {
        let mut state = self.state.lock().expect("client lock poisoned");
        if matches!(state.fifo.back(), Some(FifoEntry::Dropped)) {
            return;
        }
        if state.fifo.len() >= MAX_QUEUED {
            state.fifo.pop_back();
        }
        state.fifo.push_back(FifoEntry::Dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque as Deque;
    use std::sync::Mutex as StdMutex;

    /// An in-process transport driven by a scripted outbound message
    /// queue, for exercising the client FSM without a real socket.
    struct ScriptedTransport {
        inbound: StdMutex<Deque<(MessageType, Vec<u8>)>>,
        sent: StdMutex<Vec<(MessageType, Vec<u8>)>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<(MessageType, Vec<u8>)>) -> Self {
            Self {
                inbound: StdMutex::new(script.into_iter().collect()),
                sent: StdMutex::new(Vec::new()),
            }
        }
    }

    impl NotificationTransport for ScriptedTransport {
        fn send(&self, header: MessageHeader, payload: &[u8]) -> std::io::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((header.msg_type, payload.to_vec()));
            Ok(())
        }

        fn recv_header(&self) -> std::io::Result<MessageHeader> {
            let inbound = self.inbound.lock().unwrap();
            let (msg_type, payload) = inbound.front().expect("script exhausted");
            Ok(MessageHeader {
                msg_type: *msg_type,
                size: payload.len() as u32,
                fds: 0,
            })
        }

        fn recv_payload(&self, _len: usize) -> std::io::Result<Vec<u8>> {
            let mut inbound = self.inbound.lock().unwrap();
            Ok(inbound.pop_front().expect("script exhausted").1)
        }

        fn poll_readable(&self) -> std::io::Result<bool> {
            Ok(!self.inbound.lock().unwrap().is_empty())
        }

        fn wait_readable(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn version_payload(major: u32, minor: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&major.to_le_bytes());
        buf.extend_from_slice(&minor.to_le_bytes());
        buf
    }

    #[test]
    fn handshake_sets_version_on_matching_major() {
        let transport = ScriptedTransport::new(vec![
            (MessageType::Handshake, version_payload(2, 11)),
            (MessageType::CommandReply, Vec::new()),
        ]);
        let client = NotificationClient::new(transport);
        client.handshake(2, 0).unwrap();
        assert_eq!(
            client.negotiated_version(),
            Some(ProtocolVersion { major: 2, minor: 11 })
        );
    }

    #[test]
    fn handshake_rejects_major_mismatch() {
        let transport = ScriptedTransport::new(vec![
            (MessageType::Handshake, version_payload(3, 0)),
            (MessageType::CommandReply, Vec::new()),
        ]);
        let client = NotificationClient::new(transport);
        assert!(matches!(
            client.handshake(2, 0),
            Err(RelayError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn notifications_interleaved_during_handshake_are_enqueued() {
        let transport = ScriptedTransport::new(vec![
            (MessageType::Notification, b"n1".to_vec()),
            (MessageType::Handshake, version_payload(2, 0)),
            (MessageType::CommandReply, Vec::new()),
        ]);
        let client = NotificationClient::new(transport);
        client.handshake(2, 0).unwrap();
        assert_eq!(client.fifo_len(), 1);
        assert_eq!(
            client.next_notification().unwrap(),
            Delivered::Notification(b"n1".to_vec())
        );
    }

    #[test]
    fn fifo_collapses_overflow_into_a_single_drop_marker() {
        let transport = ScriptedTransport::new(vec![]);
        let client = NotificationClient::new(transport);
        for i in 0..MAX_QUEUED + 5 {
            client.enqueue_notification(vec![i as u8]);
        }
        assert_eq!(client.fifo_len(), MAX_QUEUED);
        assert_eq!(
            client.state.lock().unwrap().fifo.back(),
            Some(&FifoEntry::Dropped)
        );
    }

    #[test]
    fn adjacent_dropped_messages_collapse_to_one_marker() {
        let transport = ScriptedTransport::new(vec![]);
        let client = NotificationClient::new(transport);
        client.enqueue_dropped();
        client.enqueue_dropped();
        client.enqueue_dropped();
        assert_eq!(client.fifo_len(), 1);
    }
}
