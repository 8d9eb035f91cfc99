//! Peer messaging adapter.
//!
//! Five named sub-protocols ride the bilateral transport, each as a
//! `{name, content type, data}` record inside one framed message:
//!
//! | name             | content            | semantics                        |
//! |------------------|--------------------|----------------------------------|
//! | `info`           | JSON `{address}`   | settlement address exchange      |
//! | `channelDeposit` | empty              | peer deposited; poll and confirm |
//! | `requestClose`   | empty              | peer asks us to claim on-chain   |
//! | `machinomy`      | JSON claim         | a payment claim                  |
//! | `ilp`            | binary packet      | forwarded packet / reply         |

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use paychan_chain::{parse_peer_address, to_checksum_address};
use paychan_core::{Packet, PaymentClaim};

use crate::engine::SettlementEngine;
use crate::{EngineError, Result};

pub const PROTOCOL_INFO: &str = "info";
pub const PROTOCOL_CHANNEL_DEPOSIT: &str = "channelDeposit";
pub const PROTOCOL_REQUEST_CLOSE: &str = "requestClose";
pub const PROTOCOL_MACHINOMY: &str = "machinomy";
pub const PROTOCOL_ILP: &str = "ilp";

/// MIME kind of a sub-protocol record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    OctetStream,
    TextPlain,
    Json,
}

/// One record inside a framed peer message.
#[derive(Debug, Clone)]
pub struct SubProtocol {
    pub name: String,
    pub content_type: ContentType,
    pub data: Vec<u8>,
}

impl SubProtocol {
    fn json(name: &str, data: Vec<u8>) -> Self {
        Self { name: name.to_string(), content_type: ContentType::Json, data }
    }

    fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            content_type: ContentType::OctetStream,
            data: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct InfoBody {
    address: String,
}

/// Decoded peer message.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    Info { address: String },
    ChannelDeposit,
    RequestClose,
    Claim(PaymentClaim),
    Packet(Vec<u8>),
}

impl PeerMessage {
    pub fn into_protocols(self) -> Vec<SubProtocol> {
        let record = match self {
            PeerMessage::Info { address } => SubProtocol::json(
                PROTOCOL_INFO,
                serde_json::to_vec(&InfoBody { address }).expect("info body serializes"),
            ),
            PeerMessage::ChannelDeposit => SubProtocol::empty(PROTOCOL_CHANNEL_DEPOSIT),
            PeerMessage::RequestClose => SubProtocol::empty(PROTOCOL_REQUEST_CLOSE),
            PeerMessage::Claim(claim) => SubProtocol::json(
                PROTOCOL_MACHINOMY,
                serde_json::to_vec(&claim).expect("claim serializes"),
            ),
            PeerMessage::Packet(data) => SubProtocol {
                name: PROTOCOL_ILP.to_string(),
                content_type: ContentType::OctetStream,
                data,
            },
        };
        vec![record]
    }

    /// Decode the first recognized record, if any.
    pub fn from_protocols(records: &[SubProtocol]) -> Result<Option<PeerMessage>> {
        for record in records {
            match record.name.as_str() {
                PROTOCOL_INFO => {
                    let body: InfoBody = serde_json::from_slice(&record.data)
                        .map_err(|e| EngineError::Serialization(e.to_string()))?;
                    return Ok(Some(PeerMessage::Info { address: body.address }));
                }
                PROTOCOL_CHANNEL_DEPOSIT => return Ok(Some(PeerMessage::ChannelDeposit)),
                PROTOCOL_REQUEST_CLOSE => return Ok(Some(PeerMessage::RequestClose)),
                PROTOCOL_MACHINOMY => {
                    let claim: PaymentClaim = serde_json::from_slice(&record.data)
                        .map_err(|e| EngineError::Serialization(e.to_string()))?;
                    return Ok(Some(PeerMessage::Claim(claim)));
                }
                PROTOCOL_ILP => return Ok(Some(PeerMessage::Packet(record.data.clone()))),
                _ => continue,
            }
        }
        Ok(None)
    }
}

/// The bilateral message transport. Framing, request/response
/// correlation and connection lifecycle live below this seam.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_protocols(&self, records: Vec<SubProtocol>) -> Result<Vec<SubProtocol>>;
}

impl SettlementEngine {
    /// Dispatch one framed message from the peer and produce the
    /// response records.
    pub async fn handle_protocols(&self, records: Vec<SubProtocol>) -> Result<Vec<SubProtocol>> {
        match PeerMessage::from_protocols(&records)? {
            Some(PeerMessage::Info { address }) => {
                self.link_address_from_info(&address);
                let ours = to_checksum_address(&self.address());
                Ok(PeerMessage::Info { address: ours }.into_protocols())
            }
            Some(PeerMessage::ChannelDeposit) => {
                if let Err(e) = self.reconcile_peer_deposit().await {
                    debug!(account = self.account.name(), "deposit reconcile failed: {}", e);
                }
                Ok(Vec::new())
            }
            Some(PeerMessage::RequestClose) => {
                if let Err(e) = self.claim_if_profitable(false, None).await {
                    debug!(account = self.account.name(), "close request failed: {}", e);
                }
                Ok(Vec::new())
            }
            Some(PeerMessage::Claim(claim)) => {
                if let Err(e) = self.validate_claim(claim).await {
                    debug!(account = self.account.name(), "claim handling failed: {}", e);
                }
                Ok(Vec::new())
            }
            Some(PeerMessage::Packet(data)) => {
                let reply = match Packet::from_bytes(&data) {
                    Ok(Packet::Prepare(prepare)) => self.handle_incoming_prepare(prepare).await,
                    Ok(_) => Packet::reject(
                        paychan_core::CODE_INTERNAL_ERROR,
                        "expected a prepare packet",
                    ),
                    Err(e) => Packet::reject_from_error(e),
                };
                Ok(PeerMessage::Packet(reply.to_bytes()).into_protocols())
            }
            None => Err(EngineError::Transport(
                "message carried no recognized sub-protocol".to_string(),
            )),
        }
    }

    /// Validate and link the peer's settlement address. A second or
    /// mismatched address is refused with a log line, never an error.
    fn link_address_from_info(&self, address: &str) {
        let parsed = match parse_peer_address(address) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(account = self.account.name(), "refusing peer address: {}", e);
                return;
            }
        };
        match self.account.peer_address() {
            None => {
                self.account.link_peer_address(parsed);
                self.persist_later();
                info!(account = self.account.name(), address = %parsed, "peer address linked");
            }
            Some(existing) if existing == parsed => {}
            Some(existing) => {
                debug!(
                    account = self.account.name(),
                    linked = %existing,
                    offered = %parsed,
                    "refusing to relink peer address"
                );
            }
        }
    }

    /// Exchange `info` messages to learn the peer's address.
    pub(crate) async fn exchange_info(&self) {
        let ours = to_checksum_address(&self.address());
        let request = PeerMessage::Info { address: ours }.into_protocols();
        match self.transport.send_protocols(request).await {
            Ok(response) => match PeerMessage::from_protocols(&response) {
                Ok(Some(PeerMessage::Info { address })) => self.link_address_from_info(&address),
                Ok(_) => debug!(account = self.account.name(), "info exchange got no address"),
                Err(e) => debug!(account = self.account.name(), "bad info response: {}", e),
            },
            Err(e) => debug!(account = self.account.name(), "info exchange failed: {}", e),
        }
    }

    /// Transmit a claim, fire-and-forget. Transmission failures are
    /// logged and swallowed; the claim is already committed.
    pub(crate) fn forward_claim(&self, claim: PaymentClaim) {
        let this = self.strong();
        tokio::spawn(async move {
            let records = PeerMessage::Claim(claim).into_protocols();
            if let Err(e) = this.transport.send_protocols(records).await {
                debug!(account = this.account.name(), "claim transmission failed: {}", e);
            }
        });
    }

    /// Tell the peer a deposit transaction was sent, fire-and-forget.
    pub(crate) fn notify_deposit(&self) {
        let this = self.strong();
        tokio::spawn(async move {
            let records = PeerMessage::ChannelDeposit.into_protocols();
            if let Err(e) = this.transport.send_protocols(records).await {
                debug!(account = this.account.name(), "deposit notification failed: {}", e);
            }
        });
    }

    /// Ask the peer to claim our outgoing channel.
    pub async fn request_close(&self) -> Result<()> {
        self.transport
            .send_protocols(PeerMessage::RequestClose.into_protocols())
            .await?;
        Ok(())
    }
}

/// Transport that records every outbound message and replies with
/// scripted responses. For tests and development.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<Vec<SubProtocol>>>,
    responses: Mutex<VecDeque<Vec<SubProtocol>>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next send; defaults to an empty ack.
    pub fn push_response(&self, records: Vec<SubProtocol>) {
        self.responses.lock().expect("transport lock poisoned").push_back(records);
    }

    /// Make subsequent sends fail.
    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Vec<SubProtocol>> {
        self.sent.lock().expect("transport lock poisoned").clone()
    }

    /// Every claim transmitted so far, in order.
    pub fn sent_claims(&self) -> Vec<PaymentClaim> {
        self.sent()
            .iter()
            .flatten()
            .filter(|record| record.name == PROTOCOL_MACHINOMY)
            .filter_map(|record| serde_json::from_slice(&record.data).ok())
            .collect()
    }

    /// Names of every record transmitted so far, in order.
    pub fn sent_names(&self) -> Vec<String> {
        self.sent().iter().flatten().map(|record| record.name.clone()).collect()
    }
}

#[async_trait]
impl PeerTransport for RecordingTransport {
    async fn send_protocols(&self, records: Vec<SubProtocol>) -> Result<Vec<SubProtocol>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("send failed (scripted)".to_string()));
        }
        self.sent.lock().expect("transport lock poisoned").push(records);
        let response = self
            .responses
            .lock()
            .expect("transport lock poisoned")
            .pop_front()
            .unwrap_or_default();
        Ok(response)
    }
}

/// Transport that delivers every message straight into a linked peer
/// engine. Two of these back-to-back wire a bilateral pair in-process.
#[derive(Default)]
pub struct LoopbackTransport {
    peer: RwLock<Weak<SettlementEngine>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, peer: &Arc<SettlementEngine>) {
        let mut slot = self.peer.write().expect("transport lock poisoned");
        *slot = Arc::downgrade(peer);
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn send_protocols(&self, records: Vec<SubProtocol>) -> Result<Vec<SubProtocol>> {
        let peer = {
            let slot = self.peer.read().expect("transport lock poisoned");
            slot.upgrade()
        };
        match peer {
            Some(engine) => engine.handle_protocols(records).await,
            None => Err(EngineError::Transport("no peer linked".to_string())),
        }
    }
}
