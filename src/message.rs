//! Peer messages and their wire framing.
//!
//! Every frame is a 4 byte big-endian length followed by the bincode
//! encoding of [`Message`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::block::{Block, BlockId, Hash};
use crate::inventory::InvKind;
use crate::transaction::Transaction;

pub const P2P_VERSION: u32 = 11;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    BadProtocol,
    BadBlock,
    BadTransaction,
    Forked,
    TooManyPeers,
    TooManyPeersSameIp,
    DuplicatePeer,
    TimeOut,
    PingTimeout,
    SyncFail,
    Requested,
    IncompatibleProtocol,
    IncompatibleChain,
    FetchFail,
    RecentlyDisconnected,
}

impl DisconnectReason {
    /// Reasons that mark the remote as misbehaving rather than merely slow or surplus.
    pub fn is_misbehaviour(self) -> bool {
        matches!(
            self,
            DisconnectReason::BadProtocol | DisconnectReason::BadBlock | DisconnectReason::BadTransaction
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::BadProtocol => "BAD_PROTOCOL",
            DisconnectReason::BadBlock => "BAD_BLOCK",
            DisconnectReason::BadTransaction => "BAD_TRANSACTION",
            DisconnectReason::Forked => "FORKED",
            DisconnectReason::TooManyPeers => "TOO_MANY_PEERS",
            DisconnectReason::TooManyPeersSameIp => "TOO_MANY_PEERS_SAME_IP",
            DisconnectReason::DuplicatePeer => "DUPLICATE_PEER",
            DisconnectReason::TimeOut => "TIME_OUT",
            DisconnectReason::PingTimeout => "PING_TIMEOUT",
            DisconnectReason::SyncFail => "SYNC_FAIL",
            DisconnectReason::Requested => "REQUESTED",
            DisconnectReason::IncompatibleProtocol => "INCOMPATIBLE_PROTOCOL",
            DisconnectReason::IncompatibleChain => "INCOMPATIBLE_CHAIN",
            DisconnectReason::FetchFail => "FETCH_FAIL",
            DisconnectReason::RecentlyDisconnected => "RECENTLY_DISCONNECTED",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    pub version: u32,
    pub node_id: NodeId,
    pub listen_port: u16,
    pub timestamp_ms: u64,
    pub genesis: BlockId,
    pub solidified: BlockId,
    pub head: BlockId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Hello(HelloMessage),
    Ping(u64),
    Pong(u64),
    Disconnect(DisconnectReason),
    SyncBlockChain(Vec<BlockId>),
    ChainInventory { ids: Vec<BlockId>, remain: u64 },
    Inventory { kind: InvKind, ids: Vec<Hash> },
    FetchInvData { kind: InvKind, ids: Vec<Hash> },
    Block(Block),
    Transactions(Vec<Transaction>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Ping,
    Pong,
    Disconnect,
    SyncBlockChain,
    ChainInventory,
    Inventory,
    FetchInvData,
    Block,
    Transactions,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::Ping(_) => MessageKind::Ping,
            Message::Pong(_) => MessageKind::Pong,
            Message::Disconnect(_) => MessageKind::Disconnect,
            Message::SyncBlockChain(_) => MessageKind::SyncBlockChain,
            Message::ChainInventory { .. } => MessageKind::ChainInventory,
            Message::Inventory { .. } => MessageKind::Inventory,
            Message::FetchInvData { .. } => MessageKind::FetchInvData,
            Message::Block(_) => MessageKind::Block,
            Message::Transactions(_) => MessageKind::Transactions,
        }
    }

    /// The reply this message waits for, if it is a round trip.
    pub fn answer(&self) -> Option<MessageKind> {
        match self {
            Message::Ping(_) => Some(MessageKind::Pong),
            Message::SyncBlockChain(_) => Some(MessageKind::ChainInventory),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode: {0}")]
    Decode(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

pub fn encode(msg: &Message) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(msg)?)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message, max_len: usize) -> Result<(), CodecError> {
    let data = encode(msg)?;
    if data.len() > max_len {
        return Err(CodecError::FrameTooLarge(data.len()));
    }
    w.write_all(&(data.len() as u32).to_be_bytes()).await?;
    w.write_all(&data).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, max_len: usize) -> Result<Message, CodecError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    Ok(bincode::deserialize(&data)?)
}
