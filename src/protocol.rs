use bincode::Options;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::DhtError;
use crate::key::Key;
use crate::node::contact::Contact;
use crate::node::store::StoreStatus;
use crate::security::SecurityToken;
use crate::storage::StoredValue;
use crate::MESSAGE_LENGTH;

/// Fields shared by every message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Header {
    /// Correlation id; a response carries the id of its request.
    pub id: Key,
    pub sender: Contact,
}

/// One variant per operation code.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Body {
    Ping,
    Pong {
        external_addr: SocketAddr,
        estimated_size: u64,
    },
    FindNodeRequest {
        target: Key,
    },
    FindNodeResponse {
        token: SecurityToken,
        contacts: Vec<Contact>,
    },
    /// Asks for the values held under any of `targets`. Contacts are returned around the first
    /// target when none are held.
    FindValueRequest {
        targets: Vec<Key>,
        excluded: Vec<Key>,
    },
    FindValueResponse {
        token: SecurityToken,
        contacts: Vec<Contact>,
        values: Vec<StoredValue>,
        request_load: f32,
    },
    StoreRequest {
        token: Option<SecurityToken>,
        values: Vec<StoredValue>,
    },
    /// Statuses in the order of the request's values.
    StoreResponse {
        statuses: Vec<StoreStatus>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Ping = 0x01,
    Pong = 0x02,
    FindNodeRequest = 0x03,
    FindNodeResponse = 0x04,
    FindValueRequest = 0x05,
    FindValueResponse = 0x06,
    StoreRequest = 0x07,
    StoreResponse = 0x08,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Option<OpCode> {
        match byte {
            0x01 => Some(OpCode::Ping),
            0x02 => Some(OpCode::Pong),
            0x03 => Some(OpCode::FindNodeRequest),
            0x04 => Some(OpCode::FindNodeResponse),
            0x05 => Some(OpCode::FindValueRequest),
            0x06 => Some(OpCode::FindValueResponse),
            0x07 => Some(OpCode::StoreRequest),
            0x08 => Some(OpCode::StoreResponse),
            _ => None,
        }
    }

    pub fn is_response(self) -> bool {
        match self {
            OpCode::Pong
            | OpCode::FindNodeResponse
            | OpCode::FindValueResponse
            | OpCode::StoreResponse => true,
            _ => false,
        }
    }
}

impl Body {
    pub fn opcode(&self) -> OpCode {
        match *self {
            Body::Ping => OpCode::Ping,
            Body::Pong { .. } => OpCode::Pong,
            Body::FindNodeRequest { .. } => OpCode::FindNodeRequest,
            Body::FindNodeResponse { .. } => OpCode::FindNodeResponse,
            Body::FindValueRequest { .. } => OpCode::FindValueRequest,
            Body::FindValueResponse { .. } => OpCode::FindValueResponse,
            Body::StoreRequest { .. } => OpCode::StoreRequest,
            Body::StoreResponse { .. } => OpCode::StoreResponse,
        }
    }

    pub fn is_response(&self) -> bool {
        self.opcode().is_response()
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MESSAGE_LENGTH as u64)
}

/// Encodes `message` as its operation code followed by the bincode payload.
pub fn encode(message: &Message) -> Result<Vec<u8>, DhtError> {
    let mut buffer = vec![message.body.opcode() as u8];
    buffer.extend(codec().serialize(message)?);
    Ok(buffer)
}

/// Decodes a datagram produced by `encode`. The leading operation code must agree with the
/// decoded body.
pub fn decode(buffer: &[u8]) -> Result<Message, DhtError> {
    let (&opcode, payload) = buffer
        .split_first()
        .ok_or_else(|| DhtError::Decode("empty datagram".to_string()))?;
    let opcode = OpCode::from_u8(opcode)
        .ok_or_else(|| DhtError::Decode(format!("unknown operation code {:#04x}", opcode)))?;
    let message: Message = codec().deserialize(payload)?;
    if message.body.opcode() != opcode {
        return Err(DhtError::Decode(format!(
            "operation code {:?} does not match body {:?}",
            opcode,
            message.body.opcode()
        )));
    }
    Ok(message)
}

/// Outgoing half of the network layer.
pub trait Transport: Send + Sync {
    /// Sends `message` to `addr`. Returns `false` if the message was dropped before leaving the
    /// node.
    fn send(&self, addr: SocketAddr, message: &Message) -> bool;

    /// Stops receiving. Called once when the owning node is killed.
    fn close(&self) {}
}

/// A `Transport` over a UDP socket. Received datagrams are decoded on a dedicated thread and
/// forwarded to the node's message handler.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    is_active: Arc<AtomicBool>,
}

impl UdpTransport {
    pub fn bind(addr: &str, tx: Sender<Message>) -> Result<UdpTransport, DhtError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(250)))?;
        let transport = UdpTransport {
            socket: Arc::new(socket),
            is_active: Arc::new(AtomicBool::new(true)),
        };
        let ret = transport.clone();
        thread::spawn(move || {
            let mut buffer = [0u8; MESSAGE_LENGTH];
            while transport.is_active.load(Ordering::Acquire) {
                let (len, src_addr) = match transport.socket.recv_from(&mut buffer) {
                    Ok(received) => received,
                    Err(ref err)
                        if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
                    {
                        continue
                    },
                    Err(err) => {
                        warn!("Protocol: Could not receive data: {}", err);
                        continue;
                    },
                };
                match decode(&buffer[..len]) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            warn!("Protocol: Connection closed.");
                            break;
                        }
                    },
                    Err(err) => warn!("Protocol: Dropping datagram from {}: {}", src_addr, err),
                }
            }
        });
        Ok(ret)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    fn send(&self, addr: SocketAddr, message: &Message) -> bool {
        let buffer = match encode(message) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!("Protocol: Could not encode {:?}: {}", message.body.opcode(), err);
                return false;
            },
        };
        if let Err(err) = self.socket.send_to(&buffer, addr) {
            warn!("Protocol: Could not send data to {}: {}", addr, err);
            return false;
        }
        true
    }

    fn close(&self) {
        self.is_active.store(false, Ordering::Release);
    }
}
