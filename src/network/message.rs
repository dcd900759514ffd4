// Wire protocol: message framing and payload codecs.
//
// A frame is magic ‖ command(12, NUL-padded ASCII) ‖ payload-length(4 LE) ‖
// checksum(first 4 bytes of sha256d(payload)) ‖ payload. Every codec is
// byte-exact: decoding an encoded message reproduces it bit for bit.

use crate::core::serialize::{
    read_bytes, read_i32_le, read_i64_le, read_u32_le, read_u64_le, read_u8, read_hash,
    read_var_string, read_varint, write_var_string, write_varint, CodecError, Serializable,
};
use crate::core::{
    decode_header_entry, encode_header_entry, sha256d, Block, BlockHeader, Hash256, Transaction,
};
use std::io::Cursor;

/// Frame header length on the wire
pub const FRAME_HEADER_SIZE: usize = 24;

/// Upper bound on a single payload; larger frames disconnect the peer
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Most inventory entries allowed in one message
pub const MAX_INV_ENTRIES: usize = 50_000;

/// Most headers returned for one `getheaders`
pub const MAX_HEADERS_PER_MSG: usize = 2_000;

// Reject codes
pub const REJECT_MALFORMED: u8 = 0x01;
pub const REJECT_INVALID: u8 = 0x10;
pub const REJECT_DUPLICATE: u8 = 0x12;

/// What an inventory entry announces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvType {
    Tx,
    Block,
}

impl InvType {
    fn to_wire(self) -> u32 {
        match self {
            InvType::Tx => 1,
            InvType::Block => 2,
        }
    }

    fn from_wire(value: u32, offset: u64) -> Result<Self, CodecError> {
        match value {
            1 => Ok(InvType::Tx),
            2 => Ok(InvType::Block),
            other => Err(CodecError::malformed(
                offset,
                format!("unknown inventory type {other}"),
            )),
        }
    }
}

/// One announced or requested item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inventory {
    pub kind: InvType,
    pub hash: Hash256,
}

impl Inventory {
    pub fn block(hash: Hash256) -> Self {
        Self {
            kind: InvType::Block,
            hash,
        }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self {
            kind: InvType::Tx,
            hash,
        }
    }
}

/// Network endpoint as carried inside a `version` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress {
    pub services: u64,
    /// IPv6, or an IPv4-mapped address
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn unroutable() -> Self {
        Self {
            services: 0,
            ip: [0; 16],
            port: 0,
        }
    }

    pub fn from_socket_addr(addr: std::net::SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            std::net::IpAddr::V6(v6) => v6.octets(),
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.services.to_le_bytes());
        buf.extend_from_slice(&self.ip);
        buf.extend_from_slice(&self.port.to_be_bytes());
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let services = read_u64_le(cur)?;
        let ip: [u8; 16] = read_bytes(cur)?;
        let port_bytes: [u8; 2] = read_bytes(cur)?;
        Ok(Self {
            services,
            ip,
            port: u16::from_be_bytes(port_bytes),
        })
    }
}

/// Service bit: the peer serves witness data
pub const SERVICE_WITNESS: u64 = 1 << 3;

/// Handshake announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    pub fn new(
        protocol_version: u32,
        addr_recv: NetAddress,
        start_height: u32,
        timestamp: i64,
    ) -> Self {
        Self {
            version: protocol_version,
            services: SERVICE_WITNESS,
            timestamp,
            addr_recv,
            addr_from: NetAddress::unroutable(),
            nonce: rand::random(),
            user_agent: concat!("/crown-core:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            start_height: start_height as i32,
            relay: true,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.services.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        self.addr_recv.encode(buf);
        self.addr_from.encode(buf);
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        write_var_string(buf, &self.user_agent);
        buf.extend_from_slice(&self.start_height.to_le_bytes());
        buf.push(self.relay as u8);
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        Ok(Self {
            version: read_u32_le(cur)?,
            services: read_u64_le(cur)?,
            timestamp: read_i64_le(cur)?,
            addr_recv: NetAddress::decode(cur)?,
            addr_from: NetAddress::decode(cur)?,
            nonce: read_u64_le(cur)?,
            user_agent: read_var_string(cur)?,
            start_height: read_i32_le(cur)?,
            relay: read_u8(cur)? != 0,
        })
    }
}

/// Locator-based header request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub locator: Vec<Hash256>,
    /// Zero hash requests as many as the peer will give
    pub stop: Hash256,
}

impl GetHeadersMessage {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_varint(buf, self.locator.len() as u64);
        for hash in &self.locator {
            buf.extend_from_slice(hash.as_bytes());
        }
        buf.extend_from_slice(self.stop.as_bytes());
    }

    fn decode(cur: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        let version = read_u32_le(cur)?;
        let offset = cur.position();
        let count = read_varint(cur)?;
        if count > 2_000 {
            return Err(CodecError::malformed(offset, "oversized locator"));
        }
        let mut locator = Vec::with_capacity(count as usize);
        for _ in 0..count {
            locator.push(read_hash(cur)?);
        }
        let stop = read_hash(cur)?;
        Ok(Self {
            version,
            locator,
            stop,
        })
    }
}

/// Why a peer rejected something we sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    /// Command being rejected
    pub message: String,
    pub code: u8,
    pub reason: String,
    /// Hash of the offending object, when the command has one
    pub data: Option<Hash256>,
}

impl RejectMessage {
    fn encode(&self, buf: &mut Vec<u8>) {
        write_var_string(buf, &self.message);
        buf.push(self.code);
        write_var_string(buf, &self.reason);
        if let Some(hash) = &self.data {
            buf.extend_from_slice(hash.as_bytes());
        }
    }

    fn decode(cur: &mut Cursor<&[u8]>, payload_len: u64) -> Result<Self, CodecError> {
        let message = read_var_string(cur)?;
        let code = read_u8(cur)?;
        let reason = read_var_string(cur)?;
        let data = if payload_len - cur.position() >= 32 {
            Some(read_hash(cur)?)
        } else {
            None
        };
        Ok(Self {
            message,
            code,
            reason,
            data,
        })
    }
}

/// A fully decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    GetHeaders(GetHeadersMessage),
    Headers(Vec<BlockHeader>),
    Block(Block),
    Tx(Transaction),
    Mempool,
    Reject(RejectMessage),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetHeaders(_) => "getheaders",
            Message::Headers(_) => "headers",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::Mempool => "mempool",
            Message::Reject(_) => "reject",
        }
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            Message::Version(version) => version.encode(buf),
            Message::Verack | Message::Mempool => {}
            Message::Ping(nonce) | Message::Pong(nonce) => {
                buf.extend_from_slice(&nonce.to_le_bytes())
            }
            Message::Inv(items) | Message::GetData(items) | Message::NotFound(items) => {
                write_varint(buf, items.len() as u64);
                for item in items {
                    buf.extend_from_slice(&item.kind.to_wire().to_le_bytes());
                    buf.extend_from_slice(item.hash.as_bytes());
                }
            }
            Message::GetHeaders(request) => request.encode(buf),
            Message::Headers(headers) => {
                write_varint(buf, headers.len() as u64);
                for header in headers {
                    encode_header_entry(buf, header);
                }
            }
            Message::Block(block) => block.encode(buf),
            Message::Tx(tx) => tx.encode(buf),
            Message::Reject(reject) => reject.encode(buf),
        }
    }

    fn decode_payload(command: &str, payload: &[u8]) -> Result<Message, CodecError> {
        let mut cur = Cursor::new(payload);
        let message = match command {
            "version" => Message::Version(VersionMessage::decode(&mut cur)?),
            "verack" => Message::Verack,
            "ping" => Message::Ping(read_u64_le(&mut cur)?),
            "pong" => Message::Pong(read_u64_le(&mut cur)?),
            "inv" => Message::Inv(decode_inventory(&mut cur)?),
            "getdata" => Message::GetData(decode_inventory(&mut cur)?),
            "notfound" => Message::NotFound(decode_inventory(&mut cur)?),
            "getheaders" => Message::GetHeaders(GetHeadersMessage::decode(&mut cur)?),
            "headers" => {
                let offset = cur.position();
                let count = read_varint(&mut cur)?;
                if count as usize > MAX_HEADERS_PER_MSG {
                    return Err(CodecError::malformed(offset, "too many headers"));
                }
                let mut headers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    headers.push(decode_header_entry(&mut cur)?);
                }
                Message::Headers(headers)
            }
            "block" => Message::Block(Block::decode(&mut cur)?),
            "tx" => Message::Tx(Transaction::decode(&mut cur)?),
            "mempool" => Message::Mempool,
            "reject" => Message::Reject(RejectMessage::decode(&mut cur, payload.len() as u64)?),
            other => {
                return Err(CodecError::malformed(0, format!("unknown command {other:?}")))
            }
        };
        if cur.position() != payload.len() as u64 {
            return Err(CodecError::malformed(
                cur.position(),
                "trailing bytes after payload",
            ));
        }
        Ok(message)
    }

    /// Serialize into a complete wire frame for the given network
    pub fn to_frame(&self, magic: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        self.encode_payload(&mut payload);

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&magic.to_le_bytes());
        let mut command = [0u8; 12];
        command[..self.command().len()].copy_from_slice(self.command().as_bytes());
        frame.extend_from_slice(&command);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload_checksum(&payload));
        frame.extend_from_slice(&payload);
        frame
    }
}

fn decode_inventory(cur: &mut Cursor<&[u8]>) -> Result<Vec<Inventory>, CodecError> {
    let offset = cur.position();
    let count = read_varint(cur)?;
    if count as usize > MAX_INV_ENTRIES {
        return Err(CodecError::malformed(offset, "too many inventory entries"));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset = cur.position();
        let kind = InvType::from_wire(read_u32_le(cur)?, offset)?;
        let hash = read_hash(cur)?;
        items.push(Inventory { kind, hash });
    }
    Ok(items)
}

/// First four bytes of sha256d over the payload
pub fn payload_checksum(payload: &[u8]) -> [u8; 4] {
    let digest = sha256d(payload);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&digest.as_bytes()[..4]);
    checksum
}

/// Parsed frame header, read ahead of its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    command: [u8; 12],
    pub payload_len: u32,
    pub checksum: [u8; 4],
}

impl FrameHeader {
    pub fn decode(bytes: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(bytes.as_slice());
        let magic = read_u32_le(&mut cur)?;
        let command: [u8; 12] = read_bytes(&mut cur)?;
        let payload_len = read_u32_le(&mut cur)?;
        let checksum: [u8; 4] = read_bytes(&mut cur)?;
        Ok(Self {
            magic,
            command,
            payload_len,
            checksum,
        })
    }

    pub fn command_str(&self) -> Result<&str, CodecError> {
        let end = self
            .command
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.command.len());
        // Everything after the first NUL must be NUL too
        if self.command[end..].iter().any(|b| *b != 0) {
            return Err(CodecError::malformed(4, "garbage after command name"));
        }
        std::str::from_utf8(&self.command[..end])
            .map_err(|_| CodecError::malformed(4, "command is not ascii"))
    }

    /// Validate the header against the expected network magic and size cap
    pub fn validate(&self, expected_magic: u32) -> Result<(), CodecError> {
        if self.magic != expected_magic {
            return Err(CodecError::malformed(0, "wrong network magic"));
        }
        if self.payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(CodecError::malformed(16, "oversized payload"));
        }
        Ok(())
    }

    /// Decode the payload this header announced, verifying its checksum
    pub fn decode_payload(&self, payload: &[u8]) -> Result<Message, CodecError> {
        if payload.len() != self.payload_len as usize {
            return Err(CodecError::UnexpectedEof {
                offset: payload.len() as u64,
            });
        }
        if payload_checksum(payload) != self.checksum {
            return Err(CodecError::malformed(20, "bad payload checksum"));
        }
        Message::decode_payload(self.command_str()?, payload)
    }
}

/// Decode one complete frame (header and payload in one buffer)
pub fn decode_frame(data: &[u8], expected_magic: u32) -> Result<Message, CodecError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(CodecError::UnexpectedEof {
            offset: data.len() as u64,
        });
    }
    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..FRAME_HEADER_SIZE]);
    let header = FrameHeader::decode(&header_bytes)?;
    header.validate(expected_magic)?;
    header.decode_payload(&data[FRAME_HEADER_SIZE..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::NetworkParams;
    use crate::core::{Coin, OutPoint, TxInput, TxOutput};

    const MAGIC: u32 = 0xdab5_bffa;

    fn round_trip(message: Message) {
        let frame = message.to_frame(MAGIC);
        let decoded = decode_frame(&frame, MAGIC).unwrap();
        assert_eq!(decoded, message);
        // Re-encoding reproduces the frame bit for bit
        assert_eq!(decoded.to_frame(MAGIC), frame);
    }

    #[test]
    fn test_round_trip_handshake() {
        let version = VersionMessage::new(
            70_015,
            NetAddress::from_socket_addr("127.0.0.1:18444".parse().unwrap(), 0),
            42,
            1_700_000_000,
        );
        round_trip(Message::Version(version));
        round_trip(Message::Verack);
    }

    #[test]
    fn test_round_trip_ping_pong() {
        round_trip(Message::Ping(0xdead_beef_0123));
        round_trip(Message::Pong(0));
    }

    #[test]
    fn test_round_trip_inventory() {
        let items = vec![
            Inventory::block(Hash256::new([1; 32])),
            Inventory::tx(Hash256::new([2; 32])),
        ];
        round_trip(Message::Inv(items.clone()));
        round_trip(Message::GetData(items.clone()));
        round_trip(Message::NotFound(items));
    }

    #[test]
    fn test_round_trip_getheaders_and_headers() {
        round_trip(Message::GetHeaders(GetHeadersMessage {
            version: 70_015,
            locator: vec![Hash256::new([3; 32]), Hash256::new([4; 32])],
            stop: Hash256::zero(),
        }));
        let genesis = NetworkParams::regtest().genesis_block();
        round_trip(Message::Headers(vec![genesis.header]));
        round_trip(Message::Headers(vec![]));
    }

    #[test]
    fn test_round_trip_block_and_tx() {
        let genesis = NetworkParams::regtest().genesis_block();
        round_trip(Message::Block(genesis));

        let mut tx = Transaction::new(
            vec![TxInput::new(OutPoint::new(Hash256::new([5; 32]), 1), vec![0x51])],
            vec![TxOutput::new(Coin::from_sat(1234), vec![0x52])],
        );
        tx.inputs[0].witness = vec![vec![0xaa; 71], vec![0xbb; 33]];
        round_trip(Message::Tx(tx));
    }

    #[test]
    fn test_round_trip_reject() {
        round_trip(Message::Reject(RejectMessage {
            message: "block".into(),
            code: REJECT_INVALID,
            reason: "bad-pow".into(),
            data: Some(Hash256::new([6; 32])),
        }));
        round_trip(Message::Reject(RejectMessage {
            message: "mempool".into(),
            code: REJECT_MALFORMED,
            reason: "".into(),
            data: None,
        }));
        round_trip(Message::Mempool);
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let frame = Message::Verack.to_frame(MAGIC);
        assert!(decode_frame(&frame, MAGIC + 1).is_err());
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let mut frame = Message::Ping(7).to_frame(MAGIC);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(decode_frame(&frame, MAGIC).is_err());
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut frame = Message::Verack.to_frame(MAGIC);
        frame[4..8].copy_from_slice(b"zzzz");
        assert!(decode_frame(&frame, MAGIC).is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        // A ping payload with extra bytes, checksum recomputed to match
        let mut payload = 7u64.to_le_bytes().to_vec();
        payload.push(0x00);
        let mut frame = Vec::new();
        frame.extend_from_slice(&MAGIC.to_le_bytes());
        let mut command = [0u8; 12];
        command[..4].copy_from_slice(b"ping");
        frame.extend_from_slice(&command);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload_checksum(&payload));
        frame.extend_from_slice(&payload);
        assert!(decode_frame(&frame, MAGIC).is_err());
    }
}
