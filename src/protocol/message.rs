//! Tunnel messages and the command set

use super::codec;
use super::{Map, ProtocolError, Value, TUNNEL_CONNECTION_ID};
use bytes::Bytes;

/// Field names used on the wire
pub mod keys {
    pub const IDENTIFIER: &str = "identifier";
    pub const COMMAND: &str = "command";
    pub const RESULT_CODE: &str = "result-code";
    pub const FLOW_KIND: &str = "flow-kind";
    pub const HOST: &str = "host";
    pub const PORT: &str = "port";
    pub const CLOSE_TYPE: &str = "close-type";
    pub const PACKETS: &str = "packets";
    pub const PROTOCOLS: &str = "protocols";
    pub const CONFIGURATION: &str = "configuration";
    pub const DATA: &str = "data";
}

/// Tunnel commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Stream bytes (TCP) or one datagram (UDP)
    Data = 1,
    /// Stop reading the source for a connection
    Suspend = 2,
    /// Resume reading the source for a connection
    Resume = 3,
    /// Close one or both directions of a connection
    Close = 4,
    /// Open a new logical connection
    Open = 6,
    /// Outcome of an open request
    OpenResult = 7,
    /// Batch of IP packets
    Packets = 8,
    /// Request or reply carrying the server configuration
    FetchConfiguration = 9,
}

impl TryFrom<i64> for Command {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Command::Data),
            2 => Ok(Command::Suspend),
            3 => Ok(Command::Resume),
            4 => Ok(Command::Close),
            6 => Ok(Command::Open),
            7 => Ok(Command::OpenResult),
            8 => Ok(Command::Packets),
            9 => Ok(Command::FetchConfiguration),
            _ => Err(ProtocolError::UnknownCommand(value)),
        }
    }
}

/// Result of an open request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpenResult {
    Success = 0,
    Invalid = 1,
    Failure = 2,
    Timeout = 3,
}

impl TryFrom<i64> for OpenResult {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OpenResult::Success),
            1 => Ok(OpenResult::Invalid),
            2 => Ok(OpenResult::Failure),
            3 => Ok(OpenResult::Timeout),
            _ => Err(ProtocolError::OutOfRange {
                field: keys::RESULT_CODE,
                value,
            }),
        }
    }
}

/// Direction(s) named by a close command
///
/// `Read` covers the flow from the local source into the tunnel, `Write` the
/// flow from the tunnel into the local sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CloseDirection {
    Read = 0b01,
    Write = 0b10,
    All = 0b11,
}

impl CloseDirection {
    pub fn includes_read(self) -> bool {
        (self as u8) & (CloseDirection::Read as u8) != 0
    }

    pub fn includes_write(self) -> bool {
        (self as u8) & (CloseDirection::Write as u8) != 0
    }

    /// The direction the peer has to close when we close `self`
    pub fn peer(self) -> Self {
        match self {
            CloseDirection::Read => CloseDirection::Write,
            CloseDirection::Write => CloseDirection::Read,
            CloseDirection::All => CloseDirection::All,
        }
    }
}

impl TryFrom<i64> for CloseDirection {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CloseDirection::Read),
            2 => Ok(CloseDirection::Write),
            3 => Ok(CloseDirection::All),
            _ => Err(ProtocolError::OutOfRange {
                field: keys::CLOSE_TYPE,
                value,
            }),
        }
    }
}

/// Kind of flow carried by a logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FlowKind {
    Ip = 1,
    Tcp = 2,
    Udp = 3,
}

impl TryFrom<i64> for FlowKind {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FlowKind::Ip),
            2 => Ok(FlowKind::Tcp),
            3 => Ok(FlowKind::Udp),
            _ => Err(ProtocolError::OutOfRange {
                field: keys::FLOW_KIND,
                value,
            }),
        }
    }
}

/// Parameters of an open request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenRequest {
    Ip,
    Tcp { host: String, port: u16 },
    Udp,
}

impl OpenRequest {
    pub fn kind(&self) -> FlowKind {
        match self {
            OpenRequest::Ip => FlowKind::Ip,
            OpenRequest::Tcp { .. } => FlowKind::Tcp,
            OpenRequest::Udp => FlowKind::Udp,
        }
    }
}

/// Network protocol of a tunneled IP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketProtocol {
    Ipv4 = 4,
    Ipv6 = 6,
}

impl PacketProtocol {
    /// Guess the protocol from the IP version nibble
    pub fn from_packet(packet: &[u8]) -> Option<Self> {
        match packet.first()? >> 4 {
            4 => Some(PacketProtocol::Ipv4),
            6 => Some(PacketProtocol::Ipv6),
            _ => None,
        }
    }
}

impl TryFrom<i64> for PacketProtocol {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(PacketProtocol::Ipv4),
            6 => Ok(PacketProtocol::Ipv6),
            _ => Err(ProtocolError::OutOfRange {
                field: keys::PROTOCOLS,
                value,
            }),
        }
    }
}

/// One IP packet with its protocol tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Bytes,
    pub protocol: PacketProtocol,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, protocol: PacketProtocol) -> Self {
        Self {
            data: data.into(),
            protocol,
        }
    }
}

/// One UDP datagram with its remote address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Bytes,
    pub host: String,
    pub port: u16,
}

/// A decoded tunnel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Command kind
    pub command: Command,
    /// Logical connection (0 for tunnel-scoped commands)
    pub connection_id: u32,
    /// Command-specific fields
    pub properties: Map,
}

impl Message {
    pub fn new(command: Command, connection_id: u32) -> Self {
        Self {
            command,
            connection_id,
            properties: Map::new(),
        }
    }

    /// Attach a property
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key, value);
        self
    }

    pub fn open(connection_id: u32, request: &OpenRequest) -> Self {
        let message = Self::new(Command::Open, connection_id)
            .with(keys::FLOW_KIND, request.kind() as u8);
        match request {
            OpenRequest::Tcp { host, port } => message
                .with(keys::HOST, host.as_str())
                .with(keys::PORT, *port),
            OpenRequest::Ip | OpenRequest::Udp => message,
        }
    }

    pub fn open_result(
        connection_id: u32,
        result: OpenResult,
        configuration: Option<Map>,
    ) -> Self {
        let message =
            Self::new(Command::OpenResult, connection_id).with(keys::RESULT_CODE, result as u8);
        match configuration {
            Some(configuration) => message.with(keys::CONFIGURATION, configuration),
            None => message,
        }
    }

    pub fn data(connection_id: u32, data: Bytes) -> Self {
        Self::new(Command::Data, connection_id).with(keys::DATA, data)
    }

    pub fn datagram(connection_id: u32, datagram: &Datagram) -> Self {
        Self::data(connection_id, datagram.data.clone())
            .with(keys::HOST, datagram.host.as_str())
            .with(keys::PORT, datagram.port)
    }

    pub fn packets(connection_id: u32, packets: &[Packet]) -> Self {
        let data: Vec<Value> = packets.iter().map(|p| Value::Bytes(p.data.clone())).collect();
        let protocols: Vec<Value> = packets
            .iter()
            .map(|p| Value::Int(p.protocol as i64))
            .collect();
        Self::new(Command::Packets, connection_id)
            .with(keys::PACKETS, data)
            .with(keys::PROTOCOLS, protocols)
    }

    pub fn close(connection_id: u32, direction: CloseDirection) -> Self {
        Self::new(Command::Close, connection_id).with(keys::CLOSE_TYPE, direction as u8)
    }

    pub fn suspend(connection_id: u32) -> Self {
        Self::new(Command::Suspend, connection_id)
    }

    pub fn resume(connection_id: u32) -> Self {
        Self::new(Command::Resume, connection_id)
    }

    /// A configuration request (no payload) or reply (with payload)
    pub fn fetch_configuration(configuration: Option<Map>) -> Self {
        let message = Self::new(Command::FetchConfiguration, TUNNEL_CONNECTION_ID);
        match configuration {
            Some(configuration) => message.with(keys::CONFIGURATION, configuration),
            None => message,
        }
    }

    /// Encode into a complete frame
    ///
    /// `identifier` and `command` come from the message itself; a property
    /// under either name is an error.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut fields = Map::with_capacity(self.properties.len() + 2);
        fields.insert(keys::IDENTIFIER, self.connection_id);
        fields.insert(keys::COMMAND, self.command as u8);
        for (key, value) in self.properties.iter() {
            if key == keys::IDENTIFIER || key == keys::COMMAND {
                return Err(ProtocolError::Malformed(format!(
                    "reserved field {} in properties",
                    key
                )));
            }
            fields.insert(key, value.clone());
        }
        codec::encode_frame(&fields)
    }

    /// Decode a complete frame
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_fields(codec::decode_frame(frame)?)
    }

    /// Decode the payload that follows a length prefix
    pub fn decode_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_fields(codec::decode_payload(payload)?)
    }

    fn from_fields(mut properties: Map) -> Result<Self, ProtocolError> {
        let connection_id = match properties.remove(keys::IDENTIFIER) {
            Some(Value::Int(id)) => u32::try_from(id).map_err(|_| ProtocolError::OutOfRange {
                field: keys::IDENTIFIER,
                value: id,
            })?,
            Some(_) => return Err(unexpected(keys::IDENTIFIER, "int")),
            None => return Err(ProtocolError::MissingField(keys::IDENTIFIER)),
        };
        let command = match properties.remove(keys::COMMAND) {
            Some(Value::Int(code)) => Command::try_from(code)?,
            Some(_) => return Err(unexpected(keys::COMMAND, "int")),
            None => return Err(ProtocolError::MissingField(keys::COMMAND)),
        };
        Ok(Self {
            command,
            connection_id,
            properties,
        })
    }

    fn int(&self, key: &'static str) -> Result<i64, ProtocolError> {
        match self.properties.get(key) {
            Some(Value::Int(v)) => Ok(*v),
            Some(_) => Err(unexpected(key, "int")),
            None => Err(ProtocolError::MissingField(key)),
        }
    }

    fn port(&self) -> Result<u16, ProtocolError> {
        let port = self.int(keys::PORT)?;
        u16::try_from(port).map_err(|_| ProtocolError::OutOfRange {
            field: keys::PORT,
            value: port,
        })
    }

    fn host(&self) -> Result<String, ProtocolError> {
        match self.properties.get(keys::HOST) {
            Some(Value::String(host)) if !host.is_empty() => Ok(host.clone()),
            Some(Value::String(_)) => Err(ProtocolError::Malformed("empty host".to_string())),
            Some(_) => Err(unexpected(keys::HOST, "string")),
            None => Err(ProtocolError::MissingField(keys::HOST)),
        }
    }

    /// Parameters of an `open` command
    pub fn open_request(&self) -> Result<OpenRequest, ProtocolError> {
        match FlowKind::try_from(self.int(keys::FLOW_KIND)?)? {
            FlowKind::Ip => Ok(OpenRequest::Ip),
            FlowKind::Udp => Ok(OpenRequest::Udp),
            FlowKind::Tcp => Ok(OpenRequest::Tcp {
                host: self.host()?,
                port: self.port()?,
            }),
        }
    }

    pub fn result_code(&self) -> Result<OpenResult, ProtocolError> {
        OpenResult::try_from(self.int(keys::RESULT_CODE)?)
    }

    pub fn close_direction(&self) -> Result<CloseDirection, ProtocolError> {
        CloseDirection::try_from(self.int(keys::CLOSE_TYPE)?)
    }

    pub fn configuration(&self) -> Option<&Map> {
        self.properties.get_map(keys::CONFIGURATION)
    }

    /// Payload of a `data` command
    pub fn payload(&self) -> Result<Bytes, ProtocolError> {
        match self.properties.get(keys::DATA) {
            Some(Value::Bytes(data)) => Ok(data.clone()),
            Some(_) => Err(unexpected(keys::DATA, "bytes")),
            None => Err(ProtocolError::MissingField(keys::DATA)),
        }
    }

    /// Payload and address of a UDP `data` command
    pub fn datagram_payload(&self) -> Result<Datagram, ProtocolError> {
        Ok(Datagram {
            data: self.payload()?,
            host: self.host()?,
            port: self.port()?,
        })
    }

    /// Packets of a `packets` command
    pub fn packet_list(&self) -> Result<Vec<Packet>, ProtocolError> {
        let data = self
            .properties
            .get_list(keys::PACKETS)
            .ok_or(ProtocolError::MissingField(keys::PACKETS))?;
        let protocols = self
            .properties
            .get_list(keys::PROTOCOLS)
            .ok_or(ProtocolError::MissingField(keys::PROTOCOLS))?;
        if data.len() != protocols.len() {
            return Err(ProtocolError::Malformed(format!(
                "{} packets but {} protocols",
                data.len(),
                protocols.len()
            )));
        }

        data.iter()
            .zip(protocols)
            .map(|(packet, protocol)| {
                let data = packet
                    .as_bytes()
                    .ok_or_else(|| unexpected(keys::PACKETS, "bytes"))?;
                let protocol = protocol
                    .as_int()
                    .ok_or_else(|| unexpected(keys::PROTOCOLS, "int"))?;
                Ok(Packet::new(data.clone(), PacketProtocol::try_from(protocol)?))
            })
            .collect()
    }
}

fn unexpected(field: &'static str, expected: &'static str) -> ProtocolError {
    ProtocolError::UnexpectedType { field, expected }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encode_decode() {
        let messages = vec![
            Message::open(3, &OpenRequest::Tcp {
                host: "example.com".to_string(),
                port: 443,
            }),
            Message::open(4, &OpenRequest::Ip),
            Message::open_result(
                4,
                OpenResult::Success,
                Some(Map::new().with("IPv4", Map::new().with("Address", "10.0.0.2"))),
            ),
            Message::data(3, Bytes::from_static(b"hello")),
            Message::close(3, CloseDirection::Write),
            Message::suspend(3),
            Message::fetch_configuration(None),
        ];

        for message in messages {
            let frame = message.encode().unwrap();
            assert_eq!(Message::decode(&frame).unwrap(), message);
        }
    }

    #[test]
    fn test_reserved_property_not_encoded() {
        let message = Message::new(Command::Data, 1)
            .with(keys::DATA, Bytes::from_static(b"x"))
            .with(keys::COMMAND, 5i64);
        assert!(matches!(
            message.encode(),
            Err(ProtocolError::Malformed(_))
        ));

        let message = Message::suspend(2).with(keys::IDENTIFIER, 3u32);
        assert!(matches!(
            message.encode(),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_open_request_parsing() {
        let message = Message::open(9, &OpenRequest::Tcp {
            host: "10.1.1.1".to_string(),
            port: 8080,
        });
        assert_eq!(
            message.open_request().unwrap(),
            OpenRequest::Tcp {
                host: "10.1.1.1".to_string(),
                port: 8080
            }
        );

        let missing_host = Message::new(Command::Open, 9)
            .with(keys::FLOW_KIND, FlowKind::Tcp as u8)
            .with(keys::PORT, 80u16);
        assert_eq!(
            missing_host.open_request(),
            Err(ProtocolError::MissingField(keys::HOST))
        );

        let bad_port = Message::new(Command::Open, 9)
            .with(keys::FLOW_KIND, FlowKind::Tcp as u8)
            .with(keys::HOST, "h")
            .with(keys::PORT, 70000i64);
        assert!(matches!(
            bad_port.open_request(),
            Err(ProtocolError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_packets_round_trip() {
        let packets = vec![
            Packet::new(Bytes::from_static(&[0x45, 0x00]), PacketProtocol::Ipv4),
            Packet::new(Bytes::from_static(&[0x60, 0x00]), PacketProtocol::Ipv6),
        ];
        let message = Message::packets(1, &packets);
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded.packet_list().unwrap(), packets);
    }

    #[test]
    fn test_packets_length_mismatch() {
        let message = Message::new(Command::Packets, 1)
            .with(keys::PACKETS, vec![Value::Bytes(Bytes::from_static(b"x"))])
            .with(keys::PROTOCOLS, Vec::<Value>::new());
        assert!(matches!(
            message.packet_list(),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_command_rejected() {
        let frame = codec::encode_frame(&Map::new().with(keys::IDENTIFIER, 1u32)).unwrap();
        assert_eq!(
            Message::decode(&frame),
            Err(ProtocolError::MissingField(keys::COMMAND))
        );

        let frame = codec::encode_frame(
            &Map::new()
                .with(keys::IDENTIFIER, 1u32)
                .with(keys::COMMAND, 42i64),
        )
        .unwrap();
        assert_eq!(
            Message::decode(&frame),
            Err(ProtocolError::UnknownCommand(42))
        );
    }

    #[test]
    fn test_close_direction_peer() {
        assert_eq!(CloseDirection::Read.peer(), CloseDirection::Write);
        assert_eq!(CloseDirection::Write.peer(), CloseDirection::Read);
        assert_eq!(CloseDirection::All.peer(), CloseDirection::All);
        assert!(CloseDirection::All.includes_read());
        assert!(CloseDirection::All.includes_write());
        assert!(!CloseDirection::Read.includes_write());
    }

    #[test]
    fn test_protocol_from_packet() {
        assert_eq!(
            PacketProtocol::from_packet(&[0x45, 0x00]),
            Some(PacketProtocol::Ipv4)
        );
        assert_eq!(
            PacketProtocol::from_packet(&[0x60]),
            Some(PacketProtocol::Ipv6)
        );
        assert_eq!(PacketProtocol::from_packet(&[]), None);
    }
}
