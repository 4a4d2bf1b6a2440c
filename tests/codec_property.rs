use muxtunnel::protocol::{keys, Command, Map, Message, Value};
use muxtunnel::tunnel::FrameDecoder;
use proptest::prelude::*;

fn any_command() -> impl Strategy<Value = Command> {
    prop_oneof![
        Just(Command::Data),
        Just(Command::Suspend),
        Just(Command::Resume),
        Just(Command::Close),
        Just(Command::Open),
        Just(Command::OpenResult),
        Just(Command::Packets),
        Just(Command::FetchConfiguration),
    ]
}

fn field_name() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9-]{0,15}"
        .prop_filter("reserved", |name| name != keys::IDENTIFIER && name != keys::COMMAND)
}

fn any_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        any::<i64>().prop_map(Value::Int),
        ".{0,24}".prop_map(Value::String),
        proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::from),
    ];
    leaf.prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..8).prop_map(Value::List),
            proptest::collection::vec(("[a-zA-Z0-9-]{0,12}", inner), 0..8)
                .prop_map(|fields| Value::Map(fields.into_iter().collect::<Map>())),
        ]
    })
}

fn any_message() -> impl Strategy<Value = Message> {
    (
        any_command(),
        any::<u32>(),
        proptest::collection::vec((field_name(), any_value()), 0..6),
    )
        .prop_map(|(command, connection_id, fields)| Message {
            command,
            connection_id,
            properties: fields.into_iter().collect(),
        })
}

proptest! {
    #[test]
    fn encode_decode_roundtrip(message in any_message()) {
        let frame = message.encode().unwrap();
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        prop_assert_eq!(declared, frame.len());
        prop_assert_eq!(Message::decode(&frame).unwrap(), message);
    }

    #[test]
    fn reserved_property_rejected(
        message in any_message(),
        reserved in prop_oneof![Just(keys::IDENTIFIER), Just(keys::COMMAND)],
        value in any_value(),
    ) {
        let message = message.with(reserved, value);
        prop_assert!(message.encode().is_err());
    }

    #[test]
    fn frames_survive_arbitrary_chunking(
        first in any_message(),
        second in any_message(),
        chunks in proptest::collection::vec(1usize..97, 1..24),
    ) {
        let mut stream = first.encode().unwrap().to_vec();
        stream.extend_from_slice(&second.encode().unwrap());

        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        let mut offset = 0;
        for size in chunks.iter().cycle() {
            if offset == stream.len() {
                break;
            }
            let end = (offset + size).min(stream.len());
            decoder.extend(&stream[offset..end]);
            offset = end;
            while let Some(message) = decoder.decode_next().unwrap() {
                decoded.push(message);
            }
        }

        prop_assert_eq!(decoded, vec![first, second]);
        prop_assert_eq!(decoder.buffered(), 0);
    }
}
