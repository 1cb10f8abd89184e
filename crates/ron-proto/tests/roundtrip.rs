//! Property tests: encode-then-decode of wire records is the identity.
use std::collections::BTreeMap;

use proptest::prelude::*;
use ron_proto::{
    from_record, to_record, ClientSnapshot, Command, Filter, Message, Payload, Response,
};

fn arb_filter() -> impl Strategy<Value = Filter> {
    (
        "[a-f0-9-]{0,12}",
        "[a-z0-9-]{0,8}",
        prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{1,6}", 0..3),
    )
        .prop_map(|(uuid, hostname, tags)| Filter {
            uuid,
            hostname,
            tags,
            ..Default::default()
        })
}

fn arb_command() -> impl Strategy<Value = Command> {
    (
        0u64..10_000,
        prop::collection::vec("[a-z/.-]{1,12}", 0..4),
        any::<bool>(),
        any::<bool>(),
        prop::option::of(arb_filter()),
    )
        .prop_map(|(id, exec, background, once, filter)| Command {
            id,
            exec,
            background,
            once,
            filter,
            ..Default::default()
        })
}

fn arb_response() -> impl Strategy<Value = Response> {
    (0u64..10_000, ".{0,32}", ".{0,32}", -1i32..256, any::<bool>()).prop_map(
        |(id, stdout, stderr, exit_code, record_exit_code)| Response {
            id,
            stdout,
            stderr,
            exit_code,
            record_exit_code,
        },
    )
}

proptest! {
    #[test]
    fn command_roundtrip(command in arb_command()) {
        let bytes = to_record(&command).unwrap();
        let decoded: Command = from_record(&bytes).unwrap();
        prop_assert_eq!(decoded, command);
    }

    #[test]
    fn message_roundtrip(commands in prop::collection::vec(arb_command(), 0..4)) {
        let map: BTreeMap<u64, Command> =
            commands.into_iter().map(|c| (c.id, c)).collect();
        let message = Message::new("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa",
            Payload::Commands(map));
        let bytes = to_record(&message).unwrap();
        let decoded: Message = from_record(&bytes).unwrap();
        prop_assert_eq!(decoded, message);
    }

    #[test]
    fn snapshot_with_responses_roundtrip(responses in prop::collection::vec(arb_response(), 0..4)) {
        let mut snapshot = ClientSnapshot::new("aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa");
        snapshot.responses = responses;
        let message = Message::new(snapshot.uuid.clone(), Payload::Client(Box::new(snapshot)));
        let bytes = to_record(&message).unwrap();
        let decoded: Message = from_record(&bytes).unwrap();
        prop_assert_eq!(decoded, message);
    }
}
