//! Property tests for the Smoothieware line protocol helpers

use motionkit_communication::communication::serial::{strip_ack, ACK};
use motionkit_communication::firmware::smoothie::command_builder::round_to;
use motionkit_communication::firmware::smoothie::response_parser::parse_position;
use motionkit_communication::ControllerReply;
use motionkit_core::Axis;
use proptest::prelude::*;

proptest! {
    #[test]
    fn ack_splits_off_the_reply(reply in "[A-Za-z0-9:. ]{0,40}") {
        let raw = format!("{}\r\n{}", reply, ACK);
        prop_assert_eq!(strip_ack(&raw), Some(reply.trim().to_string()));
        prop_assert_eq!(strip_ack(&reply), None);
    }

    #[test]
    fn alarm_always_wins(prefix in "[a-z ]{0,10}", suffix in "[a-z ]{0,10}") {
        let text = format!("{}error ALARM{}", prefix, suffix);
        prop_assert!(matches!(ControllerReply::classify(&text), ControllerReply::Alarm(_)));
    }

    #[test]
    fn position_reply_parses_to_rounded_values(values in prop::array::uniform6(-500.0f64..500.0)) {
        let words: Vec<String> = Axis::ALL
            .iter()
            .zip(values.iter())
            .map(|(axis, value)| format!("{}:{:.4}", axis, value))
            .collect();
        let reply = format!("ok MCS: {}", words.join(" "));
        let parsed = parse_position(&reply).unwrap();
        for (axis, value) in Axis::ALL.iter().zip(values.iter()) {
            let expected = round_to(format!("{:.4}", value).parse().unwrap(), 3);
            prop_assert_eq!(parsed[axis], expected);
        }
    }
}
