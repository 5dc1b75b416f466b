#[macro_use]
extern crate afl;
use keyverify::{
    EVENT_TYPE_ACCEPT, EVENT_TYPE_CANCEL, EVENT_TYPE_DONE, EVENT_TYPE_KEY, EVENT_TYPE_MAC, EVENT_TYPE_READY,
    EVENT_TYPE_REQUEST, EVENT_TYPE_ROOM_MESSAGE, EVENT_TYPE_START, InboundEvent,
};

const EVENT_TYPES: [&str; 9] = [
    EVENT_TYPE_REQUEST,
    EVENT_TYPE_READY,
    EVENT_TYPE_START,
    EVENT_TYPE_ACCEPT,
    EVENT_TYPE_KEY,
    EVENT_TYPE_MAC,
    EVENT_TYPE_CANCEL,
    EVENT_TYPE_DONE,
    EVENT_TYPE_ROOM_MESSAGE,
];

fn main() {
    fuzz!(|data: &[u8]| {
        // First byte picks the event type and the delivery path.
        let Some((selector, body)) = data.split_first() else {
            return;
        };
        let Ok(content) = serde_json::from_slice(body) else {
            return;
        };

        let event_type = EVENT_TYPES[*selector as usize % EVENT_TYPES.len()];
        let event = if selector & 0x80 == 0 {
            InboundEvent::to_device("@fuzz:example.org", event_type, content)
        } else {
            InboundEvent::in_room("@fuzz:example.org", "!fuzz:example.org", "$fuzz", event_type, content)
        };

        let _ = event.raw_transaction_id();
        let _ = event.parse();
    });
}
