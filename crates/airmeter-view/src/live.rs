use crate::store::Store;
use airmeter_core::protocol::{decode_reading, ProtocolError};
use airmeter_core::{Cursor, Reading};

/// Folds one pushed reading into the store.
///
/// The first reading seen for a publisher anchors its earliest-known time;
/// later live readings never move it. Every reading is appended to the live
/// window, duplicates included, and replaces the publisher's latest reading.
/// A payload that does not parse leaves the store untouched.
pub fn apply_reading(store: &Store, payload: &str) -> Result<Reading, ProtocolError> {
    let reading = decode_reading(payload)?;
    let publisher = reading.pub_id;

    store.earliest().update(&publisher, |earliest| {
        if earliest.is_some() {
            return false;
        }
        *earliest = Some(reading.read_time);
        true
    });
    store.windows().update(&Cursor::live(publisher), |window| {
        window.get_or_insert_with(Vec::new).push(reading.clone());
        true
    });
    store.latest().set(&publisher, Some(reading.clone()));
    Ok(reading)
}
