use crate::store::Store;
use airmeter_core::protocol::{decode_message, ProtocolError};
use airmeter_core::Message;

/// Appends a `/msg` or `/err` frame to the active log.
pub fn append_message(store: &Store, frame: &str) -> Result<Message, ProtocolError> {
    let message = decode_message(frame)?;
    store.messages().update(|log| {
        log.entries.push(message.clone());
        true
    });
    Ok(message)
}

/// Moves the active log, in order, to the end of the archive and returns how
/// many messages moved. The archive is extended while the active log is
/// still locked, so a reader holding the log never sees the moved messages
/// missing from both.
pub fn archive(store: &Store) -> usize {
    let mut moved = 0;
    store.messages().update(|log| {
        if log.entries.is_empty() {
            return false;
        }
        let entries = std::mem::take(&mut log.entries);
        moved = entries.len();
        log.archived += moved;
        store.archive().update(|archive| {
            archive.extend(entries);
            true
        });
        true
    });
    moved
}
