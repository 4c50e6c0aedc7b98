use crate::store::Store;
use airmeter_core::protocol::{decode_roster, ProtocolError};
use airmeter_core::PublisherId;

/// Replaces the roster with the list the relay sent. The relay always sends
/// the full roster, so nothing is merged.
pub fn apply_roster(store: &Store, payload: &str) -> Result<Vec<PublisherId>, ProtocolError> {
    let roster = decode_roster(payload)?;
    store.roster().set(roster.clone());
    Ok(roster)
}
