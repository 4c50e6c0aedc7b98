use crate::router::CommandRouter;
use crate::store::Store;
use crate::{live, messages, roster};
use airmeter_core::protocol::{split_frame, Command};
use std::sync::Arc;
use tracing::{debug, warn};

/// Wires the roster, reading and message handlers into `router`.
pub fn install(router: &mut CommandRouter, store: Arc<Store>) {
    let roster_store = Arc::clone(&store);
    router.on(Command::RosterList, move |frame: &str| {
        let (_, payload) = split_frame(frame);
        match roster::apply_roster(&roster_store, payload) {
            Ok(roster) => debug!("roster_updated: {} publishers", roster.len()),
            Err(err) => warn!("roster_parse_error: {err}"),
        }
    });

    let reading_store = Arc::clone(&store);
    router.on(Command::Reading, move |frame: &str| {
        let (_, payload) = split_frame(frame);
        if let Err(err) = live::apply_reading(&reading_store, payload) {
            warn!("reading_parse_error: {err}");
        }
    });

    for command in [Command::OutboundMessage, Command::ErrorMessage] {
        let message_store = Arc::clone(&store);
        router.on(command, move |frame: &str| {
            if let Err(err) = messages::append_message(&message_store, frame) {
                warn!("message_parse_error: {err}");
            }
        });
    }
}
