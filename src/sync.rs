use std::{
    collections::HashMap,
    sync::Mutex,
};

use serde::Serialize;
use tokio::sync::broadcast::{channel, Receiver, Sender};

use crate::{
    error::Error,
    events::{Event, StrippedState},
    storage::Storage,
    util::MatrixId,
};

/// Fan-out of accepted events to local subscribers (the sync machinery and
/// anything else that tails a room). Soft-failed events never pass through
/// here; callers only publish what clients may see.
pub struct Notifier {
    channels: Mutex<HashMap<String, Sender<Event>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Notifier { channels: Mutex::new(HashMap::new()) }
    }

    pub fn subscribe(&self, room_id: &str) -> Receiver<Event> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(room_id.to_owned())
            .or_insert_with(|| channel(256).0)
            .subscribe()
    }

    pub fn publish(&self, event: &Event) {
        let room_id = match &event.room_id {
            Some(room_id) => room_id,
            None => return,
        };
        let channels = self.channels.lock().unwrap();
        if let Some(sender) = channels.get(room_id) {
            // a send error just means nobody is listening right now
            let _ = sender.send(event.clone());
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry under `rooms.invite` in a sync response.
#[derive(Clone, Debug, Serialize)]
pub struct InvitedRoom {
    pub invite_state: InviteState,
}

#[derive(Clone, Debug, Serialize)]
pub struct InviteState {
    pub events: Vec<StrippedState>,
}

/// The invited-rooms section of the user's next sync: every room they have a
/// pending invite to, with the stripped state that arrived alongside it.
pub async fn invited_rooms(
    db: &dyn Storage,
    user_id: &MatrixId,
) -> Result<HashMap<String, InvitedRoom>, Error> {
    let invites = db.get_invited_rooms(user_id).await?;
    Ok(invites
        .into_iter()
        .map(|(room_id, events)| {
            (room_id, InvitedRoom { invite_state: InviteState { events } })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe("!r:example.org");
        let event = Event {
            content: json!({"body": "hi"}),
            ty: "m.room.message".to_owned(),
            event_id: "$e".to_owned(),
            room_id: Some("!r:example.org".to_owned()),
            sender: MatrixId::try_from("@alice:example.org").unwrap(),
            origin_server_ts: 0,
            unsigned: None,
            state_key: None,
        };
        notifier.publish(&event);
        assert_eq!(rx.try_recv().unwrap().event_id, "$e");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let notifier = Notifier::new();
        let event = Event {
            content: json!({}),
            ty: "m.room.message".to_owned(),
            event_id: "$e".to_owned(),
            room_id: Some("!quiet:example.org".to_owned()),
            sender: MatrixId::try_from("@alice:example.org").unwrap(),
            origin_server_ts: 0,
            unsigned: None,
            state_key: None,
        };
        notifier.publish(&event);
    }
}
