use serde_json::{json, Value as JsonValue};

use crate::{
    error::Error,
    events::{
        room::{Member, Membership, Name, PowerLevels},
        room_version::UnhashedPdu,
        StoredPdu, VersionedPdu,
    },
    storage::{mem::MemStorageManager, Storage, StorageManager},
    util::{
        storage::{calc_auth_events, NewEvent},
        MatrixId,
    },
    validate::auth::auth_check,
};

use super::StateResolver;

struct TestRoom<'db> {
    db: &'db dyn Storage,
    room_id: String,
    /// depth -> list of events at that depth
    depth_map: Vec<Vec<String>>,
    ts: i64,
}

impl<'db> TestRoom<'db> {
    /// must only be called once per test per room id
    async fn create(
        db: &'db dyn Storage,
        room_id: &str,
        creator: &MatrixId,
    ) -> Result<TestRoom<'db>, Error> {
        let creation = UnhashedPdu {
            room_id: room_id.to_owned(),
            sender: creator.clone(),
            origin_server_ts: 0,
            ty: "m.room.create".to_owned(),
            state_key: Some(String::new()),
            content: json!({"room_version": "11"}),
            prev_events: Vec::new(),
            depth: 0,
            auth_events: Vec::new(),
            unsigned: None,
        }
        .finalize()
        .map_err(crate::error::ErrorKind::from)?;
        let stored = StoredPdu::accepted(VersionedPdu::V11(creation))?;
        db.add_pdus(&[stored.clone()]).await?;
        Ok(TestRoom {
            db,
            room_id: room_id.to_owned(),
            depth_map: vec![vec![stored.event_id().to_owned()]],
            ts: 1,
        })
    }

    /// Adds an event at an explicit depth, which you usually don't want, but
    /// is exactly what forks need.
    async fn add(
        &mut self,
        depth: usize,
        sender: &MatrixId,
        ty: &str,
        state_key: Option<&str>,
        content: JsonValue,
        resolver: &StateResolver,
    ) -> Result<String, Error> {
        let prev_events = self.depth_map[depth - 1].clone();
        let state = resolver.resolve(&self.room_id, &prev_events).await?;

        let new_event = NewEvent {
            ty: ty.to_owned(),
            content: content.clone(),
            sender: sender.clone(),
            state_key: state_key.map(String::from),
            unsigned: None,
        };
        let auth_events = calc_auth_events(&new_event, &state);

        self.ts += 1;
        let pdu = VersionedPdu::V11(
            UnhashedPdu {
                room_id: self.room_id.clone(),
                sender: sender.clone(),
                origin_server_ts: self.ts,
                ty: ty.to_owned(),
                state_key: state_key.map(String::from),
                content,
                prev_events,
                depth: depth as i64,
                auth_events,
                unsigned: None,
            }
            .finalize()
            .map_err(crate::error::ErrorKind::from)?,
        );

        let outcome = auth_check(self.db, &pdu, &state).await?;
        let stored = StoredPdu::new(pdu, !outcome.allowed(), false)?;

        if self.depth_map.len() == depth {
            self.depth_map.push(Vec::new());
        } else if self.depth_map.len() < depth {
            panic!("can't insert event there");
        }
        self.depth_map[depth].push(stored.event_id().to_owned());

        self.db.add_pdus(&[stored.clone()]).await?;
        Ok(stored.event_id().to_owned())
    }
}

async fn fixtures() -> (MemStorageManager, Box<dyn Storage>, StateResolver, MatrixId, MatrixId) {
    let manager = MemStorageManager::new();
    let db = manager.get_handle().await.unwrap();
    let resolver = StateResolver::new(manager.get_handle().await.unwrap());
    let alice = MatrixId::new("alice", "example.org").unwrap();
    let bob = MatrixId::new("bob", "example.org").unwrap();
    (manager, db, resolver, alice, bob)
}

fn join_content() -> JsonValue {
    serde_json::to_value(Member::new(Membership::Join)).unwrap()
}

#[tokio::test]
async fn linear() {
    let (_manager, db, resolver, alice, _) = fixtures().await;
    let room_id = "!linear:example.org";
    let mut room = TestRoom::create(&*db, room_id, &alice).await.unwrap();

    let _join = room
        .add(1, &alice, "m.room.member", Some(alice.as_str()), join_content(), &resolver)
        .await
        .unwrap();
    let name1 = room
        .add(2, &alice, "m.room.name", Some(""), json!({"name": "one"}), &resolver)
        .await
        .unwrap();

    let state1 = resolver.resolve(room_id, &[name1.clone()]).await.unwrap();
    assert_eq!(
        state1.get_content::<Name>(&*db, "").await.unwrap().unwrap().name,
        "one",
    );

    let name2 = room
        .add(3, &alice, "m.room.name", Some(""), json!({"name": "two"}), &resolver)
        .await
        .unwrap();
    let state2 = resolver.resolve(room_id, &[name2]).await.unwrap();
    assert_eq!(
        state2.get_content::<Name>(&*db, "").await.unwrap().unwrap().name,
        "two",
    );
    // resolving an older extremity still sees the older value
    let state1 = resolver.resolve(room_id, &[name1]).await.unwrap();
    assert_eq!(
        state1.get_content::<Name>(&*db, "").await.unwrap().unwrap().name,
        "one",
    );
}

#[tokio::test]
async fn fork_converges_and_is_deterministic() {
    let (manager, db, resolver, alice, bob) = fixtures().await;
    let room_id = "!fork:example.org";
    let mut room = TestRoom::create(&*db, room_id, &alice).await.unwrap();

    room.add(1, &alice, "m.room.member", Some(alice.as_str()), join_content(), &resolver)
        .await
        .unwrap();
    let mut levels = PowerLevels::default();
    levels.users.insert(alice.clone_inner(), 100);
    levels.users.insert(bob.clone_inner(), 50);
    room.add(2, &alice, "m.room.power_levels", Some(""), serde_json::to_value(&levels).unwrap(), &resolver)
        .await
        .unwrap();
    room.add(
        3,
        &alice,
        "m.room.join_rules",
        Some(""),
        json!({"join_rule": "public"}),
        &resolver,
    )
    .await
    .unwrap();
    room.add(4, &bob, "m.room.member", Some(bob.as_str()), join_content(), &resolver)
        .await
        .unwrap();

    // two names at the same depth: a genuine conflict
    let name_a = room
        .add(5, &alice, "m.room.name", Some(""), json!({"name": "from alice"}), &resolver)
        .await
        .unwrap();
    let name_b = room
        .add(5, &bob, "m.room.name", Some(""), json!({"name": "from bob"}), &resolver)
        .await
        .unwrap();

    let resolved = resolver
        .resolve(room_id, &[name_a.clone(), name_b.clone()])
        .await
        .unwrap();
    let winner = resolved.get(("m.room.name", "")).unwrap().to_owned();
    assert!(winner == name_a || winner == name_b);

    // mainline tie-break: same mainline position, so the later timestamp
    // folds last and wins
    assert_eq!(winner, name_b);

    // an independent resolver with a cold cache over the same store agrees,
    // regardless of input order
    let fresh = StateResolver::new(manager.get_handle().await.unwrap());
    let again = fresh.resolve(room_id, &[name_b, name_a]).await.unwrap();
    assert_eq!(again.get(("m.room.name", "")).unwrap(), winner);
}

#[tokio::test]
async fn ban_beats_concurrent_state_change() {
    let (_manager, db, resolver, alice, bob) = fixtures().await;
    let room_id = "!banfork:example.org";
    let mut room = TestRoom::create(&*db, room_id, &alice).await.unwrap();

    room.add(1, &alice, "m.room.member", Some(alice.as_str()), join_content(), &resolver)
        .await
        .unwrap();
    let mut levels = PowerLevels::default();
    levels.users.insert(alice.clone_inner(), 100);
    levels.state_default = 0;
    room.add(2, &alice, "m.room.power_levels", Some(""), serde_json::to_value(&levels).unwrap(), &resolver)
        .await
        .unwrap();
    room.add(
        3,
        &alice,
        "m.room.join_rules",
        Some(""),
        json!({"join_rule": "public"}),
        &resolver,
    )
    .await
    .unwrap();
    room.add(4, &bob, "m.room.member", Some(bob.as_str()), join_content(), &resolver)
        .await
        .unwrap();

    // fork: alice bans bob while bob concurrently renames the room
    let ban = room
        .add(
            5,
            &alice,
            "m.room.member",
            Some(bob.as_str()),
            serde_json::to_value(Member::new(Membership::Ban)).unwrap(),
            &resolver,
        )
        .await
        .unwrap();
    let bob_name = room
        .add(5, &bob, "m.room.name", Some(""), json!({"name": "bob was here"}), &resolver)
        .await
        .unwrap();

    let resolved = resolver.resolve(room_id, &[ban.clone(), bob_name.clone()]).await.unwrap();

    // the ban is a power event, folds first, and bob's rename no longer
    // passes auth
    assert_eq!(resolved.get(("m.room.member", bob.as_str())).unwrap(), ban);
    assert_ne!(resolved.get(("m.room.name", "")), Some(bob_name.as_str()));
}

#[tokio::test]
async fn join_auth_chain_is_exact() {
    let (_manager, db, _resolver, alice, _) = fixtures().await;
    let room_id = "!chain:example.org";

    // hand-built DAG: create <- power <- join, with explicit auth_events
    let create = UnhashedPdu {
        room_id: room_id.to_owned(),
        sender: alice.clone(),
        origin_server_ts: 0,
        ty: "m.room.create".to_owned(),
        state_key: Some(String::new()),
        content: json!({"room_version": "11"}),
        prev_events: vec![],
        depth: 0,
        auth_events: vec![],
        unsigned: None,
    }
    .finalize()
    .unwrap();
    let create = StoredPdu::accepted(VersionedPdu::V11(create)).unwrap();

    let power = UnhashedPdu {
        room_id: room_id.to_owned(),
        sender: alice.clone(),
        origin_server_ts: 1,
        ty: "m.room.power_levels".to_owned(),
        state_key: Some(String::new()),
        content: serde_json::to_value(PowerLevels::default()).unwrap(),
        prev_events: vec![create.event_id().to_owned()],
        depth: 1,
        auth_events: vec![create.event_id().to_owned()],
        unsigned: None,
    }
    .finalize()
    .unwrap();
    let power = StoredPdu::accepted(VersionedPdu::V11(power)).unwrap();

    let join = UnhashedPdu {
        room_id: room_id.to_owned(),
        sender: alice.clone(),
        origin_server_ts: 2,
        ty: "m.room.member".to_owned(),
        state_key: Some(alice.clone_inner()),
        content: json!({"membership": "join"}),
        prev_events: vec![power.event_id().to_owned()],
        depth: 2,
        auth_events: vec![create.event_id().to_owned(), power.event_id().to_owned()],
        unsigned: None,
    }
    .finalize()
    .unwrap();
    let join = StoredPdu::accepted(VersionedPdu::V11(join)).unwrap();

    db.add_pdus(&[create.clone(), power.clone(), join.clone()]).await.unwrap();

    let chain = db.auth_chain(room_id, &[join.event_id().to_owned()]).await.unwrap();
    let expected: std::collections::HashSet<String> =
        [create.event_id().to_owned(), power.event_id().to_owned()].into_iter().collect();
    assert_eq!(chain, expected);
}

#[tokio::test]
async fn soft_failed_events_do_not_enter_linear_state() {
    let (_manager, db, resolver, alice, bob) = fixtures().await;
    let room_id = "!soft:example.org";
    let mut room = TestRoom::create(&*db, room_id, &alice).await.unwrap();

    room.add(1, &alice, "m.room.member", Some(alice.as_str()), join_content(), &resolver)
        .await
        .unwrap();
    // bob never joined, so his name event fails auth and is stored soft-failed
    let rogue = room
        .add(2, &bob, "m.room.name", Some(""), json!({"name": "sneaky"}), &resolver)
        .await
        .unwrap();
    let stored = db.get_pdu(room_id, &rogue).await.unwrap().unwrap();
    assert!(stored.soft_failed());

    let state = resolver.resolve(room_id, &[rogue]).await.unwrap();
    assert_eq!(state.get(("m.room.name", "")), None);
}
