use std::{
    borrow::Cow,
    cmp::Ordering,
    collections::{BTreeSet, HashMap, HashSet},
    iter::FromIterator,
    sync::{Arc, Mutex},
};

use tracing::trace;

use crate::{
    error::{Error, ErrorKind},
    events::{room::EventType, StoredPdu},
    storage::{StateMap, Storage},
    validate::auth::{auth_check, auth_types_for_event},
};

/// (event_type, state_key) -> event_id
#[derive(Clone, Debug)]
pub struct State {
    room_id: String,
    map: HashMap<(Cow<'static, str>, Cow<'static, str>), String>,
}

impl State {
    pub fn new(room_id: &str) -> Self {
        State { room_id: room_id.to_owned(), map: HashMap::new() }
    }

    pub fn key<'k>((event_type, state_key): (&'k str, &'k str)) -> (Cow<'k, str>, Cow<'k, str>) {
        (Cow::from(event_type), Cow::from(state_key))
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn get<'s, 'k: 's>(&'s self, key_strs: (&'k str, &'k str)) -> Option<&'s str> {
        let key = Self::key(key_strs);
        self.map.get::<(Cow<'k, str>, Cow<'k, str>)>(&key).map(String::as_str)
    }

    pub async fn get_content<T: EventType>(
        &self,
        db: &dyn Storage,
        state_key: &str,
    ) -> Result<Option<T>, Error> {
        if let Some(event_id) = self.get((T::EVENT_TYPE, state_key)) {
            let event = db
                .get_pdu(&self.room_id, event_id)
                .await?
                .ok_or_else(|| ErrorKind::DbError("event in state doesn't exist".to_owned()))?;
            let content = serde_json::from_value(event.content().clone())
                .map_err(|e| ErrorKind::BadJson(e.to_string()))?;
            return Ok(Some(content));
        }
        Ok(None)
    }

    pub fn insert_event(&mut self, pdu: &StoredPdu) {
        self.map.insert(
            (
                Cow::from(pdu.ty().to_owned()),
                Cow::from(pdu.state_key().expect("inserted event isn't state").to_owned()),
            ),
            pdu.event_id().to_owned(),
        );
    }

    pub fn iter(&self) -> impl Iterator<Item = ((&str, &str), &str)> {
        self.map.iter().map(|((ty, key), id)| ((ty.as_ref(), key.as_ref()), id.as_str()))
    }

    pub fn to_state_map(&self) -> StateMap {
        self.map
            .iter()
            .map(|((ty, key), id)| ((ty.clone().into_owned(), key.clone().into_owned()), id.clone()))
            .collect()
    }

    pub fn from_state_map(room_id: &str, map: StateMap) -> Self {
        State {
            room_id: room_id.to_owned(),
            map: map
                .into_iter()
                .map(|((ty, key), id)| ((Cow::from(ty), Cow::from(key)), id))
                .collect(),
        }
    }
}

pub struct StateResolver {
    /// extremity set -> state after those events
    cache: Arc<Mutex<HashMap<BTreeSet<String>, State>>>,
    db: Box<dyn Storage>,
}

impl StateResolver {
    pub fn new(db: Box<dyn Storage>) -> Self {
        Self { cache: Arc::new(Mutex::new(HashMap::new())), db }
    }

    pub async fn resolve(&self, room_id: &str, events: &[String]) -> Result<State, Error> {
        self.resolve_v2(room_id, events).await
    }

    /// State resolution, version 2. Deterministic: any two servers resolving
    /// the same extremity set arrive at the same snapshot.
    #[tracing::instrument(level = "debug", skip(self))]
    #[async_recursion::async_recursion]
    pub async fn resolve_v2(&self, room_id: &str, events: &[String]) -> Result<State, Error> {
        if events.is_empty() {
            return Ok(State::new(room_id));
        }

        let key = BTreeSet::from_iter(events.iter().map(ToOwned::to_owned));
        if let Some(state) = self.cache.lock().unwrap().get(&key) {
            trace!("state cache hit");
            return Ok(state.clone());
        }

        if events.len() == 1 {
            let state = self.state_after(room_id, &events[0]).await?;
            self.cache.lock().unwrap().insert(key, state.clone());
            return Ok(state);
        }

        trace!("sad path");

        // event_id -> state after that event
        let mut scratch = HashMap::new();
        for event_id in events.iter() {
            let state = self.resolve_v2(room_id, &[event_id.clone()]).await?;
            scratch.insert(event_id.clone(), state);
        }

        // STEP 1: split the union of the snapshots into slots every input
        // agrees on and slots they fight over

        // (event_type, state_key) -> [event_id]
        let mut state_set = HashMap::new();
        for state in scratch.values() {
            for (type_and_key, event_id) in state.map.iter() {
                state_set
                    .entry((type_and_key.0.clone(), type_and_key.1.clone()))
                    .or_insert_with(HashSet::new)
                    .insert(event_id.clone());
            }
        }
        let mut unconflicted_state_map = HashMap::new();
        let mut conflicted_state_set = HashSet::new();
        for (type_and_key, event_ids) in state_set.into_iter() {
            let everywhere = scratch
                .values()
                .all(|state| state.map.contains_key(&type_and_key));
            if event_ids.len() == 1 && everywhere {
                let event_id = event_ids.into_iter().next().unwrap();
                unconflicted_state_map.insert(type_and_key, event_id);
            } else {
                conflicted_state_set.extend(event_ids);
            }
        }

        let auth_difference = self.auth_difference(room_id, scratch.values()).await?;
        let mut full_conflicted_set = conflicted_state_set
            .union(&auth_difference)
            .cloned()
            .collect::<HashSet<_>>();

        // STEP 2: order the power events and fold them over the unconflicted
        // base, dropping any that no longer pass auth

        let mut power_events = HashSet::new();
        for event_id in full_conflicted_set.iter() {
            let event = self.get_pdu(room_id, event_id).await?;
            if is_power_event(&event) {
                power_events.insert(event_id.clone());
            }
        }
        for event_id in power_events.iter() {
            full_conflicted_set.remove(event_id);
        }

        let ordered_power_events =
            self.reverse_topological_ordering(room_id, power_events).await?;

        let base = State {
            room_id: room_id.to_owned(),
            map: unconflicted_state_map.clone(),
        };
        let partially_resolved_state =
            self.iterative_auth_checks(base, &ordered_power_events).await?;

        // STEP 3: order whatever is left by its position relative to the
        // power-levels mainline

        let mainline = self.power_levels_mainline(&partially_resolved_state).await?;

        let mut events_with_closest_mainlines = Vec::new();
        for event_id in full_conflicted_set.iter() {
            let event = self.get_pdu(room_id, event_id).await?;
            if event.state_key().is_none() {
                continue;
            }
            let closest = self.closest_mainline_position(&mainline, &event).await?;
            events_with_closest_mainlines.push((event, closest));
        }
        events_with_closest_mainlines.sort_by(mainline_cmp);

        // STEP 4: fold those in as well

        let remaining: Vec<String> = events_with_closest_mainlines
            .iter()
            .map(|(event, _)| event.event_id().to_owned())
            .collect();
        let mut resolved = self
            .iterative_auth_checks(partially_resolved_state, &remaining)
            .await?;

        // STEP 5: unconflicted slots always survive

        for (type_and_key, event_id) in unconflicted_state_map.into_iter() {
            resolved.map.insert(type_and_key, event_id);
        }

        self.cache.lock().unwrap().insert(key, resolved.clone());
        Ok(resolved)
    }

    /// The state after a single event: its own state group if the ingress
    /// pipeline recorded one, else its parents' resolution plus itself.
    async fn state_after(&self, room_id: &str, event_id: &str) -> Result<State, Error> {
        if let Some(group) = self.db.event_state_group(room_id, event_id).await? {
            if let Some(map) = self.db.get_state_group(room_id, group).await? {
                return Ok(State::from_state_map(room_id, map));
            }
        }

        let event = self.get_pdu(room_id, event_id).await?;
        let mut state = self.resolve_v2(room_id, event.prev_events()).await?;
        if event.state_key().is_some() && !event.soft_failed() {
            trace!(
                event_type = event.ty(),
                state_key = event.state_key().unwrap(),
                "applying one event on top of state"
            );
            state.insert_event(&event);
        }
        Ok(state)
    }

    async fn get_pdu(&self, room_id: &str, event_id: &str) -> Result<StoredPdu, Error> {
        self.db
            .get_pdu(room_id, event_id)
            .await?
            .ok_or_else(|| ErrorKind::DbError(format!("event {} not found", event_id)).into())
    }

    /// Union minus intersection of the inputs' full auth chains.
    async fn auth_difference(
        &self,
        room_id: &str,
        snapshots: impl Iterator<Item = &State>,
    ) -> Result<HashSet<String>, Error> {
        let mut chains = Vec::new();
        for snapshot in snapshots {
            let ids: Vec<String> = snapshot.map.values().cloned().collect();
            chains.push(self.db.auth_chain(room_id, &ids).await?);
        }

        let intersection = {
            let mut iter = chains.iter();
            match iter.next() {
                Some(first) => iter.fold(first.clone(), |acc, x| {
                    acc.intersection(x).cloned().collect()
                }),
                None => HashSet::new(),
            }
        };
        let union = chains
            .iter()
            .fold(HashSet::new(), |acc: HashSet<String>, x| acc.union(x).cloned().collect());
        Ok(union.difference(&intersection).cloned().collect())
    }

    /// Orders events so that anything in an event's auth chain comes before
    /// it; ties broken by (depth descending, origin_server_ts ascending,
    /// event_id ascending).
    async fn reverse_topological_ordering(
        &self,
        room_id: &str,
        event_ids: HashSet<String>,
    ) -> Result<Vec<String>, Error> {
        let mut remaining = HashMap::new();
        for event_id in event_ids {
            let event = self.get_pdu(room_id, &event_id).await?;
            let chain = self.db.auth_chain(room_id, &[event_id.clone()]).await?;
            remaining.insert(event_id, (event, chain));
        }

        let mut ret = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let mut candidates: Vec<&String> = remaining
                .iter()
                .filter(|(_, (_, chain))| {
                    chain.iter().all(|ancestor| !remaining.contains_key(ancestor))
                })
                .map(|(id, _)| id)
                .collect();
            candidates.sort_by(|a, b| {
                let (event_a, _) = &remaining[*a];
                let (event_b, _) = &remaining[*b];
                event_b
                    .depth()
                    .cmp(&event_a.depth())
                    .then(event_a.origin_server_ts().cmp(&event_b.origin_server_ts()))
                    .then(event_a.event_id().cmp(event_b.event_id()))
            });
            let next = match candidates.first() {
                Some(id) => (*id).clone(),
                // a cycle in auth_events can only be constructed maliciously;
                // fall back to lexical order so the fold still terminates
                None => remaining.keys().min().unwrap().clone(),
            };
            remaining.remove(&next);
            ret.push(next);
        }

        Ok(ret)
    }

    /// Folds events over a base state one at a time; an event is admitted iff
    /// it passes the auth rules against the accumulated state, with its own
    /// auth_events filling any slots the state doesn't cover yet.
    async fn iterative_auth_checks(
        &self,
        mut state: State,
        ordered_events: &[String],
    ) -> Result<State, Error> {
        let room_id = state.room_id.clone();
        for event_id in ordered_events {
            let event = self.get_pdu(&room_id, event_id).await?;
            if event.state_key().is_none() {
                continue;
            }

            let mut frankenstate = state.clone();
            for auth_key in auth_types_for_event(event.inner()) {
                let key = State::key((auth_key.0.as_str(), auth_key.1.as_str()));
                if !frankenstate.map.contains_key(&key) {
                    for auth_event_id in event.auth_events() {
                        let auth_event = self.get_pdu(&room_id, auth_event_id).await?;
                        if auth_event.ty() == auth_key.0
                            && auth_event.state_key() == Some(auth_key.1.as_str())
                        {
                            frankenstate.insert_event(&auth_event);
                        }
                    }
                }
            }

            let outcome = auth_check(&*self.db, event.inner(), &frankenstate).await?;
            if outcome.allowed() {
                state.insert_event(&event);
            } else {
                trace!(
                    event_id = event.event_id(),
                    reason = ?outcome,
                    "dropping event during resolution"
                );
            }
        }

        Ok(state)
    }

    /// The chain of power-levels events reachable from the resolved one via
    /// auth_events, nearest first.
    async fn power_levels_mainline(&self, state: &State) -> Result<Vec<String>, Error> {
        let starting_point = match state.get(("m.room.power_levels", "")) {
            Some(id) => id.to_owned(),
            None => return Ok(Vec::new()),
        };
        let mut mainline = vec![starting_point.clone()];
        let mut current = starting_point;
        while let Some(parent) = self.power_levels_parent(&state.room_id, &current).await? {
            mainline.push(parent.clone());
            current = parent;
        }
        Ok(mainline)
    }

    async fn power_levels_parent(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Option<String>, Error> {
        let event = self.get_pdu(room_id, event_id).await?;
        for auth_event_id in event.auth_events() {
            let auth_event = self.get_pdu(room_id, auth_event_id).await?;
            if auth_event.ty() == "m.room.power_levels" {
                return Ok(Some(auth_event_id.clone()));
            }
        }
        Ok(None)
    }

    /// Index into the mainline of the nearest power-levels ancestor. Larger
    /// index = closer to the room's root. Events with no power-levels
    /// ancestor sort as furthest from the present.
    async fn closest_mainline_position(
        &self,
        mainline: &[String],
        event: &StoredPdu,
    ) -> Result<usize, Error> {
        let mut current = event.event_id().to_owned();
        loop {
            if let Some((index, _)) = mainline.iter().enumerate().find(|(_, id)| **id == current) {
                return Ok(index);
            }
            match self.power_levels_parent(event.room_id(), &current).await? {
                Some(id) => current = id,
                None => return Ok(usize::MAX),
            }
        }
    }
}

/// Persists an event and advances the room's state bookkeeping in one go:
/// the event's own state group, and the recomputed current state across the
/// new forward extremity set. Callers hold the room's write lock.
pub async fn commit_pdu(
    db: &dyn Storage,
    resolver: &StateResolver,
    pdu: &StoredPdu,
) -> Result<(), Error> {
    let room_id = pdu.room_id();
    db.add_pdus(std::slice::from_ref(pdu)).await?;

    if pdu.outlier() {
        return Ok(());
    }

    let mut state_after = resolver.resolve(room_id, pdu.prev_events()).await?;
    if pdu.state_key().is_some() && !pdu.soft_failed() {
        state_after.insert_event(pdu);
    }
    let group = db.create_state_group(room_id, state_after.to_state_map()).await?;
    db.set_event_state_group(room_id, pdu.event_id(), group).await?;

    let mut extremities: Vec<String> = db.forward_extremities(room_id).await?.into_iter().collect();
    extremities.sort();
    let current = resolver.resolve(room_id, &extremities).await?;
    let current_group = db.create_state_group(room_id, current.to_state_map()).await?;
    db.set_current_state_group(room_id, current_group).await?;
    Ok(())
}

fn is_power_event(pdu: &StoredPdu) -> bool {
    match pdu.ty() {
        "m.room.power_levels" | "m.room.join_rules" => true,
        "m.room.member" => {
            let membership = pdu.content().get("membership").and_then(|m| m.as_str());
            matches!(membership, Some("ban") | Some("leave"))
                && pdu.state_key() != Some(pdu.sender().as_str())
        },
        _ => false,
    }
}

fn mainline_cmp(x: &(StoredPdu, usize), y: &(StoredPdu, usize)) -> Ordering {
    // the mainline list runs newest to oldest, so a larger index is closer
    // to the root and folds first
    let mainline_based_order = x.1.cmp(&y.1).reverse();
    if mainline_based_order.is_ne() {
        return mainline_based_order;
    }

    let ts_based_order = x.0.origin_server_ts().cmp(&y.0.origin_server_ts());
    if ts_based_order.is_ne() {
        return ts_based_order;
    }

    x.0.event_id().cmp(&y.0.event_id())
}

#[cfg(test)]
mod tests;
