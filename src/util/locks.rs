use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per room id. Writes to a room's DAG are funnelled through
/// this so auth-against-current-state, storage and state recomputation happen
/// against a stable snapshot.
#[derive(Default)]
pub struct RoomLocks {
    map: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RoomLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The guard is owned so it can cross await points and is released on
    /// every path out of the critical section, including errors.
    pub async fn lock(&self, room_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.map.lock().await;
            Arc::clone(map.entry(room_id.to_owned()).or_default())
        };
        lock.lock_owned().await
    }
}
