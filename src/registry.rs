use crate::game::constants::{
  NOTIFY_TIMEOUT_MS, REGISTRY_QUEUE_DEPTH, REQUEST_TIMEOUT_MS, SWEEP_INTERVAL_MS,
};
use crate::game::simulation::SimulationHandle;
use crate::protocol::ServerMessage;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// What a relay needs to talk to a room: its key and its simulation actor.
#[derive(Debug, Clone)]
pub struct RoomHandle {
  pub key: String,
  pub simulation: SimulationHandle,
}

/// A room member as seen by the registry: identity, display color, and the
/// outbound queue feeding that member's websocket.
#[derive(Debug, Clone)]
pub struct PlayerHandle {
  pub id: String,
  pub color: String,
  pub outbound: mpsc::Sender<ServerMessage>,
}

#[derive(Debug)]
pub struct RegisteredPlayer {
  pub player_id: String,
  /// Members that were already in the room, for the join announcements.
  pub peers: Vec<PlayerHandle>,
}

#[derive(Debug)]
enum RegistryRequest {
  CreateRoom {
    respond_to: oneshot::Sender<RoomHandle>,
  },
  GetRoom {
    key: String,
    respond_to: oneshot::Sender<Option<RoomHandle>>,
  },
  RegisterPlayer {
    key: String,
    color: String,
    outbound: mpsc::Sender<ServerMessage>,
    respond_to: oneshot::Sender<Option<RegisteredPlayer>>,
  },
  RemovePlayer { key: String, player_id: String },
  Broadcast { key: String, message: ServerMessage },
}

/// Cloneable sender half of the room-directory actor. The room table, member
/// lists, and the id counters are owned by the loop in [`run`]; every
/// operation goes through its queue.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
  tx: mpsc::Sender<RegistryRequest>,
}

impl RegistryHandle {
  pub fn spawn() -> Self {
    let (tx, rx) = mpsc::channel(REGISTRY_QUEUE_DEPTH);
    tokio::spawn(run(rx));
    Self { tx }
  }

  pub async fn create_room(&self) -> Option<RoomHandle> {
    let (respond_to, response) = oneshot::channel();
    self
      .request(RegistryRequest::CreateRoom { respond_to }, response)
      .await
  }

  /// Resolves a room key. A registry that does not answer within the request
  /// timeout is treated the same as an unknown key.
  pub async fn get_room(&self, key: &str) -> Option<RoomHandle> {
    let (respond_to, response) = oneshot::channel();
    self
      .request(
        RegistryRequest::GetRoom {
          key: key.to_string(),
          respond_to,
        },
        response,
      )
      .await
      .flatten()
  }

  pub async fn register_player(
    &self,
    key: &str,
    color: &str,
    outbound: mpsc::Sender<ServerMessage>,
  ) -> Option<RegisteredPlayer> {
    let (respond_to, response) = oneshot::channel();
    self
      .request(
        RegistryRequest::RegisterPlayer {
          key: key.to_string(),
          color: color.to_string(),
          outbound,
          respond_to,
        },
        response,
      )
      .await
      .flatten()
  }

  pub async fn remove_player(&self, key: &str, player_id: &str) {
    let request = RegistryRequest::RemovePlayer {
      key: key.to_string(),
      player_id: player_id.to_string(),
    };
    self.send_bounded(request).await;
  }

  /// Best-effort notice to every member of a room.
  pub async fn broadcast(&self, key: &str, message: ServerMessage) {
    let request = RegistryRequest::Broadcast {
      key: key.to_string(),
      message,
    };
    self.send_bounded(request).await;
  }

  async fn request<T>(
    &self,
    request: RegistryRequest,
    response: oneshot::Receiver<T>,
  ) -> Option<T> {
    let result = tokio::time::timeout(Duration::from_millis(REQUEST_TIMEOUT_MS), async {
      self.tx.send(request).await.ok()?;
      response.await.ok()
    })
    .await;

    match result {
      Ok(value) => value,
      Err(_) => {
        tracing::warn!("registry request timed out");
        None
      }
    }
  }

  async fn send_bounded(&self, request: RegistryRequest) {
    let send = self.tx.send(request);
    if tokio::time::timeout(Duration::from_millis(NOTIFY_TIMEOUT_MS), send)
      .await
      .is_err()
    {
      tracing::warn!("registry send timed out");
    }
  }
}

async fn run(mut requests: mpsc::Receiver<RegistryRequest>) {
  let mut state = RegistryState::new();
  let mut sweep = tokio::time::interval(Duration::from_millis(SWEEP_INTERVAL_MS));

  loop {
    tokio::select! {
      _ = sweep.tick() => state.sweep(),
      request = requests.recv() => match request {
        Some(request) => state.handle(request),
        None => break,
      },
    }
  }

  tracing::info!("registry loop ended");
}

#[derive(Debug)]
struct RoomEntry {
  simulation: SimulationHandle,
  members: HashMap<String, PlayerHandle>,
}

#[derive(Debug)]
struct RegistryState {
  rooms: HashMap<String, RoomEntry>,
  next_room_id: u64,
  next_player_id: u64,
}

impl RegistryState {
  fn new() -> Self {
    Self {
      rooms: HashMap::new(),
      next_room_id: 1,
      next_player_id: 1,
    }
  }

  fn handle(&mut self, request: RegistryRequest) {
    match request {
      RegistryRequest::CreateRoom { respond_to } => {
        let _ = respond_to.send(self.create_room());
      }
      RegistryRequest::GetRoom { key, respond_to } => {
        let _ = respond_to.send(self.room_handle(&key));
      }
      RegistryRequest::RegisterPlayer {
        key,
        color,
        outbound,
        respond_to,
      } => {
        let _ = respond_to.send(self.register_player(&key, color, outbound));
      }
      RegistryRequest::RemovePlayer { key, player_id } => {
        self.remove_player(&key, &player_id);
      }
      RegistryRequest::Broadcast { key, message } => {
        let Some(room) = self.rooms.get(&key) else { return };
        for member in room.members.values() {
          notify(member.clone(), message.clone());
        }
      }
    }
  }

  fn create_room(&mut self) -> RoomHandle {
    let key = format!("room-{}", self.next_room_id);
    self.next_room_id += 1;
    let simulation = SimulationHandle::spawn();
    self.rooms.insert(
      key.clone(),
      RoomEntry {
        simulation: simulation.clone(),
        members: HashMap::new(),
      },
    );
    tracing::info!(room_id = %key, "room created");
    RoomHandle { key, simulation }
  }

  fn room_handle(&self, key: &str) -> Option<RoomHandle> {
    self.rooms.get(key).map(|room| RoomHandle {
      key: key.to_string(),
      simulation: room.simulation.clone(),
    })
  }

  fn register_player(
    &mut self,
    key: &str,
    color: String,
    outbound: mpsc::Sender<ServerMessage>,
  ) -> Option<RegisteredPlayer> {
    let room = self.rooms.get_mut(key)?;
    let player_id = format!("player-{}", self.next_player_id);
    self.next_player_id += 1;

    let peers: Vec<PlayerHandle> = room.members.values().cloned().collect();
    room.members.insert(
      player_id.clone(),
      PlayerHandle {
        id: player_id.clone(),
        color,
        outbound,
      },
    );
    tracing::info!(room_id = %key, player_id = %player_id, "player registered");
    Some(RegisteredPlayer { player_id, peers })
  }

  fn remove_player(&mut self, key: &str, player_id: &str) {
    // The room may have been swept already.
    let Some(room) = self.rooms.get_mut(key) else { return };
    if room.members.remove(player_id).is_none() {
      return;
    }
    tracing::info!(room_id = %key, player_id, "player removed from room");

    let notice = ServerMessage::Disconnect {
      player_id: player_id.to_string(),
    };
    for member in room.members.values() {
      notify(member.clone(), notice.clone());
    }
  }

  /// Rooms with no members are torn down here and nowhere else.
  fn sweep(&mut self) {
    let expired: Vec<String> = self
      .rooms
      .iter()
      .filter(|(_, room)| room.members.is_empty())
      .map(|(key, _)| key.clone())
      .collect();

    for key in expired {
      let Some(room) = self.rooms.remove(&key) else { continue };
      let simulation = room.simulation;
      tokio::spawn(async move {
        simulation.shutdown().await;
      });
      tracing::info!(room_id = %key, "removed empty room");
    }
  }
}

/// Detached bounded-time send so one slow or dead peer never stalls the
/// registry loop.
pub(crate) fn notify(player: PlayerHandle, message: ServerMessage) {
  tokio::spawn(async move {
    let send = player.outbound.send(message);
    if tokio::time::timeout(Duration::from_millis(NOTIFY_TIMEOUT_MS), send)
      .await
      .is_err()
    {
      tracing::warn!(player_id = %player.id, "outbound notice timed out");
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::time::timeout;

  fn outbound_pair() -> (mpsc::Sender<ServerMessage>, mpsc::Receiver<ServerMessage>) {
    mpsc::channel(16)
  }

  #[tokio::test]
  async fn create_room_yields_distinct_resolvable_keys() {
    let registry = RegistryHandle::spawn();
    let first = registry.create_room().await.expect("first room");
    let second = registry.create_room().await.expect("second room");

    assert_ne!(first.key, second.key);
    assert!(registry.get_room(&first.key).await.is_some());
    assert!(registry.get_room(&second.key).await.is_some());
    assert!(registry.get_room("room-404").await.is_none());
  }

  #[tokio::test]
  async fn register_player_returns_existing_peers() {
    let registry = RegistryHandle::spawn();
    let room = registry.create_room().await.expect("room");

    let (tx1, _rx1) = outbound_pair();
    let first = registry
      .register_player(&room.key, "ff0000", tx1)
      .await
      .expect("first player");
    assert!(first.peers.is_empty());

    let (tx2, _rx2) = outbound_pair();
    let second = registry
      .register_player(&room.key, "00ff00", tx2)
      .await
      .expect("second player");
    assert_ne!(first.player_id, second.player_id);
    assert_eq!(second.peers.len(), 1);
    assert_eq!(second.peers[0].id, first.player_id);
    assert_eq!(second.peers[0].color, "ff0000");
  }

  #[tokio::test]
  async fn register_player_in_unknown_room_fails() {
    let registry = RegistryHandle::spawn();
    let (tx, _rx) = outbound_pair();
    assert!(registry.register_player("room-404", "ffffff", tx).await.is_none());
  }

  #[tokio::test]
  async fn remove_player_notifies_remaining_members() {
    let registry = RegistryHandle::spawn();
    let room = registry.create_room().await.expect("room");

    let (tx1, mut rx1) = outbound_pair();
    let first = registry
      .register_player(&room.key, "ff0000", tx1)
      .await
      .expect("first player");
    let (tx2, _rx2) = outbound_pair();
    let second = registry
      .register_player(&room.key, "00ff00", tx2)
      .await
      .expect("second player");

    registry.remove_player(&room.key, &second.player_id).await;

    let notice = timeout(Duration::from_secs(1), rx1.recv())
      .await
      .expect("notice in time")
      .expect("channel open");
    assert_eq!(
      notice,
      ServerMessage::Disconnect {
        player_id: second.player_id.clone(),
      }
    );
    // Removing again is harmless.
    registry.remove_player(&room.key, &second.player_id).await;
    let _ = first;
  }

  #[tokio::test]
  async fn broadcast_reaches_every_member() {
    let registry = RegistryHandle::spawn();
    let room = registry.create_room().await.expect("room");

    let (tx1, mut rx1) = outbound_pair();
    registry
      .register_player(&room.key, "ff0000", tx1)
      .await
      .expect("first player");
    let (tx2, mut rx2) = outbound_pair();
    let second = registry
      .register_player(&room.key, "00ff00", tx2)
      .await
      .expect("second player");

    let message = ServerMessage::AddPart {
      player_id: second.player_id.clone(),
    };
    registry.broadcast(&room.key, message.clone()).await;

    for rx in [&mut rx1, &mut rx2] {
      let received = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("notice in time")
        .expect("channel open");
      assert_eq!(received, message);
    }
  }

  #[tokio::test]
  async fn sweep_removes_empty_rooms_and_shuts_their_simulations() {
    let mut state = RegistryState::new();
    let empty = state.create_room();
    let occupied = state.create_room();
    let (tx, _rx) = outbound_pair();
    state
      .register_player(&occupied.key, "ffffff".to_string(), tx)
      .expect("registered");

    state.sweep();

    assert!(state.room_handle(&empty.key).is_none());
    assert!(state.room_handle(&occupied.key).is_some());

    // The swept room's simulation stops answering; snapshots degrade to
    // "no pebbles" instead of hanging.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(empty.simulation.snapshot_pebbles().await.is_empty());
  }

  #[tokio::test]
  async fn sweep_reclaims_rooms_once_all_members_leave() {
    let mut state = RegistryState::new();
    let room = state.create_room();
    let (tx, _rx) = outbound_pair();
    let registered = state
      .register_player(&room.key, "ffffff".to_string(), tx)
      .expect("registered");

    state.sweep();
    assert!(state.room_handle(&room.key).is_some());

    state.remove_player(&room.key, &registered.player_id);
    state.sweep();
    assert!(state.room_handle(&room.key).is_none());
  }
}
