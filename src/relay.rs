use crate::game::constants::{
  MAX_INPUT_ERRORS, NOTIFY_TIMEOUT_MS, OUTBOUND_QUEUE_DEPTH, POINTS_PER_SEGMENT, SPAWN_X,
  SPAWN_Y,
};
use crate::game::geometry::Point;
use crate::game::simulation::{SimEvent, SimulationHandle};
use crate::protocol::{ClientInput, PlayerInfo, ServerMessage};
use crate::registry::{notify, PlayerHandle, RegistryHandle, RoomHandle};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const STATE_ACTIVE: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// One-directional Active -> Closing -> Closed lifecycle, shared between the
/// relay's two tasks. Transitions are idempotent.
#[derive(Debug)]
pub(crate) struct LifecycleFlag(AtomicU8);

impl LifecycleFlag {
  fn new() -> Self {
    Self(AtomicU8::new(STATE_ACTIVE))
  }

  fn is_active(&self) -> bool {
    self.0.load(Ordering::SeqCst) == STATE_ACTIVE
  }

  /// Returns true only for the transition out of Active.
  fn begin_close(&self) -> bool {
    self
      .0
      .compare_exchange(STATE_ACTIVE, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
  }

  fn mark_closed(&self) {
    self.0.store(STATE_CLOSED, Ordering::SeqCst);
  }
}

/// Per-player bridge between a room's simulation and one websocket. Owns the
/// player's score counter and the event-to-wire translation; everything it
/// sends to other components goes through their queues.
struct PlayerRelay {
  player_id: String,
  color: String,
  room: RoomHandle,
  registry: RegistryHandle,
  outbound: mpsc::Sender<ServerMessage>,
  lifecycle: Arc<LifecycleFlag>,
  score: u32,
}

impl PlayerRelay {
  /// First-activation announcements: the player's own identity, the member
  /// exchange with every existing peer, and the pebble snapshot replay.
  async fn announce(&self, peers: &[PlayerHandle]) {
    self
      .send(ServerMessage::YouAre {
        player_id: self.player_id.clone(),
      })
      .await;

    for peer in peers {
      notify(
        peer.clone(),
        ServerMessage::NewPlayer {
          player_id: self.player_id.clone(),
          payload: PlayerInfo {
            color: self.color.clone(),
          },
        },
      );
      self
        .send(ServerMessage::NewPlayer {
          player_id: peer.id.clone(),
          payload: PlayerInfo {
            color: peer.color.clone(),
          },
        })
        .await;
    }

    for pebble in self.room.simulation.snapshot_pebbles().await {
      self
        .send(ServerMessage::Pebble {
          x: pebble.x,
          y: pebble.y,
          resource_id: pebble.id,
        })
        .await;
    }
  }

  async fn run(mut self, mut events: mpsc::UnboundedReceiver<SimEvent>) {
    while let Some(event) = events.recv().await {
      if !self.handle_event(event).await {
        break;
      }
    }
  }

  /// Translates one simulation event into relay actions. Returns false when
  /// the event loop should stop.
  async fn handle_event(&mut self, event: SimEvent) -> bool {
    match event {
      SimEvent::PointScored => {
        self.score += 1;
        if self.score % POINTS_PER_SEGMENT == 0 {
          tracing::info!(player_id = %self.player_id, score = self.score, "body grows");
          let registry = self.registry.clone();
          let simulation = self.room.simulation.clone();
          let room_key = self.room.key.clone();
          let player_id = self.player_id.clone();
          tokio::spawn(async move {
            registry
              .broadcast(
                &room_key,
                ServerMessage::AddPart {
                  player_id: player_id.clone(),
                },
              )
              .await;
            simulation.add_segment(&player_id).await;
          });
        }
        true
      }
      SimEvent::PebbleAdded { id, x, y } => {
        self
          .send(ServerMessage::Pebble {
            x,
            y,
            resource_id: id,
          })
          .await
      }
      SimEvent::PebbleRemoved { id } => {
        self.send(ServerMessage::PebbleRemove { resource_id: id }).await
      }
      SimEvent::Position {
        player_id,
        x,
        y,
        heading,
      } => {
        self
          .send(ServerMessage::Position {
            x,
            y,
            t: heading,
            player_id,
          })
          .await
      }
      SimEvent::GameOver => {
        self.lifecycle.begin_close();
        self.send(ServerMessage::GameOver {}).await;
        tracing::info!(player_id = %self.player_id, "game over");
        schedule_simulation_remove(self.room.simulation.clone(), self.player_id.clone());
        false
      }
    }
  }

  async fn send(&self, message: ServerMessage) -> bool {
    self.outbound.send(message).await.is_ok()
  }
}

/// Detached bounded-time removal request; failure is logged inside the
/// simulation handle and otherwise ignored.
fn schedule_simulation_remove(simulation: SimulationHandle, player_id: String) {
  tokio::spawn(async move {
    simulation.remove(&player_id).await;
  });
}

/// Drives one player's connection: registers the player, joins the
/// simulation, pumps events out and input in, and runs the close sequence
/// when either side ends.
pub async fn handle_socket(
  socket: WebSocket,
  room: RoomHandle,
  registry: RegistryHandle,
  color: String,
) {
  let (mut sender, receiver) = socket.split();
  let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_DEPTH);

  let Some(registered) = registry
    .register_player(&room.key, &color, outbound_tx.clone())
    .await
  else {
    tracing::warn!(room_id = %room.key, "player registration failed, room gone");
    return;
  };
  let player_id = registered.player_id;

  let (events_tx, events_rx) = mpsc::unbounded_channel();
  let spawn = Point { x: SPAWN_X, y: SPAWN_Y };
  if !room
    .simulation
    .join(&player_id, events_tx, spawn, vec![spawn])
    .await
  {
    tracing::warn!(room_id = %room.key, player_id = %player_id, "simulation join failed");
    registry.remove_player(&room.key, &player_id).await;
    return;
  }

  let mut send_task = tokio::spawn(async move {
    while let Some(message) = outbound_rx.recv().await {
      let Ok(text) = serde_json::to_string(&message) else { continue };
      if sender.send(Message::Text(text)).await.is_err() {
        break;
      }
    }
  });

  let lifecycle = Arc::new(LifecycleFlag::new());
  let relay = PlayerRelay {
    player_id: player_id.clone(),
    color,
    room: room.clone(),
    registry: registry.clone(),
    outbound: outbound_tx.clone(),
    lifecycle: Arc::clone(&lifecycle),
    score: 0,
  };
  relay.announce(&registered.peers).await;
  let mut event_task = tokio::spawn(relay.run(events_rx));

  run_inbound(receiver, &room.simulation, &player_id, &lifecycle).await;

  // Close sequence. Both removals are no-ops if they already happened.
  lifecycle.begin_close();
  schedule_simulation_remove(room.simulation.clone(), player_id.clone());
  registry.remove_player(&room.key, &player_id).await;

  let grace = Duration::from_millis(NOTIFY_TIMEOUT_MS);
  if tokio::time::timeout(grace, &mut event_task).await.is_err() {
    event_task.abort();
  }
  // Let the queued messages (game_over in particular) flush before tearing
  // the sender down.
  drop(outbound_tx);
  if tokio::time::timeout(grace, &mut send_task).await.is_err() {
    send_task.abort();
  }
  lifecycle.mark_closed();
  tracing::info!(room_id = %room.key, player_id = %player_id, "relay closed");
}

/// Reads client input until the connection ends, the lifecycle leaves
/// Active, or too many consecutive unreadable messages arrive.
async fn run_inbound(
  mut receiver: SplitStream<WebSocket>,
  simulation: &SimulationHandle,
  player_id: &str,
  lifecycle: &LifecycleFlag,
) {
  let mut errors: u32 = 0;
  while lifecycle.is_active() {
    let Some(result) = receiver.next().await else { break };
    let message = match result {
      Ok(message) => message,
      Err(error) => {
        errors += 1;
        tracing::debug!(player_id, ?error, errors, "websocket read failed");
        if errors > MAX_INPUT_ERRORS {
          break;
        }
        continue;
      }
    };

    match message {
      Message::Text(text) => match serde_json::from_str::<ClientInput>(&text) {
        Ok(input) if input.t.is_finite() => {
          errors = 0;
          if !simulation.update_heading(player_id, input.t).await {
            break;
          }
        }
        _ => {
          errors += 1;
          tracing::debug!(player_id, errors, "unparseable client input");
          if errors > MAX_INPUT_ERRORS {
            break;
          }
        }
      },
      Message::Close(_) => break,
      _ => {}
    }
  }
}
