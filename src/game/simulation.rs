use super::constants::{
  ARENA_SIZE, BORDER_THICKNESS, MOVE_SPEED, NOTIFY_TIMEOUT_MS, PEBBLE_OBJECT_SIZE,
  PEBBLE_SPAWN_MS, PLAYER_OBJECT_SIZE, REQUEST_TIMEOUT_MS, SIMULATION_QUEUE_DEPTH, TICK_RATE_HZ,
};
use super::geometry::{Point, Rect};
use super::trail::TrailBuffer;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// State-change events fanned out to the relays subscribed to a room.
#[derive(Debug, Clone)]
pub enum SimEvent {
  PebbleAdded { id: u32, x: f64, y: f64 },
  PebbleRemoved { id: u32 },
  PointScored,
  GameOver,
  Position {
    player_id: String,
    x: f64,
    y: f64,
    heading: f64,
  },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PebbleSnapshot {
  pub id: u32,
  pub x: f64,
  pub y: f64,
}

#[derive(Debug)]
pub enum SimulationRequest {
  Join {
    player_id: String,
    events: mpsc::UnboundedSender<SimEvent>,
    head: Point,
    segments: Vec<Point>,
  },
  AddSegment { player_id: String },
  Remove { player_id: String },
  UpdateHeading { player_id: String, heading: f64 },
  SnapshotPebbles {
    respond_to: oneshot::Sender<Vec<PebbleSnapshot>>,
  },
  Shutdown,
}

/// Cloneable sender half of a room's simulation actor. All world state lives
/// behind the request channel; the loop in [`run`] is the only mutator.
#[derive(Debug, Clone)]
pub struct SimulationHandle {
  tx: mpsc::Sender<SimulationRequest>,
}

impl SimulationHandle {
  pub fn spawn() -> Self {
    let (tx, rx) = mpsc::channel(SIMULATION_QUEUE_DEPTH);
    tokio::spawn(run(rx));
    Self { tx }
  }

  pub async fn join(
    &self,
    player_id: &str,
    events: mpsc::UnboundedSender<SimEvent>,
    head: Point,
    segments: Vec<Point>,
  ) -> bool {
    self
      .tx
      .send(SimulationRequest::Join {
        player_id: player_id.to_string(),
        events,
        head,
        segments,
      })
      .await
      .is_ok()
  }

  pub async fn add_segment(&self, player_id: &str) {
    let request = SimulationRequest::AddSegment {
      player_id: player_id.to_string(),
    };
    let send = self.tx.send(request);
    if tokio::time::timeout(Duration::from_millis(NOTIFY_TIMEOUT_MS), send)
      .await
      .is_err()
    {
      tracing::warn!(player_id, "add segment request timed out");
    }
  }

  pub async fn remove(&self, player_id: &str) {
    let request = SimulationRequest::Remove {
      player_id: player_id.to_string(),
    };
    let send = self.tx.send(request);
    if tokio::time::timeout(Duration::from_millis(NOTIFY_TIMEOUT_MS), send)
      .await
      .is_err()
    {
      tracing::warn!(player_id, "player removal from simulation timed out");
    }
  }

  pub async fn update_heading(&self, player_id: &str, heading: f64) -> bool {
    self
      .tx
      .send(SimulationRequest::UpdateHeading {
        player_id: player_id.to_string(),
        heading,
      })
      .await
      .is_ok()
  }

  /// Synchronous snapshot of the live pebbles. A room that does not answer
  /// within the request timeout is treated as having none.
  pub async fn snapshot_pebbles(&self) -> Vec<PebbleSnapshot> {
    let (respond_to, response) = oneshot::channel();
    let result = tokio::time::timeout(Duration::from_millis(REQUEST_TIMEOUT_MS), async {
      self
        .tx
        .send(SimulationRequest::SnapshotPebbles { respond_to })
        .await
        .ok()?;
      response.await.ok()
    })
    .await;

    match result {
      Ok(Some(pebbles)) => pebbles,
      _ => {
        tracing::warn!("pebble snapshot unavailable, treating room as empty");
        Vec::new()
      }
    }
  }

  pub async fn shutdown(&self) {
    let send = self.tx.send(SimulationRequest::Shutdown);
    if tokio::time::timeout(Duration::from_millis(NOTIFY_TIMEOUT_MS), send)
      .await
      .is_err()
    {
      tracing::warn!("simulation shutdown request timed out");
    }
  }
}

async fn run(mut requests: mpsc::Receiver<SimulationRequest>) {
  let mut world = World::new();
  let mut ticker = tokio::time::interval(Duration::from_secs(1) / TICK_RATE_HZ);
  let mut pebble_ticker = tokio::time::interval(Duration::from_millis(PEBBLE_SPAWN_MS));

  loop {
    tokio::select! {
      _ = ticker.tick() => world.tick(),
      _ = pebble_ticker.tick() => world.spawn_random_pebble(),
      request = requests.recv() => match request {
        Some(SimulationRequest::Shutdown) | None => break,
        Some(request) => world.handle_request(request),
      },
    }
  }

  tracing::info!("simulation loop ended");
}

#[derive(Debug)]
struct BodySegment {
  rect: Rect,
  trail: TrailBuffer,
}

impl BodySegment {
  fn at(position: Point) -> Self {
    Self {
      rect: Rect::new(position.x, position.y, PLAYER_OBJECT_SIZE, PLAYER_OBJECT_SIZE),
      trail: TrailBuffer::new(),
    }
  }
}

#[derive(Debug)]
struct SimPlayer {
  heading: f64,
  head: Rect,
  segments: Vec<BodySegment>,
  score: u32,
  alive: bool,
  events: mpsc::UnboundedSender<SimEvent>,
}

/// Everything a head's movement can run into.
#[derive(Debug, Clone, PartialEq)]
enum Collidable {
  Border,
  PlayerBody { owner: String },
  Pebble { id: u32 },
}

/// Authoritative per-room world state. Only touched from the actor loop.
#[derive(Debug)]
struct World {
  players: HashMap<String, SimPlayer>,
  /// Join order doubles as the per-tick processing order so cross-player
  /// tie-breaks are deterministic.
  join_order: Vec<String>,
  pebbles: HashMap<u32, Rect>,
  next_pebble_id: u32,
  borders: [Rect; 4],
}

impl World {
  fn new() -> Self {
    Self {
      players: HashMap::new(),
      join_order: Vec::new(),
      pebbles: HashMap::new(),
      next_pebble_id: 1,
      borders: [
        Rect::new(0.0, 0.0, ARENA_SIZE, BORDER_THICKNESS),
        Rect::new(0.0, ARENA_SIZE - BORDER_THICKNESS, ARENA_SIZE, BORDER_THICKNESS),
        Rect::new(0.0, 0.0, BORDER_THICKNESS, ARENA_SIZE),
        Rect::new(ARENA_SIZE - BORDER_THICKNESS, 0.0, BORDER_THICKNESS, ARENA_SIZE),
      ],
    }
  }

  fn handle_request(&mut self, request: SimulationRequest) {
    match request {
      SimulationRequest::Join {
        player_id,
        events,
        head,
        segments,
      } => self.join(player_id, events, head, segments),
      SimulationRequest::AddSegment { player_id } => self.add_segment(&player_id),
      SimulationRequest::Remove { player_id } => self.remove(&player_id),
      SimulationRequest::UpdateHeading { player_id, heading } => {
        self.update_heading(&player_id, heading)
      }
      SimulationRequest::SnapshotPebbles { respond_to } => {
        let _ = respond_to.send(self.snapshot_pebbles());
      }
      // Shutdown breaks the loop before reaching here.
      SimulationRequest::Shutdown => {}
    }
  }

  fn join(
    &mut self,
    player_id: String,
    events: mpsc::UnboundedSender<SimEvent>,
    head: Point,
    segments: Vec<Point>,
  ) {
    let player = SimPlayer {
      heading: 0.0,
      head: Rect::new(head.x, head.y, PLAYER_OBJECT_SIZE, PLAYER_OBJECT_SIZE),
      segments: segments.into_iter().map(BodySegment::at).collect(),
      score: 0,
      alive: true,
      events,
    };
    if self.players.insert(player_id.clone(), player).is_none() {
      self.join_order.push(player_id);
    } else {
      tracing::warn!(player_id = %player_id, "player rejoined, replacing world entry");
    }
  }

  fn add_segment(&mut self, player_id: &str) {
    let Some(player) = self.players.get_mut(player_id) else {
      tracing::error!(player_id, "player missing in simulation");
      return;
    };
    player.segments.push(BodySegment::at(player.head.position()));
  }

  fn remove(&mut self, player_id: &str) {
    if self.players.remove(player_id).is_none() {
      return;
    }
    self.join_order.retain(|id| id != player_id);
  }

  fn update_heading(&mut self, player_id: &str, heading: f64) {
    let Some(player) = self.players.get_mut(player_id) else { return };
    player.heading = heading;
  }

  fn snapshot_pebbles(&self) -> Vec<PebbleSnapshot> {
    let mut pebbles: Vec<PebbleSnapshot> = self
      .pebbles
      .iter()
      .map(|(id, rect)| PebbleSnapshot {
        id: *id,
        x: rect.x,
        y: rect.y,
      })
      .collect();
    pebbles.sort_by_key(|pebble| pebble.id);
    pebbles
  }

  fn spawn_random_pebble(&mut self) {
    let mut rng = rand::thread_rng();
    let x = rng.gen_range(0.0..ARENA_SIZE);
    let y = rng.gen_range(0.0..ARENA_SIZE);
    self.spawn_pebble_at(x, y);
  }

  fn spawn_pebble_at(&mut self, x: f64, y: f64) -> u32 {
    let id = self.next_pebble_id;
    self.next_pebble_id += 1;
    self
      .pebbles
      .insert(id, Rect::new(x, y, PEBBLE_OBJECT_SIZE, PEBBLE_OBJECT_SIZE));
    self.broadcast(SimEvent::PebbleAdded { id, x, y });
    id
  }

  /// One fixed-rate step. Players are processed in join order; opponents are
  /// read at their pre-tick positions, and the collision test covers the
  /// destination rectangle only (no continuous sweep), so a sufficiently
  /// fast head could tunnel through a thin obstacle. At speed 3 against
  /// 128-wide bodies and the arena border that cannot happen.
  fn tick(&mut self) {
    let order = self.join_order.clone();
    for player_id in &order {
      let Some(player) = self.players.get(player_id) else { continue };
      if !player.alive {
        continue;
      }
      let heading = player.heading;
      let dx = MOVE_SPEED * heading.cos();
      let dy = MOVE_SPEED * heading.sin();
      let dest = player.head.translated(dx, dy);

      let mut fatal = false;
      let mut eaten: Vec<u32> = Vec::new();
      for hit in self.collisions_for(player_id, &dest) {
        match hit {
          Collidable::Border | Collidable::PlayerBody { .. } => {
            fatal = true;
            break;
          }
          Collidable::Pebble { id } => eaten.push(id),
        }
      }

      if fatal {
        let Some(player) = self.players.get_mut(player_id) else { continue };
        player.alive = false;
        let _ = player.events.send(SimEvent::GameOver);
        tracing::info!(player_id = %player_id, "player hit an obstacle");
        continue;
      }

      for pebble_id in eaten {
        self.consume_pebble(player_id, pebble_id);
      }

      let Some(player) = self.players.get_mut(player_id) else { continue };
      let mut carry = Some(player.head.position());
      for segment in &mut player.segments {
        let Some(position) = carry else { break };
        carry = segment.trail.push(position);
        if let Some(position) = carry {
          segment.rect.set_position(position);
        }
      }
      player.head.x += dx;
      player.head.y += dy;
      let (x, y) = (player.head.x, player.head.y);

      self.broadcast(SimEvent::Position {
        player_id: player_id.clone(),
        x,
        y,
        heading,
      });
    }
  }

  /// Collects everything `dest` overlaps, in a fixed order: borders, then
  /// other players' bodies in join order, then pebbles by id. Objects owned
  /// by the moving player never collide with it, and dead players are not
  /// part of the collision set.
  fn collisions_for(&self, player_id: &str, dest: &Rect) -> Vec<Collidable> {
    let mut hits = Vec::new();

    for border in &self.borders {
      if dest.intersects(border) {
        hits.push(Collidable::Border);
      }
    }

    for other_id in &self.join_order {
      if other_id == player_id {
        continue;
      }
      let Some(other) = self.players.get(other_id) else { continue };
      if !other.alive {
        continue;
      }
      if dest.intersects(&other.head) {
        hits.push(Collidable::PlayerBody {
          owner: other_id.clone(),
        });
      }
      for segment in &other.segments {
        if dest.intersects(&segment.rect) {
          hits.push(Collidable::PlayerBody {
            owner: other_id.clone(),
          });
        }
      }
    }

    let mut pebble_ids: Vec<u32> = self
      .pebbles
      .iter()
      .filter(|(_, rect)| dest.intersects(rect))
      .map(|(id, _)| *id)
      .collect();
    pebble_ids.sort_unstable();
    hits.extend(pebble_ids.into_iter().map(|id| Collidable::Pebble { id }));

    hits
  }

  fn consume_pebble(&mut self, player_id: &str, pebble_id: u32) {
    if self.pebbles.remove(&pebble_id).is_none() {
      return;
    }
    self.broadcast(SimEvent::PebbleRemoved { id: pebble_id });
    if let Some(player) = self.players.get_mut(player_id) {
      player.score += 1;
      let _ = player.events.send(SimEvent::PointScored);
    }
    tracing::debug!(player_id, pebble_id, "pebble consumed");
  }

  /// Fan-out to every live player. Dead players get nothing further until
  /// their relay removes them.
  fn broadcast(&self, event: SimEvent) {
    for player in self.players.values() {
      if !player.alive {
        continue;
      }
      let _ = player.events.send(event.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::game::constants::{SPAWN_X, SPAWN_Y, TRAIL_BUFFER_LEN};
  use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

  fn spawn_point() -> Point {
    Point { x: SPAWN_X, y: SPAWN_Y }
  }

  fn join_default(world: &mut World, player_id: &str) -> UnboundedReceiver<SimEvent> {
    let (events, rx) = unbounded_channel();
    world.join(
      player_id.to_string(),
      events,
      spawn_point(),
      vec![spawn_point()],
    );
    rx
  }

  fn drain(rx: &mut UnboundedReceiver<SimEvent>) -> Vec<SimEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
      events.push(event);
    }
    events
  }

  fn game_over_count(events: &[SimEvent]) -> usize {
    events
      .iter()
      .filter(|event| matches!(event, SimEvent::GameOver))
      .count()
  }

  #[test]
  fn join_and_remove_replay_leaves_expected_players() {
    let mut world = World::new();
    let _rx1 = join_default(&mut world, "player-1");
    let _rx2 = join_default(&mut world, "player-2");
    let _rx3 = join_default(&mut world, "player-3");
    world.remove("player-2");

    assert_eq!(world.players.len(), 2);
    assert!(world.players.contains_key("player-1"));
    assert!(world.players.contains_key("player-3"));
    assert_eq!(world.join_order, vec!["player-1", "player-3"]);
  }

  #[test]
  fn remove_is_idempotent() {
    let mut world = World::new();
    let _rx = join_default(&mut world, "player-1");
    world.remove("player-1");
    let players_after_first = world.players.len();
    let order_after_first = world.join_order.clone();

    world.remove("player-1");

    assert_eq!(world.players.len(), players_after_first);
    assert_eq!(world.join_order, order_after_first);
  }

  #[test]
  fn straight_tick_moves_head_without_incident() {
    // Scenario: heading 0 at speed 3 from (300,300) lands at (303,300).
    let mut world = World::new();
    let mut rx = join_default(&mut world, "player-1");
    world.update_heading("player-1", 0.0);

    world.tick();

    let head = world.players["player-1"].head;
    assert_eq!(head.x, 303.0);
    assert_eq!(head.y, 300.0);

    let events = drain(&mut rx);
    assert_eq!(game_over_count(&events), 0);
    let position = events
      .iter()
      .find_map(|event| match event {
        SimEvent::Position { player_id, x, y, heading } => {
          Some((player_id.clone(), *x, *y, *heading))
        }
        _ => None,
      })
      .expect("position broadcast");
    assert_eq!(position, ("player-1".to_string(), 303.0, 300.0, 0.0));
  }

  #[test]
  fn consuming_a_pebble_scores_and_broadcasts_removal() {
    let mut world = World::new();
    let mut rx1 = join_default(&mut world, "player-1");
    let mut rx2 = {
      let (events, rx) = unbounded_channel();
      world.join(
        "player-2".to_string(),
        events,
        Point { x: 1000.0, y: 1000.0 },
        vec![Point { x: 1000.0, y: 1000.0 }],
      );
      rx
    };
    let pebble_id = world.spawn_pebble_at(303.0, 300.0);
    drain(&mut rx1);
    drain(&mut rx2);
    world.update_heading("player-1", 0.0);

    world.tick();

    assert_eq!(world.players["player-1"].score, 1);
    assert!(world.snapshot_pebbles().is_empty());

    let events1 = drain(&mut rx1);
    assert!(events1
      .iter()
      .any(|event| matches!(event, SimEvent::PebbleRemoved { id } if *id == pebble_id)));
    assert!(events1
      .iter()
      .any(|event| matches!(event, SimEvent::PointScored)));

    // Every other player in the room hears about the removal, but only the
    // consumer is credited.
    let events2 = drain(&mut rx2);
    assert!(events2
      .iter()
      .any(|event| matches!(event, SimEvent::PebbleRemoved { id } if *id == pebble_id)));
    assert!(!events2
      .iter()
      .any(|event| matches!(event, SimEvent::PointScored)));
  }

  #[test]
  fn pebble_ids_are_strictly_increasing_and_never_reused() {
    let mut world = World::new();
    let first = world.spawn_pebble_at(10.0, 10.0);
    let second = world.spawn_pebble_at(20.0, 20.0);
    let third = world.spawn_pebble_at(30.0, 30.0);
    assert_eq!((first, second, third), (1, 2, 3));

    let _rx = join_default(&mut world, "player-1");
    world.consume_pebble("player-1", second);
    let fourth = world.spawn_pebble_at(40.0, 40.0);
    assert_eq!(fourth, 4);

    let ids: Vec<u32> = world
      .snapshot_pebbles()
      .iter()
      .map(|pebble| pebble.id)
      .collect();
    assert_eq!(ids, vec![1, 3, 4]);
  }

  #[test]
  fn snapshot_returns_every_live_pebble() {
    let mut world = World::new();
    let positions = [(100.0, 200.0), (300.0, 400.0), (500.0, 600.0)];
    let mut expected = Vec::new();
    for (x, y) in positions {
      let id = world.spawn_pebble_at(x, y);
      expected.push(PebbleSnapshot { id, x, y });
    }

    assert_eq!(world.snapshot_pebbles(), expected);
  }

  #[test]
  fn overlapping_heads_kill_exactly_one_player() {
    // Scenario: two heads on the same spot. The player processed first in
    // join order observes the overlap and dies; the dead player immediately
    // leaves the collision set, so the other is unaffected.
    let mut world = World::new();
    let mut rx1 = join_default(&mut world, "player-1");
    let mut rx2 = join_default(&mut world, "player-2");

    world.tick();

    let events1 = drain(&mut rx1);
    assert_eq!(game_over_count(&events1), 1);
    assert!(!world.players["player-1"].alive);

    let events2 = drain(&mut rx2);
    assert_eq!(game_over_count(&events2), 0);
    assert!(world.players["player-2"].alive);
    assert_eq!(world.players["player-2"].head.x, 303.0);

    // A dead player is excluded from later ticks and hears nothing more.
    world.tick();
    assert_eq!(game_over_count(&drain(&mut rx1)), 0);
    assert!(drain(&mut rx1).is_empty());
    assert!(world.players["player-2"].alive);
    assert_eq!(world.players["player-2"].head.x, 306.0);
  }

  #[test]
  fn own_body_does_not_kill() {
    let mut world = World::new();
    let mut rx = join_default(&mut world, "player-1");
    // The starting segment overlaps the head completely.
    world.tick();
    assert_eq!(game_over_count(&drain(&mut rx)), 0);
    assert!(world.players["player-1"].alive);
  }

  #[test]
  fn border_collision_is_fatal() {
    let mut world = World::new();
    let (events, mut rx) = unbounded_channel();
    let near_border = Point {
      x: ARENA_SIZE - PLAYER_OBJECT_SIZE - 2.0,
      y: 300.0,
    };
    world.join("player-1".to_string(), events, near_border, vec![near_border]);
    world.update_heading("player-1", 0.0);

    world.tick();

    assert_eq!(game_over_count(&drain(&mut rx)), 1);
    assert!(!world.players["player-1"].alive);
    // The fatal collision aborts the movement for the tick.
    assert_eq!(world.players["player-1"].head.x, near_border.x);
  }

  #[test]
  fn add_segment_appends_at_head() {
    let mut world = World::new();
    let _rx = join_default(&mut world, "player-1");
    world.add_segment("player-1");

    let player = &world.players["player-1"];
    assert_eq!(player.segments.len(), 2);
    assert_eq!(player.segments[1].rect.position(), player.head.position());
  }

  #[test]
  fn add_segment_for_unknown_player_is_a_noop() {
    let mut world = World::new();
    world.add_segment("player-404");
    assert!(world.players.is_empty());
  }

  #[test]
  fn segments_trail_the_head_by_the_buffer_length() {
    let mut world = World::new();
    let mut rx = join_default(&mut world, "player-1");
    world.update_heading("player-1", 0.0);

    for _ in 0..TRAIL_BUFFER_LEN {
      world.tick();
    }
    // The buffer is full but nothing has been displaced yet.
    assert_eq!(world.players["player-1"].segments[0].rect.x, SPAWN_X);

    world.tick();
    // One more tick releases the oldest head position (the spawn point).
    assert_eq!(world.players["player-1"].segments[0].rect.x, SPAWN_X);
    world.tick();
    assert_eq!(
      world.players["player-1"].segments[0].rect.x,
      SPAWN_X + MOVE_SPEED
    );
    drain(&mut rx);
  }

  #[tokio::test]
  async fn handle_snapshot_degrades_to_empty_after_shutdown() {
    let simulation = SimulationHandle::spawn();
    let (events, _rx) = unbounded_channel();
    assert!(
      simulation
        .join("player-1", events, spawn_point(), vec![spawn_point()])
        .await
    );

    simulation.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(simulation.snapshot_pebbles().await.is_empty());
    // Shutdown is idempotent from the caller's side.
    simulation.shutdown().await;
  }
}
