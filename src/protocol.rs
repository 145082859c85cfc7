use serde::{Deserialize, Serialize};

/// Messages sent to a client over its websocket connection, tagged by
/// `message_type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "message_type")]
pub enum ServerMessage {
  #[serde(rename = "youare")]
  YouAre { player_id: String },
  #[serde(rename = "new_player")]
  NewPlayer {
    player_id: String,
    payload: PlayerInfo,
  },
  #[serde(rename = "disconnect")]
  Disconnect { player_id: String },
  #[serde(rename = "pos")]
  Position {
    x: f64,
    y: f64,
    t: f64,
    player_id: String,
  },
  #[serde(rename = "pebble")]
  Pebble {
    x: f64,
    y: f64,
    resource_id: u32,
  },
  #[serde(rename = "pebble-remove")]
  PebbleRemove { resource_id: u32 },
  #[serde(rename = "add_part")]
  AddPart { player_id: String },
  #[serde(rename = "game_over")]
  GameOver {},
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerInfo {
  pub color: String,
}

/// The only message clients send: their current heading angle in radians.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ClientInput {
  pub t: f64,
}
