use axum::{
  extract::{Query, State, WebSocketUpgrade},
  http::{Method, StatusCode},
  response::IntoResponse,
  routing::{get, post},
  Json, Router,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

mod game;
mod protocol;
mod registry;
mod relay;
mod shared;

use registry::RegistryHandle;
use shared::color::{is_valid_color, DEFAULT_COLOR};

#[derive(Clone)]
struct AppState {
  registry: RegistryHandle,
}

#[derive(Debug, Serialize)]
struct NewRoomResponse {
  room_id: String,
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
  rk: Option<String>,
  color: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let state = Arc::new(AppState {
    registry: RegistryHandle::spawn(),
  });

  let cors = CorsLayer::new()
    .allow_origin(Any)
    .allow_methods([Method::GET, Method::POST])
    .allow_headers(Any);

  let app: Router = Router::new()
    .route("/make_room", post(make_room))
    .route("/ws", get(ws_handler))
    .layer(cors)
    .with_state(state);

  let port: u16 = env::var("PORT")
    .ok()
    .and_then(|value| value.parse().ok())
    .unwrap_or(8090);
  let address = format!("0.0.0.0:{port}");
  tracing::info!("listening on {address}");

  let listener = tokio::net::TcpListener::bind(&address).await?;
  axum::serve(listener, app).await?;

  Ok(())
}

async fn make_room(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  match state.registry.create_room().await {
    Some(room) => (
      StatusCode::CREATED,
      Json(NewRoomResponse { room_id: room.key }),
    )
      .into_response(),
    None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
  }
}

async fn ws_handler(
  ws: WebSocketUpgrade,
  Query(params): Query<ConnectQuery>,
  State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
  let Some(room_key) = params.rk else {
    return StatusCode::BAD_REQUEST.into_response();
  };

  let color = params.color.unwrap_or_else(|| DEFAULT_COLOR.to_string());
  if !is_valid_color(&color) {
    tracing::error!(%color, "invalid color code given");
    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
  }

  // Lookup is bounded inside the registry handle; an unresponsive registry
  // reads the same as an unknown key.
  let Some(room) = state.registry.get_room(&room_key).await else {
    tracing::error!(room_id = %room_key, "room not found");
    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
  };

  let registry = state.registry.clone();
  ws.on_upgrade(move |socket| relay::handle_socket(socket, room, registry, color))
    .into_response()
}
