pub const ARENA_SIZE: f64 = 5000.0;
pub const BORDER_THICKNESS: f64 = 1.0;
pub const PLAYER_OBJECT_SIZE: f64 = 128.0;
pub const PEBBLE_OBJECT_SIZE: f64 = 64.0;
pub const MOVE_SPEED: f64 = 3.0;
pub const SPAWN_X: f64 = 300.0;
pub const SPAWN_Y: f64 = 300.0;
pub const TRAIL_BUFFER_LEN: usize = 15;
pub const TICK_RATE_HZ: u32 = 30;
pub const PEBBLE_SPAWN_MS: u64 = 250;
pub const POINTS_PER_SEGMENT: u32 = 3;
pub const SWEEP_INTERVAL_MS: u64 = 2000;
pub const NOTIFY_TIMEOUT_MS: u64 = 1000;
pub const REQUEST_TIMEOUT_MS: u64 = 1000;
pub const MAX_INPUT_ERRORS: u32 = 10;
pub const SIMULATION_QUEUE_DEPTH: usize = 64;
pub const REGISTRY_QUEUE_DEPTH: usize = 64;
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;
