pub mod constants;
pub mod geometry;
pub mod simulation;
pub mod trail;
