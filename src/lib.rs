pub mod core;
pub mod player;
