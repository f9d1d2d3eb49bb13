pub mod data;
pub mod health;
pub mod runs;
pub mod trigger;
