pub mod events;
pub mod files;
pub mod runs;
pub mod threads;
