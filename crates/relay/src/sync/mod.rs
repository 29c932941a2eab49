pub mod resolver;
pub mod sequencer;
pub mod snapshot;
