pub mod intake;
pub mod extraction;
pub mod detection;
pub mod ledger; // Batch ledger + retention guard
pub mod orchestrator;
pub mod channel; // Token registry, event streams
