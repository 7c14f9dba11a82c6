//! Consensus: the propose/ack/commit round driver.

pub mod engine;

pub use engine::{
    ConsensusConfig, ConsensusEngine, ConsensusHandle, ConsensusInput, ConsensusOutput, Phase,
};
