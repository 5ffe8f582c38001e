// End-to-end harness: a scripted mock node and miner clients around a loopback relay

pub mod mocks;
pub mod utils;

pub use mocks::{MockNode, NodeLink};
pub use utils::{eventually, login_frame, test_config, MinerClient, TestRelay};
