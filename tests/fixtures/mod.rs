//! Test fixtures

mod two_peer;

pub use two_peer::{Peer, TwoPeerFixture, wait_for};
