//! Networking for Taskmesh — libp2p swarm, peer directory, and chunked
//! payload distribution. Provider discovery rides the swarm's Kademlia
//! behaviour; provider records are keyed by task hash.

pub mod distribution;
pub mod swarm;
pub mod transport;
