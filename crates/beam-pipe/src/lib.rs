//! Beam pipe layer.
//!
//! Two peers sharing nothing but a passphrase meet through a discovery
//! substrate and get one end-to-end encrypted duplex byte stream.
//!
//! Derivation: blake3 over a versioned, length-prefixed encoding.
//! Transport: X25519 + ChaCha20-Poly1305 via `beam-transport`.
//! Discovery: mainline DHT via `beam-dht`, or in-memory for tests.

pub mod config;
pub mod derive;
pub mod error;
pub mod memory;
pub mod rendezvous;
pub mod secret;
pub mod substrate;
pub mod swarm;
pub mod tunnel;

pub use config::{BeamConfig, Clock, ManualClock, SystemClock, LONG_DRIFT, SHORT_DRIFT};
pub use derive::{accepts, KeyDerivation, Role, Topic};
pub use error::BeamError;
pub use memory::{MemoryNetwork, MemoryNode};
pub use rendezvous::RendezvousState;
pub use secret::SharedSecret;
pub use substrate::{CandidateTransport, Discovery, Listening, PeerRecord, RemoteAddress};
pub use swarm::{Swarm, SwarmConfig};
pub use tunnel::{Beam, BeamHandle, BeamReader, BeamWriter, PipeEvent, PipeState};
