//! Seed peer: serves its files to other peers and downloads what it lacks.
//! The tracker says who holds a file; the bytes travel peer to peer over Go-Back-N UDP.

pub mod catalog;
pub mod config;
pub mod listener;
pub mod peer;
pub mod requester;
pub mod tracker_client;

pub use catalog::{Catalog, CatalogError};
pub use config::PeerConfig;
pub use listener::PeerListener;
pub use peer::{FetchError, FetchOutcome, Peer, PeerError};
pub use requester::{PeerRequester, TransferError, TransferOutcome};
pub use tracker_client::{ControlSettings, TrackerClient, TrackerClientError};
