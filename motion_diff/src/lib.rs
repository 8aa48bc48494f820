// THEORY:
// This file is the entry point of the `motion_diff` library crate.
//
// The crate highlights motion between consecutive video frames by recoloring the
// regions that changed, with the frame sequence split across a cluster of cooperating
// endpoints. The public surface is the `Coordinator`, which runs one endpoint of a
// pass, plus the pieces a caller wires into it:
// - a `Fabric` to talk over (`LocalFabric` runs a whole cluster in one process),
// - a `PassConfig`,
// - a `VideoAssembler` for the final video.
//
// The algorithms (`core_modules`) and the message passing (`fabric`) are public too,
// so they can be used and tested on their own.

pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod core_modules;
pub mod diff_pool;
pub mod distributor;
pub mod error;
pub mod fabric;

pub use collaborators::{AssemblyRequest, FrameExtractor, NoAssembly, VideoAssembler};
pub use config::{BackgroundPolicy, DiffConfig, PassConfig, TransportConfig};
pub use coordinator::{COLLECTOR, Coordinator, EndpointState, PassReport};
pub use core_modules::diff_engine::{DiffEngine, DiffFrame, Region, diff_frames};
pub use core_modules::frame::{DecodeError, Frame};
pub use core_modules::manifest::Manifest;
pub use core_modules::partition::WorkRange;
pub use error::{PassError, Result};
pub use fabric::local::LocalFabric;
pub use fabric::transport::{ChunkedTransport, TransferError};
pub use fabric::{Fabric, FabricError, Rank, Tag};
