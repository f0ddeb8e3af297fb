// Modules
mod cache;
mod coordinator;
mod directory;
mod probe;
mod utils;

// Public exports
pub use cache::DiscoveryCache;
pub use coordinator::{DiscoveryCoordinator, DiscoveryRequest};
pub use directory::{parse_seed_json, JsonSeedDirectory, SeedDirectory, StaticSeedDirectory};
pub use probe::{NetworkProbe, PeerProbe, ProbeError};
