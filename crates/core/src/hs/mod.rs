mod address;
mod cache;
mod client;
mod descriptor;
mod hsdir;

pub use address::OnionAddress;
pub use cache::DescriptorCache;
pub use client::{BuilderLauncher, CircuitLauncher, HsClient};
pub use descriptor::{blinded_pubkey, descriptor_id, time_period, Descriptor, IntroPoint};
pub use hsdir::{closest_hsdirs, responsible_hsdirs, xor_distance};
