mod kdf;
mod layers;
mod ntor;

pub use kdf::HopKeys;
pub use layers::{HopCrypto, LayerCipher, RunningDigest};
pub use ntor::{respond, NtorClient};
