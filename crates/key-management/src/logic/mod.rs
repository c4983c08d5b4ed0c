// Envelope encryption core
// Key proxies and providers, canary based key identification, the key set, and the
// services built on top of it (retrying encrypt/decrypt, rotation, startup checks)

pub mod canary;
pub mod canary_mapper;
pub mod detector;
pub mod encrypted_value;
pub mod key_proxy;
pub mod key_set;
pub mod provider;
pub mod retrying;
pub mod rotator;
