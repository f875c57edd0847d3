/// Courier Crypto Library
///
/// - HMAC-SHA256 webhook signatures (inbound verification, CRM forward signing)
/// - AES-256-GCM sealing of per-account send credentials

pub mod credentials;
pub mod keys;
pub mod signature;
