#[cfg(feature = "afc")]
pub mod afc;
#[cfg(feature = "debug_proxy")]
pub mod debug_proxy;
#[cfg(feature = "installation_proxy")]
pub mod installation_proxy;
