pub mod events;
pub mod guest;
pub mod peer;
pub mod proxy;
pub mod registry;
pub mod system;
pub mod transport;

#[cfg(test)]
mod mock_transport;
