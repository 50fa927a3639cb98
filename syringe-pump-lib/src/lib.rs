pub mod device;
pub mod driver;
pub mod port;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;
