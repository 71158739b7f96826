//! Secure DFU request handling core for BlueBuzzah devices.

pub mod dfu;
pub mod traits;

#[cfg(test)]
mod test_helpers;
