pub mod config;
pub mod transport;
pub mod util;

#[cfg(test)]
pub mod test_util;
