pub mod agents;
pub mod blocks;
pub mod jobs;
pub mod liveness;
pub mod ports;
pub mod results;

#[cfg(test)]
pub(crate) mod test_support;
