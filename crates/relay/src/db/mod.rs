pub mod dialect;
pub mod pool;
