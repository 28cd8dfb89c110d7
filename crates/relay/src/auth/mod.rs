pub mod credential;
pub mod jwt;
pub mod middleware;
