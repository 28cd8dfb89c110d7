// liao-common: shared types and pure helpers for the liao broker workspace

pub mod conversation;
pub mod history;
pub mod preview;
pub mod types;
pub mod value;
