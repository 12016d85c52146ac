pub mod daemon;
pub mod membership;
pub mod settings;
pub mod storage;
pub mod sync;
