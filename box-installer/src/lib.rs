pub mod api;
pub mod lock;
