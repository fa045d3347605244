// 网盘API模块

pub mod api;
pub mod memory;
pub mod types;

pub use api::PanApi;
pub use memory::{CallStats, MemoryPanClient};
pub use types::*;
