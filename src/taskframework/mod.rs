//! 任务执行框架
//!
//! 通用的有界并发执行器，负责调度、重试和失败收集；
//! 失败原因的判断交给任务单元自己

pub mod executor;
pub mod task;

pub use executor::TaskExecutor;
pub use task::{LostTask, TaskInfo, TaskInfoItem, TaskUnit, TaskUnitRunResult};
