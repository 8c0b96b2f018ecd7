//! 数据传输对象

pub mod models;
