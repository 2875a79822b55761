//! # PACS存储模块
//!
//! 负责影像二进制对象的存取，以及与长期影像归档服务之间的接口。

pub mod archive;
pub mod storage;

pub use archive::*;
pub use storage::*;
