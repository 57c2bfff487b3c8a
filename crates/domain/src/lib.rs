//! 聊天中枢核心领域模型
//!
//! 包含连接、房间、主体标识，以及在实时连接上交换的信封格式。

pub mod envelope;
pub mod errors;
pub mod subject;
pub mod value_objects;

// 重新导出常用类型
pub use envelope::*;
pub use errors::*;
pub use subject::*;
pub use value_objects::*;
