pub mod locks;
pub mod mxid;
pub mod storage;

pub use mxid::{MatrixId, MxidError};
pub use storage::StorageExt;
