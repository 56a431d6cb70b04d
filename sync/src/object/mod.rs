mod object_data;
mod storage;

pub use object_data::{DeferredHooks, ObjectData, VarDescriptor};
pub use storage::ObjectDataStorage;
