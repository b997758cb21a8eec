//! Runtime values: the tagged `Value` enum, heap-allocated payloads,
//! closures, and the recycling pools backing frames and list storage.

pub mod closure;
pub mod heap;
pub mod pool;

pub use closure::{CallTarget, FuncAddr, FuncPtr};
pub use heap::{HeapObject, ListStorage, Value};
pub use pool::{Pool, PoolStats, Recycle};
