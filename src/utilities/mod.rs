pub mod collections;
pub mod memory;
pub mod thread_dispatcher;

pub use self::collections::*;
pub use self::memory::*;
pub use self::thread_dispatcher::*;
