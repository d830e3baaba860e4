pub mod local;
pub mod memory;
pub mod traits;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use traits::{get_json, put_json, Storage};
