pub mod process;
pub mod store;

pub use process::ProcessBackend;
pub use store::NodeStore;
