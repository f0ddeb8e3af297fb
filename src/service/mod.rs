pub mod engine;
pub mod host;
pub mod manager;
pub mod storage;
pub mod tcp;

pub use engine::{Engine, EngineConfig, EngineFactory};
pub use host::ServiceHost;
pub use manager::ServiceManager;
pub use storage::StorageHandle;
pub use tcp::{TcpEngineFactory, TcpLinkEngine};
