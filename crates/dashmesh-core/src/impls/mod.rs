//! Port implementations.
//!
//! - `InMemoryStore`: shared store for tests, demos and single-process meshes
//! - `DockerExecutor`: runs payloads through the docker CLI
//! - `EchoExecutor`: development executor
//! - `StaticIdentity`: fixed identity provider

pub mod docker_executor;
pub mod echo_executor;
pub mod inmem_store;
pub mod static_identity;
pub mod system;

pub use self::docker_executor::DockerExecutor;
pub use self::echo_executor::EchoExecutor;
pub use self::inmem_store::{InMemoryStore, StoreClient};
pub use self::static_identity::StaticIdentity;
pub use self::system::detect_system_metadata;
