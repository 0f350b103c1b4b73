pub mod bootstrap;
pub mod csr;
pub mod provision;

pub use bootstrap::bootstrap;
pub use provision::read_api_server_flags;
