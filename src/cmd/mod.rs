//! CLI command implementations.
//!
//! | Module    | Commands handled     |
//! |-----------|----------------------|
//! | `serve`   | `Serve`              |
//! | `init`    | `Init`               |
//! | `import`  | `Import`             |
//! | `config`  | `Config`             |

pub mod config;
pub mod import;
pub mod init;
pub mod serve;

pub use config::cmd_config;
pub use import::cmd_import;
pub use init::cmd_init;
pub use serve::cmd_serve;
