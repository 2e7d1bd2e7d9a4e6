//! In-memory LDAPv3 directory server for integration tests.
//!
//! Start one from a [`Config`] with [`LdapServer::from_config`], or wire a
//! [`Directory`] and an [`InterceptorChain`] by hand and call [`LdapServer::new`].

pub mod config;
pub mod directory;
pub mod dn;
pub mod entry;
pub mod filter;
pub mod interceptor;
pub mod ldap_protocol;
pub mod metrics;
pub mod schema;
pub mod server;
pub mod session;
pub mod tls;

pub use config::Config;
pub use directory::{Directory, DirectoryConfig, DirectoryError};
pub use dn::Dn;
pub use entry::Entry;
pub use filter::Filter;
pub use interceptor::{Interceptor, InterceptorChain};
pub use metrics::{run_metrics_server, Metrics};
pub use server::{LdapServer, ServerHandle, ServerOptions};
