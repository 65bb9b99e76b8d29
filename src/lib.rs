pub mod auth;
pub mod config;
pub mod dkim;
pub mod dmarc;
pub mod dns;
pub mod domain;
pub mod error;
pub mod org_domain;
pub mod spf;
pub mod trace;

pub use auth::{AuthRequest, AuthenticationVerdict, Authenticator, DkimSignatureRef};
pub use config::EngineConfig;
pub use dns::{DnsLookup, DnsResolver};
pub use domain::DomainName;
pub use error::ErrorClass;
pub use spf::{SpfRequest, SpfResult};
