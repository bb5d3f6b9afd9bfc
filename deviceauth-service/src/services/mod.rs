//! Services layer for deviceauth-service.
//!
//! Tenant resolution, storage backends, the device state machine and the
//! token signing capability.

pub mod context;
mod database;
mod devauth;
pub mod error;
mod jwt;
mod memory;
pub mod metrics;
pub mod store;
pub mod tenantadm;

pub use context::{Namespace, RequestContext, TenantId, DEFAULT_BASE_NAMESPACE};
pub use database::MongoStore;
pub use devauth::{DevAuth, DevAuthSettings, TenantScope, DEFAULT_TOKEN_EXPIRY_SECONDS};
pub use error::{DevAuthError, ErrorKind};
pub use jwt::{DeviceClaims, JwtSigner, TokenSigner};
pub use memory::MemoryStore;
pub use self::metrics::{get_metrics, init_metrics};
pub use store::{AuthSetFilter, DataStore, DeviceUpdate, StoreError, TokenFilter};
pub use tenantadm::{StaticTenantVerifier, TenantAdmClient, TenantAdmError, TenantVerifier};
