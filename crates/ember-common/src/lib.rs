// Shared identifiers and the tenant snapshot record used across crates.
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
}

pub mod ids {
    // Strongly typed IDs so node names and connection ids never mix.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! uuid_id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    uuid_id_type!(ConnectionId);
    uuid_id_type!(ManagerId);

    /// Cluster node name. Nodes are addressed by operator-chosen names
    /// (`node-1`, `eu-west-a`), not generated ids.
    #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct NodeId(String);

    impl NodeId {
        pub fn new(name: impl Into<String>) -> Result<Self> {
            let name = name.into();
            let trimmed = name.trim();
            if trimmed.is_empty() || trimmed.contains(',') {
                return Err(Error::InvalidId(name));
            }
            Ok(Self(trimmed.to_string()))
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl fmt::Display for NodeId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl FromStr for NodeId {
        type Err = Error;

        fn from_str(input: &str) -> Result<Self> {
            Self::new(input)
        }
    }
}

/// Database connection parameters for a tenant.
///
/// Credentials are stored encrypted upstream; the password here is whatever
/// the tenant store hands over and is never printed by `Debug`.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub ssl: bool,
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("ssl", &self.ssl)
            .finish_non_exhaustive()
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            name: "postgres".into(),
            user: "postgres".into(),
            password: String::new(),
            ssl: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantLimits {
    // Ceiling on server-side connections the tenant database accepts from us.
    pub max_connections: u32,
    // Connections one manager opens against the tenant database.
    pub pool_size: u32,
    pub max_concurrent_users: u32,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_connections: 100,
            pool_size: 2,
            max_concurrent_users: 200,
        }
    }
}

/// Read-only tenant snapshot fetched on every connection attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tenant {
    pub tenant_id: String,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub limits: TenantLimits,
}

impl Tenant {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            suspended: false,
            database: DatabaseSettings::default(),
            limits: TenantLimits::default(),
        }
    }

    pub fn with_suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    pub fn with_limits(mut self, limits: TenantLimits) -> Self {
        self.limits = limits;
        self
    }
}
