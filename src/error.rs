use thiserror::Error;

/// Resource kinds a quota denial can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    ApiRequests,
    Storage,
    RateLimit,
}

impl std::fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaResource::ApiRequests => write!(f, "api_requests"),
            QuotaResource::Storage => write!(f, "storage"),
            QuotaResource::RateLimit => write!(f, "rate_limit"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not leader, current leader: {leader}", leader = .leader_addr.as_deref().unwrap_or("unknown"))]
    NotLeader { leader_addr: Option<String> },

    #[error("quorum not reached: {0}")]
    Quorum(String),

    #[error("no capacity: {0}")]
    NoCapacity(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota exceeded for {resource}: {current}/{limit}")]
    Quota {
        resource: QuotaResource,
        current: u64,
        limit: u64,
    },

    #[error("verification token invalid")]
    TokenInvalid,

    #[error("snapshot version {found} newer than supported {supported}")]
    SnapshotVersion { found: u32, supported: u32 },

    #[error("snapshot checksum mismatch: expected {expected}, computed {computed}")]
    Checksum { expected: String, computed: String },

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("apply error: {0}")]
    Apply(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

impl PlatformError {
    /// True for failures worth retrying at the RPC layer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlatformError::Network(_) | PlatformError::Timeout(_) | PlatformError::Quorum(_)
        )
    }
}
