use thiserror::Error;

/// Result type alias using StateError
pub type Result<T> = std::result::Result<T, StateError>;

// ========== Error Facility ==========

/// Canonical error kind taxonomy
///
/// Each kind maps to a stable error code that can be used for programmatic
/// error handling, testing, and external API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExErrorKind {
    // Lookup / lifecycle
    NotFound,
    NotAlive,
    AlreadyExists,
    InUse,

    // Concurrency
    ExcessiveContention,
    ReferenceRace,

    // Validation
    InvalidInput,
    InvalidConfig,
    InvalidBindings,
    WouldBreakRelation,
    StorageIncompatible,
    BaseUnsupported,
    QuotaLimitExceeded,
    ImmutableField,
    UnitInError,

    // Auth-like refusals
    Forbidden,

    // Internal
    Serialization,
    Internal,
}

impl ExErrorKind {
    /// Get the stable error code for this kind
    pub fn code(&self) -> &'static str {
        match self {
            ExErrorKind::NotFound => "ERR_NOT_FOUND",
            ExErrorKind::NotAlive => "ERR_NOT_ALIVE",
            ExErrorKind::AlreadyExists => "ERR_ALREADY_EXISTS",
            ExErrorKind::InUse => "ERR_IN_USE",
            ExErrorKind::ExcessiveContention => "ERR_EXCESSIVE_CONTENTION",
            ExErrorKind::ReferenceRace => "ERR_REFERENCE_RACE",
            ExErrorKind::InvalidInput => "ERR_INVALID_INPUT",
            ExErrorKind::InvalidConfig => "ERR_INVALID_CONFIG",
            ExErrorKind::InvalidBindings => "ERR_INVALID_BINDINGS",
            ExErrorKind::WouldBreakRelation => "ERR_WOULD_BREAK_RELATION",
            ExErrorKind::StorageIncompatible => "ERR_STORAGE_INCOMPATIBLE",
            ExErrorKind::BaseUnsupported => "ERR_BASE_UNSUPPORTED",
            ExErrorKind::QuotaLimitExceeded => "ERR_QUOTA_LIMIT_EXCEEDED",
            ExErrorKind::ImmutableField => "ERR_IMMUTABLE_FIELD",
            ExErrorKind::UnitInError => "ERR_UNIT_IN_ERROR",
            ExErrorKind::Forbidden => "ERR_FORBIDDEN",
            ExErrorKind::Serialization => "ERR_SERIALIZATION",
            ExErrorKind::Internal => "ERR_INTERNAL",
        }
    }

    /// Whether this kind is a deterministic validation failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ExErrorKind::InvalidInput
                | ExErrorKind::InvalidConfig
                | ExErrorKind::InvalidBindings
                | ExErrorKind::WouldBreakRelation
                | ExErrorKind::StorageIncompatible
                | ExErrorKind::BaseUnsupported
                | ExErrorKind::QuotaLimitExceeded
                | ExErrorKind::ImmutableField
                | ExErrorKind::UnitInError
        )
    }
}

/// Canonical structured error type
///
/// Flattened view of a [`StateError`] used by the logging facility and by
/// callers that only care about classification.
#[derive(Debug, Clone)]
pub struct ExError {
    kind: ExErrorKind,
    op: Option<String>,
    entity_id: Option<String>,
    message: String,
}

impl ExError {
    /// Create a new error with the specified kind
    pub fn new(kind: ExErrorKind) -> Self {
        Self {
            kind,
            op: None,
            entity_id: None,
            message: String::new(),
        }
    }

    /// Add operation context
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    /// Add entity ID context
    pub fn with_entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    /// Add custom message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn kind(&self) -> ExErrorKind {
        self.kind
    }

    /// Get the stable error code
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ExError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.code())?;
        if let Some(op) = &self.op {
            write!(f, " in operation '{}'", op)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(entity_id) = &self.entity_id {
            write!(f, " (entity_id: {})", entity_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExError {}

// ========== End Error Facility ==========

/// Error taxonomy for state operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    // ===== Lookup / lifecycle =====
    /// Entity, settings document or refcount is absent
    #[error("{entity} not found")]
    NotFound { entity: String },

    /// Operation requires a life state the entity has already left
    #[error("{entity} is not alive")]
    NotAlive { entity: String },

    #[error("{entity} already exists")]
    AlreadyExists { entity: String },

    /// Entity still has dependents that block the operation
    #[error("{message}")]
    InUse { message: String },

    // ===== Concurrency =====
    /// Retry budget exhausted
    #[error("state changing too quickly; try again soon")]
    ExcessiveContention,

    /// A counter vanished between read and decrement
    #[error("refcount {key:?} of {owner:?} was removed concurrently")]
    ReferenceRace { owner: String, key: String },

    // ===== Validation =====
    #[error("{message}")]
    InvalidArgument { message: String },

    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("invalid bindings: {message}")]
    InvalidBindings { message: String },

    #[error("would break relation \"{relation}\"")]
    WouldBreakRelation { relation: String },

    #[error("{reason} storage \"{name}\" removed")]
    StorageRemoved { name: String, reason: String },

    #[error("existing storage \"{name}\" {field} changed from {from} to {to}")]
    StorageChanged {
        name: String,
        field: String,
        from: String,
        to: String,
    },

    #[error("existing storage \"{name}\" range contracted: {message}")]
    StorageContracted { name: String, message: String },

    #[error("{message}")]
    StorageConstraint { message: String },

    #[error("base \"{base}\" not supported by charm, supported bases are: {supported}")]
    BaseUnsupported { base: String, supported: String },

    #[error("{message}")]
    QuotaLimitExceeded { message: String },

    #[error("{message}")]
    ImmutableField { message: String },

    #[error("unit \"{unit}\" is in an error state")]
    UnitInError { unit: String },

    // ===== Refusals =====
    #[error("{message}")]
    Forbidden { message: String },

    // ===== Internal =====
    #[error("serialization error: {message}")]
    Serialization { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    /// Operation context wrapped around an underlying cause
    #[error("cannot {context}: {source}")]
    Annotated {
        context: String,
        #[source]
        source: Box<StateError>,
    },
}

impl StateError {
    pub fn not_found(entity: impl Into<String>) -> Self {
        StateError::NotFound {
            entity: entity.into(),
        }
    }

    pub fn not_alive(entity: impl Into<String>) -> Self {
        StateError::NotAlive {
            entity: entity.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        StateError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Wrap this error with the operation that failed
    pub fn annotate(self, context: impl Into<String>) -> Self {
        StateError::Annotated {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost cause, skipping annotations
    pub fn root(&self) -> &StateError {
        match self {
            StateError::Annotated { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classification of the innermost cause
    pub fn kind(&self) -> ExErrorKind {
        match self.root() {
            StateError::NotFound { .. } => ExErrorKind::NotFound,
            StateError::NotAlive { .. } => ExErrorKind::NotAlive,
            StateError::AlreadyExists { .. } => ExErrorKind::AlreadyExists,
            StateError::InUse { .. } => ExErrorKind::InUse,
            StateError::ExcessiveContention => ExErrorKind::ExcessiveContention,
            StateError::ReferenceRace { .. } => ExErrorKind::ReferenceRace,
            StateError::InvalidArgument { .. } => ExErrorKind::InvalidInput,
            StateError::InvalidConfig { .. } => ExErrorKind::InvalidConfig,
            StateError::InvalidBindings { .. } => ExErrorKind::InvalidBindings,
            StateError::WouldBreakRelation { .. } => ExErrorKind::WouldBreakRelation,
            StateError::StorageRemoved { .. }
            | StateError::StorageChanged { .. }
            | StateError::StorageContracted { .. }
            | StateError::StorageConstraint { .. } => ExErrorKind::StorageIncompatible,
            StateError::BaseUnsupported { .. } => ExErrorKind::BaseUnsupported,
            StateError::QuotaLimitExceeded { .. } => ExErrorKind::QuotaLimitExceeded,
            StateError::ImmutableField { .. } => ExErrorKind::ImmutableField,
            StateError::UnitInError { .. } => ExErrorKind::UnitInError,
            StateError::Forbidden { .. } => ExErrorKind::Forbidden,
            StateError::Serialization { .. } => ExErrorKind::Serialization,
            StateError::Internal { .. } => ExErrorKind::Internal,
            StateError::Annotated { .. } => ExErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ExErrorKind::NotFound
    }

    pub fn is_not_alive(&self) -> bool {
        self.kind() == ExErrorKind::NotAlive
    }
}

/// Conversion from StateError to the structured ExError
impl From<StateError> for ExError {
    fn from(err: StateError) -> Self {
        let message = err.to_string();
        let ex = ExError::new(err.kind()).with_message(message);
        match err {
            StateError::Annotated { context, .. } => ex.with_op(context),
            StateError::NotFound { entity }
            | StateError::NotAlive { entity }
            | StateError::AlreadyExists { entity } => ex.with_entity_id(entity),
            StateError::ReferenceRace { owner, key } => {
                ex.with_entity_id(format!("{}#{}", owner, key))
            }
            _ => ex,
        }
    }
}

impl From<&StateError> for ExError {
    fn from(err: &StateError) -> Self {
        err.clone().into()
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for StateError {
    fn from(err: toml::de::Error) -> Self {
        StateError::Serialization {
            message: err.to_string(),
        }
    }
}
