//! Error taxonomy for the indexing runtime.
//!
//! Every error that can reach the sync loop is classified into one of three
//! groups: `User` (non-retryable, halts the triggering event),
//! `Infra` (retryable with backoff, escalates to `Fatal` past a cap), and
//! `Fatal` (design-invariant violation, shuts the process down).

use std::fmt;

use crate::checkpoint::Checkpoint;

/// Context carried by every error so the indexing loop can render the
/// "event checkpoint, source name, pretty-printed argument object" the
/// spec requires for user-visible output.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub checkpoint: Option<Checkpoint>,
    pub source: Option<String>,
    pub detail: String,
}

impl ErrorContext {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            checkpoint: None,
            source: None,
            detail: detail.into(),
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.detail)?;
        if let Some(source) = &self.source {
            write!(f, " (source={source})")?;
        }
        if let Some(checkpoint) = &self.checkpoint {
            write!(f, " (checkpoint={checkpoint})")?;
        }
        Ok(())
    }
}

/// Non-retryable errors surfaced from user-facing store methods.
#[derive(Debug, Clone)]
pub enum UserError {
    Build(ErrorContext),
    Shutdown(ErrorContext),
    UniqueConstraint(ErrorContext),
    NotNullConstraint(ErrorContext),
    CheckConstraint(ErrorContext),
    RecordNotFound(ErrorContext),
    BigIntSerialization(ErrorContext),
    InvalidStoreMethod(ErrorContext),
    UndefinedTable(ErrorContext),
}

impl UserError {
    fn context(&self) -> &ErrorContext {
        match self {
            UserError::Build(c)
            | UserError::Shutdown(c)
            | UserError::UniqueConstraint(c)
            | UserError::NotNullConstraint(c)
            | UserError::CheckConstraint(c)
            | UserError::RecordNotFound(c)
            | UserError::BigIntSerialization(c)
            | UserError::InvalidStoreMethod(c)
            | UserError::UndefinedTable(c) => c,
        }
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UserError::Build(_) => "BuildError",
            UserError::Shutdown(_) => "ShutdownError",
            UserError::UniqueConstraint(_) => "UniqueConstraintError",
            UserError::NotNullConstraint(_) => "NotNullConstraintError",
            UserError::CheckConstraint(_) => "CheckConstraintError",
            UserError::RecordNotFound(_) => "RecordNotFoundError",
            UserError::BigIntSerialization(_) => "BigIntSerializationError",
            UserError::InvalidStoreMethod(_) => "InvalidStoreMethod",
            UserError::UndefinedTable(_) => "UndefinedTable",
        };
        write!(f, "{name}: {}", self.context())
    }
}

/// Retryable errors from infrastructure (DB connection, RPC transport).
#[derive(Debug, Clone)]
pub enum InfraError {
    DbConnection(ErrorContext),
    TransactionStatement(ErrorContext),
    CopyFlush(ErrorContext),
    Rpc(ErrorContext),
    Timeout(ErrorContext),
}

impl InfraError {
    fn context(&self) -> &ErrorContext {
        match self {
            InfraError::DbConnection(c)
            | InfraError::TransactionStatement(c)
            | InfraError::CopyFlush(c)
            | InfraError::Rpc(c)
            | InfraError::Timeout(c) => c,
        }
    }
}

impl fmt::Display for InfraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InfraError::DbConnection(_) => "DbConnectionError",
            InfraError::TransactionStatement(_) => "TransactionStatementError",
            InfraError::CopyFlush(_) => "CopyFlushError",
            InfraError::Rpc(_) => "RpcError",
            InfraError::Timeout(_) => "TimeoutError",
        };
        write!(f, "{name}: {}", self.context())
    }
}

/// Fatal, design-invariant violations. No partial recovery is attempted.
#[derive(Debug, Clone)]
pub enum FatalError {
    DeepReorg(ErrorContext),
    MalformedCachedData(ErrorContext),
    SchemaMismatch(ErrorContext),
}

impl FatalError {
    fn context(&self) -> &ErrorContext {
        match self {
            FatalError::DeepReorg(c)
            | FatalError::MalformedCachedData(c)
            | FatalError::SchemaMismatch(c) => c,
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FatalError::DeepReorg(_) => "DeepReorgError",
            FatalError::MalformedCachedData(_) => "MalformedCachedDataError",
            FatalError::SchemaMismatch(_) => "SchemaMismatchError",
        };
        write!(f, "{name}: {}", self.context())
    }
}

#[derive(Debug, Clone)]
pub enum IndexerError {
    User(UserError),
    Infra(InfraError),
    Fatal(FatalError),
}

impl IndexerError {
    /// Whether the indexing loop should retry this error with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexerError::Infra(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, IndexerError::Fatal(_))
    }

    /// Escalate a retryable error to fatal once the retry cap is exceeded.
    pub fn escalate(self) -> IndexerError {
        match self {
            IndexerError::Infra(infra) => IndexerError::Fatal(FatalError::SchemaMismatch(
                ErrorContext::new(format!("retry cap exceeded: {infra}")),
            )),
            other => other,
        }
    }
}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexerError::User(e) => write!(f, "{e}"),
            IndexerError::Infra(e) => write!(f, "{e}"),
            IndexerError::Fatal(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for IndexerError {}

impl From<UserError> for IndexerError {
    fn from(value: UserError) -> Self {
        IndexerError::User(value)
    }
}

impl From<InfraError> for IndexerError {
    fn from(value: InfraError) -> Self {
        IndexerError::Infra(value)
    }
}

impl From<FatalError> for IndexerError {
    fn from(value: FatalError) -> Self {
        IndexerError::Fatal(value)
    }
}

impl From<sqlx::Error> for IndexerError {
    fn from(value: sqlx::Error) -> Self {
        match &value {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                InfraError::DbConnection(ErrorContext::new(value.to_string())).into()
            }
            sqlx::Error::RowNotFound => {
                UserError::RecordNotFound(ErrorContext::new(value.to_string())).into()
            }
            _ => InfraError::TransactionStatement(ErrorContext::new(value.to_string())).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_source_and_checkpoint() {
        let ctx = ErrorContext::new("missing column `amount`")
            .with_source("erc20:Transfer")
            .with_checkpoint(Checkpoint::new(1, 2, 3, 0, 0, 0));
        let err = IndexerError::User(UserError::NotNullConstraint(ctx));
        let rendered = err.to_string();
        assert!(rendered.contains("NotNullConstraintError"));
        assert!(rendered.contains("erc20:Transfer"));
    }

    #[test]
    fn infra_errors_are_retryable_user_errors_are_not() {
        let infra = IndexerError::Infra(InfraError::Timeout(ErrorContext::new("t")));
        let user = IndexerError::User(UserError::UniqueConstraint(ErrorContext::new("u")));
        assert!(infra.is_retryable());
        assert!(!user.is_retryable());
    }

    #[test]
    fn escalation_turns_infra_into_fatal() {
        let infra = IndexerError::Infra(InfraError::DbConnection(ErrorContext::new("down")));
        assert!(infra.escalate().is_fatal());
    }
}
