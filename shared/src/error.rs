use thiserror::Error;

/// Failures reported by either backing store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// I/O, connection or query failure. Callers assume nothing was applied.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A version or stock guard matched no row; nothing was applied.
    #[error("optimistic lock conflict")]
    OptimisticLockConflict,

    #[error("stock cannot be negative: {0}")]
    InvalidStock(i32),
}

/// Outcome of a rejected `purchase` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PurchaseError {
    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i32),

    #[error("duplicate request")]
    DuplicateRequest,

    #[error("insufficient stock")]
    InsufficientStock,

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    #[error("admission queue is closed")]
    QueueClosed,
}

impl PurchaseError {
    /// True for failures the caller did not cause and cannot fix by changing the request.
    pub fn is_internal(&self) -> bool {
        matches!(self, PurchaseError::StoreUnavailable(_) | PurchaseError::QueueClosed)
    }
}
