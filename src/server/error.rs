use thiserror::Error;

/// Request-level error taxonomy. The HTTP layer maps each variant onto a
/// status code; the detector and workers treat the permission/conflict
/// variants as silent skips instead.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    RateLimited(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ServiceError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::Validation(_) => 400,
            ServiceError::Unauthorized => 401,
            ServiceError::Forbidden(_) => 403,
            ServiceError::NotFound(_) => 404,
            ServiceError::Conflict(_) => 409,
            ServiceError::RateLimited(_) => 429,
            ServiceError::Database(_) => 500,
        }
    }
}

/// True when a sqlx error is a unique-constraint violation. Duplicate
/// reactions are detected through this.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(ServiceError::Validation("bad".into()).status_code(), 400);
        assert_eq!(ServiceError::Unauthorized.status_code(), 401);
        assert_eq!(ServiceError::Forbidden("no".into()).status_code(), 403);
        assert_eq!(ServiceError::NotFound("message").status_code(), 404);
        assert_eq!(ServiceError::Conflict("dup".into()).status_code(), 409);
        assert_eq!(ServiceError::RateLimited("cap".into()).status_code(), 429);
    }
}
