//! Precondition checks.
//!
//! Each check reads through the unit of work, so it sees the same snapshot the
//! mutations will run against, and reports a negative outcome as a value rather
//! than an error. The coordinator decides what a negative outcome means.

use chrono::NaiveDate;
use serde::Serialize;

use crate::error::TxError;
use crate::model::AlbumId;
use crate::uow::UnitOfWork;

/// Outcome of a precondition check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PreconditionResult {
    /// Rule holds. `observed` is the value the rule was evaluated against.
    Satisfied { observed: i64 },
    /// Rule does not hold
    Violated { reason: String },
    /// Target entity does not exist
    Missing { entity: &'static str, id: String },
}

impl PreconditionResult {
    pub fn satisfied(observed: i64) -> Self {
        Self::Satisfied { observed }
    }

    pub fn violated(reason: impl Into<String>) -> Self {
        Self::Violated {
            reason: reason.into(),
        }
    }

    pub fn missing(entity: &'static str, id: impl ToString) -> Self {
        Self::Missing {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied { .. })
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Satisfied { .. } => None,
            Self::Violated { reason } => Some(reason.clone()),
            Self::Missing { entity, id } => Some(format!("no such {} {}", entity, id)),
        }
    }

    /// Observed value for a satisfied check, or the error a caller should see
    pub fn into_result(self) -> Result<i64, TxError> {
        match self {
            Self::Satisfied { observed } => Ok(observed),
            Self::Violated { reason } => Err(TxError::PreconditionViolated { reason }),
            Self::Missing { entity, id } => Err(TxError::NotFound { entity, id }),
        }
    }
}

/// `available quantity >= requested quantity` for one album.
///
/// Satisfied results carry the available quantity.
pub async fn check_inventory(
    uow: &mut UnitOfWork,
    album: AlbumId,
    requested: i64,
) -> Result<PreconditionResult, TxError> {
    let Some(available) = uow.album_quantity(album).await? else {
        return Ok(PreconditionResult::missing(AlbumId::LABEL, album));
    };
    if available < requested {
        return Ok(PreconditionResult::violated(format!(
            "insufficient quantity: requested {}, available {}",
            requested, available
        )));
    }
    Ok(PreconditionResult::satisfied(available))
}

/// At least one project started on or after `since`.
///
/// Satisfied results carry the number of matching projects, which the raise
/// must then update exactly.
pub async fn check_budget_targets(
    uow: &mut UnitOfWork,
    since: NaiveDate,
) -> Result<PreconditionResult, TxError> {
    let count = uow.count_projects_since(since).await?;
    if count == 0 {
        return Ok(PreconditionResult::violated(format!(
            "no projects started on or after {}",
            since
        )));
    }
    Ok(PreconditionResult::satisfied(count as i64))
}
