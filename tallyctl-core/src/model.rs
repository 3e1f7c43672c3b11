//! Domain types: identifiers, mutation requests and read-only projections.
//!
//! Requests are validated on construction and immutable afterwards. Projections
//! mirror table rows and are never written back directly; the only way state
//! changes is through a [`Statement`](crate::store::Statement) executed inside a
//! unit of work.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
            sqlx::Type,
        )]
        #[sqlx(transparent)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub const LABEL: &'static str = $label;

            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

id_type!(
    /// Primary key of an `album` row.
    AlbumId,
    "album"
);
id_type!(
    /// Primary key of a `projects` row.
    ProjectId,
    "project"
);
id_type!(
    /// Customer placing an order. Only recorded for auditing.
    CustomerId,
    "customer"
);
id_type!(CompanyId, "company");
id_type!(UserId, "user");
id_type!(OrderId, "order");

/// Validation error for requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Quantity must be strictly positive
    NonPositive { field: &'static str, value: i64 },

    /// Value outside the accepted range
    OutOfRange {
        field: &'static str,
        value: i64,
        max: i64,
    },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositive { field, value } => {
                write!(f, "{} must be positive, got {}", field, value)
            }
            Self::OutOfRange { field, value, max } => {
                write!(f, "{} must be at most {}, got {}", field, max, value)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Request to order `quantity` copies of an album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderRequest {
    album: AlbumId,
    quantity: i64,
    customer: Option<CustomerId>,
}

impl OrderRequest {
    pub fn new(
        album: AlbumId,
        quantity: i64,
        customer: Option<CustomerId>,
    ) -> Result<Self, ValidationError> {
        if quantity <= 0 {
            return Err(ValidationError::NonPositive {
                field: "quantity",
                value: quantity,
            });
        }
        Ok(Self {
            album,
            quantity,
            customer,
        })
    }

    pub fn album(&self) -> AlbumId {
        self.album
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn customer(&self) -> Option<CustomerId> {
        self.customer
    }
}

/// Upper bound for a single budget raise, in percent.
pub const MAX_RAISE_PERCENT: i64 = 1_000;

/// Request to raise the budget of every project started on or after `since`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetRaise {
    since: NaiveDate,
    percent: i64,
}

impl BudgetRaise {
    pub fn new(since: NaiveDate, percent: i64) -> Result<Self, ValidationError> {
        if percent <= 0 {
            return Err(ValidationError::NonPositive {
                field: "percent",
                value: percent,
            });
        }
        if percent > MAX_RAISE_PERCENT {
            return Err(ValidationError::OutOfRange {
                field: "percent",
                value: percent,
                max: MAX_RAISE_PERCENT,
            });
        }
        Ok(Self { since, percent })
    }

    pub fn since(&self) -> NaiveDate {
        self.since
    }

    pub fn percent(&self) -> i64 {
        self.percent
    }
}

/// Apply a percentage raise to a budget, rounding half away from zero.
///
/// Matches `ROUND(budget::numeric * (100 + percent) / 100)` on the server side.
/// Returns `None` when the raised budget does not fit in an `i64`.
pub fn raised_budget(budget: i64, percent: i64) -> Option<i64> {
    let factor = 100_i128.checked_add(i128::from(percent))?;
    let scaled = i128::from(budget).checked_mul(factor)?;
    let rounded = if scaled >= 0 {
        (scaled + 50) / 100
    } else {
        (scaled - 50) / 100
    };
    i64::try_from(rounded).ok()
}

/// Project row with its assigned users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: String,
    pub budget: i64,
    pub finished: bool,
    pub start_date: NaiveDate,
    pub company_id: CompanyId,
    #[sqlx(skip)]
    pub user_ids: Vec<UserId>,
}

/// Album row (inventory)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Album {
    pub id: AlbumId,
    pub title: String,
    pub artist: String,
    pub quantity: i64,
}

/// Order row written by a successful order workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Order {
    pub id: OrderId,
    pub album_id: AlbumId,
    pub cust_id: Option<CustomerId>,
    pub quantity: i64,
    pub date: DateTime<Utc>,
}
