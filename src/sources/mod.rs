//! PostgreSQL connection plumbing shared by the vector tile builder (C10).

#[cfg(feature = "postgres")]
pub mod postgres;
