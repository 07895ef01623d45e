//! Tests of the PostgreSQL drivers against a live database.
//!
//! Requires `TEST_ADMIN_DATABASE_URL`; see `support::db`.

mod support;

mod driver;
