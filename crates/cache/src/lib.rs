//! SQLite book store.
//!
//! Unlike the git repositories, this database *is* the source of truth for
//! local books: their content, the repository each one is linked to, the
//! revision it was last synced to and the last action shown to the user.
//!
//! [`Database`] owns the connection pool and runs the embedded migrations;
//! [`Library`] implements [`BookStore`](quire_book::BookStore) on top of it.

mod db;
pub mod error;
mod library;
mod models;

pub use crate::db::Database;
pub use crate::library::Library;
