//! Parameter-specific SQL handlers.
//!
//! Each handler turns one search value into a condition over the columns of
//! a single `search_index` row. The query builder wraps these conditions in
//! membership subqueries, so handlers never see table aliases.

mod date;
mod number;
mod quantity;
mod reference;
mod string;
mod token;
mod uri;

pub use date::DateHandler;
pub use number::NumberHandler;
pub use quantity::QuantityHandler;
pub use reference::ReferenceHandler;
pub use string::StringHandler;
pub use token::TokenHandler;
pub use uri::UriHandler;
