//! CLI command implementations.

pub(crate) mod discover;
pub(crate) mod inspect;
pub(crate) mod keys;
pub(crate) mod package;
pub(crate) mod route;
pub(crate) mod test_intent;
pub(crate) mod validate;
