use crate::wire::ObjectType;
use thiserror::Error;

/// Errors raised while populating the type and method tables at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("object {ty} is already registered")]
    DuplicateType { ty: ObjectType },

    #[error("object type name '{name}' is already registered")]
    DuplicateTypeName { name: String },

    #[error("method '{method}' is already registered on {owner}")]
    DuplicateMethod { owner: String, method: String },

    #[error("node '{path}' is already registered")]
    DuplicateNode { path: String },

    #[error("registry is locked; register everything before the session starts")]
    Locked,
}
