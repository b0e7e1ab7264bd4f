use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Identifier is empty")]
    Empty,

    #[error("Identifier contains invalid character {0:?}")]
    InvalidCharacter(char),
}
