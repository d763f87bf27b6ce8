//! Contract for the component that turns configuration bytes into live
//! routing state. Implemented outside this crate.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("configuration parse failed: {0}")]
    Parse(String),

    #[error("configuration apply failed: {0}")]
    Apply(String),
}

pub trait ConfigEngine {
    type Parsed;

    /// Pure: no side effects, no shared state.
    fn parse(&self, bytes: &[u8]) -> Result<Self::Parsed, EngineError>;

    /// Replaces the local routing state. Either the whole new view is
    /// installed or the old one is left untouched.
    fn apply(&mut self, parsed: Self::Parsed) -> Result<(), EngineError>;
}
