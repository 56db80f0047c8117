/// Classified failure of a catalog backend call.
///
/// Backend bindings map their driver errors into one of these variants
/// before returning, so the engine never sees a raw driver error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("Backend connection error: {0}")]
    Connection(String),

    #[error("Malformed row: {0}")]
    MalformedRow(String),
}
