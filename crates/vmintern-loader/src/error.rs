use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("class {name} is already defined by {context}")]
    DuplicateClass { name: String, context: String },

    #[error("class {name} is not defined by {context}")]
    UnknownClass { name: String, context: String },

    #[error("{context} is unloading and cannot define classes")]
    ContextUnloading { context: String },
}

pub type Result<T> = std::result::Result<T, LoaderError>;
