use mongodb::error::{ErrorKind, GridFsErrorKind};
use shared::Error;

const NAMESPACE_NOT_FOUND: i32 = 26;

/// Map a driver error into `StoreUnavailable` with context
pub(crate) fn store_error(context: &'static str) -> impl Fn(mongodb::error::Error) -> Error {
    move |e| Error::StoreUnavailable(format!("Failed to {}: {}", context, e))
}

pub(crate) fn io_error(context: &'static str) -> impl Fn(std::io::Error) -> Error {
    move |e| Error::StoreUnavailable(format!("Failed to {}: {}", context, e))
}

/// The collection does not exist yet, e.g. listing indexes before the first insert
pub(crate) fn is_namespace_not_found(err: &mongodb::error::Error) -> bool {
    matches!(err.kind.as_ref(), ErrorKind::Command(command) if command.code == NAMESPACE_NOT_FOUND)
}

pub(crate) fn is_file_not_found(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::GridFs(GridFsErrorKind::FileNotFound { .. })
    )
}
