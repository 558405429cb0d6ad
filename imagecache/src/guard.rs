use shared::Result;
use tracing::error;

/// Applies the error-tolerance setting at a storage boundary
#[derive(Clone, Copy, Debug)]
pub(crate) struct ErrorPolicy {
    storage: &'static str,
    ignore_errors: bool,
}

impl ErrorPolicy {
    pub(crate) fn new(storage: &'static str, ignore_errors: bool) -> Self {
        Self {
            storage,
            ignore_errors,
        }
    }

    /// Store failures become `fallback()` when errors are ignored.
    /// Configuration errors always propagate.
    pub(crate) fn settle<T>(
        &self,
        operation: &str,
        result: Result<T>,
        fallback: impl FnOnce() -> T,
    ) -> Result<T> {
        match result {
            Err(err) if self.ignore_errors && err.is_store_failure() => {
                error!("[{}] {} failed: {}", self.storage, operation, err);
                Ok(fallback())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Error;

    #[test]
    fn test_tolerant_policy_swallows_store_failures() {
        let policy = ErrorPolicy::new("TEST_STORAGE", true);
        let result: Result<bool> = policy.settle(
            "exists",
            Err(Error::StoreUnavailable("connection reset".to_string())),
            || false,
        );
        assert!(!result.unwrap());
    }

    #[test]
    fn test_strict_policy_propagates_store_failures() {
        let policy = ErrorPolicy::new("TEST_STORAGE", false);
        let result: Result<Option<u8>> = policy.settle(
            "get",
            Err(Error::StoreUnavailable("connection reset".to_string())),
            || None,
        );
        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
    }

    #[test]
    fn test_configuration_errors_always_propagate() {
        let policy = ErrorPolicy::new("TEST_STORAGE", true);
        let result: Result<Option<u8>> = policy.settle(
            "put",
            Err(Error::Configuration("no key".to_string())),
            || None,
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_success_passes_through() {
        let policy = ErrorPolicy::new("TEST_STORAGE", true);
        assert_eq!(policy.settle("get", Ok(Some(7u8)), || None).unwrap(), Some(7));
    }
}
