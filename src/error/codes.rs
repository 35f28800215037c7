/// Error code registry for churnwise
///
/// Error codes are organized by category:
/// - 1000-1999: Validation errors
/// - 2000-2999: Not-found errors
/// - 3000-3999: Storage errors
/// - 4000-4999: Training errors
/// - 5000-5999: Stage errors
pub struct ErrorCode;

impl ErrorCode {
    // Validation errors (1000-1999)
    pub const VALIDATION_GENERIC: u16 = 1000;
    pub const VALIDATION_INVALID_FRACTION: u16 = 1001;
    pub const VALIDATION_UNSORTED_INPUT: u16 = 1002;
    pub const VALIDATION_INVALID_TRANSITION: u16 = 1003;

    // Not-found errors (2000-2999)
    pub const NOT_FOUND_GENERIC: u16 = 2000;
    pub const NOT_FOUND_ARTIFACT: u16 = 2001;

    // Storage errors (3000-3999)
    pub const STORAGE_UNAVAILABLE: u16 = 3000;

    // Training errors (4000-4999)
    pub const TRAINING_INSUFFICIENT_DATA: u16 = 4000;
    pub const TRAINING_UNSUPPORTED_ALGORITHM: u16 = 4001;

    // Stage errors (5000-5999)
    pub const STAGE_INTERNAL: u16 = 5000;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        ErrorCode::VALIDATION_GENERIC => "Input failed validation",
        ErrorCode::VALIDATION_INVALID_FRACTION => "Test fraction must be within [0, 1)",
        ErrorCode::VALIDATION_UNSORTED_INPUT => "Temporal split input is not sorted by date",
        ErrorCode::VALIDATION_INVALID_TRANSITION => "Status transition is not allowed",
        ErrorCode::NOT_FOUND_GENERIC => "Requested record was not found",
        ErrorCode::NOT_FOUND_ARTIFACT => "No trained model exists; train a model first",
        ErrorCode::STORAGE_UNAVAILABLE => "Blob or metadata store is unreachable",
        ErrorCode::TRAINING_INSUFFICIENT_DATA => "Not enough labeled rows to train",
        ErrorCode::TRAINING_UNSUPPORTED_ALGORITHM => "Algorithm is not supported",
        ErrorCode::STAGE_INTERNAL => "Background stage failed",
        _ => "Unknown error",
    }
}
