//! Classification of Kubernetes API errors.
//!
//! The controllers decide between "treat as success", "retry", and "drop"
//! based on the status reason the API server returned. Reasons are matched
//! first, with the HTTP code as a fallback for servers that omit them.

use kube::core::ErrorResponse;
use kube::Error;

fn api_response(err: &Error) -> Option<&ErrorResponse> {
    match err {
        Error::Api(resp) => Some(resp),
        _ => None,
    }
}

fn matches(err: &Error, reason: &str, code: u16) -> bool {
    api_response(err).is_some_and(|resp| resp.reason == reason || resp.code == code)
}

pub fn is_not_found(err: &Error) -> bool {
    matches(err, "NotFound", 404)
}

pub fn is_gone(err: &Error) -> bool {
    matches(err, "Gone", 410)
}

pub fn is_already_exists(err: &Error) -> bool {
    api_response(err).is_some_and(|resp| resp.reason == "AlreadyExists")
}

pub fn is_invalid(err: &Error) -> bool {
    matches(err, "Invalid", 422)
}

/// Errors the server will keep returning no matter how often the same
/// request is retried.
pub fn malformed_request(err: &Error) -> bool {
    let Some(resp) = api_response(err) else {
        return false;
    };
    matches!(
        resp.reason.as_str(),
        "Unauthorized"
            | "BadRequest"
            | "Forbidden"
            | "NotAcceptable"
            | "UnsupportedMediaType"
            | "MethodNotAllowed"
            | "Invalid"
    ) || matches!(resp.code, 400 | 401 | 403 | 405 | 406 | 415 | 422)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(reason: &str, code: u16) -> Error {
        Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: String::new(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn classifies_by_reason() {
        assert!(is_not_found(&api_error("NotFound", 404)));
        assert!(is_gone(&api_error("Gone", 410)));
        assert!(is_already_exists(&api_error("AlreadyExists", 409)));
        assert!(is_invalid(&api_error("Invalid", 422)));
        assert!(!is_not_found(&api_error("AlreadyExists", 409)));
    }

    #[test]
    fn conflict_is_not_already_exists() {
        // Both use HTTP 409; only the reason distinguishes them.
        assert!(!is_already_exists(&api_error("Conflict", 409)));
    }

    #[test]
    fn malformed_requests_are_terminal() {
        for reason in [
            "Unauthorized",
            "BadRequest",
            "Forbidden",
            "NotAcceptable",
            "UnsupportedMediaType",
            "MethodNotAllowed",
            "Invalid",
        ] {
            assert!(malformed_request(&api_error(reason, 0)), "{reason}");
        }
        assert!(!malformed_request(&api_error("ServerTimeout", 500)));
        assert!(!malformed_request(&api_error("NotFound", 404)));
    }
}
