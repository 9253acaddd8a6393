//! Generated OpenAPI document.

use utoipa::OpenApi;

use crate::routes::submissions;

/// The coordinator's OpenAPI description.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "bespoke-coordinator",
        description = "Coordinator API for bespoke force-field parameterization workflows."
    ),
    paths(
        submissions::create,
        submissions::get,
        submissions::list,
        submissions::delete,
    ),
    components(schemas(
        submissions::SubmitRequest,
        submissions::SubmitResponse,
        submissions::SubmissionLink,
        crate::error::ApiErrorBody,
    ))
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_contains_all_routes() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.iter().any(|p| p.as_str() == "/submissions"));
        assert!(paths.iter().any(|p| p.as_str() == "/submissions/{id}"));
    }
}
