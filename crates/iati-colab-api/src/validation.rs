use std::time::Duration;

use iati_colab_core::{ColabError, ValidationReport};
use serde_json::Value;
use time::OffsetDateTime;

/// Submits a document to the remote IATI validator.
#[derive(Debug, Clone)]
pub struct ValidationClient {
    agent: ureq::Agent,
    endpoint: String,
}

impl ValidationClient {
    #[must_use]
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoint: endpoint.to_string(),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST `document` as the `file` part of a multipart form, with `name` as
    /// both the `name` field and the file name. Returns the raw response JSON
    /// and the report read from it.
    ///
    /// # Errors
    /// Returns [`ColabError::Fetch`] for transport failures, non-success
    /// statuses, or a non-JSON body, and [`ColabError::Validation`] when the
    /// body lacks the expected shape.
    pub fn submit(&self, name: &str, document: &[u8]) -> Result<(Value, ValidationReport), ColabError> {
        let fetch_error =
            |detail: String| ColabError::Fetch { locator: self.endpoint.clone(), detail };

        let boundary = format!(
            "----iati-colab-{:x}",
            OffsetDateTime::now_utc().unix_timestamp_nanos()
        );
        let body = multipart_body(&boundary, name, document);

        tracing::info!(endpoint = %self.endpoint, bytes = document.len(), "submitting document for validation");
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", &format!("multipart/form-data; boundary={boundary}"))
            .send_bytes(&body)
            .map_err(|err| fetch_error(err.to_string()))?;
        let raw: Value = response
            .into_json()
            .map_err(|err| fetch_error(format!("validator returned invalid JSON: {err}")))?;

        let report = ValidationReport::from_json(&raw)?;
        tracing::info!(
            validation_errors = report.validation_errors.len(),
            ruleset_errors = report.ruleset_errors.len(),
            invalid_embedded_codelist_values = report.invalid_embedded_codelist_values.len(),
            invalid_non_embedded_codelist_values = report.invalid_non_embedded_codelist_values.len(),
            "validation report received"
        );
        Ok((raw, report))
    }
}

fn multipart_body(boundary: &str, name: &str, document: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(document.len() + 512);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"name\"\r\n\r\n{name}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: application/xml\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(document);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}
