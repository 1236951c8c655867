//! Synchronous block signing and signature record encoding.

use std::{io::Write, sync::Arc};

use logsig_core::Imprint;
use logsig_tree::{record, FinishedBlock, TreeError};
use tracing::{debug, warn};

use crate::{
    aggregator::{AggregationRequest, Aggregator, Endpoint, ServiceConfig},
    error::{Result, ServiceError},
    queue::SigningOutcome,
};

/// Longest error text written into a placeholder, in bytes.
pub const MAX_ERROR_TEXT_LEN: usize = 1024;

/// Placeholder text for a failure, cut to [`MAX_ERROR_TEXT_LEN`] on a
/// character boundary.
fn error_text(error: &ServiceError) -> String {
    let mut text = error.description();
    if text.len() > MAX_ERROR_TEXT_LEN {
        let mut end = MAX_ERROR_TEXT_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// Encodes the record that closes a block in the signature stream.
///
/// A signature too large for a record is replaced by a placeholder, so the
/// returned outcome can differ from the one passed in. Placeholders always
/// encode.
pub(crate) fn encode_outcome(
    record_count: u64,
    root: &Imprint,
    outcome: SigningOutcome,
) -> logsig_core::Result<(Vec<u8>, SigningOutcome)> {
    let failure = match outcome {
        SigningOutcome::Signed(signature) => match record::signature_record(record_count, &signature) {
            Ok(bytes) => return Ok((bytes, SigningOutcome::Signed(signature))),
            Err(e) => ServiceError::serialization(e.to_string()),
        },
        SigningOutcome::Failed(error) => error,
    };

    let bytes = record::no_signature_record(record_count, root, Some(&error_text(&failure)))?;
    Ok((bytes, SigningOutcome::Failed(failure)))
}

/// Signs finished blocks while the writer waits.
#[derive(Debug, Clone)]
pub struct SyncSigner {
    aggregator: Arc<dyn Aggregator>,
    endpoints: Vec<Endpoint>,
}

impl SyncSigner {
    /// Creates a signer trying `endpoints` in order.
    pub fn new(aggregator: Arc<dyn Aggregator>, endpoints: Vec<Endpoint>) -> Self {
        Self { aggregator, endpoints }
    }

    /// Configured endpoints.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Signs the block root; the first endpoint to answer wins.
    pub async fn sign(&self, root: &Imprint, level: u8) -> std::result::Result<bytes::Bytes, ServiceError> {
        let request = AggregationRequest::new(root.clone(), level);
        let mut last_error = ServiceError::NoEndpoints;

        for endpoint in &self.endpoints {
            match self.aggregator.sign(endpoint, &request).await {
                Ok(signature) => return Ok(signature),
                Err(e) => {
                    debug!(endpoint = %endpoint.uri, error = %e, "endpoint failed to sign");
                    last_error = e;
                },
            }
        }
        Err(last_error)
    }

    /// Signs a finished block and writes the signature or a placeholder.
    ///
    /// Service failures are not errors here: the block is committed with the
    /// failure text and the outcome says so. Only output failures are
    /// returned as errors.
    pub async fn sign_block<W: Write>(&self, out: &mut W, block: &FinishedBlock) -> Result<SigningOutcome> {
        let outcome = match self.sign(&block.root, block.level).await {
            Ok(signature) => SigningOutcome::Signed(signature),
            Err(e) => {
                warn!(
                    record_count = block.record_count,
                    level = block.level,
                    error = %e,
                    "block signing failed, writing placeholder"
                );
                SigningOutcome::Failed(e)
            },
        };

        let (bytes, outcome) = encode_outcome(block.record_count, &block.root, outcome)?;
        out.write_all(&bytes).map_err(TreeError::from)?;
        Ok(outcome)
    }

    /// Fetches the service configuration from the first endpoint that answers.
    pub async fn receive_config(&self) -> std::result::Result<ServiceConfig, ServiceError> {
        let mut last_error = ServiceError::NoEndpoints;
        for endpoint in &self.endpoints {
            match self.aggregator.receive_config(endpoint).await {
                Ok(config) => return Ok(config),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use logsig_core::{tlv::tags, HashAlgorithm, TlvReader};

    use super::*;

    #[test]
    fn oversized_signature_becomes_placeholder() {
        let root = Imprint::zero(HashAlgorithm::Sha256);
        let oversized = Bytes::from(vec![0u8; 70_000]);

        let (bytes, outcome) = encode_outcome(4, &root, SigningOutcome::Signed(oversized)).unwrap();
        assert!(matches!(outcome, SigningOutcome::Failed(ServiceError::Serialization { .. })));

        let record = TlvReader::new(&bytes).read_next().unwrap().unwrap();
        assert_eq!(record.tag(), tags::BLOCK_SIGNATURE);
        assert!(record.child(tags::NO_SIGNATURE).unwrap().is_some());
    }

    #[test]
    fn long_failure_text_is_cut_to_fit() {
        let root = Imprint::zero(HashAlgorithm::Sha256);
        let error = ServiceError::service(1, "é".repeat(40_000));

        let (bytes, outcome) = encode_outcome(3, &root, SigningOutcome::Failed(error.clone())).unwrap();
        assert_eq!(outcome, SigningOutcome::Failed(error));

        let record = TlvReader::new(&bytes).read_next().unwrap().unwrap();
        let placeholder = record.child(tags::NO_SIGNATURE).unwrap().unwrap();
        let text = placeholder.child(tags::NO_SIGNATURE_ERROR).unwrap().unwrap().value();
        let text = std::str::from_utf8(&text[..text.len() - 1]).unwrap();
        assert!(text.len() <= MAX_ERROR_TEXT_LEN);
        assert!(text.starts_with("aggregation service error 1: éé"));
    }

    #[test]
    fn failure_text_is_written_with_terminator() {
        let root = Imprint::zero(HashAlgorithm::Sha256);
        let (bytes, _) =
            encode_outcome(2, &root, SigningOutcome::Failed(ServiceError::RequestLimit)).unwrap();

        let record = TlvReader::new(&bytes).read_next().unwrap().unwrap();
        let placeholder = record.child(tags::NO_SIGNATURE).unwrap().unwrap();
        let text = placeholder.child(tags::NO_SIGNATURE_ERROR).unwrap().unwrap();
        assert_eq!(text.value(), b"request limit reached\0");
        assert_eq!(record.child(tags::RECORD_COUNT).unwrap().unwrap().as_uint().unwrap(), 2);
    }
}
