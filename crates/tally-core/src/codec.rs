//! Wire encoding for records.
//!
//! Records travel as UTF-8 JSON objects with camelCase field names, one
//! record per transport message:
//!
//! ```text
//! {"id":"p1","question":"Q","options":["A","B"],"createdBy":"u1","createdAt":10}
//! {"pollId":"p1","optionIndex":0,"voterIdentity":"v1","signatureProof":"","castAt":100}
//! ```

use crate::error::Result;
use crate::record::Record;
use crate::validate::Validator;

/// Encode a record into a transport payload.
pub fn encode<R: Record>(record: &R) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}

/// Decode a transport payload into a record without validating it.
pub fn decode<R: Record>(payload: &[u8]) -> Result<R> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decode a transport payload and run structural validation on the result.
///
/// # Errors
///
/// Returns [`crate::Error::Json`] if the payload is not a record of kind `R`,
/// or [`crate::Error::Validation`] if it decodes but is malformed.
pub fn decode_valid<R: Record>(payload: &[u8], validator: &Validator) -> Result<R> {
    let record: R = decode(payload)?;
    validator.validate(&record)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::record::{PollRecord, VoteRecord};

    const POLL_JSON: &str =
        r#"{"id":"p1","question":"Q","options":["A","B"],"createdBy":"u1","createdAt":10}"#;

    #[test]
    fn test_decode_poll() {
        let poll: PollRecord = decode(POLL_JSON.as_bytes()).unwrap();
        assert_eq!(poll.id, "p1");
        assert_eq!(poll.options, vec!["A", "B"]);
        assert_eq!(poll.created_at, 10);
    }

    #[test]
    fn test_encode_decode_vote() {
        let vote = VoteRecord {
            poll_id: "p1".to_string(),
            option_index: 1,
            voter_identity: "v1".to_string(),
            signature_proof: "sig".to_string(),
            cast_at: 50,
        };
        let bytes = encode(&vote).unwrap();
        let decoded: VoteRecord = decode(&bytes).unwrap();
        assert_eq!(decoded, vote);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = decode::<PollRecord>(b"not json");
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[test]
    fn test_decode_rejects_negative_option_index() {
        let json = r#"{"pollId":"p1","optionIndex":-1,"voterIdentity":"v1","castAt":100}"#;
        assert!(decode::<VoteRecord>(json.as_bytes()).is_err());
    }

    #[test]
    fn test_decode_rejects_other_kind() {
        // A vote payload arriving on the poll topic does not decode as a poll
        let json = r#"{"pollId":"p1","optionIndex":0,"voterIdentity":"v1","castAt":100}"#;
        assert!(decode::<PollRecord>(json.as_bytes()).is_err());
    }

    #[test]
    fn test_decode_valid_rejects_malformed_poll() {
        let json = r#"{"id":"p1","question":"Q","options":["A"],"createdBy":"u1","createdAt":10}"#;
        let result = decode_valid::<PollRecord>(json.as_bytes(), &Validator::default());
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_decode_valid_accepts_poll() {
        let result = decode_valid::<PollRecord>(POLL_JSON.as_bytes(), &Validator::default());
        assert!(result.is_ok());
    }
}
