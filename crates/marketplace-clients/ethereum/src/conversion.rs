//! Conversions between the generated contract types and the domain types the
//! rest of the system consumes.

use alloy::primitives::U256;
use marketplace_client_interface::{InferenceRequest, ModelInfo, RequestStatus};

use crate::error::MarketplaceClientError;
use crate::IInferenceMarketplace;

pub(crate) fn u256_to_u64(field: &'static str, value: U256) -> Result<u64, MarketplaceClientError> {
    u64::try_from(value)
        .map_err(|_| MarketplaceClientError::Conversion(format!("{field} does not fit in u64: {value}")))
}

pub(crate) fn request_from_contract(
    raw: IInferenceMarketplace::Request,
) -> Result<InferenceRequest, MarketplaceClientError> {
    let status =
        RequestStatus::try_from(raw.status).map_err(|e| MarketplaceClientError::Conversion(e.to_string()))?;
    Ok(InferenceRequest {
        request_id: u256_to_u64("requestId", raw.requestId)?,
        model_id: u256_to_u64("modelId", raw.modelId)?,
        user: raw.user,
        payment: raw.payment,
        input_data_hash: raw.inputDataHash,
        result_hash: raw.resultHash,
        compute_node: raw.computeNode,
        created_at: u256_to_u64("createdAt", raw.createdAt)?,
        completed_at: u256_to_u64("completedAt", raw.completedAt)?,
        status,
    })
}

pub(crate) fn model_from_contract(raw: IInferenceMarketplace::Model) -> Result<ModelInfo, MarketplaceClientError> {
    Ok(ModelInfo {
        model_id: u256_to_u64("modelId", raw.modelId)?,
        name: raw.name,
        model_hash: raw.modelHash,
        active: raw.active,
    })
}

pub(crate) fn request_ids(raw: Vec<U256>) -> Result<Vec<u64>, MarketplaceClientError> {
    raw.into_iter().map(|id| u256_to_u64("requestId", id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;
    use assert_matches::assert_matches;

    fn raw_request() -> IInferenceMarketplace::Request {
        IInferenceMarketplace::Request {
            requestId: U256::from(42u64),
            modelId: U256::from(1u64),
            user: Address::repeat_byte(0x11),
            payment: U256::from(5_000u64),
            inputDataHash: "QmInput".to_string(),
            resultHash: String::new(),
            computeNode: Address::ZERO,
            createdAt: U256::from(1_700_000_000u64),
            completedAt: U256::ZERO,
            status: 0,
        }
    }

    #[test]
    fn pending_request_converts_cleanly() {
        let request = request_from_contract(raw_request()).unwrap();
        assert_eq!(request.request_id, 42);
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(request.compute_node, Address::ZERO);
        assert!(request.result_hash.is_empty());
    }

    #[test]
    fn unknown_status_discriminant_is_rejected() {
        let mut raw = raw_request();
        raw.status = 9;
        assert_matches!(request_from_contract(raw), Err(MarketplaceClientError::Conversion(_)));
    }

    #[test]
    fn oversized_request_id_is_rejected() {
        let mut raw = raw_request();
        raw.requestId = U256::MAX;
        assert_matches!(request_from_contract(raw), Err(MarketplaceClientError::Conversion(_)));
    }

    #[test]
    fn id_list_converts_or_fails_as_a_whole() {
        let ids = request_ids(vec![U256::from(1u64), U256::from(2u64)]).unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert_matches!(
            request_ids(vec![U256::from(1u64), U256::MAX]),
            Err(MarketplaceClientError::Conversion(_))
        );
    }
}
