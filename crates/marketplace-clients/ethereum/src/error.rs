use thiserror::Error;

/// Error raised while submitting a single transaction attempt.
#[derive(Error, Debug)]
pub enum SendTransactionError {
    /// The network refused the transaction because another transaction with
    /// the same nonce is already pending at a competitive fee. The caller is
    /// expected to resubmit once with bumped replacement fees on the same
    /// nonce.
    #[error("Replacement transaction underpriced: {0}")]
    ReplacementUnderpriced(alloy::contract::Error),

    #[error("Transaction send failed: {0}")]
    Send(alloy::contract::Error),
}

impl SendTransactionError {
    /// Classify a raw contract/transport error from a `send` call. Node
    /// implementations only expose the replacement rejection through the RPC
    /// error message, so the match is textual.
    pub fn classify(error: alloy::contract::Error) -> Self {
        let message = error.to_string().to_lowercase();
        if message.contains("replacement transaction underpriced") || message.contains("transaction underpriced") {
            SendTransactionError::ReplacementUnderpriced(error)
        } else {
            SendTransactionError::Send(error)
        }
    }

    pub fn is_replacement_underpriced(&self) -> bool {
        matches!(self, SendTransactionError::ReplacementUnderpriced(_))
    }
}

#[derive(Error, Debug)]
pub enum MarketplaceClientError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Contract call failed: {0}")]
    Contract(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("No RPC endpoints configured")]
    NoEndpointsConfigured,

    #[error("No live RPC endpoint")]
    NoLiveEndpoint,

    #[error("All RPC endpoints exhausted after {attempts} attempts, last error: {last_error}")]
    EndpointsExhausted { attempts: u32, last_error: String },

    #[error("Event stream error: {message}")]
    EventStream { message: String },
}
