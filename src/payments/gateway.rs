use crate::payments::error::GatewayResult;
use crate::payments::types::{StkPushRequest, StkPushResponse};
use async_trait::async_trait;

/// Boundary trait for the push-payment provider. The only component allowed
/// to make outbound network calls to the provider; it carries no business
/// rules.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Obtain a valid access credential, reusing a cached one when it has not
    /// expired.
    async fn get_token(&self) -> GatewayResult<String>;

    /// Issue a push-payment prompt to the payer's device. Returns the two
    /// provider correlation identifiers needed to match the asynchronous
    /// callback.
    async fn push_payment(&self, request: StkPushRequest) -> GatewayResult<StkPushResponse>;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::error::GatewayError;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockGateway {
        pushes: AtomicU32,
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn get_token(&self) -> GatewayResult<String> {
            Ok("token".to_string())
        }

        async fn push_payment(
            &self,
            request: StkPushRequest,
        ) -> GatewayResult<StkPushResponse> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            if request.amount_kes <= 0 {
                return Err(GatewayError::Rejected {
                    message: "amount must be positive".to_string(),
                    status: Some(400),
                });
            }
            Ok(StkPushResponse {
                merchant_request_id: "mr_1".to_string(),
                checkout_request_id: "ws_CO_test".to_string(),
                response_code: "0".to_string(),
                response_description: None,
                customer_message: None,
            })
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    #[tokio::test]
    async fn trait_can_be_implemented_by_mock_gateway() {
        let gateway: Box<dyn PaymentGateway> = Box::new(MockGateway {
            pushes: AtomicU32::new(0),
        });
        let response = gateway
            .push_payment(StkPushRequest {
                phone_number: "254712345678".to_string(),
                amount_kes: 100,
                account_reference: "INV-1".to_string(),
                transaction_desc: "Cleaning".to_string(),
            })
            .await
            .expect("push should succeed");
        assert_eq!(response.checkout_request_id, "ws_CO_test");
    }
}
