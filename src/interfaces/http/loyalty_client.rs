use crate::domain::accrual::{AccrualReport, LoyaltyError};
use crate::domain::order::OrderNumber;
use crate::domain::ports::LoyaltyClient;
use crate::error::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

/// Loyalty client talking to the accrual service's REST API.
///
/// Queries `GET {base_url}/api/orders/{number}` and maps the status code onto
/// the retry classes the poller understands.
#[derive(Debug, Clone)]
pub struct HttpLoyaltyClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpLoyaltyClient {
    /// Builds a client with a per-request `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn order_url(&self, order: &OrderNumber) -> String {
        format!("{}/api/orders/{}", self.base_url, order)
    }
}

#[async_trait]
impl LoyaltyClient for HttpLoyaltyClient {
    async fn query(&self, order: &OrderNumber) -> std::result::Result<AccrualReport, LoyaltyError> {
        let response = self
            .http
            .get(self.order_url(order))
            .send()
            .await
            .map_err(|e| LoyaltyError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let report: AccrualReport = response
                    .json()
                    .await
                    .map_err(|e| LoyaltyError::MalformedResponse(e.to_string()))?;
                if report.order != order.as_str() {
                    return Err(LoyaltyError::MalformedResponse(format!(
                        "asked for order {order}, got {}",
                        report.order
                    )));
                }
                Ok(report)
            }
            StatusCode::NO_CONTENT => Err(LoyaltyError::NotRegistered),
            StatusCode::TOO_MANY_REQUESTS => Err(LoyaltyError::RateLimited),
            status => Err(LoyaltyError::UnexpectedStatus(status.as_u16())),
        }
    }
}
