//! OAuth token upkeep.
//!
//! The browser-based authorization flow lives outside the core; this module
//! only refreshes token pairs already in the character store. Refresh is
//! single-flight per character so concurrent calls sharing one refresh token
//! never race the SSO endpoint.

use crate::error::{CoreError, CoreResult};
use crate::models::now_ms;
use crate::store::character::CharacterStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const TOKEN_URL: &str = "https://login.eveonline.com/v2/oauth/token";
/// Refresh this long before the access token actually expires.
const EXPIRY_SKEW_MS: i64 = 60_000;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

pub struct TokenManager {
    http: reqwest::Client,
    store: CharacterStore,
    client_id: String,
    token_url: String,
    flights: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(http: reqwest::Client, store: CharacterStore, client_id: String) -> Self {
        Self {
            http,
            store,
            client_id,
            token_url: TOKEN_URL.to_string(),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// A valid access token for the character, refreshing first if the
    /// stored one expires within the skew window.
    pub async fn access_token(&self, character_id: i64) -> CoreResult<String> {
        let character = self.store.get_character(character_id).await?;
        if character.expires_at >= now_ms() + EXPIRY_SKEW_MS {
            return Ok(character.access_token);
        }

        let flight = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(character_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;

        // Another caller may have refreshed while we waited for the flight.
        let character = self.store.get_character(character_id).await?;
        if character.expires_at >= now_ms() + EXPIRY_SKEW_MS {
            return Ok(character.access_token);
        }

        tracing::debug!(character_id, "refreshing access token");
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", character.refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CoreError::TokenRefreshFailed {
                character_id,
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(CoreError::TokenRefreshFailed {
                character_id,
                reason: format!("SSO returned {}", response.status()),
            });
        }

        let token: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| CoreError::TokenRefreshFailed {
                    character_id,
                    reason: format!("bad token response: {e}"),
                })?;

        let expires_at = now_ms() + token.expires_in * 1000;
        self.store
            .update_tokens(character_id, &token.access_token, &token.refresh_token, expires_at)
            .await?;
        tracing::info!(character_id, "access token refreshed");
        Ok(token.access_token)
    }
}
