//! # Egress
//!
//! Outbound delivery for the send loop: builds the URL for an event's
//! destination and POSTs its JSON body with a bounded per-attempt timeout.

use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::event::Event;

/// Thin wrapper over a shared `reqwest::Client`, configured once at engine
/// startup with the configured per-POST timeout (spec §4.5/§5: 500 ms
/// total, not per-read).
#[derive(Clone)]
pub struct Egress {
    client: reqwest::Client,
}

impl Egress {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EngineError::from)?;
        Ok(Self { client })
    }

    fn url_for(event: &Event) -> String {
        format!(
            "http://{}:{}{}",
            event.destination_address, event.destination_port, event.destination_endpoint
        )
    }

    /// POST one event and return Ok(()) only on a 2xx response. Any
    /// non-2xx status or transport failure is a `Transport` error carrying
    /// the destination and status code, leaving retry decisions to the
    /// caller (send loop).
    pub async fn send(&self, event: &Event) -> Result<()> {
        let url = Self::url_for(event);
        let response = self
            .client
            .post(&url)
            .json(event)
            .send()
            .await
            .map_err(|e| EngineError::transport(e.to_string(), url.clone(), e.status().map(|s| s.as_u16())))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::transport(
                format!("destination responded with {}", response.status()),
                url,
                Some(response.status().as_u16()),
            ))
        }
    }
}
