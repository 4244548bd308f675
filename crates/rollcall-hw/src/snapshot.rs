//! Network cameras that serve a still image per HTTP request.

use crate::frame::Frame;
use crate::source::{FrameSource, SourceError};
use reqwest::blocking::Client;
use std::time::Duration;

pub struct SnapshotCamera {
    client: Client,
    url: String,
    sequence: u32,
}

impl SnapshotCamera {
    /// Build a client bounded by `timeout`. No request is made until the first read.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(timeout).connect_timeout(timeout).build()?;
        tracing::info!(url, timeout_ms = timeout.as_millis() as u64, "snapshot camera configured");
        Ok(Self {
            client,
            url: url.to_string(),
            sequence: 0,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl FrameSource for SnapshotCamera {
    fn read(&mut self) -> Result<Frame, SourceError> {
        let bytes = self.client.get(&self.url).send()?.error_for_status()?.bytes()?;
        let image = image::load_from_memory(&bytes)?.to_luma8();
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Frame::new(image, self.sequence))
    }
}
