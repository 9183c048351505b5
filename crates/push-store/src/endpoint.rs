//! Push endpoint minting.

use std::future;

use push_proto::{ChannelId, Uaid};

use crate::backend::{BackendFuture, EndpointMinter};

/// Mints endpoints of the form `{base}/push/{uaid}/{chid}`.
#[derive(Debug, Clone)]
pub struct PathEndpointMinter {
    base_url: String,
}

impl PathEndpointMinter {
    /// Create a minter rooted at `base_url`. A trailing slash is ignored.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }
}

impl EndpointMinter for PathEndpointMinter {
    fn make_endpoint(&self, uaid: Uaid, channel_id: ChannelId) -> BackendFuture<'_, String> {
        let url = format!("{}/push/{uaid}/{channel_id}", self.base_url);
        Box::pin(future::ready(Ok(url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_make_endpoint_format() {
        let minter = PathEndpointMinter::new("https://push.example.com/");
        let uaid = Uaid::new();
        let chid = ChannelId::new();

        let url = minter.make_endpoint(uaid, chid).await.unwrap();
        assert_eq!(url, format!("https://push.example.com/push/{uaid}/{chid}"));
    }
}
