//! Connect-time handshake parameters.
//!
//! The node presents these as opaque query-style key-value pairs; the
//! dispatcher validates them on its side.

use serde::{Deserialize, Serialize};

/// Identity and capacity hints presented when attaching to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Node display name.
    pub name: String,

    /// Advertised model name.
    pub model: String,

    /// Bearer token checked by the dispatcher.
    pub token: String,

    /// Maximum number of concurrent tasks this node will accept.
    pub max_concurrency: usize,
}

impl ConnectParams {
    /// Render as the `key=value&...` pairs the dispatcher parses.
    pub fn to_query(&self) -> String {
        format!(
            "name={}&model={}&token={}&max_concurrency={}",
            self.name, self.model, self.token, self.max_concurrency
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_rendering() {
        let params = ConnectParams {
            name: "beagle".to_string(),
            model: "buddy-7b".to_string(),
            token: "secret".to_string(),
            max_concurrency: 4,
        };
        assert_eq!(
            params.to_query(),
            "name=beagle&model=buddy-7b&token=secret&max_concurrency=4"
        );
    }
}
